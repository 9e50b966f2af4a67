/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The locality-aware (`xds_experimental`) policy.
//!
//! Until the first [`ClusterLoadAssignment`] arrives as an attribute of a
//! resolver update, traffic is routed by the configured fallback policy over
//! the resolved backends.  From then on a [`LocalityStore`] owns all routing
//! and the fallback policy is shut down.

use std::error::Error;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::client::load_balancing::{
    ChannelController, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbPolicyRegistry, ParsedJsonLbConfig, Subchannel, SubchannelState, round_robin,
};
use crate::client::name_resolution::{ResolverUpdate, Target};
use crate::client::service_config::{LbPolicyEntry, unwrap_lb_policy_entry};

pub mod fallback;
pub mod load_stats;
pub mod locality;
pub mod locality_store;
pub mod picker;

use fallback::FallbackPolicy;
use load_stats::LoadStatsStore;
use locality::ClusterLoadAssignment;
use locality_store::{LocalityStore, LocalityStoreOptions};

pub static POLICY_NAME: &str = "xds_experimental";

/// Registers the locality-aware policy in the global registry.  Its child and
/// fallback policies are looked up there too.
pub fn reg() {
    GLOBAL_LB_REGISTRY.add_builder(XdsPolicyBuilder::new(GLOBAL_LB_REGISTRY.clone()));
}

/// Errors produced while parsing an `xds_experimental` config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed xds config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {field} '{target}': {reason}")]
    InvalidTarget {
        field: &'static str,
        target: String,
        reason: String,
    },
    #[error("invalid {field} entry: {reason}")]
    InvalidPolicyEntry { field: &'static str, reason: String },
}

/// Configuration of the locality-aware policy.
#[derive(Debug, Clone, PartialEq)]
pub struct XdsConfig {
    pub balancer_name: Target,
    /// Policy of each locality.  None selects round_robin.
    pub child_policy: Option<LbPolicyEntry>,
    /// Policy used until the first load assignment arrives.
    pub fallback_policy: LbPolicyEntry,
    pub eds_service_name: Option<Target>,
    pub lrs_load_reporting_server_name: Option<Target>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawXdsConfig {
    balancer_name: String,
    #[serde(default)]
    child_policy: Vec<Value>,
    #[serde(default)]
    fallback_policy: Vec<Value>,
    eds_service_name: Option<String>,
    lrs_load_reporting_server_name: Option<String>,
}

impl XdsConfig {
    /// Parses the JSON config.  Of each policy list, the first entry
    /// registered in `registry` is kept.
    pub fn parse(
        config: &ParsedJsonLbConfig,
        registry: &LbPolicyRegistry,
    ) -> Result<Self, ConfigError> {
        let raw: RawXdsConfig = config.convert_to()?;
        Ok(XdsConfig {
            balancer_name: parse_target("balancerName", &raw.balancer_name)?,
            child_policy: first_registered("childPolicy", &raw.child_policy, registry)?,
            fallback_policy: first_registered("fallbackPolicy", &raw.fallback_policy, registry)?
                .unwrap_or_else(default_fallback_policy),
            eds_service_name: raw
                .eds_service_name
                .map(|name| parse_target("edsServiceName", &name))
                .transpose()?,
            lrs_load_reporting_server_name: raw
                .lrs_load_reporting_server_name
                .map(|name| parse_target("lrsLoadReportingServerName", &name))
                .transpose()?,
        })
    }
}

fn parse_target(field: &'static str, target: &str) -> Result<Target, ConfigError> {
    target
        .parse()
        .map_err(|reason| ConfigError::InvalidTarget {
            field,
            target: target.to_string(),
            reason,
        })
}

fn first_registered(
    field: &'static str,
    entries: &[Value],
    registry: &LbPolicyRegistry,
) -> Result<Option<LbPolicyEntry>, ConfigError> {
    for entry in entries {
        let entry = unwrap_lb_policy_entry(entry)
            .map_err(|reason| ConfigError::InvalidPolicyEntry { field, reason })?;
        if registry.get_policy(&entry.policy_name).is_some() {
            return Ok(Some(entry));
        }
        tracing::debug!("{field}: skipping unregistered policy {}", entry.policy_name);
    }
    Ok(None)
}

pub(crate) fn default_fallback_policy() -> LbPolicyEntry {
    LbPolicyEntry {
        policy_name: round_robin::POLICY_NAME.to_string(),
        config: ParsedJsonLbConfig::new(Value::Object(Map::new())),
    }
}

/// Builds [`XdsPolicy`] instances whose child and fallback policies come from
/// `registry`.
pub struct XdsPolicyBuilder {
    registry: LbPolicyRegistry,
}

impl XdsPolicyBuilder {
    pub fn new(registry: LbPolicyRegistry) -> Self {
        Self { registry }
    }
}

impl LbPolicyBuilder for XdsPolicyBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(XdsPolicy::new(self.registry.clone(), options))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let config = XdsConfig::parse(config, &self.registry)?;
        Ok(Some(LbConfig::new(config)))
    }
}

pub struct XdsPolicy {
    registry: LbPolicyRegistry,
    options: LbPolicyOptions,
    // None once the first load assignment was received.
    fallback: Option<FallbackPolicy>,
    store: Option<LocalityStore>,
    // Shared by every store this policy creates.
    load_stats: Arc<LoadStatsStore>,
}

impl XdsPolicy {
    pub fn new(registry: LbPolicyRegistry, options: LbPolicyOptions) -> Self {
        let fallback = FallbackPolicy::new(registry.clone(), child_options(&options));
        Self {
            registry,
            options,
            fallback: Some(fallback),
            store: None,
            load_stats: Arc::new(LoadStatsStore::new()),
        }
    }

    pub fn load_stats(&self) -> &Arc<LoadStatsStore> {
        &self.load_stats
    }

    fn handle_assignment(
        &mut self,
        assignment: &ClusterLoadAssignment,
        config: Option<&XdsConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(mut fallback) = self.fallback.take() {
            tracing::debug!(
                cluster = %assignment.cluster_name,
                "first load assignment received, leaving fallback"
            );
            fallback.shutdown();
        }

        let entry = config.and_then(|c| c.child_policy.as_ref());
        let child_name = entry.map_or(round_robin::POLICY_NAME, |e| e.policy_name.as_str());
        let child_policy = self
            .registry
            .get_policy(child_name)
            .ok_or_else(|| format!("locality policy {child_name} is not registered"))?;
        let child_config = match entry {
            Some(entry) => child_policy.parse_config(&entry.config)?,
            None => None,
        };

        let store = match self.store.take() {
            Some(mut store) if store.child_policy_name() == child_policy.name() => {
                store.set_child_config(child_config);
                store
            }
            old => {
                if let Some(mut old) = old {
                    tracing::debug!(
                        "locality policy changed from {} to {}",
                        old.child_policy_name(),
                        child_policy.name()
                    );
                    old.shutdown();
                }
                let mut store_options = LocalityStoreOptions::new(child_policy);
                store_options.child_config = child_config;
                store_options.load_stats = self.load_stats.clone();
                LocalityStore::new(store_options, child_options(&self.options))
            }
        };
        let store = self.store.insert(store);

        let localities: IndexMap<_, _> = assignment
            .localities
            .iter()
            .filter(|(locality, endpoints)| {
                let keep = endpoints.locality_weight > 0;
                if !keep {
                    tracing::debug!(%locality, "ignoring locality with zero weight");
                }
                keep
            })
            .map(|(locality, endpoints)| (locality.clone(), endpoints.clone()))
            .collect();
        store.update_drop_overloads(assignment.drop_overloads.clone());
        store.update_localities(localities, channel_controller);
        Ok(())
    }
}

fn child_options(options: &LbPolicyOptions) -> LbPolicyOptions {
    LbPolicyOptions {
        work_scheduler: options.work_scheduler.clone(),
        runtime: options.runtime.clone(),
        logger: options.logger.clone(),
    }
}

impl LbPolicy for XdsPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let xds_config = config.and_then(|c| c.convert_to::<XdsConfig>());
        if let Some(assignment) = update.attributes.get::<ClusterLoadAssignment>() {
            return self.handle_assignment(assignment, xds_config.as_deref(), channel_controller);
        }
        match self.fallback.as_mut() {
            Some(fallback) => fallback.resolver_update(update, config, channel_controller),
            None => {
                // The store keeps routing with the last assignment.
                if let Err(e) = &update.endpoints {
                    tracing::debug!("ignoring resolution error after load assignment: {e}");
                }
                Ok(())
            }
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if let Some(fallback) = self.fallback.as_mut() {
            if fallback.owns(&subchannel) {
                fallback.subchannel_update(subchannel, state, channel_controller);
                return;
            }
        }
        if let Some(store) = self.store.as_mut() {
            store.subchannel_update(subchannel, state, channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(fallback) = self.fallback.as_mut() {
            fallback.work(channel_controller);
        }
        if let Some(store) = self.store.as_mut() {
            store.work(channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(fallback) = self.fallback.as_mut() {
            fallback.exit_idle(channel_controller);
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut fallback) = self.fallback.take() {
            fallback.shutdown();
        }
        if let Some(mut store) = self.store.take() {
            store.shutdown();
        }
    }

    fn accepts_empty_endpoints(&self) -> bool {
        true
    }
}
