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

//! The policy that routes traffic before the first load assignment arrives.

use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{XdsConfig, default_fallback_policy};
use crate::client::load_balancing::auto_config::GRPCLB_POLICY_NAME;
use crate::client::load_balancing::child_manager::WrappedController;
use crate::client::load_balancing::{
    ChannelController, LbConfig, LbPolicy, LbPolicyOptions, LbPolicyRegistry, Subchannel,
    SubchannelState, WeakSubchannel, WorkScheduler,
};
use crate::client::name_resolution::ResolverUpdate;

const NO_BACKENDS: &str = "No backend address available from the name resolver";

/// Runs the `fallbackPolicy` of an [`XdsConfig`] over the resolved backends.
///
/// The running policy is kept while the configured name stays the same and
/// replaced when it changes.
pub struct FallbackPolicy {
    registry: LbPolicyRegistry,
    options: LbPolicyOptions,
    child: Option<FallbackChild>,
    // Subchannels created by the current child.
    subchannels: HashSet<WeakSubchannel>,
}

struct FallbackChild {
    name: &'static str,
    policy: Box<dyn LbPolicy>,
    work_requested: Arc<AtomicBool>,
}

impl FallbackPolicy {
    pub fn new(registry: LbPolicyRegistry, options: LbPolicyOptions) -> Self {
        Self {
            registry,
            options,
            child: None,
            subchannels: HashSet::new(),
        }
    }

    /// Name of the running fallback policy.
    pub fn child_name(&self) -> Option<&'static str> {
        self.child.as_ref().map(|c| c.name)
    }

    /// Reports whether the running fallback policy created `subchannel`.
    pub(crate) fn owns(&self, subchannel: &Arc<dyn Subchannel>) -> bool {
        self.subchannels.contains(&WeakSubchannel::new(subchannel))
    }

    fn shutdown_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            child.policy.shutdown();
        }
        self.subchannels.clear();
    }

    fn finish_child_call(&mut self, wrapped: WrappedController<'_>) {
        for subchannel in wrapped.created_subchannels {
            self.subchannels.insert(subchannel.into());
        }
        if let Some(state) = wrapped.picker_update {
            wrapped.channel_controller.update_picker(state);
        }
    }
}

impl LbPolicy for FallbackPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.subchannels.retain(|sc| sc.upgrade().is_some());

        let xds_config = config.and_then(|c| c.convert_to::<XdsConfig>());
        let entry = xds_config
            .map(|c| c.fallback_policy.clone())
            .unwrap_or_else(default_fallback_policy);
        let builder = self
            .registry
            .get_policy(&entry.policy_name)
            .ok_or_else(|| format!("fallback policy {} is not registered", entry.policy_name))?;
        let child_config = builder.parse_config(&entry.config)?;

        if self.child_name() != Some(builder.name()) {
            if let Some(old) = self.child_name() {
                tracing::debug!("fallback policy changed from {old} to {}", builder.name());
            }
            self.shutdown_child();
            let work_requested = Arc::new(AtomicBool::new(false));
            let policy = builder.build(LbPolicyOptions {
                work_scheduler: Arc::new(FlagWorkScheduler {
                    work_requested: work_requested.clone(),
                    parent: self.options.work_scheduler.clone(),
                }),
                runtime: self.options.runtime.clone(),
                logger: self.options.logger.clone(),
            });
            self.child = Some(FallbackChild {
                name: builder.name(),
                policy,
                work_requested,
            });
        }

        let update = match update.endpoints {
            Ok(endpoints) if builder.name() == GRPCLB_POLICY_NAME => ResolverUpdate {
                endpoints: Ok(endpoints),
                ..update
            },
            Ok(endpoints) => {
                let backends: Vec<_> = endpoints.into_iter().filter(|e| !e.is_balancer()).collect();
                ResolverUpdate {
                    endpoints: if backends.is_empty() {
                        Err(NO_BACKENDS.to_string())
                    } else {
                        Ok(backends)
                    },
                    ..update
                }
            }
            Err(_) => update,
        };

        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        let mut wrapped = WrappedController::new(channel_controller);
        let result = child
            .policy
            .resolver_update(update, child_config.as_ref(), &mut wrapped);
        self.finish_child_call(wrapped);
        result
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if !self.owns(&subchannel) {
            tracing::debug!("ignoring update for {subchannel} of a replaced fallback policy");
            return;
        }
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        child
            .policy
            .subchannel_update(subchannel, state, &mut wrapped);
        self.finish_child_call(wrapped);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if !child.work_requested.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut wrapped = WrappedController::new(channel_controller);
        child.policy.work(&mut wrapped);
        self.finish_child_call(wrapped);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        child.policy.exit_idle(&mut wrapped);
        self.finish_child_call(wrapped);
    }

    fn shutdown(&mut self) {
        self.shutdown_child();
    }
}

struct FlagWorkScheduler {
    work_requested: Arc<AtomicBool>,
    parent: Arc<dyn WorkScheduler>,
}

impl WorkScheduler for FlagWorkScheduler {
    fn schedule_work(&self) {
        self.work_requested.store(true, Ordering::Release);
        self.parent.schedule_work();
    }
}
