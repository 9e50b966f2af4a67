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

use std::any::Any;
use std::fmt::Display;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// An in-memory representation of a service config, usually provided to gRPC as
/// a JSON object.
///
/// Only the load-balancing subset is interpreted here; the rest of the object
/// is kept as-is.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServiceConfig {
    raw: Map<String, Value>,
}

/// One `{ "<policy name>": { ...config } }` entry of a `loadBalancingConfig`
/// list.
#[derive(Debug, Clone, PartialEq)]
pub struct LbPolicyEntry {
    pub policy_name: String,
    pub config: ParsedJsonLbConfig,
}

impl ServiceConfig {
    /// Parses a JSON service config.  The top level must be an object.
    pub fn from_json(json: &str) -> Result<Self, String> {
        match serde_json::from_str::<Value>(json) {
            Ok(Value::Object(raw)) => Ok(ServiceConfig { raw }),
            Ok(other) => Err(format!("service config must be a JSON object, got {other}")),
            Err(e) => Err(format!("failed to parse service config: {e}")),
        }
    }

    pub fn from_map(raw: Map<String, Value>) -> Self {
        ServiceConfig { raw }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns the load-balancing policies requested by this config, in order
    /// of preference.
    ///
    /// The `loadBalancingConfig` list wins over the legacy
    /// `loadBalancingPolicy` string.  A legacy policy name is lower-cased and
    /// carries an empty config.  Returns an empty list if the config says
    /// nothing about load balancing.
    pub fn lb_policies(&self) -> Result<Vec<LbPolicyEntry>, String> {
        if let Some(list) = self.raw.get("loadBalancingConfig") {
            let list = list
                .as_array()
                .ok_or_else(|| format!("loadBalancingConfig is not a list: {list}"))?;
            return list.iter().map(unwrap_lb_policy_entry).collect();
        }
        if let Some(policy) = self.raw.get("loadBalancingPolicy") {
            let policy = policy
                .as_str()
                .ok_or_else(|| format!("loadBalancingPolicy is not a string: {policy}"))?;
            return Ok(vec![LbPolicyEntry {
                policy_name: policy.to_lowercase(),
                config: ParsedJsonLbConfig::new(Value::Object(Map::new())),
            }]);
        }
        Ok(vec![])
    }
}

/// Unwraps a single `{ "<name>": { ...config } }` map.
pub(crate) fn unwrap_lb_policy_entry(entry: &Value) -> Result<LbPolicyEntry, String> {
    let map = entry
        .as_object()
        .ok_or_else(|| format!("load-balancing config entry is not an object: {entry}"))?;
    if map.len() != 1 {
        return Err(format!(
            "there should be exactly one policy in a load-balancing config entry, found {}: {entry}",
            map.len()
        ));
    }
    let (policy_name, config) = map
        .iter()
        .next()
        .ok_or_else(|| format!("empty load-balancing config entry: {entry}"))?;
    if !config.is_object() {
        return Err(format!("config of policy {policy_name} is not an object: {config}"));
    }
    Ok(LbPolicyEntry {
        policy_name: policy_name.clone(),
        config: ParsedJsonLbConfig::new(config.clone()),
    })
}

/// A convenience wrapper for an LB policy's configuration object, as produced
/// by [`LbPolicyBuilder::parse_config`].
///
/// [`LbPolicyBuilder::parse_config`]: crate::client::load_balancing::LbPolicyBuilder::parse_config
#[derive(Debug, Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    /// Create a new LbConfig wrapper containing the provided config.
    pub fn new(config: impl Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Convenience method to extract the LB policy's configuration object.
    pub fn convert_to<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.config.clone().downcast::<T>().ok()
    }
}

/// An LB policy configuration as it appears in the service config, before the
/// policy has parsed it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedJsonLbConfig {
    pub value: Value,
}

impl ParsedJsonLbConfig {
    pub fn new(value: Value) -> Self {
        ParsedJsonLbConfig { value }
    }

    /// Deserializes the JSON into the policy's own config type.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }
}

impl Display for ParsedJsonLbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}
