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

//! The channel's top-level LB policy.  It picks which registered policy
//! governs the channel from the service config and the kinds of endpoints the
//! resolver returned, and swaps that delegate when the choice changes.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::Mutex;
use tonic::Status;

use crate::client::ConnectivityState;
use crate::client::load_balancing::child_manager::WrappedController;
use crate::client::load_balancing::{
    ChannelController, ChannelLogLevel, ChannelLogger, Failing, LbConfig, LbPolicy,
    LbPolicyBuilder, LbPolicyOptions, LbPolicyRegistry, LbState, ParsedJsonLbConfig,
    QueuingPicker, Subchannel, SubchannelState, WeakSubchannel, WorkScheduler, pick_first,
    round_robin,
};
use crate::client::name_resolution::{Endpoint, ResolverUpdate};
use crate::client::service_config::ServiceConfig;

/// Name of the look-aside balancer policy that receives balancer endpoints.
pub const GRPCLB_POLICY_NAME: &str = "grpclb";

/// The policy used when neither the service config nor the endpoints ask for
/// another one.
pub const DEFAULT_POLICY: &str = pick_first::POLICY_NAME;

/// Reasons no policy could be selected for a resolver update.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("None of [{}] specified by Service Config are available.", .0.join(", "))]
    NoneAvailable(Vec<String>),
    #[error("Received ONLY balancer addresses but grpclb runtime is missing")]
    OnlyBalancerAddresses,
    #[error("Trying to load '{policy}' because {reason}, but it's unavailable")]
    Unavailable { policy: String, reason: String },
    #[error("invalid load-balancing config: {0}")]
    InvalidServiceConfig(String),
}

/// The outcome of [`PolicySelector::decide`].
pub struct PolicySelection {
    pub builder: Arc<dyn LbPolicyBuilder>,
    /// The winning entry's raw config.  None when the policy was chosen
    /// without a service config entry.
    pub config: Option<ParsedJsonLbConfig>,
    /// The endpoints the delegate should see.
    pub endpoints: Vec<Endpoint>,
}

impl Debug for PolicySelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicySelection")
            .field("policy", &self.builder.name())
            .field("config", &self.config)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

/// Chooses a policy from a service config and a list of endpoints.
pub struct PolicySelector {
    registry: LbPolicyRegistry,
    default_policy: String,
    logger: Arc<dyn ChannelLogger>,
    last_skipped: Option<Vec<String>>,
    round_robin_due_to_missing_grpclb: bool,
}

impl PolicySelector {
    pub fn new(
        registry: LbPolicyRegistry,
        default_policy: impl Into<String>,
        logger: Arc<dyn ChannelLogger>,
    ) -> Self {
        Self {
            registry,
            default_policy: default_policy.into(),
            logger,
            last_skipped: None,
            round_robin_due_to_missing_grpclb: false,
        }
    }

    pub fn decide(
        &mut self,
        endpoints: &[Endpoint],
        service_config: Option<&ServiceConfig>,
    ) -> Result<PolicySelection, PolicyError> {
        let backends: Vec<Endpoint> = endpoints
            .iter()
            .filter(|ep| !ep.is_balancer())
            .cloned()
            .collect();
        let have_balancer_address = backends.len() != endpoints.len();

        let entries = match service_config {
            Some(sc) => sc.lb_policies().map_err(PolicyError::InvalidServiceConfig)?,
            None => vec![],
        };
        if !entries.is_empty() {
            let mut skipped: Vec<String> = vec![];
            for entry in entries {
                let Some(builder) = self.registry.get_policy(&entry.policy_name) else {
                    if !skipped.contains(&entry.policy_name) {
                        skipped.push(entry.policy_name);
                    }
                    continue;
                };
                self.log_skipped(skipped);
                let endpoints = if entry.policy_name == GRPCLB_POLICY_NAME {
                    endpoints.to_vec()
                } else {
                    backends
                };
                return Ok(PolicySelection {
                    builder,
                    config: Some(entry.config),
                    endpoints,
                });
            }
            if !have_balancer_address {
                return Err(PolicyError::NoneAvailable(skipped));
            }
        }

        if have_balancer_address {
            if let Some(builder) = self.registry.get_policy(GRPCLB_POLICY_NAME) {
                return Ok(PolicySelection {
                    builder,
                    config: None,
                    endpoints: endpoints.to_vec(),
                });
            }
            if backends.is_empty() {
                return Err(PolicyError::OnlyBalancerAddresses);
            }
            if !self.round_robin_due_to_missing_grpclb {
                self.round_robin_due_to_missing_grpclb = true;
                self.logger.log(
                    ChannelLogLevel::Error,
                    "Found balancer addresses but grpclb runtime is missing. \
                     Will use round_robin. Please include grpc-lb's grpclb support.",
                );
            }
            let builder = self.get_policy_or_fail(
                round_robin::POLICY_NAME,
                "received balancer addresses but grpclb runtime is missing",
            )?;
            return Ok(PolicySelection {
                builder,
                config: None,
                endpoints: backends,
            });
        }

        self.round_robin_due_to_missing_grpclb = false;
        let default_policy = self.default_policy.clone();
        let builder = self.get_policy_or_fail(&default_policy, "using default policy")?;
        Ok(PolicySelection {
            builder,
            config: None,
            endpoints: endpoints.to_vec(),
        })
    }

    // Logs the unavailable policies skipped on the way to a winner, once per
    // distinct set.
    fn log_skipped(&mut self, skipped: Vec<String>) {
        if skipped.is_empty() || self.last_skipped.as_ref() == Some(&skipped) {
            return;
        }
        self.logger.log(
            ChannelLogLevel::Debug,
            &format!(
                "[{}] specified by Service Config are not available",
                skipped.join(", ")
            ),
        );
        self.last_skipped = Some(skipped);
    }

    fn get_policy_or_fail(
        &self,
        policy: &str,
        reason: &str,
    ) -> Result<Arc<dyn LbPolicyBuilder>, PolicyError> {
        self.registry
            .get_policy(policy)
            .ok_or_else(|| PolicyError::Unavailable {
                policy: policy.to_string(),
                reason: reason.to_string(),
            })
    }
}

struct Delegate {
    name: &'static str,
    policy: Box<dyn LbPolicy>,
    generation: u64,
}

/// Top-level LB policy that delegates to the policy chosen by a
/// [`PolicySelector`].
///
/// Every delegate gets its own work scheduler and its subchannels are tagged
/// with the delegate's generation, so work requests and subchannel updates
/// belonging to a replaced delegate are dropped.
pub struct AutoConfiguredPolicy {
    selector: PolicySelector,
    delegate: Option<Delegate>,
    next_generation: u64,
    options: LbPolicyOptions,
    pending_work: Arc<Mutex<HashSet<u64>>>,
    subchannel_generations: HashMap<WeakSubchannel, u64>,
}

impl AutoConfiguredPolicy {
    /// Creates the policy and builds the default policy as the initial
    /// delegate if it is registered.
    pub fn new(
        registry: LbPolicyRegistry,
        default_policy: impl Into<String>,
        options: LbPolicyOptions,
    ) -> Self {
        let default_policy = default_policy.into();
        let initial = registry.get_policy(&default_policy);
        let mut policy = Self {
            selector: PolicySelector::new(registry, default_policy, options.logger.clone()),
            delegate: None,
            next_generation: 0,
            options,
            pending_work: Arc::default(),
            subchannel_generations: HashMap::new(),
        };
        match initial {
            Some(builder) => policy.build_delegate(builder),
            None => tracing::warn!(
                "default LB policy '{}' is not registered",
                policy.selector.default_policy
            ),
        }
        policy
    }

    /// Returns the name of the current delegate's policy, if any.
    pub fn delegate_name(&self) -> Option<&'static str> {
        self.delegate.as_ref().map(|d| d.name)
    }

    /// Handles a resolver update, returning UNAVAILABLE if the selected
    /// delegate cannot use the endpoints.
    pub fn try_resolver_update(
        &mut self,
        update: ResolverUpdate,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Status> {
        self.subchannel_generations
            .retain(|sc, _| sc.upgrade().is_some());

        let endpoints = match &update.endpoints {
            Ok(endpoints) => endpoints.clone(),
            Err(error) => {
                self.handle_resolution_error(update.clone(), error.clone(), channel_controller);
                return Ok(());
            }
        };
        let service_config = match &update.service_config {
            Ok(sc) => sc.as_ref(),
            Err(e) => {
                tracing::debug!("ignoring invalid service config: {e}");
                None
            }
        };

        let selection = match self.selector.decide(&endpoints, service_config) {
            Ok(selection) => selection,
            Err(e) => {
                channel_controller.update_picker(LbState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    picker: Arc::new(Failing {
                        error: e.to_string(),
                    }),
                });
                self.shutdown_delegate();
                return Ok(());
            }
        };

        // A config the selected policy rejects leaves the current delegate
        // and its picker in place.
        let config = match &selection.config {
            Some(raw) => {
                self.options.logger.log(
                    ChannelLogLevel::Debug,
                    &format!("Load-balancing config: {raw}"),
                );
                selection.builder.parse_config(raw).map_err(|e| {
                    Status::unavailable(format!(
                        "failed to parse {} config: {e}",
                        selection.builder.name()
                    ))
                })?
            }
            None => None,
        };

        if self.delegate_name() != Some(selection.builder.name()) {
            self.switch_to(selection.builder.clone(), channel_controller);
        }

        let Some(delegate) = self.delegate.as_mut() else {
            return Ok(());
        };
        let generation = delegate.generation;
        let mut wrapped = WrappedController::new(channel_controller);

        if selection.endpoints.is_empty() && !delegate.policy.accepts_empty_endpoints() {
            let message = format!(
                "NameResolver returned no usable address. addrs={}, attrs={:?}",
                display_endpoints(&endpoints),
                update.attributes
            );
            let error_update = ResolverUpdate {
                endpoints: Err(message.clone()),
                ..update
            };
            let _ = delegate
                .policy
                .resolver_update(error_update, config.as_ref(), &mut wrapped);
            self.finish_delegate_call(wrapped, generation);
            return Err(Status::unavailable(message));
        }

        let delegate_update = ResolverUpdate {
            endpoints: Ok(selection.endpoints),
            ..update
        };
        if let Err(e) = delegate
            .policy
            .resolver_update(delegate_update, config.as_ref(), &mut wrapped)
        {
            tracing::debug!("{} rejected resolver update: {e}", delegate.name);
        }
        self.finish_delegate_call(wrapped, generation);
        Ok(())
    }

    /// Replaces the current delegate with a new policy built from `builder`.
    /// The channel sees CONNECTING until the new delegate publishes.
    pub fn switch_to(
        &mut self,
        builder: Arc<dyn LbPolicyBuilder>,
        channel_controller: &mut dyn ChannelController,
    ) {
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        });
        let old = self.delegate_name();
        self.shutdown_delegate();
        self.build_delegate(builder);
        if let (Some(old), Some(new)) = (old, self.delegate_name()) {
            self.options.logger.log(
                ChannelLogLevel::Info,
                &format!("Load balancer changed from {old} to {new}"),
            );
        }
    }

    fn build_delegate(&mut self, builder: Arc<dyn LbPolicyBuilder>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let policy = builder.build(LbPolicyOptions {
            work_scheduler: Arc::new(GenerationWorkScheduler {
                generation,
                pending_work: self.pending_work.clone(),
                parent: self.options.work_scheduler.clone(),
            }),
            runtime: self.options.runtime.clone(),
            logger: self.options.logger.clone(),
        });
        self.delegate = Some(Delegate {
            name: builder.name(),
            policy,
            generation,
        });
    }

    fn shutdown_delegate(&mut self) {
        if let Some(mut delegate) = self.delegate.take() {
            delegate.policy.shutdown();
        }
    }

    fn handle_resolution_error(
        &mut self,
        update: ResolverUpdate,
        error: String,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(delegate) = self.delegate.as_mut() else {
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(Failing { error }),
            });
            return;
        };
        let generation = delegate.generation;
        let mut wrapped = WrappedController::new(channel_controller);
        let _ = delegate.policy.resolver_update(update, None, &mut wrapped);
        self.finish_delegate_call(wrapped, generation);
    }

    // Records subchannels created by the delegate and forwards its picker.
    fn finish_delegate_call(&mut self, wrapped: WrappedController<'_>, generation: u64) {
        for subchannel in wrapped.created_subchannels {
            self.subchannel_generations
                .insert(subchannel.into(), generation);
        }
        if let Some(state) = wrapped.picker_update {
            wrapped.channel_controller.update_picker(state);
        }
    }
}

impl LbPolicy for AutoConfiguredPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(self.try_resolver_update(update, channel_controller)?)
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let owner = self
            .subchannel_generations
            .get(&WeakSubchannel::new(&subchannel))
            .copied();
        let Some(delegate) = self.delegate.as_mut() else {
            return;
        };
        if owner != Some(delegate.generation) {
            tracing::debug!("ignoring update for {subchannel} of a replaced LB policy");
            return;
        }
        let generation = delegate.generation;
        let mut wrapped = WrappedController::new(channel_controller);
        delegate
            .policy
            .subchannel_update(subchannel, state, &mut wrapped);
        self.finish_delegate_call(wrapped, generation);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let pending = std::mem::take(&mut *self.pending_work.lock());
        let Some(delegate) = self.delegate.as_mut() else {
            return;
        };
        if !pending.contains(&delegate.generation) {
            return;
        }
        let generation = delegate.generation;
        let mut wrapped = WrappedController::new(channel_controller);
        delegate.policy.work(&mut wrapped);
        self.finish_delegate_call(wrapped, generation);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(delegate) = self.delegate.as_mut() else {
            return;
        };
        let generation = delegate.generation;
        let mut wrapped = WrappedController::new(channel_controller);
        delegate.policy.exit_idle(&mut wrapped);
        self.finish_delegate_call(wrapped, generation);
    }

    fn shutdown(&mut self) {
        self.shutdown_delegate();
        self.subchannel_generations.clear();
    }

    fn accepts_empty_endpoints(&self) -> bool {
        true
    }
}

fn display_endpoints(endpoints: &[Endpoint]) -> String {
    let list: Vec<String> = endpoints.iter().map(|ep| ep.to_string()).collect();
    format!("[{}]", list.join(", "))
}

// Work requests of a delegate, honoured only while that delegate is current.
struct GenerationWorkScheduler {
    generation: u64,
    pending_work: Arc<Mutex<HashSet<u64>>>,
    parent: Arc<dyn WorkScheduler>,
}

impl WorkScheduler for GenerationWorkScheduler {
    fn schedule_work(&self) {
        self.pending_work.lock().insert(self.generation);
        self.parent.schedule_work();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{AutoConfiguredPolicy, GenerationWorkScheduler, PolicyError, PolicySelector};
    use crate::client::ConnectivityState;
    use crate::client::load_balancing::test_utils::{
        Data, PolicyFuncs, RecordingLogger, StubPolicyBuilder, TestChannelController, TestEvent,
        TestWorkScheduler, endpoint,
    };
    use crate::client::load_balancing::xds::XdsPolicyBuilder;
    use crate::client::load_balancing::{
        ChannelController, ChannelLogLevel, LbConfig, LbPolicy, LbPolicyOptions,
        LbPolicyRegistry, ParsedJsonLbConfig, PickRequest, PickResult, SubchannelState,
        WorkScheduler, pick_first, round_robin,
    };
    use crate::client::name_resolution::{Endpoint, ResolverUpdate};
    use crate::client::service_config::ServiceConfig;
    use crate::rt::default_runtime;

    // What a stub delegate saw in its last resolver update.
    #[derive(Default)]
    struct Seen {
        endpoints: Option<Result<Vec<Endpoint>, String>>,
        config: Option<serde_json::Value>,
        updates: usize,
        shutdowns: usize,
    }

    fn recording_funcs(seen: Arc<Mutex<Seen>>, accepts_empty_endpoints: bool) -> PolicyFuncs {
        let on_update = seen.clone();
        PolicyFuncs {
            resolver_update: Some(Arc::new(
                move |_data: &mut Data,
                      update: ResolverUpdate,
                      config: Option<&LbConfig>,
                      _controller: &mut dyn ChannelController| {
                    let mut seen = on_update.lock();
                    seen.updates += 1;
                    seen.endpoints = Some(update.endpoints);
                    seen.config = config
                        .and_then(|c| c.convert_to::<ParsedJsonLbConfig>())
                        .map(|c| c.value.clone());
                    Ok(())
                },
            )),
            shutdown: Some(Arc::new(move |_data: &mut Data| {
                seen.lock().shutdowns += 1;
            })),
            accepts_empty_endpoints,
            ..Default::default()
        }
    }

    fn base_registry() -> LbPolicyRegistry {
        let registry = LbPolicyRegistry::new();
        registry.add_builder(pick_first::Builder {});
        registry.add_builder(round_robin::RoundRobinBuilder {});
        registry
    }

    fn selector(registry: LbPolicyRegistry) -> (PolicySelector, Arc<RecordingLogger>) {
        let logger = Arc::new(RecordingLogger::default());
        (
            PolicySelector::new(registry, "pick_first", logger.clone()),
            logger,
        )
    }

    fn service_config(json: &str) -> ServiceConfig {
        ServiceConfig::from_json(json).unwrap()
    }

    fn balancer(addr: &str) -> Endpoint {
        endpoint(addr).into_balancer("ok")
    }

    fn setup(
        registry: LbPolicyRegistry,
        default_policy: &str,
    ) -> (
        AutoConfiguredPolicy,
        mpsc::UnboundedReceiver<TestEvent>,
        TestChannelController,
        Arc<RecordingLogger>,
    ) {
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let logger = Arc::new(RecordingLogger::default());
        let options = LbPolicyOptions {
            work_scheduler: Arc::new(TestWorkScheduler {
                tx_events: tx_events.clone(),
            }),
            runtime: default_runtime(),
            logger: logger.clone(),
        };
        let policy = AutoConfiguredPolicy::new(registry, default_policy, options);
        (policy, rx_events, TestChannelController { tx_events }, logger)
    }

    fn update_with_config(endpoints: Vec<Endpoint>, json: &str) -> ResolverUpdate {
        ResolverUpdate {
            service_config: Ok(Some(service_config(json))),
            ..ResolverUpdate::with_endpoints(endpoints)
        }
    }

    fn last_picker_state(
        rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    ) -> Option<ConnectivityState> {
        let mut last = None;
        while let Ok(event) = rx_events.try_recv() {
            if let TestEvent::UpdatePicker(state) = event {
                last = Some(state.connectivity_state);
            }
        }
        last
    }

    #[test]
    fn default_delegate_is_pick_first() {
        let (policy, _rx, _tcc, _logger) = setup(base_registry(), "pick_first");
        assert_eq!(policy.delegate_name(), Some("pick_first"));
    }

    #[test]
    fn default_delegate_is_configurable() {
        let registry = base_registry();
        let builder = StubPolicyBuilder::new("test_lb", PolicyFuncs::default());
        let builds = builder.build_counter();
        registry.add_builder(builder);
        let (policy, _rx, _tcc, _logger) = setup(registry, "test_lb");
        assert_eq!(policy.delegate_name(), Some("test_lb"));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn same_policy_keeps_delegate_and_propagates_config() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let registry = base_registry();
        let builder = StubPolicyBuilder::new("test_lb", recording_funcs(seen.clone(), false));
        let builds = builder.build_counter();
        registry.add_builder(builder);
        let (mut policy, _rx, mut tcc, logger) = setup(registry, "test_lb");

        let servers = vec![endpoint("1.1.1.1:1"), endpoint("2.2.2.2:2")];
        let update = update_with_config(
            servers.clone(),
            r#"{"loadBalancingConfig": [{"test_lb": {"setting1": "high"}}]}"#,
        );
        policy.try_resolver_update(update, &mut tcc).unwrap();
        {
            let seen = seen.lock();
            assert_eq!(seen.endpoints, Some(Ok(servers.clone())));
            assert_eq!(seen.config, Some(json!({"setting1": "high"})));
        }

        let update = update_with_config(
            servers.clone(),
            r#"{"loadBalancingConfig": [{"test_lb": {"setting1": "low"}}]}"#,
        );
        policy.try_resolver_update(update, &mut tcc).unwrap();
        let seen = seen.lock();
        assert_eq!(seen.updates, 2);
        assert_eq!(seen.config, Some(json!({"setting1": "low"})));
        assert_eq!(seen.shutdowns, 0);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(
            logger.count(ChannelLogLevel::Debug, "Load-balancing config: "),
            2
        );
        assert_eq!(logger.count(ChannelLogLevel::Info, "Load balancer changed"), 0);
    }

    #[test]
    fn changed_policy_shuts_down_old_delegate_once() {
        let seen_old = Arc::new(Mutex::new(Seen::default()));
        let seen_new = Arc::new(Mutex::new(Seen::default()));
        let registry = base_registry();
        registry.add_builder(StubPolicyBuilder::new(
            "test_lb",
            recording_funcs(seen_old.clone(), false),
        ));
        registry.add_builder(StubPolicyBuilder::new(
            "test_lb2",
            recording_funcs(seen_new.clone(), false),
        ));
        let (mut policy, mut rx_events, mut tcc, logger) = setup(registry, "test_lb");

        let update = update_with_config(
            vec![endpoint("1.1.1.1:1")],
            r#"{"loadBalancingPolicy": "TEST_LB2"}"#,
        );
        policy.try_resolver_update(update.clone(), &mut tcc).unwrap();
        policy.try_resolver_update(update, &mut tcc).unwrap();

        assert_eq!(policy.delegate_name(), Some("test_lb2"));
        assert_eq!(seen_old.lock().shutdowns, 1);
        assert_eq!(seen_new.lock().shutdowns, 0);
        assert_eq!(seen_new.lock().updates, 2);
        assert_eq!(seen_new.lock().config, Some(json!({})));
        assert_eq!(
            logger.count(
                ChannelLogLevel::Info,
                "Load balancer changed from test_lb to test_lb2"
            ),
            1
        );
        assert_eq!(
            last_picker_state(&mut rx_events),
            Some(ConnectivityState::Connecting)
        );
    }

    #[test]
    fn only_backends_reach_non_balancer_delegate() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let registry = base_registry();
        registry.add_builder(StubPolicyBuilder::new("test_lb", recording_funcs(seen.clone(), false)));
        let (mut policy, _rx, mut tcc, _logger) = setup(registry, "pick_first");

        let update = update_with_config(
            vec![endpoint("1.1.1.1:1"), balancer("9.9.9.9:9")],
            r#"{"loadBalancingConfig": [{"test_lb": {}}]}"#,
        );
        policy.try_resolver_update(update, &mut tcc).unwrap();
        assert_eq!(policy.delegate_name(), Some("test_lb"));
        assert_eq!(
            seen.lock().endpoints,
            Some(Ok(vec![endpoint("1.1.1.1:1")]))
        );
    }

    #[test]
    fn empty_endpoints_are_a_resolution_error_for_delegates_that_refuse_them() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let registry = base_registry();
        registry.add_builder(StubPolicyBuilder::new("test_lb", recording_funcs(seen.clone(), false)));
        let (mut policy, _rx, mut tcc, _logger) = setup(registry, "test_lb");

        let status = policy
            .try_resolver_update(ResolverUpdate::with_endpoints(vec![]), &mut tcc)
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().starts_with("NameResolver returned no usable address"));
        assert_eq!(policy.delegate_name(), Some("test_lb"));
        match &seen.lock().endpoints {
            Some(Err(msg)) => assert!(msg.starts_with("NameResolver returned no usable address")),
            other => panic!("delegate saw {:?}", other),
        }
    }

    #[test]
    fn empty_endpoints_reach_delegates_that_accept_them() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let registry = base_registry();
        registry.add_builder(StubPolicyBuilder::new("test_lb2", recording_funcs(seen.clone(), true)));
        let (mut policy, _rx, mut tcc, _logger) = setup(registry, "pick_first");

        let update = update_with_config(
            vec![],
            r#"{"loadBalancingConfig": [{"test_lb2": {"setting1": "high"}}]}"#,
        );
        policy.try_resolver_update(update, &mut tcc).unwrap();
        assert_eq!(policy.delegate_name(), Some("test_lb2"));
        let seen = seen.lock();
        assert_eq!(seen.endpoints, Some(Ok(vec![])));
        assert_eq!(seen.config, Some(json!({"setting1": "high"})));
    }

    #[test]
    fn policy_error_fails_picks_and_next_update_recovers() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let registry = base_registry();
        registry.add_builder(StubPolicyBuilder::new("test_lb", recording_funcs(seen.clone(), false)));
        let (mut policy, mut rx_events, mut tcc, _logger) = setup(registry, "test_lb");

        let update = update_with_config(
            vec![endpoint("1.1.1.1:1")],
            r#"{"loadBalancingConfig": [{"magic_balancer": {}}]}"#,
        );
        policy.try_resolver_update(update, &mut tcc).unwrap();
        assert_eq!(policy.delegate_name(), None);
        assert_eq!(seen.lock().shutdowns, 1);
        let mut failing = None;
        while let Ok(event) = rx_events.try_recv() {
            if let TestEvent::UpdatePicker(state) = event {
                failing = Some(state);
            }
        }
        let failing = failing.unwrap();
        assert_eq!(failing.connectivity_state, ConnectivityState::TransientFailure);
        match failing.picker.pick(&PickRequest::default()) {
            PickResult::Fail(status) => assert_eq!(
                status.message(),
                "None of [magic_balancer] specified by Service Config are available."
            ),
            other => panic!("unexpected pick result {:?}", other),
        }

        policy
            .try_resolver_update(
                ResolverUpdate::with_endpoints(vec![endpoint("1.1.1.1:1")]),
                &mut tcc,
            )
            .unwrap();
        assert_eq!(policy.delegate_name(), Some("test_lb"));
    }

    #[test]
    fn rejected_config_keeps_current_delegate() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let registry = base_registry();
        registry.add_builder(StubPolicyBuilder::new("test_lb", recording_funcs(seen.clone(), false)));
        registry.add_builder(XdsPolicyBuilder::new(registry.clone()));
        let (mut policy, mut rx_events, mut tcc, _logger) = setup(registry, "test_lb");
        policy
            .try_resolver_update(
                ResolverUpdate::with_endpoints(vec![endpoint("1.1.1.1:1")]),
                &mut tcc,
            )
            .unwrap();
        while rx_events.try_recv().is_ok() {}

        // balancerName is required.
        let update = update_with_config(
            vec![endpoint("1.1.1.2:1")],
            r#"{"loadBalancingConfig": [{"xds_experimental": {}}]}"#,
        );
        let status = policy.try_resolver_update(update, &mut tcc).unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(
            status
                .message()
                .starts_with("failed to parse xds_experimental config"),
            "{}",
            status.message()
        );
        assert_eq!(policy.delegate_name(), Some("test_lb"));
        assert_eq!(seen.lock().shutdowns, 0);
        assert_eq!(last_picker_state(&mut rx_events), None);

        policy
            .try_resolver_update(
                ResolverUpdate::with_endpoints(vec![endpoint("1.1.1.3:1")]),
                &mut tcc,
            )
            .unwrap();
        let seen = seen.lock();
        assert_eq!(seen.updates, 2);
        assert_eq!(seen.endpoints, Some(Ok(vec![endpoint("1.1.1.3:1")])));
    }

    #[test]
    fn stale_delegate_work_and_subchannels_are_ignored() {
        let works = Arc::new(AtomicUsize::new(0));
        let registry = base_registry();
        let works_clone = works.clone();
        registry.add_builder(StubPolicyBuilder::new(
            "test_lb",
            PolicyFuncs {
                resolver_update: Some(Arc::new(
                    |_data: &mut Data,
                     update: ResolverUpdate,
                     _: Option<&LbConfig>,
                     controller: &mut dyn ChannelController| {
                        for ep in update.endpoints? {
                            controller.new_subchannel(&ep.addresses[0]);
                        }
                        Ok(())
                    },
                )),
                work: Some(Arc::new(
                    move |_data: &mut Data, _controller: &mut dyn ChannelController| {
                        works_clone.fetch_add(1, Ordering::SeqCst);
                    },
                )),
                ..Default::default()
            },
        ));
        let (mut policy, mut rx_events, mut tcc, _logger) = setup(registry, "test_lb");
        policy
            .try_resolver_update(
                ResolverUpdate::with_endpoints(vec![endpoint("1.1.1.1:1")]),
                &mut tcc,
            )
            .unwrap();
        let old_subchannel = loop {
            if let TestEvent::NewSubchannel(sc) = rx_events.try_recv().unwrap() {
                break sc;
            }
        };
        // The scheduler handed to the first delegate.
        let old_scheduler = GenerationWorkScheduler {
            generation: 0,
            pending_work: policy.pending_work.clone(),
            parent: Arc::new(TestWorkScheduler {
                tx_events: tcc.tx_events.clone(),
            }),
        };
        old_scheduler.schedule_work();
        policy.work(&mut tcc);
        assert_eq!(works.load(Ordering::SeqCst), 1);

        let update = update_with_config(
            vec![endpoint("1.1.1.1:1")],
            r#"{"loadBalancingPolicy": "pick_first"}"#,
        );
        policy.try_resolver_update(update, &mut tcc).unwrap();
        assert_eq!(policy.delegate_name(), Some("pick_first"));

        // Work requested by the replaced delegate is dropped.
        old_scheduler.schedule_work();
        policy.work(&mut tcc);
        assert_eq!(works.load(Ordering::SeqCst), 1);

        // State changes of the replaced delegate's subchannels are dropped.
        while rx_events.try_recv().is_ok() {}
        policy.subchannel_update(
            old_subchannel,
            &SubchannelState::new(ConnectivityState::Ready),
            &mut tcc,
        );
        assert_eq!(last_picker_state(&mut rx_events), None);
    }

    #[test]
    fn decide_without_config_uses_default_policy() {
        let (mut selector, logger) = selector(base_registry());
        let servers = vec![endpoint("1.1.1.1:1")];
        let selection = selector.decide(&servers, None).unwrap();
        assert_eq!(selection.builder.name(), "pick_first");
        assert_eq!(selection.endpoints, servers);
        assert!(selection.config.is_none());

        let selection = selector
            .decide(&servers, Some(&ServiceConfig::default()))
            .unwrap();
        assert_eq!(selection.builder.name(), "pick_first");
        assert!(selection.config.is_none());
        assert!(logger.messages().is_empty());
    }

    #[test]
    fn decide_with_custom_default() {
        let registry = base_registry();
        registry.add_builder(StubPolicyBuilder::new("test_lb", PolicyFuncs::default()));
        let mut selector = PolicySelector::new(
            registry,
            "test_lb",
            Arc::new(RecordingLogger::default()),
        );
        let selection = selector.decide(&[endpoint("1.1.1.1:1")], None).unwrap();
        assert_eq!(selection.builder.name(), "test_lb");
    }

    #[test]
    fn decide_balancer_addresses_select_grpclb() {
        let registry = base_registry();
        registry.add_builder(StubPolicyBuilder::new("grpclb", PolicyFuncs::default()));
        let (mut selector, logger) = selector(registry);
        let servers = vec![endpoint("1.1.1.1:1"), balancer("9.9.9.9:9")];

        let selection = selector.decide(&servers, None).unwrap();
        assert_eq!(selection.builder.name(), "grpclb");
        assert_eq!(selection.endpoints, servers);
        assert!(selection.config.is_none());

        // An explicit grpclb entry keeps its config and all endpoints.
        let sc = service_config(
            r#"{"loadBalancingConfig": [{"grpclb": {"childPolicy": [{"pick_first": {}}]}}]}"#,
        );
        let selection = selector.decide(&servers, Some(&sc)).unwrap();
        assert_eq!(selection.builder.name(), "grpclb");
        assert_eq!(selection.endpoints, servers);
        assert_eq!(
            selection.config.unwrap().value,
            json!({"childPolicy": [{"pick_first": {}}]})
        );

        // Unavailable configured policies fall back to grpclb when balancer
        // addresses are present.
        let sc = service_config(r#"{"loadBalancingConfig": [{"magic_balancer": {}}]}"#);
        let selection = selector.decide(&servers, Some(&sc)).unwrap();
        assert_eq!(selection.builder.name(), "grpclb");
        assert!(selection.config.is_none());
        assert!(logger.messages().is_empty());
    }

    #[test]
    fn decide_configured_policy_filters_balancer_addresses() {
        let registry = base_registry();
        registry.add_builder(StubPolicyBuilder::new("grpclb", PolicyFuncs::default()));
        let (mut selector, _logger) = selector(registry);
        let servers = vec![endpoint("1.1.1.1:1"), balancer("9.9.9.9:9")];

        let sc = service_config(r#"{"loadBalancingPolicy": "ROUND_ROBIN"}"#);
        let selection = selector.decide(&servers, Some(&sc)).unwrap();
        assert_eq!(selection.builder.name(), "round_robin");
        assert_eq!(selection.endpoints, vec![endpoint("1.1.1.1:1")]);
        assert_eq!(selection.config.unwrap().value, json!({}));

        let sc = service_config(r#"{"loadBalancingConfig": [{"round_robin": {}}]}"#);
        let selection = selector.decide(&servers, Some(&sc)).unwrap();
        assert_eq!(selection.builder.name(), "round_robin");
        assert_eq!(selection.endpoints, vec![endpoint("1.1.1.1:1")]);
    }

    #[test]
    fn decide_missing_grpclb_falls_back_to_round_robin_and_logs_once() {
        let (mut selector, logger) = selector(base_registry());
        let servers = vec![balancer("9.9.9.9:9"), endpoint("1.1.1.1:1")];

        let selection = selector.decide(&servers, None).unwrap();
        assert_eq!(selection.builder.name(), "round_robin");
        assert!(selection.config.is_none());
        assert_eq!(selection.endpoints, vec![endpoint("1.1.1.1:1")]);

        let selection = selector.decide(&servers, None).unwrap();
        assert_eq!(selection.builder.name(), "round_robin");
        assert_eq!(
            logger.count(
                ChannelLogLevel::Error,
                "Found balancer addresses but grpclb runtime is missing. Will use round_robin."
            ),
            1
        );
        assert_eq!(logger.messages().len(), 1);
    }

    #[test]
    fn decide_only_balancer_addresses_without_grpclb_fails() {
        let (mut selector, _logger) = selector(base_registry());
        let sc = service_config(r#"{"loadBalancingConfig": [{"grpclb": {}}]}"#);
        let err = selector
            .decide(&[balancer("9.9.9.9:9")], Some(&sc))
            .unwrap_err();
        assert_eq!(err, PolicyError::OnlyBalancerAddresses);
        assert_eq!(
            err.to_string(),
            "Received ONLY balancer addresses but grpclb runtime is missing"
        );
    }

    #[test]
    fn decide_unknown_policies_fail() {
        let (mut selector, _logger) = selector(base_registry());
        let servers = vec![endpoint("1.1.1.1:1")];
        for json in [
            r#"{"loadBalancingPolicy": "MAGIC_BALANCER"}"#,
            r#"{"loadBalancingConfig": [{"magic_balancer": {}}]}"#,
        ] {
            let err = selector
                .decide(&servers, Some(&service_config(json)))
                .unwrap_err();
            assert_eq!(
                err.to_string(),
                "None of [magic_balancer] specified by Service Config are available."
            );
        }
    }

    #[test]
    fn decide_skips_unknown_policies_and_logs_each_set_once() {
        let (mut selector, logger) = selector(base_registry());
        let servers = vec![endpoint("1.1.1.1:1")];
        let sc = service_config(
            r#"{"loadBalancingConfig": [{"magic_balancer": {}}, {"round_robin": {}}]}"#,
        );
        for _ in 0..2 {
            let selection = selector.decide(&servers, Some(&sc)).unwrap();
            assert_eq!(selection.builder.name(), "round_robin");
            assert_eq!(selection.endpoints, servers);
            assert_eq!(selection.config.unwrap().value, json!({}));
        }
        assert_eq!(
            logger.count(
                ChannelLogLevel::Debug,
                "[magic_balancer] specified by Service Config are not available"
            ),
            1
        );
    }

    #[test]
    fn decide_missing_default_policy_fails() {
        let mut selector = PolicySelector::new(
            LbPolicyRegistry::new(),
            "pick_first",
            Arc::new(RecordingLogger::default()),
        );
        let err = selector.decide(&[endpoint("1.1.1.1:1")], None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Trying to load 'pick_first' because using default policy, but it's unavailable"
        );
    }
}
