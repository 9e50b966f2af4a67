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
use std::error::Error;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::load_balancing::{
    ChannelController, ChannelLogLevel, ChannelLogger, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, ParsedJsonLbConfig, PickResult, Subchannel, SubchannelState,
    WorkScheduler,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::rt::default_runtime;

pub(crate) const TEST_AUTHORITY: &str = "test-authority";

// A test subchannel that forwards connect calls to a channel.
// This allows tests to verify when a subchannel is asked to connect.
pub(crate) struct TestSubchannel {
    address: Address,
    tx_connect: mpsc::UnboundedSender<TestEvent>,
}

impl TestSubchannel {
    pub fn new(address: Address, tx_connect: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            address,
            tx_connect,
        }
    }
}

impl Display for TestSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestSubchannel({})", self.address)
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        let _ = self
            .tx_connect
            .send(TestEvent::Connect(self.address.clone()));
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<dyn Subchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    ScheduleWork,
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({})", addr.address),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
        }
    }
}

/// A test channel controller that forwards calls to a channel.  This allows
/// tests to verify when a channel controller is asked to create subchannels or
/// update the picker.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> =
            Arc::new(TestSubchannel::new(address.clone(), self.tx_events.clone()));
        self.tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()))
            .unwrap();
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.tx_events
            .send(TestEvent::UpdatePicker(update))
            .unwrap();
    }

    fn request_resolution(&mut self) {
        self.tx_events.send(TestEvent::RequestResolution).unwrap();
    }

    fn authority(&self) -> &str {
        TEST_AUTHORITY
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.tx_events.send(TestEvent::ScheduleWork);
    }
}

/// A logger that keeps every message for later inspection.
#[derive(Default)]
pub(crate) struct RecordingLogger {
    messages: Mutex<Vec<(ChannelLogLevel, String)>>,
}

impl RecordingLogger {
    pub(crate) fn messages(&self) -> Vec<(ChannelLogLevel, String)> {
        self.messages.lock().clone()
    }

    /// Returns how many messages at `level` contain `needle`.
    pub(crate) fn count(&self, level: ChannelLogLevel, needle: &str) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|(l, m)| *l == level && m.contains(needle))
            .count()
    }
}

impl ChannelLogger for RecordingLogger {
    fn log(&self, level: ChannelLogLevel, message: &str) {
        self.messages.lock().push((level, message.to_string()));
    }
}

/// Returns LbPolicyOptions whose work scheduler reports to `tx_events`.
pub(crate) fn test_options(tx_events: mpsc::UnboundedSender<TestEvent>) -> LbPolicyOptions {
    LbPolicyOptions {
        work_scheduler: Arc::new(TestWorkScheduler { tx_events }),
        runtime: default_runtime(),
        logger: Arc::new(RecordingLogger::default()),
    }
}

pub(crate) fn endpoint(addr: &str) -> Endpoint {
    Endpoint::new(vec![Address::tcp(addr)])
}

// Returns the next picker update, skipping other events.
pub(crate) async fn next_picker_update(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
) -> LbState {
    loop {
        match rx_events.recv().await.unwrap() {
            TestEvent::UpdatePicker(state) => return state,
            _ => continue,
        }
    }
}

// Returns the address of the subchannel a picker picked, panicking on any
// other result.
pub(crate) fn picked_address(result: PickResult) -> String {
    match result {
        PickResult::Pick(pick) => pick.subchannel.address().address,
        other => panic!("unexpected pick result {:?}", other),
    }
}

type ResolverUpdateFn = dyn Fn(
        &mut Data,
        ResolverUpdate,
        Option<&LbConfig>,
        &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>
    + Send
    + Sync;

type SubchannelUpdateFn =
    dyn Fn(&mut Data, Arc<dyn Subchannel>, &SubchannelState, &mut dyn ChannelController)
        + Send
        + Sync;

/// This struct holds `LbPolicy` trait stub functions that tests are expected to implement.
#[derive(Clone, Default)]
pub(crate) struct PolicyFuncs {
    pub resolver_update: Option<Arc<ResolverUpdateFn>>,
    pub subchannel_update: Option<Arc<SubchannelUpdateFn>>,
    pub work: Option<Arc<dyn Fn(&mut Data, &mut dyn ChannelController) + Send + Sync>>,
    pub shutdown: Option<Arc<dyn Fn(&mut Data) + Send + Sync>>,
    pub accepts_empty_endpoints: bool,
}

/// Data holds test data that will be passed all to functions in PolicyFuncs
#[derive(Default)]
pub(crate) struct Data {
    pub test_data: Option<Box<dyn Any + Send + Sync>>,
}

/// The stub `LbPolicy` that calls the provided functions.
pub(crate) struct StubPolicy {
    funcs: PolicyFuncs,
    data: Data,
}

impl LbPolicy for StubPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(f) = &self.funcs.resolver_update {
            return f(&mut self.data, update, config, channel_controller);
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if let Some(f) = &self.funcs.subchannel_update {
            f(&mut self.data, subchannel, state, channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.work {
            f(&mut self.data, channel_controller);
        }
    }

    fn shutdown(&mut self) {
        if let Some(f) = &self.funcs.shutdown {
            f(&mut self.data);
        }
    }

    fn accepts_empty_endpoints(&self) -> bool {
        self.funcs.accepts_empty_endpoints
    }
}

/// This StubPolicyBuilder builds a StubPolicy.  Configs are accepted as-is
/// and handed to the policy as a `ParsedJsonLbConfig`.
pub(crate) struct StubPolicyBuilder {
    name: &'static str,
    funcs: PolicyFuncs,
    builds: Arc<AtomicUsize>,
}

impl StubPolicyBuilder {
    pub fn new(name: &'static str, funcs: PolicyFuncs) -> Self {
        Self {
            name,
            funcs,
            builds: Arc::default(),
        }
    }

    /// Returns a counter of the policies built by this builder.
    pub fn build_counter(&self) -> Arc<AtomicUsize> {
        self.builds.clone()
    }
}

impl LbPolicyBuilder for StubPolicyBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Box::new(StubPolicy {
            funcs: self.funcs.clone(),
            data: Data::default(),
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(Some(LbConfig::new(config.clone())))
    }
}
