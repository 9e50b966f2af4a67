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

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use crate::client::ConnectivityState;
use crate::client::load_balancing::child_manager::{ChildManager, EndpointSharder};
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, PickRequest, PickResult, Picker, QueuingPicker, Subchannel,
    SubchannelState, pick_first,
};
use crate::client::name_resolution::{Endpoint, ResolverUpdate};

pub static POLICY_NAME: &str = "round_robin";
static START: Once = Once::new();

pub(crate) struct RoundRobinBuilder {}

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        let resolver_update_sharder = EndpointSharder::new(Arc::new(pick_first::Builder {}));
        let child_manager = ChildManager::new(Box::new(resolver_update_sharder), options);
        Box::new(RoundRobinPolicy { child_manager })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

/// Register round robin as a LbPolicy.
pub fn reg() {
    START.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(RoundRobinBuilder {});
    });
}

// Round robin runs one pick_first child per endpoint and spreads picks across
// the children in the aggregate state.
struct RoundRobinPolicy {
    child_manager: ChildManager<Endpoint>,
}

impl RoundRobinPolicy {
    // Sends a picker that rotates over every child in `state`.  Children in
    // no matching state leave a queuing picker.
    fn send_picker_with_children(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        aggregate_state: ConnectivityState,
        children_state: ConnectivityState,
    ) {
        let pickers: Vec<_> = self
            .child_manager
            .child_states()
            .filter(|(_, state)| state.connectivity_state == children_state)
            .map(|(_, state)| state.picker.clone())
            .collect();
        let picker: Arc<dyn Picker> = if pickers.is_empty() {
            Arc::new(QueuingPicker {})
        } else {
            Arc::new(RoundRobinPicker::new(pickers))
        };
        channel_controller.update_picker(LbState {
            connectivity_state: aggregate_state,
            picker,
        });
    }

    // If the aggregate state is Idle or Connecting, rotate over CONNECTING
    // children.  Otherwise rotate over the children in the aggregate state.
    fn send_aggregate_picker(&mut self, channel_controller: &mut dyn ChannelController) {
        let state = self.child_manager.aggregate_states();
        tracing::trace!("round_robin aggregate state is {state}");
        let children_state = match state {
            ConnectivityState::Idle | ConnectivityState::Connecting => ConnectivityState::Connecting,
            other => other,
        };
        self.send_picker_with_children(channel_controller, state, children_state);
    }

    fn move_children_from_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let should_exit_idle = self
            .child_manager
            .child_states()
            .any(|(_, state)| state.connectivity_state == ConnectivityState::Idle);
        if should_exit_idle {
            self.child_manager.exit_idle(channel_controller);
        }
    }

    fn move_to_transient_failure(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        error: String,
    ) {
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
        channel_controller.request_resolution();
    }

    fn finish_update(&mut self, channel_controller: &mut dyn ChannelController) {
        self.move_children_from_idle(channel_controller);
        if self.child_manager.has_updated() {
            self.send_aggregate_picker(channel_controller);
        }
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match &update.endpoints {
            Ok(endpoints) => {
                if !endpoints.iter().any(|ep| !ep.addresses.is_empty()) {
                    let error = "received empty address list from the name resolver";
                    self.child_manager.shutdown();
                    self.move_to_transient_failure(channel_controller, error.to_string());
                    return Err(error.into());
                }
                self.child_manager
                    .resolver_update(update, config, channel_controller)?;
            }
            Err(resolver_error) => {
                if !self.child_manager.has_children() {
                    let error = resolver_error.clone();
                    self.move_to_transient_failure(channel_controller, error.clone());
                    return Err(error.into());
                }
                // Children keep using their last good addresses.
                self.child_manager
                    .forward_update_to_children(channel_controller, update, config);
            }
        }
        self.finish_update(channel_controller);
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.child_manager
            .subchannel_update(subchannel, state, channel_controller);
        self.finish_update(channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        self.child_manager.work(channel_controller);
        self.finish_update(channel_controller);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.child_manager.exit_idle(channel_controller);
        self.finish_update(channel_controller);
    }

    fn shutdown(&mut self) {
        self.child_manager.shutdown();
    }
}

struct RoundRobinPicker {
    pickers: Vec<Arc<dyn Picker>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    // Callers pass at least one picker.
    fn new(pickers: Vec<Arc<dyn Picker>>) -> Self {
        let random_index: usize = rand::random_range(..pickers.len());
        Self {
            pickers,
            next: AtomicUsize::new(random_index),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, request: &PickRequest) -> PickResult {
        let len = self.pickers.len();
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % len;
        self.pickers[idx].pick(request)
    }
}
