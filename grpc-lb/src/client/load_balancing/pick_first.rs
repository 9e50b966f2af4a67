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

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::{Arc, LazyLock, Once};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Deserialize;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, ParsedJsonLbConfig, Pick, PickRequest, PickResult, Picker,
    QueuingPicker, Subchannel, SubchannelState, WorkScheduler,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};

// A function type that takes a mutable slice of endpoints and shuffles them.
type EndpointShuffler = dyn Fn(&mut [Endpoint]) + Send + Sync + 'static;

// A global shuffler function that can be overridden for testing.
pub(crate) static SHUFFLE_ENDPOINTS_FN: LazyLock<Mutex<Box<EndpointShuffler>>> =
    LazyLock::new(|| Mutex::new(thread_rng_shuffler()));

pub(crate) fn thread_rng_shuffler() -> Box<EndpointShuffler> {
    Box::new(|endpoints: &mut [Endpoint]| endpoints.shuffle(&mut rand::rng()))
}

pub static POLICY_NAME: &str = "pick_first";

pub(crate) struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            work_scheduler: options.work_scheduler,
            subchannel_list: None,
            selected_subchannel: None,
            addresses: vec![],
            last_resolver_error: None,
            last_connection_error: None,
            connectivity_state: ConnectivityState::Connecting,
            sent_connecting_state: false,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg: PickFirstConfig = config
            .convert_to()
            .map_err(|e| format!("failed to parse JSON config: {e}"))?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PickFirstConfig {
    pub(crate) shuffle_address_list: Option<bool>,
}

pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

struct PickFirstPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    subchannel_list: Option<SubchannelList>, // Subchannels we are currently connecting to.
    selected_subchannel: Option<Arc<dyn Subchannel>>, // The currently connected subchannel.
    addresses: Vec<Address>,                 // Most recent addresses from the name resolver.
    last_resolver_error: Option<String>,
    last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
    connectivity_state: ConnectivityState,
    sent_connecting_state: bool,
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match update.endpoints {
            Ok(mut endpoints) => {
                tracing::debug!("received update from resolver with endpoints: {endpoints:?}");
                self.shuffle_endpoints(config, &mut endpoints);

                let new_addresses = address_list_from_endpoints(&endpoints);
                // Treat empty resolver updates identically to resolver errors
                // that occur before any valid update has been received.
                if new_addresses.is_empty() {
                    self.handle_empty_endpoints(channel_controller);
                    return Err("received empty address list from the name resolver".into());
                }

                // Start using the new address list unless in IDLE, in which
                // case exit_idle() or the idle picker does that.
                self.addresses = new_addresses;
                if self.connectivity_state != ConnectivityState::Idle {
                    self.start_subchannel_list(channel_controller);
                }
            }
            Err(error) => {
                tracing::debug!("received error from resolver: {error}");
                self.last_resolver_error = Some(error);
                // Keep using the previous good update, if one exists.
                if self.addresses.is_empty()
                    || self.connectivity_state == ConnectivityState::TransientFailure
                {
                    self.move_to_transient_failure(channel_controller);
                }
            }
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        tracing::trace!("received update for {subchannel}: {state}");

        if self
            .subchannel_list
            .as_ref()
            .is_some_and(|list| list.contains(&subchannel))
        {
            if state.connectivity_state == ConnectivityState::Ready {
                self.move_to_ready(subchannel, channel_controller);
            } else {
                self.update_tracked_subchannel(&subchannel, state, channel_controller);
            }
            return;
        }

        // Any state change of the selected subchannel means it is no longer
        // connected.
        if self
            .selected_subchannel
            .as_ref()
            .is_some_and(|selected| *selected == subchannel)
            && state.connectivity_state != ConnectivityState::Ready
        {
            self.move_to_idle(channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        // Reconnect from the first address after going IDLE.
        if self.connectivity_state == ConnectivityState::Idle && !self.addresses.is_empty() {
            self.start_subchannel_list(channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.work(channel_controller);
    }

    fn shutdown(&mut self) {
        self.subchannel_list = None;
        self.selected_subchannel = None;
    }
}

// Flattens the endpoints by concatenating their ordered address lists and
// drops duplicate addresses.
fn address_list_from_endpoints(endpoints: &[Endpoint]) -> Vec<Address> {
    let mut uniques = HashSet::new();
    endpoints
        .iter()
        .flat_map(|ep| ep.addresses.iter().cloned())
        .filter(|addr| uniques.insert(addr.clone()))
        .collect()
}

impl PickFirstPolicy {
    fn shuffle_endpoints(&self, config: Option<&LbConfig>, endpoints: &mut [Endpoint]) {
        let shuffle = config
            .and_then(|c| c.convert_to::<PickFirstConfig>())
            .and_then(|c| c.shuffle_address_list)
            .unwrap_or(false);
        // Shuffling changes the order of the endpoints but not the order of
        // the addresses within each endpoint.
        if shuffle {
            (SHUFFLE_ENDPOINTS_FN.lock())(endpoints);
        }
    }

    fn start_subchannel_list(&mut self, channel_controller: &mut dyn ChannelController) {
        let mut list = SubchannelList::new(&self.addresses, channel_controller);
        list.connect_to_next_subchannel();
        self.subchannel_list = Some(list);
        if self.connectivity_state != ConnectivityState::TransientFailure
            && !(self.connectivity_state == ConnectivityState::Connecting
                && self.sent_connecting_state)
        {
            self.move_to_connecting(channel_controller);
        }
    }

    // Resets internal state and moves to TRANSIENT_FAILURE.
    fn handle_empty_endpoints(&mut self, channel_controller: &mut dyn ChannelController) {
        self.subchannel_list = None;
        self.selected_subchannel = None;
        self.addresses = vec![];
        self.last_resolver_error =
            Some("received empty address list from the name resolver".to_string());
        self.move_to_transient_failure(channel_controller);
    }

    // Handles non-READY updates for subchannels in the subchannel list.
    fn update_tracked_subchannel(
        &mut self,
        sc: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(list) = self.subchannel_list.as_mut() else {
            return;
        };
        list.update_subchannel_data(sc, state);

        match state.connectivity_state {
            ConnectivityState::Idle => {
                // Once every subchannel has been tried, reconnect to any that
                // backs off to IDLE.
                if list.is_first_pass_complete() {
                    sc.connect();
                }
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state.last_connection_error.clone();
                if list.is_first_pass_complete() {
                    if list.all_in_transient_failure() {
                        self.move_to_transient_failure(channel_controller);
                    }
                } else if list.current_is(sc) && !list.connect_to_next_subchannel() {
                    tracing::debug!("first pass complete, connecting to all subchannels");
                    list.first_pass_complete = true;
                    list.connect_to_all_subchannels();
                    self.move_to_transient_failure(channel_controller);
                }
            }
            ConnectivityState::Connecting | ConnectivityState::Ready => {}
        }
    }

    fn move_to_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Idle;
        self.subchannel_list = None;
        self.selected_subchannel = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Idle,
            picker: Arc::new(IdlePicker {
                work_scheduler: self.work_scheduler.clone(),
            }),
        });
        channel_controller.request_resolution();
        self.sent_connecting_state = false;
    }

    fn move_to_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Connecting;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        });
        self.sent_connecting_state = true;
    }

    fn move_to_ready(
        &mut self,
        sc: Arc<dyn Subchannel>,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.connectivity_state = ConnectivityState::Ready;
        self.selected_subchannel = Some(sc.clone());
        self.subchannel_list = None;
        self.last_connection_error = None;
        self.last_resolver_error = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Ready,
            picker: Arc::new(OneSubchannelPicker { sc }),
        });
        self.sent_connecting_state = false;
    }

    fn move_to_transient_failure(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        let error = match (&self.last_resolver_error, &self.last_connection_error) {
            (_, Some(conn_err)) => format!("last seen connection error: {conn_err}"),
            (Some(res_err), None) => format!("last seen resolver error: {res_err}"),
            (None, None) => "all addresses failed to connect".to_string(),
        };
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
        channel_controller.request_resolution();
        self.sent_connecting_state = false;
    }
}

// A picker that always returns the same subchannel.
struct OneSubchannelPicker {
    sc: Arc<dyn Subchannel>,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _request: &PickRequest) -> PickResult {
        PickResult::Pick(Pick::new(self.sc.clone()))
    }
}

// A picker that always queues picks and schedules work.  This triggers the LB
// policy to start connecting from the first address.
struct IdlePicker {
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl Picker for IdlePicker {
    fn pick(&self, _request: &PickRequest) -> PickResult {
        self.work_scheduler.schedule_work();
        PickResult::Queue
    }
}

// A list of subchannels created from the most recent address list, tracking
// the last state of each and the position of the sequential connection pass.
struct SubchannelList {
    states: HashMap<Arc<dyn Subchannel>, ConnectivityState>,
    ordered_subchannels: Vec<Arc<dyn Subchannel>>,
    // Index of the subchannel currently being connected, or None before the
    // first attempt.
    current_idx: Option<usize>,
    first_pass_complete: bool,
}

impl SubchannelList {
    fn new(addresses: &[Address], channel_controller: &mut dyn ChannelController) -> Self {
        let ordered_subchannels: Vec<_> = addresses
            .iter()
            .map(|address| channel_controller.new_subchannel(address))
            .collect();
        let states = ordered_subchannels
            .iter()
            .map(|sc| (sc.clone(), ConnectivityState::Idle))
            .collect();
        tracing::debug!(
            "created new subchannel list with {} subchannels",
            ordered_subchannels.len()
        );
        SubchannelList {
            states,
            ordered_subchannels,
            current_idx: None,
            first_pass_complete: false,
        }
    }

    fn contains(&self, sc: &Arc<dyn Subchannel>) -> bool {
        self.states.contains_key(sc)
    }

    fn current_is(&self, sc: &Arc<dyn Subchannel>) -> bool {
        self.current_idx
            .and_then(|idx| self.ordered_subchannels.get(idx))
            .is_some_and(|current| current == sc)
    }

    fn update_subchannel_data(&mut self, sc: &Arc<dyn Subchannel>, state: &SubchannelState) {
        if let Some(s) = self.states.get_mut(sc) {
            *s = state.connectivity_state;
        }
    }

    // Initiates a connection attempt to the next subchannel in the list.
    // Returns false if there are no more subchannels in the list.
    fn connect_to_next_subchannel(&mut self) -> bool {
        let next = self.current_idx.map_or(0, |idx| idx + 1);
        match self.ordered_subchannels.get(next) {
            Some(sc) => {
                self.current_idx = Some(next);
                sc.connect();
                true
            }
            None => false,
        }
    }

    fn is_first_pass_complete(&self) -> bool {
        self.first_pass_complete
    }

    fn all_in_transient_failure(&self) -> bool {
        self.states
            .values()
            .all(|s| *s == ConnectivityState::TransientFailure)
    }

    fn connect_to_all_subchannels(&self) {
        for sc in &self.ordered_subchannels {
            if self.states.get(sc) == Some(&ConnectivityState::Idle) {
                sc.connect();
            }
        }
    }
}
