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

//! Load-balancing policies and the traits that connect them to a channel.
//!
//! A channel owns exactly one top-level [`LbPolicy`] (the auto-configured
//! policy) and calls into it serially.  Policies create subchannels and
//! publish pickers through the [`ChannelController`] they are handed on every
//! call, and ask for a later call into [`LbPolicy::work`] through their
//! [`WorkScheduler`] when a timer fires or a picker needs to trigger work.

use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;

use tonic::{Status, metadata::MetadataMap};

use crate::client::ConnectivityState;
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::rt::Runtime;

pub mod auto_config;
pub mod child_manager;
pub mod pick_first;
pub mod registry;
pub mod round_robin;
pub(crate) mod timer;
pub mod xds;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
pub use crate::client::subchannel::{Subchannel, SubchannelState};
pub(crate) use crate::client::subchannel::WeakSubchannel;
pub use registry::{GLOBAL_LB_REGISTRY, LbPolicyRegistry};

/// Registers every policy implemented by this crate with the global registry.
pub fn reg() {
    pick_first::reg();
    round_robin::reg();
    xds::reg();
}

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,
    /// The runtime which provides utilities to do async work.
    pub runtime: Arc<dyn Runtime>,
    /// Sink for channel-level diagnostics.
    pub logger: Arc<dyn ChannelLogger>,
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule another
    // call.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.  An update whose endpoints
    /// are an Err reports a resolution error.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Called by a parent policy to ask an IDLE policy to start connecting.
    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {}

    /// Called when the policy is discarded by its parent.  No other method is
    /// called afterwards.
    fn shutdown(&mut self) {}

    /// Reports whether the policy wants resolver updates with an empty
    /// endpoint list.  When false, such updates are turned into resolution
    /// errors before reaching the policy.
    fn accepts_empty_endpoints(&self) -> bool {
        false
    }
}

/// Controls channel behaviors.
pub trait ChannelController: Send + Sync {
    /// Creates a new subchannel in IDLE state.
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel>;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration.
    fn request_resolution(&mut self);

    /// Returns the authority used for connections made by this policy.
    fn authority(&self) -> &str;
}

/// Severity of a channel log message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelLogLevel {
    Debug,
    Info,
    Error,
}

/// A sink for channel-scoped diagnostics emitted by LB policies.
pub trait ChannelLogger: Send + Sync {
    fn log(&self, level: ChannelLogLevel, message: &str);
}

/// The default [`ChannelLogger`], forwarding to `tracing`.
#[derive(Debug, Default)]
pub struct TracingChannelLogger {
    _priv: (),
}

impl ChannelLogger for TracingChannelLogger {
    fn log(&self, level: ChannelLogLevel, message: &str) {
        match level {
            ChannelLogLevel::Debug => tracing::debug!(target: "grpc_lb::channel", "{message}"),
            ChannelLogLevel::Info => tracing::info!(target: "grpc_lb::channel", "{message}"),
            ChannelLogLevel::Error => tracing::error!(target: "grpc_lb::channel", "{message}"),
        }
    }
}

/// The data about an RPC a Picker may use to make its decision.
#[derive(Debug, Default, Clone)]
pub struct PickRequest {
    /// The full method name, e.g. "/helloworld.Greeter/SayHello".
    pub method: String,
    /// The outgoing metadata of the RPC.
    pub metadata: MetadataMap,
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  A Picker is only used once for any RPC.  If pick() returns Queue,
/// the channel will queue the RPC until a new Picker is produced by the
/// LbPolicy, and will call pick() on the new Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications so they can predict what might happens when
/// performing RPCs:
///
/// If the ConnectivityState is Idle, the Picker should ensure connections are
/// initiated by the LbPolicy that produced the Picker, and return a Queue
/// result so the request is attempted the next time a Picker is produced.
///
/// If the ConnectivityState is Connecting, the Picker should return a Queue
/// result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return an
/// Err with an error that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue, and
    /// the Pick call will be repeated by the channel when a new Picker is
    /// produced by the LbPolicy.
    fn pick(&self, request: &PickRequest) -> PickResult;
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status
    /// (with the code converted to UNAVAILABLE).  If the RPC is wait-for-ready,
    /// then it will not be terminated, but instead attempted on a new picker if
    /// one is produced before it is cancelled.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.
    Drop(Status),
}

impl Debug for PickResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pick(pick) => write!(f, "Pick({})", pick.subchannel),
            Self::Queue => write!(f, "Queue"),
            Self::Fail(status) => write!(f, "Fail({status:?})"),
            Self::Drop(status) => write!(f, "Drop({status:?})"),
        }
    }
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker which
    /// queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

impl Debug for LbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LbState({})", self.connectivity_state)
    }
}

/// Invoked once with the final status of an RPC routed by a Pick.
pub type PickCompletionFn = Box<dyn FnOnce(&Status) + Send + Sync>;

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    /// Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
    /// Callback the channel invokes when the RPC completes.
    pub on_complete: Option<PickCompletionFn>,
}

impl Pick {
    pub fn new(subchannel: Arc<dyn Subchannel>) -> Self {
        Pick {
            subchannel,
            metadata: MetadataMap::new(),
            on_complete: None,
        }
    }
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _request: &PickRequest) -> PickResult {
        PickResult::Queue
    }
}

/// Failing fails every pick with UNAVAILABLE and the given error.
pub struct Failing {
    pub error: String,
}

impl Picker for Failing {
    fn pick(&self, _request: &PickRequest) -> PickResult {
        PickResult::Fail(Status::unavailable(self.error.clone()))
    }
}
