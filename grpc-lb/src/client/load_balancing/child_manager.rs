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

//! A utility which helps parent LB policies manage multiple children for the
//! purposes of forwarding channel updates.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::hash::Hash;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, ChannelLogger, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbState, Subchannel, SubchannelState, WeakSubchannel, WorkScheduler,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::rt::Runtime;

// An LbPolicy implementation that manages multiple children.
pub struct ChildManager<T> {
    subchannel_child_map: HashMap<WeakSubchannel, usize>,
    children: Vec<Child<T>>,
    update_sharder: Box<dyn ResolverUpdateSharder<T>>,
    pending_work: Arc<Mutex<HashSet<usize>>>,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
    logger: Arc<dyn ChannelLogger>,
    updated: bool,
}

struct Child<T> {
    identifier: T,
    policy: Box<dyn LbPolicy>,
    state: LbState,
    work_scheduler: Arc<ChildWorkScheduler>,
}

/// A collection of data sent to a child of the ChildManager.
pub struct ChildUpdate<T> {
    /// The identifier the ChildManager should use for this child.
    pub child_identifier: T,
    /// The builder the ChildManager should use to create this child if it does
    /// not exist.
    pub child_policy_builder: Arc<dyn LbPolicyBuilder>,
    /// The relevant ResolverUpdate to send to this child.
    pub child_update: ResolverUpdate,
}

pub trait ResolverUpdateSharder<T>: Send {
    /// Performs the operation of sharding an aggregate ResolverUpdate into one
    /// or more ChildUpdates.  Called automatically by the ChildManager when its
    /// resolver_update method is called.
    fn shard_update(
        &self,
        resolver_update: ResolverUpdate,
    ) -> Result<Vec<ChildUpdate<T>>, Box<dyn Error + Send + Sync>>;
}

/// EndpointSharder shards a resolver update into individual endpoints,
/// with each endpoint serving as the unique identifier for a child.
pub struct EndpointSharder {
    pub builder: Arc<dyn LbPolicyBuilder>,
}

impl EndpointSharder {
    pub fn new(builder: Arc<dyn LbPolicyBuilder>) -> Self {
        Self { builder }
    }
}

// Creates a ChildUpdate for each endpoint received.
impl ResolverUpdateSharder<Endpoint> for EndpointSharder {
    fn shard_update(
        &self,
        resolver_update: ResolverUpdate,
    ) -> Result<Vec<ChildUpdate<Endpoint>>, Box<dyn Error + Send + Sync>> {
        let endpoints = resolver_update.endpoints.clone()?;
        Ok(endpoints
            .into_iter()
            .map(|e| ChildUpdate {
                child_identifier: e.clone(),
                child_policy_builder: self.builder.clone(),
                child_update: ResolverUpdate {
                    attributes: resolver_update.attributes.clone(),
                    endpoints: Ok(vec![e]),
                    service_config: resolver_update.service_config.clone(),
                    resolution_note: resolver_update.resolution_note.clone(),
                },
            })
            .collect())
    }
}

/// Aggregates the states of a group of policies.
///
/// If any policy is READY then the aggregate state is READY.  Otherwise, if
/// any is CONNECTING, then CONNECTING.  Otherwise, if any is IDLE, then IDLE.
/// Otherwise TRANSIENT_FAILURE.  Returns None for an empty group.
pub(crate) fn aggregate_states(
    states: impl IntoIterator<Item = ConnectivityState>,
) -> Option<ConnectivityState> {
    let mut aggregate = None;
    for state in states {
        aggregate = Some(match (aggregate, state) {
            (_, ConnectivityState::Ready) | (Some(ConnectivityState::Ready), _) => {
                return Some(ConnectivityState::Ready);
            }
            (Some(ConnectivityState::Connecting), _) | (_, ConnectivityState::Connecting) => {
                ConnectivityState::Connecting
            }
            (Some(ConnectivityState::Idle), _) | (_, ConnectivityState::Idle) => {
                ConnectivityState::Idle
            }
            _ => ConnectivityState::TransientFailure,
        });
    }
    aggregate
}

impl<T> ChildManager<T> {
    /// Creates a new ChildManager LB policy.  shard_update is called whenever a
    /// resolver_update operation occurs.  Children share the runtime and
    /// logger in `options`; their work requests are funneled through
    /// `options.work_scheduler`.
    pub fn new(update_sharder: Box<dyn ResolverUpdateSharder<T>>, options: LbPolicyOptions) -> Self {
        Self {
            update_sharder,
            subchannel_child_map: Default::default(),
            children: Default::default(),
            pending_work: Default::default(),
            work_scheduler: options.work_scheduler,
            runtime: options.runtime,
            logger: options.logger,
            updated: false,
        }
    }

    /// Returns data for all current children.
    pub fn child_states(&self) -> impl Iterator<Item = (&T, &LbState)> {
        self.children
            .iter()
            .map(|child| (&child.identifier, &child.state))
    }

    /// Aggregates states from child policies.  Reports TRANSIENT_FAILURE if
    /// there are no children.
    pub fn aggregate_states(&self) -> ConnectivityState {
        aggregate_states(self.children.iter().map(|c| c.state.connectivity_state))
            .unwrap_or(ConnectivityState::TransientFailure)
    }

    // Called to update all accounting in the ChildManager from operations
    // performed by a child policy on the WrappedController that was created for
    // it.  child_idx is an index into the children vec for the relevant child.
    fn resolve_child_controller(&mut self, channel_controller: WrappedController, child_idx: usize) {
        for csc in channel_controller.created_subchannels {
            self.subchannel_child_map.insert(csc.into(), child_idx);
        }
        if let Some(state) = channel_controller.picker_update {
            self.children[child_idx].state = state;
            self.updated = true;
        };
    }

    /// Sends the same update to every existing child without resharding.
    pub(crate) fn forward_update_to_children(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        resolver_update: ResolverUpdate,
        config: Option<&LbConfig>,
    ) {
        for child_idx in 0..self.children.len() {
            let mut wrapped = WrappedController::new(channel_controller);
            let _ = self.children[child_idx].policy.resolver_update(
                resolver_update.clone(),
                config,
                &mut wrapped,
            );
            self.resolve_child_controller(wrapped, child_idx);
        }
    }

    /// Checks whether a child has produced an update since the last call.
    pub fn has_updated(&mut self) -> bool {
        mem::take(&mut self.updated)
    }

    /// Returns true if ChildManager has children.
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }
}

impl<T: PartialEq + Hash + Eq + Send + Sync + 'static> LbPolicy for ChildManager<T> {
    fn resolver_update(
        &mut self,
        resolver_update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        // First determine if the incoming update is valid.
        let child_updates = self.update_sharder.shard_update(resolver_update)?;

        // Hold the lock to prevent new work requests while indices are
        // rewritten.
        let mut pending_work = self.pending_work.lock();
        let old_pending_work = mem::take(&mut *pending_work);
        let old_children = mem::take(&mut self.children);
        let old_subchannel_child_map = mem::take(&mut self.subchannel_child_map);

        // Reverse the old subchannel map.
        let mut old_child_subchannels_map: HashMap<usize, Vec<WeakSubchannel>> = HashMap::new();
        for (subchannel, child_idx) in old_subchannel_child_map {
            old_child_subchannels_map
                .entry(child_idx)
                .or_default()
                .push(subchannel);
        }

        let mut old_children: HashMap<T, _> = old_children
            .into_iter()
            .enumerate()
            .map(|(old_idx, e)| (e.identifier, (e.policy, e.state, old_idx, e.work_scheduler)))
            .collect();

        let (ids_builders, updates): (Vec<_>, Vec<_>) = child_updates
            .into_iter()
            .map(|e| ((e.child_identifier, e.child_policy_builder), e.child_update))
            .unzip();

        // Transfer children whose identifiers appear before and after the
        // update, and create new children.
        for (new_idx, (identifier, builder)) in ids_builders.into_iter().enumerate() {
            if let Some((policy, state, old_idx, work_scheduler)) = old_children.remove(&identifier)
            {
                for subchannel in old_child_subchannels_map
                    .remove(&old_idx)
                    .into_iter()
                    .flatten()
                {
                    self.subchannel_child_map.insert(subchannel, new_idx);
                }
                if old_pending_work.contains(&old_idx) {
                    pending_work.insert(new_idx);
                }
                *work_scheduler.idx.lock() = Some(new_idx);
                self.children.push(Child {
                    identifier,
                    state,
                    policy,
                    work_scheduler,
                });
            } else {
                let work_scheduler = Arc::new(ChildWorkScheduler {
                    pending_work: self.pending_work.clone(),
                    idx: Mutex::new(Some(new_idx)),
                    parent: self.work_scheduler.clone(),
                });
                let policy = builder.build(LbPolicyOptions {
                    work_scheduler: work_scheduler.clone(),
                    runtime: self.runtime.clone(),
                    logger: self.logger.clone(),
                });
                self.children.push(Child {
                    identifier,
                    state: LbState::initial(),
                    policy,
                    work_scheduler,
                });
            };
        }

        // Invalidate and shut down all deleted children.
        for (_, (mut policy, _, _, work_scheduler)) in old_children {
            *work_scheduler.idx.lock() = None;
            policy.shutdown();
        }

        // Release the pending_work mutex before calling into the children to
        // allow their work scheduler calls to unblock.
        drop(pending_work);

        for (child_idx, child_update) in updates.into_iter().enumerate() {
            let mut wrapped = WrappedController::new(channel_controller);
            let _ = self.children[child_idx]
                .policy
                .resolver_update(child_update, config, &mut wrapped);
            self.resolve_child_controller(wrapped, child_idx);
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        // Determine which child created this subchannel.
        let Some(&child_idx) = self
            .subchannel_child_map
            .get(&WeakSubchannel::new(&subchannel))
        else {
            tracing::debug!("ignoring update for subchannel {subchannel} of a removed child");
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        self.children[child_idx]
            .policy
            .subchannel_update(subchannel, state, &mut wrapped);
        self.resolve_child_controller(wrapped, child_idx);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let child_idxes = mem::take(&mut *self.pending_work.lock());
        for child_idx in child_idxes {
            let mut wrapped = WrappedController::new(channel_controller);
            self.children[child_idx].policy.work(&mut wrapped);
            self.resolve_child_controller(wrapped, child_idx);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        for child_idx in 0..self.children.len() {
            let mut wrapped = WrappedController::new(channel_controller);
            self.children[child_idx].policy.exit_idle(&mut wrapped);
            self.resolve_child_controller(wrapped, child_idx);
        }
    }

    fn shutdown(&mut self) {
        for child in &mut self.children {
            *child.work_scheduler.idx.lock() = None;
            child.policy.shutdown();
        }
        self.children.clear();
        self.subchannel_child_map.clear();
    }
}

/// A ChannelController handed to a child policy.  Subchannel creation and
/// re-resolution requests pass through to the parent's controller; picker
/// updates are captured for the parent to act on after the child returns.
pub(crate) struct WrappedController<'a> {
    pub(crate) channel_controller: &'a mut dyn ChannelController,
    pub(crate) created_subchannels: Vec<Arc<dyn Subchannel>>,
    pub(crate) picker_update: Option<LbState>,
    authority: Option<String>,
}

impl<'a> WrappedController<'a> {
    pub(crate) fn new(channel_controller: &'a mut dyn ChannelController) -> Self {
        Self {
            channel_controller,
            created_subchannels: vec![],
            picker_update: None,
            authority: None,
        }
    }

    /// Overrides the authority reported to the child.
    pub(crate) fn with_authority(mut self, authority: String) -> Self {
        self.authority = Some(authority);
        self
    }
}

impl ChannelController for WrappedController<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel = self.channel_controller.new_subchannel(address);
        self.created_subchannels.push(subchannel.clone());
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.picker_update = Some(update);
    }

    fn request_resolution(&mut self) {
        self.channel_controller.request_resolution();
    }

    fn authority(&self) -> &str {
        match &self.authority {
            Some(authority) => authority,
            None => self.channel_controller.authority(),
        }
    }
}

struct ChildWorkScheduler {
    pending_work: Arc<Mutex<HashSet<usize>>>, // Must be taken first for correctness
    idx: Mutex<Option<usize>>,                // None if the child is deleted.
    parent: Arc<dyn WorkScheduler>,
}

impl WorkScheduler for ChildWorkScheduler {
    fn schedule_work(&self) {
        let mut pending_work = self.pending_work.lock();
        if let Some(idx) = *self.idx.lock() {
            pending_work.insert(idx);
            drop(pending_work);
            self.parent.schedule_work();
        }
    }
}
