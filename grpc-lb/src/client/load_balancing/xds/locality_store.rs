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

//! The locality store: one child policy per locality, grouped into priority
//! bands with exactly one active band.
//!
//! Every discovery update rebuilds the priority table and restarts from the
//! highest priority.  A band that does not become READY within
//! [`FAILOVER_TIMEOUT`] (or that reports TRANSIENT_FAILURE) fails over to the
//! next band; a higher band becoming READY again takes over and deactivates the
//! bands below it.  Deactivated localities are deleted after
//! [`DELAYED_DELETION_TIMEOUT`] unless they are needed again first.
//!
//! Child policies are never called while the store is in the middle of an
//! update.  Endpoint deliveries are queued and run once the entry point's own
//! bookkeeping is complete.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Bound;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::load_stats::{ClientLoadCounter, LoadStatsStore};
use super::locality::{DropOverload, Locality, LocalityLbEndpoints};
use super::picker::{
    DropPicker, LoadRecordingPicker, RandRandom, ThreadSafeRandom, WeightedChildPicker,
    WeightedPicker,
};
use crate::client::ConnectivityState;
use crate::client::load_balancing::child_manager::{WrappedController, aggregate_states};
use crate::client::load_balancing::timer::{TimerHandle, TimerQueue};
use crate::client::load_balancing::{
    ChannelController, ChannelLogger, Failing, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, Picker, QueuingPicker, Subchannel, SubchannelState,
    WeakSubchannel, WorkScheduler,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::rt::Runtime;

/// How long a band may stay not READY before the next band is tried.
pub const FAILOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a deactivated locality keeps its child policy.
pub const DELAYED_DELETION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Settings of a [`LocalityStore`].
#[derive(Clone)]
pub struct LocalityStoreOptions {
    /// Builds the policy of each locality.
    pub child_policy: Arc<dyn LbPolicyBuilder>,
    /// Configuration handed to every child policy.
    pub child_config: Option<LbConfig>,
    pub failover_timeout: Duration,
    pub delayed_deletion_timeout: Duration,
    /// Random source of the published pickers.
    pub random: Arc<dyn ThreadSafeRandom>,
    pub load_stats: Arc<LoadStatsStore>,
}

impl LocalityStoreOptions {
    pub fn new(child_policy: Arc<dyn LbPolicyBuilder>) -> Self {
        Self {
            child_policy,
            child_config: None,
            failover_timeout: FAILOVER_TIMEOUT,
            delayed_deletion_timeout: DELAYED_DELETION_TIMEOUT,
            random: Arc::new(RandRandom::default()),
            load_stats: Arc::new(LoadStatsStore::new()),
        }
    }
}

/// Runtime state of one locality.
pub(crate) struct LocalityLbInfo {
    policy: Box<dyn LbPolicy>,
    // The child's latest state, its picker wrapped to record load.
    state: LbState,
    counter: Arc<ClientLoadCounter>,
    deletion_timer: Option<TimerHandle>,
}

impl LocalityLbInfo {
    /// Cancels a pending deletion.
    pub(crate) fn reactivate(&mut self) {
        if let Some(timer) = self.deletion_timer.take() {
            timer.cancel();
        }
    }

    pub(crate) fn is_deactivated(&self) -> bool {
        self.deletion_timer.is_some()
    }

    fn shutdown(&mut self) {
        self.reactivate();
        self.policy.shutdown();
    }
}

#[derive(Default)]
struct PriorityManager {
    // Keyed by priority.  Missing priorities up to the last one are empty
    // bands.
    priority_table: BTreeMap<usize, Vec<Locality>>,
    locality_info: IndexMap<Locality, LocalityLbEndpoints>,
    current_priority: Option<usize>,
    failover_timer: Option<TimerHandle>,
}

impl PriorityManager {
    fn update_localities(&mut self, localities: IndexMap<Locality, LocalityLbEndpoints>) {
        self.priority_table.clear();
        for (locality, info) in &localities {
            self.priority_table
                .entry(info.priority as usize)
                .or_default()
                .push(locality.clone());
        }
        self.locality_info = localities;
        self.current_priority = None;
    }

    fn band(&self, priority: usize) -> Vec<Locality> {
        self.priority_table
            .get(&priority)
            .cloned()
            .unwrap_or_default()
    }

    fn last_priority(&self) -> Option<usize> {
        self.priority_table.keys().next_back().copied()
    }

    fn priority_of(&self, locality: &Locality) -> Option<usize> {
        self.locality_info
            .get(locality)
            .map(|info| info.priority as usize)
    }

    fn locality_weight(&self, locality: &Locality) -> u32 {
        self.locality_info
            .get(locality)
            .map_or(0, |info| info.locality_weight)
    }

    fn cancel_failover_timer(&mut self) {
        if let Some(timer) = self.failover_timer.take() {
            timer.cancel();
        }
    }

    fn reset(&mut self) {
        self.cancel_failover_timer();
        self.priority_table.clear();
        self.locality_info.clear();
        self.current_priority = None;
    }
}

enum TimerEvent {
    FailOver,
    Delete(Locality),
}

enum Pending {
    // Hand the locality its latest endpoints.
    Deliver(Locality),
    RemoveStats(Vec<Locality>),
}

/// Owns the child policies of all localities and publishes the picker of the
/// active priority band.
pub struct LocalityStore {
    options: LocalityStoreOptions,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
    logger: Arc<dyn ChannelLogger>,
    localities: HashMap<Locality, LocalityLbInfo>,
    // Localities of the latest discovery update.
    discovered: HashSet<Locality>,
    drop_overloads: Vec<DropOverload>,
    priority: PriorityManager,
    timers: TimerQueue<TimerEvent>,
    pending: VecDeque<Pending>,
    pending_work: Arc<Mutex<HashSet<Locality>>>,
    subchannel_owners: HashMap<WeakSubchannel, Locality>,
}

impl LocalityStore {
    pub fn new(options: LocalityStoreOptions, lb_options: LbPolicyOptions) -> Self {
        Self {
            timers: TimerQueue::new(
                lb_options.runtime.clone(),
                lb_options.work_scheduler.clone(),
            ),
            options,
            work_scheduler: lb_options.work_scheduler,
            runtime: lb_options.runtime,
            logger: lb_options.logger,
            localities: HashMap::new(),
            discovered: HashSet::new(),
            drop_overloads: vec![],
            priority: PriorityManager::default(),
            pending: VecDeque::new(),
            pending_work: Arc::default(),
            subchannel_owners: HashMap::new(),
        }
    }

    pub fn load_stats(&self) -> &Arc<LoadStatsStore> {
        &self.options.load_stats
    }

    /// Name of the policy every locality runs.
    pub fn child_policy_name(&self) -> &'static str {
        self.options.child_policy.name()
    }

    /// Replaces the configuration handed to child policies with their next
    /// endpoint update.
    pub fn set_child_config(&mut self, child_config: Option<LbConfig>) {
        self.options.child_config = child_config;
    }

    /// Applies a discovery update.  Localities keep their order within a
    /// priority band.
    pub fn update_localities(
        &mut self,
        localities: IndexMap<Locality, LocalityLbEndpoints>,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.subchannel_owners
            .retain(|sc, _| sc.upgrade().is_some());

        for locality in localities.keys() {
            if self.localities.contains_key(locality) {
                self.pending.push_back(Pending::Deliver(locality.clone()));
            }
        }

        for locality in localities.keys() {
            if !self.discovered.contains(locality) {
                self.options.load_stats.add_locality(locality);
            }
        }
        // Removed only after the new picker is published, so calls still
        // routed to a removed locality are counted.
        let removed: Vec<Locality> = self
            .discovered
            .iter()
            .filter(|l| !localities.contains_key(*l))
            .cloned()
            .collect();
        if !removed.is_empty() {
            self.pending.push_back(Pending::RemoveStats(removed));
        }
        self.discovered = localities.keys().cloned().collect();

        tracing::debug!(
            localities = localities.len(),
            "updating locality priorities"
        );
        self.priority.update_localities(localities);
        self.fail_over(channel_controller);

        let stale: Vec<Locality> = self
            .localities
            .keys()
            .filter(|l| !self.discovered.contains(*l))
            .cloned()
            .collect();
        for locality in stale {
            self.deactivate(&locality);
        }

        self.drain_pending(channel_controller);
    }

    /// Replaces the drop configuration used by pickers published from now on.
    pub fn update_drop_overloads(&mut self, drop_overloads: Vec<DropOverload>) {
        self.drop_overloads = drop_overloads;
    }

    /// Routes a subchannel update to the locality whose policy created the
    /// subchannel.
    pub fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(locality) = self
            .subchannel_owners
            .get(&WeakSubchannel::new(&subchannel))
            .cloned()
        else {
            tracing::debug!("ignoring update for subchannel {subchannel} of no locality");
            return;
        };
        self.call_child(&locality, channel_controller, |policy, controller| {
            policy.subchannel_update(subchannel, state, controller)
        });
        self.drain_pending(channel_controller);
    }

    /// Handles fired timers and the work requested by child policies.
    pub fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        for event in self.timers.take_fired() {
            match event {
                TimerEvent::FailOver => {
                    self.priority.failover_timer = None;
                    tracing::debug!("failover timer fired");
                    self.fail_over(channel_controller);
                }
                TimerEvent::Delete(locality) => self.delete_locality(&locality),
            }
        }

        let requested = mem::take(&mut *self.pending_work.lock());
        for locality in requested {
            self.call_child(&locality, channel_controller, |policy, controller| {
                policy.work(controller)
            });
        }

        self.drain_pending(channel_controller);
    }

    /// Shuts down every locality and forgets all discovery state.
    pub fn reset(&mut self) {
        for (_, mut info) in self.localities.drain() {
            info.shutdown();
        }
        for pending in self.pending.drain(..) {
            if let Pending::RemoveStats(localities) = pending {
                for locality in localities {
                    self.options.load_stats.remove_locality(&locality);
                }
            }
        }
        for locality in self.discovered.drain() {
            self.options.load_stats.remove_locality(&locality);
        }
        self.priority.reset();
        self.pending_work.lock().clear();
        self.subchannel_owners.clear();
    }

    pub fn shutdown(&mut self) {
        self.reset();
    }

    /// Makes the next band active.  Does nothing if the last band is already
    /// active.
    fn fail_over(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(last) = self.priority.last_priority() else {
            return;
        };
        let next = match self.priority.current_priority {
            None => 0,
            Some(current) if current < last => current + 1,
            Some(_) => return,
        };
        self.priority.current_priority = Some(next);
        tracing::debug!(priority = next, "failing over");

        let band = self.priority.band(next);
        let mut initialized_before = false;
        for locality in &band {
            if let Some(info) = self.localities.get_mut(locality) {
                initialized_before = true;
                info.reactivate();
            } else {
                self.init_locality(locality);
            }
        }

        if !initialized_before {
            self.priority.cancel_failover_timer();
            self.priority.failover_timer = Some(
                self.timers
                    .schedule(self.options.failover_timeout, TimerEvent::FailOver),
            );
        }

        self.update_priority_state(Some(next), channel_controller);
    }

    /// Recomputes the state of band `priority` and publishes it if the band is
    /// active or takes over as the active band.
    fn update_priority_state(
        &mut self,
        priority: Option<usize>,
        channel_controller: &mut dyn ChannelController,
    ) {
        let (Some(priority), Some(current)) = (priority, self.priority.current_priority) else {
            return;
        };
        if priority > current {
            return;
        }

        let band = self.priority.band(priority);
        let mut states = Vec::with_capacity(band.len());
        let mut pickers = vec![];
        for locality in &band {
            if !self.localities.contains_key(locality) {
                self.init_locality(locality);
            }
            let Some(info) = self.localities.get_mut(locality) else {
                continue;
            };
            info.reactivate();
            states.push(info.state.connectivity_state);
            if info.state.connectivity_state == ConnectivityState::Ready {
                pickers.push(WeightedChildPicker::new(
                    self.priority.locality_weight(locality),
                    info.state.picker.clone(),
                ));
            }
        }
        let state = aggregate_states(states);

        if priority == current {
            self.update_picker(state, pickers, channel_controller);
            match state {
                Some(ConnectivityState::Ready) => self.priority.cancel_failover_timer(),
                Some(ConnectivityState::TransientFailure) => {
                    self.priority.cancel_failover_timer();
                    self.fail_over(channel_controller);
                }
                // Still connecting with the timer armed: wait for it.
                _ if self.priority.failover_timer.is_some() => {}
                _ => self.fail_over(channel_controller),
            }
        } else if state == Some(ConnectivityState::Ready) {
            tracing::debug!(priority, "higher priority became ready");
            self.update_picker(state, pickers, channel_controller);
            self.priority.cancel_failover_timer();
            self.priority.current_priority = Some(priority);
        }

        if state == Some(ConnectivityState::Ready) {
            let worse: Vec<Locality> = self
                .priority
                .priority_table
                .range((Bound::Excluded(priority), Bound::Unbounded))
                .flat_map(|(_, band)| band.iter().cloned())
                .collect();
            for locality in worse {
                self.deactivate(&locality);
            }
        }
    }

    fn update_picker(
        &self,
        state: Option<ConnectivityState>,
        pickers: Vec<WeightedChildPicker>,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(connectivity_state) = state else {
            return;
        };
        let mut picker: Arc<dyn Picker> = if pickers.is_empty() {
            if connectivity_state == ConnectivityState::TransientFailure {
                Arc::new(Failing {
                    error: "no locality of the active priority is reachable".to_string(),
                })
            } else {
                Arc::new(QueuingPicker {})
            }
        } else {
            Arc::new(WeightedPicker::new(pickers, self.options.random.clone()))
        };
        if !self.drop_overloads.is_empty() {
            picker = Arc::new(DropPicker::new(
                self.drop_overloads.clone(),
                picker,
                self.options.random.clone(),
                self.options.load_stats.clone(),
            ));
        }
        channel_controller.update_picker(LbState {
            connectivity_state,
            picker,
        });
    }

    fn init_locality(&mut self, locality: &Locality) {
        tracing::debug!(%locality, "creating locality policy");
        let work_scheduler = Arc::new(LocalityWorkScheduler {
            locality: locality.clone(),
            pending_work: self.pending_work.clone(),
            parent: self.work_scheduler.clone(),
        });
        let policy = self.options.child_policy.build(LbPolicyOptions {
            work_scheduler,
            runtime: self.runtime.clone(),
            logger: self.logger.clone(),
        });
        self.localities.insert(
            locality.clone(),
            LocalityLbInfo {
                policy,
                state: LbState::initial(),
                counter: self.options.load_stats.locality_counter(locality),
                deletion_timer: None,
            },
        );
        self.pending.push_back(Pending::Deliver(locality.clone()));
    }

    fn deactivate(&mut self, locality: &Locality) {
        let Some(info) = self.localities.get_mut(locality) else {
            return;
        };
        if info.is_deactivated() {
            return;
        }
        tracing::debug!(%locality, "deactivating locality");
        info.deletion_timer = Some(self.timers.schedule(
            self.options.delayed_deletion_timeout,
            TimerEvent::Delete(locality.clone()),
        ));
    }

    fn delete_locality(&mut self, locality: &Locality) {
        let Some(mut info) = self.localities.remove(locality) else {
            return;
        };
        tracing::debug!(%locality, "deleting deactivated locality");
        info.shutdown();
        self.subchannel_owners.retain(|_, owner| owner != locality);
        self.pending_work.lock().remove(locality);
    }

    fn drain_pending(&mut self, channel_controller: &mut dyn ChannelController) {
        while let Some(pending) = self.pending.pop_front() {
            match pending {
                Pending::Deliver(locality) => self.deliver_endpoints(&locality, channel_controller),
                Pending::RemoveStats(localities) => {
                    for locality in localities {
                        self.options.load_stats.remove_locality(&locality);
                    }
                }
            }
        }
    }

    fn deliver_endpoints(
        &mut self,
        locality: &Locality,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(info) = self.priority.locality_info.get(locality) else {
            return;
        };
        let update = ResolverUpdate::with_endpoints(
            info.endpoints.iter().map(|e| e.endpoint.clone()).collect(),
        );
        let config = self.options.child_config.clone();
        let result = self.call_child(locality, channel_controller, |policy, controller| {
            policy.resolver_update(update, config.as_ref(), controller)
        });
        if let Some(Err(err)) = result {
            tracing::debug!(%locality, "locality policy rejected its endpoints: {err}");
        }
    }

    // Calls into the policy of `locality`, if it still exists, then records the
    // subchannels it created and acts on the picker it published.
    fn call_child<R>(
        &mut self,
        locality: &Locality,
        channel_controller: &mut dyn ChannelController,
        f: impl FnOnce(&mut dyn LbPolicy, &mut dyn ChannelController) -> R,
    ) -> Option<R> {
        let info = self.localities.get_mut(locality)?;
        let mut wrapped = WrappedController::new(channel_controller)
            .with_authority(locality.sub_zone.clone());
        let result = f(info.policy.as_mut(), &mut wrapped);
        let created_subchannels = mem::take(&mut wrapped.created_subchannels);
        let picker_update = wrapped.picker_update.take();
        drop(wrapped);

        for subchannel in created_subchannels {
            self.subchannel_owners
                .insert(WeakSubchannel::new(&subchannel), locality.clone());
        }
        if let Some(state) = picker_update {
            self.child_state_updated(locality, state, channel_controller);
        }
        Some(result)
    }

    fn child_state_updated(
        &mut self,
        locality: &Locality,
        state: LbState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(info) = self.localities.get_mut(locality) else {
            return;
        };
        info.state = LbState {
            connectivity_state: state.connectivity_state,
            picker: Arc::new(LoadRecordingPicker::new(state.picker, info.counter.clone())),
        };
        let priority = self.priority.priority_of(locality);
        self.update_priority_state(priority, channel_controller);
    }
}

struct LocalityWorkScheduler {
    locality: Locality,
    pending_work: Arc<Mutex<HashSet<Locality>>>,
    parent: Arc<dyn WorkScheduler>,
}

impl WorkScheduler for LocalityWorkScheduler {
    fn schedule_work(&self) {
        self.pending_work.lock().insert(self.locality.clone());
        self.parent.schedule_work();
    }
}
