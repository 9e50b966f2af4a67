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

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use tokio::sync::{Notify, mpsc, oneshot};
use tonic::Status;

use super::ConnectivityState;
use crate::client::load_balancing::auto_config::{AutoConfiguredPolicy, DEFAULT_POLICY};
use crate::client::load_balancing::{
    ChannelController, ChannelLogger, Failing, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyOptions,
    LbPolicyRegistry, LbState, PickRequest, PickResult, Subchannel, SubchannelState,
    TracingChannelLogger, WorkScheduler,
};
use crate::client::name_resolution::{Address, ResolverUpdate, Target};
use crate::rt::{Runtime, default_runtime};

/// Creates the connections LB policies ask the channel for.
pub trait SubchannelFactory: Send + Sync {
    /// Returns a new IDLE subchannel for `address`.
    fn new_subchannel(&self, address: &Address, authority: &str) -> Arc<dyn Subchannel>;
}

pub struct ChannelOptions {
    /// Registry the channel selects its LB policy from.
    pub registry: LbPolicyRegistry,
    /// Policy used when the service config and endpoints ask for no other.
    pub default_policy: String,
    pub runtime: Arc<dyn Runtime>,
    pub logger: Arc<dyn ChannelLogger>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            registry: GLOBAL_LB_REGISTRY.clone(),
            default_policy: DEFAULT_POLICY.to_string(),
            runtime: default_runtime(),
            logger: Arc::new(TracingChannelLogger::default()),
        }
    }
}

/// A client channel's load-balancing front end.
///
/// Every event is queued to a single worker task that owns the channel's LB
/// policy, so policies only ever run one call at a time.  Pickers published
/// by the policy are read without locking by [`Channel::pick`].
///
/// Channel creation cannot fail, but if the target string is invalid, the
/// returned channel will fail all picks and reject all updates.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    tx: mpsc::UnboundedSender<WorkQueueItem>,
    state: Arc<ArcSwap<LbState>>,
    resolution_requested: Arc<Notify>,
}

enum WorkQueueItem {
    ResolverUpdate {
        update: ResolverUpdate,
        reply: Option<oneshot::Sender<Result<(), Status>>>,
    },
    SubchannelUpdate {
        subchannel: Arc<dyn Subchannel>,
        state: SubchannelState,
    },
    ScheduleWork,
    ExitIdle,
    Shutdown(oneshot::Sender<()>),
}

impl Channel {
    /// Constructs a channel for `target` and spawns its worker on the
    /// configured runtime.
    pub fn new(
        target: &str,
        subchannel_factory: Arc<dyn SubchannelFactory>,
        options: ChannelOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ArcSwap::from_pointee(LbState::initial()));
        let resolution_requested = Arc::new(Notify::new());
        let channel = Self {
            inner: Arc::new(ChannelInner {
                tx,
                state: state.clone(),
                resolution_requested: resolution_requested.clone(),
            }),
        };

        let target = match Target::from_str(target) {
            Ok(target) => target,
            Err(e) => {
                tracing::error!("invalid channel target {target}: {e}");
                state.store(Arc::new(LbState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    picker: Arc::new(Failing {
                        error: format!("invalid channel target: {e}"),
                    }),
                }));
                // Dropping the receiver makes every later update fail.
                drop(rx);
                return channel;
            }
        };

        let work_scheduler = Arc::new(ChannelWorkScheduler {
            tx: channel.inner.tx.downgrade(),
            scheduled: Arc::default(),
        });
        let policy = AutoConfiguredPolicy::new(
            options.registry,
            options.default_policy,
            LbPolicyOptions {
                work_scheduler: work_scheduler.clone(),
                runtime: options.runtime.clone(),
                logger: options.logger,
            },
        );
        let worker = Worker {
            policy,
            work_scheduled: work_scheduler.scheduled.clone(),
            controller: InternalChannelController {
                subchannel_factory,
                state,
                resolution_requested,
                authority: default_authority(&target),
            },
        };
        // The worker stops on its own once the queue closes.
        let _ = options.runtime.spawn(Box::pin(worker.run(rx)));
        channel
    }

    /// Delivers a resolver update to the LB policy.  Returns the policy's
    /// verdict: UNAVAILABLE when no policy could handle the endpoints.
    pub async fn update(&self, update: ResolverUpdate) -> Result<(), Status> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(WorkQueueItem::ResolverUpdate {
            update,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| closed())?
    }

    /// Reports that name resolution failed.
    pub fn resolution_error(&self, error: impl Into<String>) {
        let _ = self.enqueue(WorkQueueItem::ResolverUpdate {
            update: ResolverUpdate::with_error(error),
            reply: None,
        });
    }

    /// Reports a connectivity change of a subchannel created by this channel.
    pub fn update_subchannel_state(&self, subchannel: Arc<dyn Subchannel>, state: SubchannelState) {
        let _ = self.enqueue(WorkQueueItem::SubchannelUpdate { subchannel, state });
    }

    /// Asks an idle LB policy to start connecting.
    pub fn exit_idle(&self) {
        let _ = self.enqueue(WorkQueueItem::ExitIdle);
    }

    /// Picks a subchannel for a request with the most recent picker.
    pub fn pick(&self, request: &PickRequest) -> PickResult {
        self.inner.state.load().picker.pick(request)
    }

    /// Returns the current state of the channel.
    pub fn state(&self) -> ConnectivityState {
        self.inner.state.load().connectivity_state
    }

    /// Completes the next time an LB policy asks for re-resolution.
    pub async fn resolution_requested(&self) {
        self.inner.resolution_requested.notified().await
    }

    /// Shuts down the LB policy and stops the worker.  Picks fail afterwards.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.enqueue(WorkQueueItem::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    fn enqueue(&self, item: WorkQueueItem) -> Result<(), Status> {
        self.inner.tx.send(item).map_err(|_| closed())
    }
}

// The endpoint named by the target's path; the target's own authority names
// the resolver's server, not the service.
fn default_authority(target: &Target) -> String {
    match target.path().trim_start_matches('/') {
        "" => target.authority_host_port(),
        endpoint => endpoint.to_string(),
    }
}

fn closed() -> Status {
    Status::unavailable("channel is shut down")
}

struct Worker {
    policy: AutoConfiguredPolicy,
    work_scheduled: Arc<AtomicBool>,
    controller: InternalChannelController,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkQueueItem>) {
        while let Some(item) = rx.recv().await {
            match item {
                WorkQueueItem::ResolverUpdate { update, reply } => {
                    let result = self
                        .policy
                        .try_resolver_update(update, &mut self.controller);
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(status) = result {
                                tracing::debug!("resolver update rejected: {status}");
                            }
                        }
                    }
                }
                WorkQueueItem::SubchannelUpdate { subchannel, state } => {
                    self.policy
                        .subchannel_update(subchannel, &state, &mut self.controller);
                }
                WorkQueueItem::ScheduleWork => {
                    self.work_scheduled.store(false, Ordering::Release);
                    self.policy.work(&mut self.controller);
                }
                WorkQueueItem::ExitIdle => self.policy.exit_idle(&mut self.controller),
                WorkQueueItem::Shutdown(reply) => {
                    self.shutdown();
                    let _ = reply.send(());
                    return;
                }
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.policy.shutdown();
        self.controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing {
                error: "channel is shut down".to_string(),
            }),
        });
    }
}

struct InternalChannelController {
    subchannel_factory: Arc<dyn SubchannelFactory>,
    state: Arc<ArcSwap<LbState>>,
    resolution_requested: Arc<Notify>,
    authority: String,
}

impl ChannelController for InternalChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        self.subchannel_factory
            .new_subchannel(address, &self.authority)
    }

    fn update_picker(&mut self, update: LbState) {
        tracing::debug!("channel state: {}", update.connectivity_state);
        self.state.store(Arc::new(update));
    }

    fn request_resolution(&mut self) {
        self.resolution_requested.notify_one();
    }

    fn authority(&self) -> &str {
        &self.authority
    }
}

// Coalesces work requests: at most one ScheduleWork is queued at a time.
struct ChannelWorkScheduler {
    tx: mpsc::WeakUnboundedSender<WorkQueueItem>,
    scheduled: Arc<AtomicBool>,
}

impl WorkScheduler for ChannelWorkScheduler {
    fn schedule_work(&self) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(WorkQueueItem::ScheduleWork);
        }
    }
}
