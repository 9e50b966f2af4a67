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

//! Delayed events for policies that run inside the channel's serialized
//! context.
//!
//! A timer is a sleep spawned on the [`Runtime`].  When it elapses it records
//! its event and asks the channel to call the policy's `work` method, where the
//! policy drains the fired events with [`TimerQueue::take_fired`].  Policy
//! state is therefore only ever touched from the serialized context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::WorkScheduler;
use crate::rt::{Runtime, TaskHandle};

/// A scheduled event that can be cancelled.
pub(crate) struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: Box<dyn TaskHandle>,
}

impl TimerHandle {
    /// Cancels the timer.  A cancelled timer never delivers its event, even if
    /// its delay already elapsed.  Cancelling more than once is a no-op.
    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.task.abort();
        }
    }
}

struct FiredEvent<E> {
    event: E,
    cancelled: Arc<AtomicBool>,
}

pub(crate) struct TimerQueue<E> {
    runtime: Arc<dyn Runtime>,
    work_scheduler: Arc<dyn WorkScheduler>,
    fired: Arc<Mutex<Vec<FiredEvent<E>>>>,
}

impl<E: Send + 'static> TimerQueue<E> {
    pub(crate) fn new(runtime: Arc<dyn Runtime>, work_scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            runtime,
            work_scheduler,
            fired: Arc::default(),
        }
    }

    /// Delivers `event` through `take_fired` once `delay` has elapsed.
    pub(crate) fn schedule(&self, delay: Duration, event: E) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let sleep = self.runtime.sleep(delay);
        let fired = self.fired.clone();
        let work_scheduler = self.work_scheduler.clone();
        let task_cancelled = cancelled.clone();
        let task = self.runtime.spawn(Box::pin(async move {
            sleep.await;
            if task_cancelled.load(Ordering::Acquire) {
                return;
            }
            fired.lock().push(FiredEvent {
                event,
                cancelled: task_cancelled,
            });
            work_scheduler.schedule_work();
        }));
        TimerHandle { cancelled, task }
    }

    /// Returns the events of every timer that fired and was not cancelled
    /// since the previous call, in firing order.
    pub(crate) fn take_fired(&self) -> Vec<E> {
        let fired = std::mem::take(&mut *self.fired.lock());
        fired
            .into_iter()
            .filter(|f| !f.cancelled.load(Ordering::Acquire))
            .map(|f| f.event)
            .collect()
    }
}
