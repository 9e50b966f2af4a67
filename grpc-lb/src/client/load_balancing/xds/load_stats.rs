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

//! Client-side load accounting for the locality-aware policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::locality::Locality;

/// Call counters of one locality.  Updated from the call path, so all fields
/// are atomics.
#[derive(Debug, Default)]
pub struct ClientLoadCounter {
    issued: AtomicU64,
    in_progress: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl ClientLoadCounter {
    pub(crate) fn record_call_started(&self) {
        self.issued.fetch_add(1, Ordering::Relaxed);
        self.in_progress.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_call_finished(&self, ok: bool) {
        self.in_progress.fetch_sub(1, Ordering::Relaxed);
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Calls still in progress are carried over to the next interval.
    fn snapshot(&self) -> LocalityLoadSnapshot {
        LocalityLoadSnapshot {
            calls_issued: self.issued.swap(0, Ordering::Relaxed),
            calls_in_progress: self.in_progress.load(Ordering::Relaxed),
            calls_succeeded: self.succeeded.swap(0, Ordering::Relaxed),
            calls_failed: self.failed.swap(0, Ordering::Relaxed),
        }
    }
}

/// Calls recorded for one locality since the previous snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalityLoadSnapshot {
    pub calls_issued: u64,
    pub calls_in_progress: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
}

/// Load recorded since the previous snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub localities: HashMap<Locality, LocalityLoadSnapshot>,
    pub dropped: HashMap<String, u64>,
    pub total_dropped: u64,
}

#[derive(Default)]
struct Inner {
    counters: HashMap<Locality, Arc<ClientLoadCounter>>,
    dropped: HashMap<String, u64>,
    total_dropped: u64,
}

/// Aggregates per-locality call counts and per-category drop counts.
#[derive(Default)]
pub struct LoadStatsStore {
    inner: Mutex<Inner>,
}

impl LoadStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `locality`.  Tracking an already tracked locality keeps
    /// its counter.
    pub fn add_locality(&self, locality: &Locality) {
        self.inner
            .lock()
            .counters
            .entry(locality.clone())
            .or_default();
    }

    /// Stops tracking `locality`.  Calls already routed to it keep updating
    /// the detached counter, which is no longer reported.
    pub fn remove_locality(&self, locality: &Locality) {
        self.inner.lock().counters.remove(locality);
    }

    /// Returns the counter of `locality`, tracking it if it was unknown.
    pub fn locality_counter(&self, locality: &Locality) -> Arc<ClientLoadCounter> {
        self.inner
            .lock()
            .counters
            .entry(locality.clone())
            .or_default()
            .clone()
    }

    pub fn record_dropped_request(&self, category: &str) {
        let mut inner = self.inner.lock();
        *inner.dropped.entry(category.to_string()).or_default() += 1;
        inner.total_dropped += 1;
    }

    /// Returns the load recorded since the previous call and starts a new
    /// interval.
    pub fn snapshot(&self) -> LoadSnapshot {
        let mut inner = self.inner.lock();
        LoadSnapshot {
            localities: inner
                .counters
                .iter()
                .map(|(locality, counter)| (locality.clone(), counter.snapshot()))
                .collect(),
            dropped: std::mem::take(&mut inner.dropped),
            total_dropped: std::mem::take(&mut inner.total_dropped),
        }
    }
}
