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

//! Pickers composed by the locality store.

use std::sync::Arc;

use tonic::{Code, Status};

use super::load_stats::{ClientLoadCounter, LoadStatsStore};
use super::locality::{DropOverload, MILLION};
use crate::client::load_balancing::{PickRequest, PickResult, Picker};

/// A source of uniform random numbers shared by the call path.
pub trait ThreadSafeRandom: Send + Sync {
    /// Returns a uniform value in `[0, bound)`.  `bound` is never zero.
    fn next_below(&self, bound: u64) -> u64;
}

/// Draws from the thread-local generator of the `rand` crate.
#[derive(Debug, Default)]
pub struct RandRandom {
    _priv: (),
}

impl ThreadSafeRandom for RandRandom {
    fn next_below(&self, bound: u64) -> u64 {
        rand::random_range(..bound)
    }
}

/// A picker and the weight of its share of calls.
#[derive(Clone)]
pub struct WeightedChildPicker {
    pub weight: u32,
    pub picker: Arc<dyn Picker>,
}

impl WeightedChildPicker {
    pub fn new(weight: u32, picker: Arc<dyn Picker>) -> Self {
        Self { weight, picker }
    }
}

/// Selects a child with probability proportional to its weight.
///
/// Children with a zero weight are never selected, unless every child has a
/// zero weight, in which case all are selected uniformly.
pub struct WeightedPicker {
    children: Vec<WeightedChildPicker>,
    total_weight: u64,
    random: Arc<dyn ThreadSafeRandom>,
}

impl WeightedPicker {
    /// Callers pass at least one child.
    pub fn new(children: Vec<WeightedChildPicker>, random: Arc<dyn ThreadSafeRandom>) -> Self {
        let total_weight = children.iter().map(|c| u64::from(c.weight)).sum();
        Self {
            children,
            total_weight,
            random,
        }
    }

    fn select(&self) -> &WeightedChildPicker {
        if self.total_weight == 0 {
            let idx = self.random.next_below(self.children.len() as u64) as usize;
            return &self.children[idx];
        }
        let mut remaining = self.random.next_below(self.total_weight);
        for child in &self.children {
            let weight = u64::from(child.weight);
            if remaining < weight {
                return child;
            }
            remaining -= weight;
        }
        // Unreachable while the draw is below the total weight.
        &self.children[self.children.len() - 1]
    }
}

impl Picker for WeightedPicker {
    fn pick(&self, request: &PickRequest) -> PickResult {
        if let [only] = self.children.as_slice() {
            return only.picker.pick(request);
        }
        self.select().picker.pick(request)
    }
}

/// Drops calls per category before the wrapped picker sees them.
pub struct DropPicker {
    drop_overloads: Vec<DropOverload>,
    delegate: Arc<dyn Picker>,
    random: Arc<dyn ThreadSafeRandom>,
    load_stats: Arc<LoadStatsStore>,
}

impl DropPicker {
    pub fn new(
        drop_overloads: Vec<DropOverload>,
        delegate: Arc<dyn Picker>,
        random: Arc<dyn ThreadSafeRandom>,
        load_stats: Arc<LoadStatsStore>,
    ) -> Self {
        Self {
            drop_overloads,
            delegate,
            random,
            load_stats,
        }
    }
}

impl Picker for DropPicker {
    fn pick(&self, request: &PickRequest) -> PickResult {
        for drop_overload in &self.drop_overloads {
            if self.random.next_below(u64::from(MILLION))
                < u64::from(drop_overload.drops_per_million)
            {
                self.load_stats
                    .record_dropped_request(&drop_overload.category);
                return PickResult::Drop(Status::unavailable(format!(
                    "dropped by loadbalancer: {drop_overload}"
                )));
            }
        }
        self.delegate.pick(request)
    }
}

/// Counts the calls a locality's picker routes, and how they end.
pub struct LoadRecordingPicker {
    delegate: Arc<dyn Picker>,
    counter: Arc<ClientLoadCounter>,
}

impl LoadRecordingPicker {
    pub fn new(delegate: Arc<dyn Picker>, counter: Arc<ClientLoadCounter>) -> Self {
        Self { delegate, counter }
    }
}

impl Picker for LoadRecordingPicker {
    fn pick(&self, request: &PickRequest) -> PickResult {
        let mut pick = match self.delegate.pick(request) {
            PickResult::Pick(pick) => pick,
            other => return other,
        };
        self.counter.record_call_started();
        let counter = self.counter.clone();
        let previous = pick.on_complete.take();
        pick.on_complete = Some(Box::new(move |status: &Status| {
            counter.record_call_finished(status.code() == Code::Ok);
            if let Some(previous) = previous {
                previous(status);
            }
        }));
        PickResult::Pick(pick)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tonic::Status;

    use super::{
        DropPicker, LoadRecordingPicker, ThreadSafeRandom, WeightedChildPicker, WeightedPicker,
    };
    use crate::client::load_balancing::test_utils::TestSubchannel;
    use crate::client::load_balancing::xds::load_stats::{LoadStatsStore, LocalityLoadSnapshot};
    use crate::client::load_balancing::xds::locality::{DropOverload, Locality};
    use crate::client::load_balancing::{Pick, PickRequest, PickResult, Picker};
    use crate::client::name_resolution::Address;

    /// Returns queued draws in order, then zero.
    #[derive(Default)]
    pub(crate) struct FakeRandom {
        draws: Mutex<VecDeque<u64>>,
    }

    impl FakeRandom {
        pub(crate) fn with_draws(draws: impl IntoIterator<Item = u64>) -> Arc<Self> {
            Arc::new(Self {
                draws: Mutex::new(draws.into_iter().collect()),
            })
        }
    }

    impl ThreadSafeRandom for FakeRandom {
        fn next_below(&self, bound: u64) -> u64 {
            let draw = self.draws.lock().pop_front().unwrap_or(0);
            assert!(draw < bound, "draw {draw} out of [0, {bound})");
            draw
        }
    }

    // Fails every pick with its name, so tests can tell pickers apart.
    struct NamedPicker(&'static str);

    impl Picker for NamedPicker {
        fn pick(&self, _request: &PickRequest) -> PickResult {
            PickResult::Fail(Status::unavailable(self.0))
        }
    }

    fn named(weight: u32, name: &'static str) -> WeightedChildPicker {
        WeightedChildPicker::new(weight, Arc::new(NamedPicker(name)))
    }

    fn picked_name(result: PickResult) -> String {
        match result {
            PickResult::Fail(status) => status.message().to_string(),
            other => panic!("unexpected pick result {other:?}"),
        }
    }

    #[test]
    fn weighted_picker_selects_proportionally() {
        let random = FakeRandom::with_draws([0, 2, 3, 9]);
        let picker = WeightedPicker::new(vec![named(3, "a"), named(7, "b")], random);
        let picks: Vec<_> = (0..4)
            .map(|_| picked_name(picker.pick(&PickRequest::default())))
            .collect();
        assert_eq!(picks, vec!["a", "a", "b", "b"]);
    }

    #[test]
    fn weighted_picker_never_selects_zero_weight() {
        let random = FakeRandom::with_draws([0, 1, 2]);
        let picker = WeightedPicker::new(
            vec![named(0, "zero"), named(2, "a"), named(1, "b")],
            random,
        );
        let picks: Vec<_> = (0..3)
            .map(|_| picked_name(picker.pick(&PickRequest::default())))
            .collect();
        assert_eq!(picks, vec!["a", "a", "b"]);
    }

    #[test]
    fn weighted_picker_with_no_weight_selects_uniformly() {
        let random = FakeRandom::with_draws([2, 0, 1]);
        let picker = WeightedPicker::new(
            vec![named(0, "a"), named(0, "b"), named(0, "c")],
            random,
        );
        let picks: Vec<_> = (0..3)
            .map(|_| picked_name(picker.pick(&PickRequest::default())))
            .collect();
        assert_eq!(picks, vec!["c", "a", "b"]);
    }

    #[test]
    fn drop_picker_drops_in_order_and_records() {
        let load_stats = Arc::new(LoadStatsStore::new());
        let drops = vec![
            DropOverload::new("throttle", 100_000),
            DropOverload::new("lb", 300_000),
        ];
        // First call: dropped by "throttle".  Second: passes "throttle",
        // dropped by "lb".  Third: passes both.
        let random = FakeRandom::with_draws([99_999, 100_000, 299_999, 100_000, 300_000]);
        let picker = DropPicker::new(
            drops,
            Arc::new(NamedPicker("backend")),
            random,
            load_stats.clone(),
        );

        match picker.pick(&PickRequest::default()) {
            PickResult::Drop(status) => {
                assert_eq!(status.code(), tonic::Code::Unavailable);
                assert!(status.message().contains("dropped by loadbalancer"));
                assert!(status.message().contains("throttle"));
            }
            other => panic!("unexpected pick result {other:?}"),
        }
        match picker.pick(&PickRequest::default()) {
            PickResult::Drop(status) => assert!(status.message().contains("lb")),
            other => panic!("unexpected pick result {other:?}"),
        }
        assert_eq!(picked_name(picker.pick(&PickRequest::default())), "backend");

        let snapshot = load_stats.snapshot();
        assert_eq!(snapshot.dropped["throttle"], 1);
        assert_eq!(snapshot.dropped["lb"], 1);
        assert_eq!(snapshot.total_dropped, 2);
    }

    #[test]
    fn drop_picker_full_and_zero_rates() {
        let load_stats = Arc::new(LoadStatsStore::new());
        let always = DropPicker::new(
            vec![DropOverload::new("all", 1_000_000)],
            Arc::new(NamedPicker("backend")),
            FakeRandom::with_draws([999_999]),
            load_stats.clone(),
        );
        assert!(matches!(
            always.pick(&PickRequest::default()),
            PickResult::Drop(_)
        ));

        let never = DropPicker::new(
            vec![DropOverload::new("none", 0)],
            Arc::new(NamedPicker("backend")),
            FakeRandom::with_draws([0]),
            load_stats,
        );
        assert_eq!(picked_name(never.pick(&PickRequest::default())), "backend");
    }

    struct SubchannelPicker {
        tx_events: mpsc::UnboundedSender<crate::client::load_balancing::test_utils::TestEvent>,
        completed: Arc<AtomicBool>,
    }

    impl Picker for SubchannelPicker {
        fn pick(&self, _request: &PickRequest) -> PickResult {
            let mut pick = Pick::new(Arc::new(TestSubchannel::new(
                Address::tcp("1.1.1.1:1"),
                self.tx_events.clone(),
            )));
            let completed = self.completed.clone();
            pick.on_complete = Some(Box::new(move |_status: &Status| {
                completed.store(true, Ordering::SeqCst);
            }));
            PickResult::Pick(pick)
        }
    }

    #[test]
    fn load_recording_picker_counts_calls() {
        let (tx_events, _rx_events) = mpsc::unbounded_channel();
        let load_stats = LoadStatsStore::new();
        let locality = Locality::new("r", "z", "s");
        let completed = Arc::new(AtomicBool::new(false));
        let picker = LoadRecordingPicker::new(
            Arc::new(SubchannelPicker {
                tx_events,
                completed: completed.clone(),
            }),
            load_stats.locality_counter(&locality),
        );

        let PickResult::Pick(first) = picker.pick(&PickRequest::default()) else {
            panic!("expected a pick");
        };
        let PickResult::Pick(second) = picker.pick(&PickRequest::default()) else {
            panic!("expected a pick");
        };
        (first.on_complete.unwrap())(&Status::internal("boom"));
        assert!(completed.load(Ordering::SeqCst));
        let _ = second;

        let snapshot = load_stats.snapshot();
        assert_eq!(
            snapshot.localities[&locality],
            LocalityLoadSnapshot {
                calls_issued: 2,
                calls_in_progress: 1,
                calls_succeeded: 0,
                calls_failed: 1,
            }
        );
    }
}
