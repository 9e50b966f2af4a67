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

//! Endpoint-discovery data consumed by the locality store.

use std::fmt::{self, Display};

use indexmap::IndexMap;

use crate::client::name_resolution::Endpoint;

/// Identifies where a group of endpoints runs.  Two localities are the same
/// locality iff all three fields match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locality {
    /// Region the endpoints are in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

impl Locality {
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        sub_zone: impl Into<String>,
    ) -> Self {
        Locality {
            region: region.into(),
            zone: zone.into(),
            sub_zone: sub_zone.into(),
        }
    }
}

impl Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.zone, self.sub_zone)
    }
}

/// One endpoint of a locality with its load-balancing weight.
#[derive(Debug, Clone, PartialEq)]
pub struct LbEndpoint {
    pub endpoint: Endpoint,
    pub load_balancing_weight: u32,
}

impl LbEndpoint {
    pub fn new(endpoint: Endpoint, load_balancing_weight: u32) -> Self {
        LbEndpoint {
            endpoint,
            load_balancing_weight,
        }
    }
}

/// The endpoints of one locality, its weight relative to the other localities
/// of its priority, and its priority (0 is the highest).
#[derive(Debug, Clone, PartialEq)]
pub struct LocalityLbEndpoints {
    pub endpoints: Vec<LbEndpoint>,
    pub locality_weight: u32,
    pub priority: u32,
}

impl LocalityLbEndpoints {
    pub fn new(endpoints: Vec<LbEndpoint>, locality_weight: u32, priority: u32) -> Self {
        LocalityLbEndpoints {
            endpoints,
            locality_weight,
            priority,
        }
    }
}

/// The denominator of a drop fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FractionDenominator {
    Hundred,
    TenThousand,
    Million,
}

/// Upper bound of [`DropOverload::drops_per_million`].
pub const MILLION: u32 = 1_000_000;

/// The probability that calls of a category are dropped before reaching any
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropOverload {
    pub category: String,
    pub drops_per_million: u32,
}

impl DropOverload {
    pub fn new(category: impl Into<String>, drops_per_million: u32) -> Self {
        DropOverload {
            category: category.into(),
            drops_per_million: drops_per_million.min(MILLION),
        }
    }

    /// Converts `numerator / denominator` to drops per million, clamped to
    /// 100%.
    pub fn from_fraction(
        category: impl Into<String>,
        numerator: u32,
        denominator: FractionDenominator,
    ) -> Self {
        let per_million = match denominator {
            FractionDenominator::Hundred => u64::from(numerator) * 10_000,
            FractionDenominator::TenThousand => u64::from(numerator) * 100,
            FractionDenominator::Million => u64::from(numerator),
        };
        DropOverload {
            category: category.into(),
            drops_per_million: per_million.min(u64::from(MILLION)) as u32,
        }
    }

    pub fn drops_everything(&self) -> bool {
        self.drops_per_million == MILLION
    }
}

impl Display for DropOverload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DropOverload{{category={}, dropsPerMillion={}}}",
            self.category, self.drops_per_million
        )
    }
}

/// Converts drop fractions, in order, to a drop list.
///
/// Entries after the first one dropping 100% of calls can never match and are
/// discarded.  The returned flag reports whether such an entry was found.
pub fn drop_overloads_from_fractions<S: Into<String>>(
    fractions: impl IntoIterator<Item = (S, u32, FractionDenominator)>,
) -> (Vec<DropOverload>, bool) {
    let mut drop_overloads = vec![];
    for (category, numerator, denominator) in fractions {
        let drop_overload = DropOverload::from_fraction(category, numerator, denominator);
        let drops_everything = drop_overload.drops_everything();
        drop_overloads.push(drop_overload);
        if drops_everything {
            return (drop_overloads, true);
        }
    }
    (drop_overloads, false)
}

/// The endpoints of a cluster grouped by locality, plus its drop
/// configuration.  Delivered to the locality-aware policy as an attribute of
/// the resolver update; localities keep their discovery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterLoadAssignment {
    pub cluster_name: String,
    pub localities: IndexMap<Locality, LocalityLbEndpoints>,
    pub drop_overloads: Vec<DropOverload>,
}

#[cfg(test)]
mod test {
    use super::{DropOverload, FractionDenominator, Locality, drop_overloads_from_fractions};

    #[test]
    fn fractions_convert_to_drops_per_million() {
        let cases = [
            (1, FractionDenominator::Hundred, 10_000),
            (25, FractionDenominator::TenThousand, 2_500),
            (7, FractionDenominator::Million, 7),
            (101, FractionDenominator::Hundred, 1_000_000),
            (u32::MAX, FractionDenominator::TenThousand, 1_000_000),
        ];
        for (numerator, denominator, want) in cases {
            let drop_overload = DropOverload::from_fraction("lb", numerator, denominator);
            assert_eq!(drop_overload.drops_per_million, want, "{numerator} / {denominator:?}");
        }
    }

    #[test]
    fn drop_list_stops_after_first_full_drop() {
        let (drops, all) = drop_overloads_from_fractions([
            ("throttle", 10, FractionDenominator::Hundred),
            ("lb", 100, FractionDenominator::Hundred),
            ("never", 1, FractionDenominator::Million),
        ]);
        assert!(all);
        assert_eq!(
            drops,
            vec![
                DropOverload::new("throttle", 100_000),
                DropOverload::new("lb", 1_000_000)
            ]
        );

        let (drops, all) =
            drop_overloads_from_fractions([("throttle", 10, FractionDenominator::Hundred)]);
        assert!(!all);
        assert_eq!(drops.len(), 1);
    }

    #[test]
    fn localities_are_equal_iff_all_fields_match() {
        assert_eq!(Locality::new("r", "z", "s"), Locality::new("r", "z", "s"));
        assert_ne!(Locality::new("r", "z", "s"), Locality::new("r", "z", "t"));
        assert_eq!(Locality::new("r", "z", "s").to_string(), "r/z/s");
    }
}
