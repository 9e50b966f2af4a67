/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */


//! Client-side load balancing for [gRPC].
//!
//! This crate contains the decision engine a channel uses to route calls: the
//! auto-configured policy that picks a load-balancing policy from the service
//! config, the `pick_first` and `round_robin` leaf policies, and the
//! locality-aware `xds_experimental` policy with priority fail-over and
//! drop overloads.
//!
//! This version is in progress and not recommended for any production use.  All
//! APIs are unstable.  Proceed at your own risk.
//!
//! [gRPC]: https://grpc.io

pub mod attributes;
pub mod client;
pub mod rt;
