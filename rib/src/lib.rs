// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routing information base structures shared by the BGP session cores:
//! route families, prefixes, paths, per-peer adjacency tables and the
//! decision-process table, plus the policy-engine interface.

pub mod adj;
pub mod db;
pub mod error;
pub mod policy;
pub mod types;

pub use adj::AdjRib;
pub use db::Rib;
pub use policy::{DefaultPolicy, Policy, PolicyDisposition, PolicyOutcome, PrefixPolicy, PrefixRule};
pub use types::{Asn, Path, PathOrigin, PeerInfo, Prefix, Prefix4, Prefix6, RouteFamily};
