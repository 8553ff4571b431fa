// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use rib::{Asn, DefaultPolicy, RouteFamily};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Speaker-wide configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct RouterConfig {
    pub asn: Asn,
    pub id: u32,
}

/// Per-neighbor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PeerConfig {
    pub name: String,

    /// Neighbor transport address (normally port 179).
    pub host: SocketAddr,

    /// Expected remote autonomous system.
    pub remote_asn: u32,

    /// Route families this neighbor is configured to carry.
    pub families: Vec<RouteFamily>,

    /// Timer intervals, in seconds unless noted.
    pub hold_time: u64,
    pub keepalive: u64,
    pub connect_retry: u64,
    pub idle_hold_time: u64,
    pub idle_hold_time_after_reset: u64,

    /// Timer resolution in milliseconds.
    pub resolution: u64,

    /// Wait for the neighbor to connect rather than dialing out.
    pub passive: bool,

    /// Run the decision process on this neighbor's behalf.
    pub route_server_client: bool,

    /// Names of policies applied to routes received from siblings for this
    /// neighbor, in application order, and the verdict used when none match.
    pub import_policy: Vec<String>,
    pub export_policy: Vec<String>,
    pub default_import_policy: DefaultPolicy,
    pub default_export_policy: DefaultPolicy,
}

impl PeerConfig {
    pub fn new(name: &str, host: SocketAddr, remote_asn: u32) -> Self {
        Self {
            name: name.into(),
            host,
            remote_asn,
            families: vec![RouteFamily::IPV4_UNICAST],
            hold_time: 90,
            keepalive: 30,
            connect_retry: 10,
            idle_hold_time: 0,
            idle_hold_time_after_reset: 30,
            resolution: 100,
            passive: false,
            route_server_client: false,
            import_policy: Vec::new(),
            export_policy: Vec::new(),
            default_import_policy: DefaultPolicy::AcceptRoute,
            default_export_policy: DefaultPolicy::AcceptRoute,
        }
    }
}
