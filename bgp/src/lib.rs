// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-neighbor BGP session cores: one supervisor actor per configured
//! neighbor driving the RFC 4271 state machine, exchanging decoded BGP
//! messages with the peer and route updates with sibling sessions.

use std::net::IpAddr;
use std::time::Duration;

pub mod clock;
pub mod config;
pub mod connect;
pub mod connection;
pub mod connection_tcp;
pub mod error;
pub mod fanout;
pub mod fsm;
pub mod global;
pub mod messages;
pub mod pipeline;
pub mod session;

mod log;

#[cfg(test)]
#[macro_use]
extern crate lazy_static;

#[cfg(test)]
pub mod connection_channel;


pub const BGP_PORT: u16 = 179;

/// Capacity of the bounded session mailboxes and of the outgoing message
/// queue. Sends into a full mailbox block the sender.
pub const MAILBOX_DEPTH: usize = 1024;

/// Lower bound on the connect-retry period regardless of configuration.
pub const CONNECT_RETRY_FLOOR: Duration = Duration::from_secs(10);

/// An established session lost within this window of coming up counts as a
/// flap.
pub const FLAP_WINDOW: Duration = Duration::from_secs(30);

//TODO use IpAddr::to_canonical once it stabilizes.
pub fn to_canonical(addr: IpAddr) -> IpAddr {
    match addr {
        v6 @ IpAddr::V6(ip) => match ip.to_ipv4() {
            Some(v4) => IpAddr::V4(v4),
            None => v6,
        },
        v4 @ IpAddr::V4(_) => v4,
    }
}
