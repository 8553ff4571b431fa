// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::session::{PeerMessage, SessionEvent};
use rib::{Path, PeerInfo};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::mpsc::SyncSender;

/// A sibling session's mailbox. Sends are blocking: a full sibling mailbox
/// back-pressures the sender rather than dropping.
#[derive(Clone)]
pub struct PeerHandle {
    pub info: PeerInfo,
    mailbox: SyncSender<SessionEvent>,
}

impl PeerHandle {
    pub fn new(info: PeerInfo, mailbox: SyncSender<SessionEvent>) -> Self {
        Self { info, mailbox }
    }

    pub fn send_paths(&self, paths: Vec<Path>) -> Result<(), Error> {
        self.mailbox
            .send(SessionEvent::Sibling(PeerMessage::Path(paths)))?;
        Ok(())
    }

    pub fn send_peer_down(&self, info: PeerInfo) -> Result<(), Error> {
        self.mailbox
            .send(SessionEvent::Sibling(PeerMessage::PeerDown(info)))?;
        Ok(())
    }
}

/// The sibling directory: every other session in this speaker that should
/// hear about paths received or computed here, keyed by neighbor address.
/// Membership is driven by peer-added / peer-deleted control messages; no
/// session ever holds an owning reference to another.
#[derive(Default)]
pub struct Fanout {
    egress: BTreeMap<IpAddr, PeerHandle>,
}

impl Fanout {
    /// Deliver a path list to every sibling. A disconnected sibling is
    /// skipped; it is about to be removed by a peer-deleted message.
    pub fn send_paths(&self, paths: &[Path]) {
        if paths.is_empty() {
            return;
        }
        for handle in self.egress.values() {
            let _ = handle.send_paths(paths.to_vec());
        }
    }

    pub fn broadcast_peer_down(&self, info: PeerInfo) {
        for handle in self.egress.values() {
            let _ = handle.send_peer_down(info);
        }
    }

    pub fn add_egress(&mut self, peer: IpAddr, handle: PeerHandle) {
        self.egress.insert(peer, handle);
    }

    pub fn remove_egress(&mut self, peer: IpAddr) -> Option<PeerHandle> {
        self.egress.remove(&peer)
    }

    pub fn contains(&self, peer: IpAddr) -> bool {
        self.egress.contains_key(&peer)
    }

    pub fn handles(&self) -> impl Iterator<Item = &PeerHandle> {
        self.egress.values()
    }

    pub fn len(&self) -> usize {
        self.egress.len()
    }

    pub fn is_empty(&self) -> bool {
        self.egress.is_empty()
    }
}
