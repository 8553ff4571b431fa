// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The global-RIB actor: a distinct pseudo-peer that shares the route
//! pipeline and sibling fan-out with real sessions but has no state
//! machine, no transport and no connect loop. Paths received from siblings
//! run the decision process and the resulting changes are re-broadcast to
//! every sibling.

use crate::config::RouterConfig;
use crate::fanout::{Fanout, PeerHandle};
use crate::session::{
    ApiRequest, ApiRequestKind, ApiResponse, PeerMessage, ServerMessage,
    SessionEvent,
};
use crate::MAILBOX_DEPTH;
use rib::{PeerInfo, Rib, RouteFamily};
use rsd_common::lock;
use serde_json::json;
use slog::{debug, info, warn, Logger};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub struct GlobalRibRunner {
    pub info: PeerInfo,
    families: Vec<RouteFamily>,
    rib: Rib,
    event_tx: SyncSender<SessionEvent>,
    event_rx: Mutex<Option<Receiver<SessionEvent>>>,
    fanout: Mutex<Fanout>,
    shutdown: AtomicBool,
    log: Logger,
}

impl GlobalRibRunner {
    pub fn new(
        router: RouterConfig,
        families: Vec<RouteFamily>,
        rib: Rib,
        log: Logger,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = sync_channel(MAILBOX_DEPTH);
        Arc::new(Self {
            info: PeerInfo {
                asn: router.asn.as_u32(),
                id: router.id,
                address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            },
            families,
            rib,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            fanout: Mutex::new(Fanout::default()),
            shutdown: AtomicBool::new(false),
            log,
        })
    }

    pub fn handle(&self) -> PeerHandle {
        PeerHandle::new(self.info, self.event_tx.clone())
    }

    pub fn mailbox(&self) -> SyncSender<SessionEvent> {
        self.event_tx.clone()
    }

    pub fn rib(&self) -> Rib {
        self.rib.clone()
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let runner = self.clone();
        std::thread::spawn(move || runner.run())
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.event_tx.send(SessionEvent::Kill);
    }

    fn run(&self) {
        let event_rx = lock!(self.event_rx)
            .take()
            .expect("global rib event loop started twice");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let Ok(event) = event_rx.recv() else {
                return;
            };
            match event {
                SessionEvent::Kill => {
                    info!(self.log, "global rib teardown");
                    return;
                }
                SessionEvent::Sibling(PeerMessage::Path(paths)) => {
                    let changes = self.rib.process_paths(paths);
                    lock!(self.fanout).send_paths(&changes);
                }
                SessionEvent::Sibling(PeerMessage::PeerDown(info)) => {
                    for family in self.families.iter() {
                        let changes =
                            self.rib.delete_paths_for_peer(&info, *family);
                        lock!(self.fanout).send_paths(&changes);
                    }
                }
                SessionEvent::Server(msg) => self.handle_server_msg(msg),
                SessionEvent::Fsm { .. } => {
                    // nothing routes FSM events here
                    unreachable!("fsm event delivered to global rib session")
                }
            }
        }
    }

    fn handle_server_msg(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::PeerAdded(handle) => {
                info!(self.log, "sibling added to global rib";
                    "sibling" => %handle.info.address);
                lock!(self.fanout).add_egress(handle.info.address, handle);
                for family in self.families.iter() {
                    let paths = self.rib.get_path_list(*family);
                    lock!(self.fanout).send_paths(&paths);
                }
            }
            ServerMessage::PeerDeleted(info) => {
                let removed =
                    lock!(self.fanout).remove_egress(info.address).is_some();
                if !removed {
                    warn!(self.log, "can not find peer";
                        "sibling" => %info.address);
                    return;
                }
                for family in self.families.iter() {
                    let changes =
                        self.rib.delete_paths_for_peer(&info, *family);
                    lock!(self.fanout).send_paths(&changes);
                }
            }
            ServerMessage::PolicyUpdated(_) => {
                debug!(self.log, "global rib has no session policies");
            }
            ServerMessage::Api(request) => self.handle_api_request(request),
        }
    }

    fn handle_api_request(&self, request: ApiRequest) {
        let data = match request.kind {
            ApiRequestKind::LocalRib | ApiRequestKind::GlobalRib => {
                if self.rib.has_family(request.family) {
                    json!(self.rib.table(request.family))
                } else {
                    json!({})
                }
            }
            _ => serde_json::Value::Null,
        };
        let _ = request.reply.send(ApiResponse { data });
    }
}
