// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-neighbor session supervisor: one event loop owning the
//! adjacency tables, negotiated session state and sibling directory,
//! dispatching decoded BGP messages, server control messages and sibling
//! route messages to completion, one event at a time.

use crate::config::{PeerConfig, RouterConfig};
use crate::connect;
use crate::connection::{BgpConnection, BgpConnector};
use crate::error::Error;
use crate::fanout::{Fanout, PeerHandle};
use crate::fsm::{AdminState, Fsm, FsmHandler, FsmState};
use crate::log::neighbor_log;
use crate::messages::{
    rewrite_as_path_2byte, validate_update, CapabilityCode, CeaseSubcode,
    Capability, Message, MessageError, MessageType, NotificationMessage,
    normalize_as4_path,
};
use crate::pipeline::{
    filter_paths, paths_from_update, prepare_export, updates_from_paths,
    PolicyChains,
};
use crate::{to_canonical, FLAP_WINDOW, MAILBOX_DEPTH};
use chrono::{DateTime, Utc};
use rib::{AdjRib, Path, PeerInfo, Policy, Rib, RouteFamily};
use rsd_common::lock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Information about a neighbor (peer).
#[derive(Debug, Clone)]
pub struct NeighborInfo {
    pub name: String,
    pub host: SocketAddr,
}

/// Counters for messages sent and received, state transitions and flaps.
#[derive(Default)]
pub struct SessionCounters {
    pub opens_sent: AtomicU64,
    pub opens_received: AtomicU64,
    pub updates_sent: AtomicU64,
    pub updates_received: AtomicU64,
    pub keepalives_sent: AtomicU64,
    pub keepalives_received: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_received: AtomicU64,
    pub route_refreshes_sent: AtomicU64,
    pub route_refreshes_received: AtomicU64,
    pub established_transitions: AtomicU64,
    pub flaps: AtomicU64,
}

impl SessionCounters {
    pub fn count_sent(&self, kind: MessageType) {
        self.counter_for(kind, true).fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_received(&self, kind: MessageType) {
        self.counter_for(kind, false).fetch_add(1, Ordering::Relaxed);
    }

    fn counter_for(&self, kind: MessageType, sent: bool) -> &AtomicU64 {
        match (kind, sent) {
            (MessageType::Open, true) => &self.opens_sent,
            (MessageType::Open, false) => &self.opens_received,
            (MessageType::Update, true) => &self.updates_sent,
            (MessageType::Update, false) => &self.updates_received,
            (MessageType::Notification, true) => &self.notifications_sent,
            (MessageType::Notification, false) => &self.notifications_received,
            (MessageType::KeepAlive, true) => &self.keepalives_sent,
            (MessageType::KeepAlive, false) => &self.keepalives_received,
            (MessageType::RouteRefresh, true) => &self.route_refreshes_sent,
            (MessageType::RouteRefresh, false) => {
                &self.route_refreshes_received
            }
        }
    }

    pub fn total_sent(&self) -> u64 {
        self.opens_sent.load(Ordering::Relaxed)
            + self.updates_sent.load(Ordering::Relaxed)
            + self.keepalives_sent.load(Ordering::Relaxed)
            + self.notifications_sent.load(Ordering::Relaxed)
            + self.route_refreshes_sent.load(Ordering::Relaxed)
    }

    pub fn total_received(&self) -> u64 {
        self.opens_received.load(Ordering::Relaxed)
            + self.updates_received.load(Ordering::Relaxed)
            + self.keepalives_received.load(Ordering::Relaxed)
            + self.notifications_received.load(Ordering::Relaxed)
            + self.route_refreshes_received.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        for counter in [
            &self.opens_sent,
            &self.opens_received,
            &self.updates_sent,
            &self.updates_received,
            &self.keepalives_sent,
            &self.keepalives_received,
            &self.notifications_sent,
            &self.notifications_received,
            &self.route_refreshes_sent,
            &self.route_refreshes_received,
            &self.established_transitions,
            &self.flaps,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// The outbound message queue drained onto the wire by the FSM driver.
/// Carries a depth gauge so introspection can report the instantaneous
/// number of pending messages.
#[derive(Clone)]
pub struct MessageQueue {
    tx: SyncSender<Message>,
    depth: Arc<AtomicUsize>,
}

pub struct MessageQueueRx {
    rx: Receiver<Message>,
    depth: Arc<AtomicUsize>,
}

pub fn message_queue(capacity: usize) -> (MessageQueue, MessageQueueRx) {
    let (tx, rx) = sync_channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        MessageQueue {
            tx,
            depth: depth.clone(),
        },
        MessageQueueRx { rx, depth },
    )
}

impl MessageQueue {
    pub fn send(&self, msg: Message) -> Result<(), Error> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tx.send(msg) {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageQueueRx {
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Message, RecvTimeoutError> {
        let msg = self.rx.recv_timeout(timeout)?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Ok(msg)
    }
}

/// What the FSM driver reports up to the supervisor.
#[derive(Debug)]
pub enum FsmMessage {
    StateChange(FsmState),
    Message(Message),
    MessageError(MessageError),
}

/// Route messages exchanged between sibling sessions.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    /// Paths a sibling received from its neighbor (its post-receive
    /// Adj-RIB-In contents) or computed.
    Path(Vec<Path>),

    /// A sibling's session left established; drop everything learned from
    /// it.
    PeerDown(PeerInfo),
}

/// Control messages from the parent server.
pub enum ServerMessage {
    PeerAdded(PeerHandle),
    PeerDeleted(PeerInfo),
    PolicyUpdated(BTreeMap<String, Arc<dyn Policy>>),
    Api(ApiRequest),
}

/// Management request kinds served by the supervisor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ApiRequestKind {
    LocalRib,
    GlobalRib,
    AdjRibIn,
    AdjRibOut,
    NeighborShutdown,
    NeighborReset,
    NeighborSoftReset,
    NeighborSoftResetIn,
    NeighborSoftResetOut,
    NeighborEnable,
    NeighborDisable,
}

pub struct ApiRequest {
    pub kind: ApiRequestKind,
    pub family: RouteFamily,
    pub reply: std::sync::mpsc::Sender<ApiResponse>,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub data: serde_json::Value,
}

/// Everything a session mailbox can carry. One bounded queue per session
/// preserves per-source FIFO ordering; sibling sends block when it fills.
pub enum SessionEvent {
    Fsm { generation: u64, message: FsmMessage },
    Server(ServerMessage),
    Sibling(PeerMessage),
    Kill,
}

/// JSON-marshalled view of a session for the management API.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PeerSummary {
    pub conf: PeerSummaryConf,
    pub info: PeerSummaryInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PeerSummaryConf {
    pub remote_ip: IpAddr,
    pub id: String,
    pub remote_as: u32,
    pub remote_cap: Vec<u8>,
    pub local_cap: Vec<u8>,
    pub families: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PeerSummaryInfo {
    pub bgp_state: String,
    pub admin_state: String,
    pub fsm_established_transitions: u64,
    pub total_message_out: u64,
    pub total_message_in: u64,
    pub update_message_out: u64,
    pub update_message_in: u64,
    pub keepalive_message_out: u64,
    pub keepalive_message_in: u64,
    pub open_message_out: u64,
    pub open_message_in: u64,
    pub notification_out: u64,
    pub notification_in: u64,
    pub refresh_message_out: u64,
    pub refresh_message_in: u64,
    pub uptime: i64,
    pub downtime: i64,
    pub received: u64,
    pub accepted: u64,
    pub advertised: u64,
    pub out_q: usize,
    pub flops: u64,
}

/// True when a loss of established this soon after coming up counts as a
/// flap.
pub fn is_flap(uptime: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match (now - uptime).to_std() {
        Ok(elapsed) => elapsed < FLAP_WINDOW,
        Err(_) => false,
    }
}

/// One BGP peering relationship: supervisor state plus the FSM driver and
/// (for non-passive peers) the connect loop.
pub struct PeerSession<Cnx: BgpConnection> {
    pub neighbor: NeighborInfo,
    pub config: PeerConfig,
    pub router: RouterConfig,
    pub fsm: Arc<Fsm<Cnx>>,
    pub counters: Arc<SessionCounters>,

    event_tx: SyncSender<SessionEvent>,
    event_rx: Mutex<Option<Receiver<SessionEvent>>>,
    conn_tx: SyncSender<Cnx>,
    get_active_tx: SyncSender<()>,
    get_active_rx: Mutex<Option<Receiver<()>>>,

    rib: Rib,
    adj_rib: Mutex<AdjRib>,
    rf_map: Mutex<BTreeSet<RouteFamily>>,
    cap_map: Mutex<BTreeMap<u8, Capability>>,
    peer_info: Mutex<PeerInfo>,
    fanout: Mutex<Fanout>,
    policies: Mutex<PolicyChains>,
    outgoing: Mutex<Option<MessageQueue>>,

    uptime: Mutex<Option<DateTime<Utc>>>,
    downtime: Mutex<Option<DateTime<Utc>>>,
    update_recv_time: Mutex<Option<DateTime<Utc>>>,

    generation: AtomicU64,
    shutdown: Arc<AtomicBool>,
    log: Logger,
}

impl<Cnx: BgpConnection> PeerSession<Cnx> {
    pub fn new(
        router: RouterConfig,
        config: PeerConfig,
        rib: Rib,
        policy_map: &BTreeMap<String, Arc<dyn Policy>>,
        siblings: Vec<PeerHandle>,
        log: Logger,
    ) -> Arc<Self> {
        let neighbor = NeighborInfo {
            name: config.name.clone(),
            host: config.host,
        };
        let (event_tx, event_rx) = sync_channel(MAILBOX_DEPTH);
        let (conn_tx, conn_rx) = sync_channel(1);
        let (get_active_tx, get_active_rx) = sync_channel(1);
        let counters = Arc::new(SessionCounters::default());
        let fsm = Arc::new(Fsm::new(
            config.clone(),
            router,
            neighbor.clone(),
            conn_rx,
            counters.clone(),
            log.clone(),
        ));

        let peer_info = PeerInfo {
            asn: config.remote_asn,
            id: 0,
            address: to_canonical(config.host.ip()),
        };

        let mut fanout = Fanout::default();
        for handle in siblings {
            fanout.add_egress(handle.info.address, handle);
        }

        let mut policies = PolicyChains::new(
            config.default_import_policy,
            config.default_export_policy,
        );
        Self::resolve_policies(&config, policy_map, &mut policies);

        let session = Arc::new(Self {
            neighbor,
            adj_rib: Mutex::new(AdjRib::new(&config.families)),
            rf_map: Mutex::new(config.families.iter().copied().collect()),
            cap_map: Mutex::new(BTreeMap::new()),
            peer_info: Mutex::new(peer_info),
            fanout: Mutex::new(fanout),
            policies: Mutex::new(policies),
            outgoing: Mutex::new(None),
            uptime: Mutex::new(None),
            downtime: Mutex::new(Some(Utc::now())),
            update_recv_time: Mutex::new(None),
            generation: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            conn_tx,
            get_active_tx,
            get_active_rx: Mutex::new(Some(get_active_rx)),
            rib,
            fsm,
            counters,
            config,
            router,
            log,
        });
        session
    }

    fn resolve_policies(
        config: &PeerConfig,
        policy_map: &BTreeMap<String, Arc<dyn Policy>>,
        chains: &mut PolicyChains,
    ) {
        // unresolved names are skipped
        chains.import = config
            .import_policy
            .iter()
            .filter_map(|name| policy_map.get(name).cloned())
            .collect();
        chains.export = config
            .export_policy
            .iter()
            .filter_map(|name| policy_map.get(name).cloned())
            .collect();
    }

    /// Start the supervisor, and for non-passive peers the connect loop.
    /// Returns the supervisor's join handle.
    pub fn start(
        self: &Arc<Self>,
        connector: Option<Arc<dyn BgpConnector<Conn = Cnx>>>,
    ) -> JoinHandle<()> {
        if !self.config.passive {
            if let Some(connector) = connector {
                let get_active_rx = lock!(self.get_active_rx)
                    .take()
                    .expect("connect loop started twice");
                connect::spawn_connect_loop(
                    connector,
                    self.fsm.clone(),
                    self.conn_tx.clone(),
                    get_active_rx,
                    self.shutdown.clone(),
                    self.log.clone(),
                );
            }
        }
        let session = self.clone();
        std::thread::spawn(move || session.run())
    }

    /// The sibling-facing mailbox handle for this session.
    pub fn handle(&self) -> PeerHandle {
        PeerHandle::new(*lock!(self.peer_info), self.event_tx.clone())
    }

    /// The raw mailbox, used by the parent server for control messages.
    pub fn mailbox(&self) -> SyncSender<SessionEvent> {
        self.event_tx.clone()
    }

    /// Offer a transport connection to the session (from the listener or
    /// the connect loop).
    pub fn pass_conn(&self, conn: Cnx) -> Result<(), Error> {
        self.conn_tx.send(conn)?;
        Ok(())
    }

    /// Request session teardown. The supervisor sends a CEASE /
    /// peer-deconfigured notification, stops the FSM driver and returns.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.event_tx.send(SessionEvent::Kill);
    }

    /// The supervisor event loop. Each outer iteration binds a fresh FSM
    /// handler and outgoing queue to the current state, performs the
    /// state's entry actions, then handles events until the next
    /// transition.
    pub fn run(self: &Arc<Self>) {
        let event_rx = lock!(self.event_rx)
            .take()
            .expect("session event loop started twice");
        loop {
            let state = self.fsm.state();
            let generation =
                self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            let (out_tx, out_rx) = message_queue(MAILBOX_DEPTH);
            *lock!(self.outgoing) = Some(out_tx.clone());
            let handler = FsmHandler::new(
                self.fsm.clone(),
                generation,
                self.event_tx.clone(),
                out_rx,
            );

            match state {
                FsmState::Established => {
                    self.enter_established();
                }
                FsmState::Active => {
                    if !self.config.passive {
                        // non-blocking nudge; the connect loop may already
                        // have a pending token
                        let _ = self.get_active_tx.try_send(());
                    }
                    *lock!(self.downtime) = Some(Utc::now());
                }
                _ => {
                    *lock!(self.downtime) = Some(Utc::now());
                }
            }

            handler.start();

            loop {
                if self.shutdown.load(Ordering::Acquire) {
                    self.teardown(&out_tx, &handler);
                    return;
                }
                let event = match event_rx.recv() {
                    Ok(event) => event,
                    Err(_) => {
                        handler.stop();
                        return;
                    }
                };
                match event {
                    SessionEvent::Kill => {
                        self.teardown(&out_tx, &handler);
                        return;
                    }
                    SessionEvent::Fsm { generation: g, .. }
                        if g != generation =>
                    {
                        // stale event from a previous state's driver
                        continue;
                    }
                    SessionEvent::Fsm { message, .. } => match message {
                        FsmMessage::StateChange(next) => {
                            handler.wait();
                            self.handle_state_change(state, next);
                            break;
                        }
                        FsmMessage::Message(msg) => {
                            self.handle_bgp_message(msg);
                        }
                        FsmMessage::MessageError(e) => {
                            self.handle_message_error(e);
                        }
                    },
                    SessionEvent::Server(msg) => {
                        self.handle_server_msg(msg);
                    }
                    SessionEvent::Sibling(msg) => {
                        self.handle_peer_msg(msg);
                    }
                }
            }
        }
    }

    fn teardown(&self, out_tx: &MessageQueue, handler: &FsmHandler<Cnx>) {
        neighbor_log!(self, info, "session teardown");
        self.fsm.close_conn_channel();
        // best effort: dropped unless the writer drains it first
        let _ = out_tx.send(Message::Notification(
            NotificationMessage::cease(CeaseSubcode::PeerDeconfigured),
        ));
        // one resolution period for the established writer to flush the
        // cease before the driver threads are stopped
        std::thread::sleep(Duration::from_millis(self.config.resolution) * 2);
        handler.stop();
    }

    /// Entry actions for established: record the local transport address
    /// (kept in the FSM), re-emit the full Adj-RIB-Out, mark uptime.
    fn enter_established(&self) {
        for family in self.config.families.iter() {
            let paths = lock!(self.adj_rib).get_out_path_list(*family);
            self.send_messages(updates_from_paths(&paths));
        }
        *lock!(self.uptime) = Some(Utc::now());
        self.counters
            .established_transitions
            .fetch_add(1, Ordering::Relaxed);
    }

    fn handle_state_change(&self, old: FsmState, new: FsmState) {
        neighbor_log!(self, info, "state {} -> {}", old, new);
        if old == FsmState::Established && new != FsmState::Established {
            let now = Utc::now();
            if let Some(up) = *lock!(self.uptime) {
                if is_flap(up, now) {
                    self.counters.flaps.fetch_add(1, Ordering::Relaxed);
                }
            }
            {
                let mut adj_rib = lock!(self.adj_rib);
                for family in self.config.families.iter() {
                    adj_rib.drop_all_in(*family);
                }
            }
            let info = *lock!(self.peer_info);
            lock!(self.fanout).broadcast_peer_down(info);
        }
        if self.fsm.admin_state() == AdminState::Down {
            self.counters.clear();
            *lock!(self.uptime) = None;
            *lock!(self.downtime) = None;
        }
    }

    /// Dispatch a decoded BGP message by type. KEEPALIVE and NOTIFICATION
    /// never arrive here; the FSM driver consumes them.
    fn handle_bgp_message(&self, msg: Message) {
        match msg {
            Message::Open(open) => self.handle_open(open),
            Message::RouteRefresh(rr) => {
                self.handle_route_refresh(rr.family())
            }
            Message::Update(update) => self.handle_update(update),
            Message::KeepAlive | Message::Notification(_) => {}
        }
    }

    fn handle_open(&self, open: crate::messages::OpenMessage) {
        lock!(self.peer_info).id = open.id;

        {
            let mut cap_map = lock!(self.cap_map);
            for cap in open.capabilities() {
                cap_map.insert(cap.code(), cap.clone());
            }
        }

        // negotiated families: configured ∩ remote-advertised, computed
        // into a fresh set
        let remote = open.families();
        let negotiated: BTreeSet<RouteFamily> = self
            .config
            .families
            .iter()
            .filter(|family| remote.contains(family))
            .copied()
            .collect();
        neighbor_log!(
            self,
            info,
            "open received: id={:#010x} negotiated families {:?}",
            open.id,
            negotiated
        );
        *lock!(self.rf_map) = negotiated;

        // RFC 4271 p.13: use the smaller of the configured hold time and
        // the hold time received in the OPEN
        let negotiated_hold =
            self.config.hold_time.min(open.hold_time as u64);
        self.fsm
            .set_negotiated_hold_time(Duration::from_secs(negotiated_hold));
    }

    fn handle_route_refresh(&self, family: RouteFamily) {
        if !lock!(self.rf_map).contains(&family) {
            neighbor_log!(
                self,
                warn,
                "route refresh for unsupported family {}",
                family
            );
            return;
        }
        if !lock!(self.cap_map)
            .contains_key(&(CapabilityCode::RouteRefresh as u8))
        {
            neighbor_log!(
                self,
                warn,
                "route refresh received but the capability was not advertised"
            );
            return;
        }
        let paths = lock!(self.adj_rib).get_out_path_list(family);
        self.send_messages(updates_from_paths(&paths));
    }

    fn handle_update(&self, mut update: crate::messages::UpdateMessage) {
        *lock!(self.update_recv_time) = Some(Utc::now());

        let rf_map = lock!(self.rf_map).clone();
        if let Err(e) = validate_update(&update, &rf_map) {
            neighbor_log!(self, warn, "malformed update: {}", e);
            if e.code != 0 {
                self.enqueue_outgoing(Message::Notification(
                    e.to_notification(),
                ));
            }
            return;
        }

        normalize_as4_path(&mut update);
        let info = *lock!(self.peer_info);
        let paths = paths_from_update(&update, info);
        lock!(self.adj_rib).update_in(&paths);
        lock!(self.fanout).send_paths(&paths);
    }

    fn handle_message_error(&self, e: MessageError) {
        neighbor_log!(self, warn, "message error: {}", e);
        self.enqueue_outgoing(Message::Notification(e.to_notification()));
    }

    fn enqueue_outgoing(&self, msg: Message) {
        // clone the handle first so a full queue does not stall readers of
        // the outgoing gauge
        let out = lock!(self.outgoing).clone();
        if let Some(out) = out {
            let _ = out.send(msg);
        }
    }

    /// The single egress funnel for UPDATE messages. Messages are silently
    /// dropped unless the FSM is established. AS paths are rewritten to
    /// 2-octet form when the peer did not advertise the 4-octet AS
    /// capability.
    fn send_messages(&self, msgs: Vec<Message>) {
        for msg in msgs {
            if self.fsm.state() != FsmState::Established {
                continue;
            }
            let kind = msg.kind();
            let Message::Update(mut update) = msg else {
                // only the route pipeline feeds this path; anything else
                // is a programming error
                panic!("non-update message in update egress: {:?}", kind);
            };
            if !lock!(self.cap_map)
                .contains_key(&(CapabilityCode::FourOctetAs as u8))
            {
                rewrite_as_path_2byte(&mut update);
            }
            self.enqueue_outgoing(Message::Update(update));
        }
    }

    /// Import paths received from a sibling, run the decision process when
    /// this peer wants it, and emit the result to the neighbor.
    fn handle_peer_msg(&self, msg: PeerMessage) {
        match msg {
            PeerMessage::Path(paths) => {
                let chains = lock!(self.policies).clone();
                let accepted =
                    filter_paths(paths, &chains.import, chains.default_import);
                let out = if self.config.route_server_client {
                    self.rib.process_paths(accepted)
                } else {
                    accepted
                };
                self.send_update_msg_from_paths(out);
            }
            PeerMessage::PeerDown(info) => {
                for family in self.config.families.iter() {
                    let changes =
                        self.rib.delete_paths_for_peer(&info, *family);
                    if self.config.route_server_client {
                        self.send_update_msg_from_paths(changes);
                    }
                }
            }
        }
    }

    /// The export path: rewrite attributes for this neighbor, apply export
    /// policy, record Adj-RIB-Out, and emit UPDATEs. Paths whose nexthop
    /// points back at the neighbor and families that were not negotiated
    /// are dropped at this egress.
    fn send_update_msg_from_paths(&self, paths: Vec<Path>) {
        if paths.is_empty() {
            return;
        }
        let prepared = prepare_export(&paths, &self.router, &self.config);
        let chains = lock!(self.policies).clone();
        let accepted =
            filter_paths(prepared, &chains.export, chains.default_export);
        lock!(self.adj_rib).update_out(&accepted);

        let neighbor_addr = to_canonical(self.config.host.ip());
        let rf_map = lock!(self.rf_map).clone();
        let sendable: Vec<Path> = accepted
            .into_iter()
            .filter(|p| {
                if p.nexthop.map(to_canonical) == Some(neighbor_addr) {
                    neighbor_log!(
                        self,
                        debug,
                        "split horizon: not sending {} back",
                        p.nlri
                    );
                    return false;
                }
                rf_map.contains(&p.family)
            })
            .collect();
        self.send_messages(updates_from_paths(&sendable));
    }

    fn handle_server_msg(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::PeerAdded(handle) => {
                neighbor_log!(
                    self,
                    info,
                    "sibling added: {}",
                    handle.info.address
                );
                lock!(self.fanout)
                    .add_egress(handle.info.address, handle);
                if self.config.route_server_client {
                    for family in self.config.families.iter() {
                        let paths =
                            lock!(self.adj_rib).get_in_path_list(*family);
                        lock!(self.fanout).send_paths(&paths);
                    }
                }
            }
            ServerMessage::PeerDeleted(info) => {
                let removed =
                    lock!(self.fanout).remove_egress(info.address).is_some();
                if !removed {
                    neighbor_log!(
                        self,
                        warn,
                        "can not find peer: {}",
                        info.address
                    );
                    return;
                }
                for family in self.config.families.iter() {
                    let changes =
                        self.rib.delete_paths_for_peer(&info, *family);
                    if self.config.route_server_client {
                        self.send_update_msg_from_paths(changes);
                    } else {
                        lock!(self.fanout).send_paths(&changes);
                    }
                }
            }
            ServerMessage::PolicyUpdated(policy_map) => {
                neighbor_log!(self, info, "policy updated");
                let mut chains = lock!(self.policies);
                Self::resolve_policies(
                    &self.config,
                    &policy_map,
                    &mut chains,
                );
            }
            ServerMessage::Api(request) => {
                self.handle_api_request(request);
            }
        }
    }

    fn handle_api_request(&self, request: ApiRequest) {
        let family = request.family;
        let data = match request.kind {
            ApiRequestKind::LocalRib | ApiRequestKind::GlobalRib => {
                if self.fsm.admin_state() != AdminState::Down
                    && self.rib.has_family(family)
                {
                    json!(self.rib.table(family))
                } else {
                    json!({})
                }
            }
            ApiRequestKind::AdjRibIn => {
                let mut adjrib = BTreeMap::new();
                adjrib.insert(
                    family.to_string(),
                    lock!(self.adj_rib).snapshot_in(family),
                );
                json!(adjrib)
            }
            ApiRequestKind::AdjRibOut => {
                let mut adjrib = BTreeMap::new();
                adjrib.insert(
                    family.to_string(),
                    lock!(self.adj_rib).snapshot_out(family),
                );
                json!(adjrib)
            }
            ApiRequestKind::NeighborShutdown => {
                self.enqueue_outgoing(Message::Notification(
                    NotificationMessage::cease(
                        CeaseSubcode::AdministrativeShutdown,
                    ),
                ));
                serde_json::Value::Null
            }
            ApiRequestKind::NeighborReset => {
                self.fsm.set_idle_hold_time(Duration::from_secs(
                    self.config.idle_hold_time_after_reset,
                ));
                self.enqueue_outgoing(Message::Notification(
                    NotificationMessage::cease(
                        CeaseSubcode::AdministrativeReset,
                    ),
                ));
                serde_json::Value::Null
            }
            ApiRequestKind::NeighborSoftReset
            | ApiRequestKind::NeighborSoftResetIn => {
                let paths = lock!(self.adj_rib).get_in_path_list(family);
                lock!(self.fanout).send_paths(&paths);
                if request.kind == ApiRequestKind::NeighborSoftReset {
                    let out = lock!(self.adj_rib).get_out_path_list(family);
                    self.send_messages(updates_from_paths(&out));
                }
                serde_json::Value::Null
            }
            ApiRequestKind::NeighborSoftResetOut => {
                let out = lock!(self.adj_rib).get_out_path_list(family);
                self.send_messages(updates_from_paths(&out));
                serde_json::Value::Null
            }
            ApiRequestKind::NeighborEnable => {
                self.request_admin(AdminState::Up)
            }
            ApiRequestKind::NeighborDisable => {
                self.request_admin(AdminState::Down)
            }
        };
        let _ = request.reply.send(ApiResponse { data });
        // dropping the sender closes the reply channel
    }

    fn request_admin(&self, state: AdminState) -> serde_json::Value {
        match self.fsm.request_admin_state(state) {
            Ok(()) => json!({ "result": format!("admin state {}", state) }),
            Err(_) => {
                neighbor_log!(
                    self,
                    warn,
                    "previous admin request is still remaining"
                );
                json!({ "result": "previous request is still remaining" })
            }
        }
    }

    /// Marshal the session's configuration and runtime state for the
    /// management API.
    pub fn summary(&self) -> PeerSummary {
        let now = Utc::now();
        let uptime = lock!(self.uptime)
            .map(|t| (now - t).num_seconds())
            .unwrap_or(0);
        let downtime = lock!(self.downtime)
            .map(|t| (now - t).num_seconds())
            .unwrap_or(0);

        let state = self.fsm.state();
        let (mut received, mut advertised) = (0u64, 0u64);
        if state == FsmState::Established {
            let adj_rib = lock!(self.adj_rib);
            for family in self.config.families.iter() {
                received += adj_rib.in_count(*family) as u64;
                advertised += adj_rib.out_count(*family) as u64;
            }
        }

        let c = &self.counters;
        PeerSummary {
            conf: PeerSummaryConf {
                remote_ip: self.config.host.ip(),
                id: std::net::Ipv4Addr::from(lock!(self.peer_info).id)
                    .to_string(),
                remote_as: self.config.remote_asn,
                remote_cap: lock!(self.cap_map).keys().copied().collect(),
                local_cap: vec![
                    CapabilityCode::MultiprotocolExtensions as u8,
                    CapabilityCode::RouteRefresh as u8,
                    CapabilityCode::FourOctetAs as u8,
                ],
                families: lock!(self.rf_map)
                    .iter()
                    .map(|family| family.to_string())
                    .collect(),
            },
            info: PeerSummaryInfo {
                bgp_state: state.to_string(),
                admin_state: self.fsm.admin_state().to_string(),
                fsm_established_transitions: c
                    .established_transitions
                    .load(Ordering::Relaxed),
                total_message_out: c.total_sent(),
                total_message_in: c.total_received(),
                update_message_out: c.updates_sent.load(Ordering::Relaxed),
                update_message_in: c.updates_received.load(Ordering::Relaxed),
                keepalive_message_out: c
                    .keepalives_sent
                    .load(Ordering::Relaxed),
                keepalive_message_in: c
                    .keepalives_received
                    .load(Ordering::Relaxed),
                open_message_out: c.opens_sent.load(Ordering::Relaxed),
                open_message_in: c.opens_received.load(Ordering::Relaxed),
                notification_out: c
                    .notifications_sent
                    .load(Ordering::Relaxed),
                notification_in: c
                    .notifications_received
                    .load(Ordering::Relaxed),
                refresh_message_out: c
                    .route_refreshes_sent
                    .load(Ordering::Relaxed),
                refresh_message_in: c
                    .route_refreshes_received
                    .load(Ordering::Relaxed),
                uptime,
                downtime,
                // accepted mirrors received: both are Adj-RIB-In counts
                received,
                accepted: received,
                advertised,
                out_q: lock!(self.outgoing)
                    .as_ref()
                    .map(|q| q.len())
                    .unwrap_or(0),
                flops: c.flaps.load(Ordering::Relaxed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_queue_depth_tracks_pending() {
        let (tx, rx) = message_queue(16);
        assert_eq!(tx.len(), 0);
        tx.send(Message::KeepAlive).unwrap();
        tx.send(Message::KeepAlive).unwrap();
        assert_eq!(tx.len(), 2);
        rx.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(tx.len(), 1);
        rx.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(tx.len(), 0);
    }

    #[test]
    fn flap_window() {
        let now = Utc::now();
        let recent = now - chrono::Duration::seconds(5);
        let old = now - chrono::Duration::seconds(60);
        assert!(is_flap(recent, now));
        assert!(!is_flap(old, now));
        // a 30s-exact downtime is not a flap
        let edge = now - chrono::Duration::seconds(30);
        assert!(!is_flap(edge, now));
    }

    #[test]
    fn counter_clear() {
        let c = SessionCounters::default();
        c.count_sent(MessageType::Update);
        c.count_received(MessageType::KeepAlive);
        c.flaps.fetch_add(3, Ordering::Relaxed);
        assert_eq!(c.total_sent(), 1);
        c.clear();
        assert_eq!(c.total_sent(), 0);
        assert_eq!(c.total_received(), 0);
        assert_eq!(c.flaps.load(Ordering::Relaxed), 0);
    }
}
