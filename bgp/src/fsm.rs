// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RFC 4271 neighbor state machine driver. One `Fsm` lives for the
//! whole session; the supervisor constructs a fresh `FsmHandler` bound to
//! the current state on every transition, so each state runs with empty
//! queues and its own state-scoped threads.

use crate::clock::SessionClock;
use crate::config::{PeerConfig, RouterConfig};
use crate::connection::{BgpConnection, ConnectionDirection};
use crate::log::neighbor_log;
use crate::messages::{
    CeaseSubcode, ErrorCode, Message, MessageType, NotificationMessage,
    OpenMessage,
};
use crate::session::{
    FsmMessage, MessageQueueRx, NeighborInfo, SessionCounters, SessionEvent,
};
use crate::error::Error;
use rsd_common::lock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

/// Hold interval while waiting for the peer's OPEN, per RFC 4271 §8.2.2's
/// "large value" suggestion.
const OPEN_WAIT_HOLD_TIME: Duration = Duration::from_secs(240);

/// The states a BGP neighbor state machine may be in.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, JsonSchema,
)]
pub enum FsmState {
    /// Initial state. Refuse all incoming BGP connections. No resources
    /// allocated to peer.
    Idle,

    /// Waiting for the TCP connection to be completed.
    Connect,

    /// Trying to acquire peer by listening for and accepting a TCP
    /// connection.
    Active,

    /// Waiting for open message from peer.
    OpenSent,

    /// Waiting for keepalive or notification from peer.
    OpenConfirm,

    /// Able to exchange update, notification and keepalive messages with
    /// peers.
    Established,
}

impl FsmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmState::Idle => "idle",
            FsmState::Connect => "connect",
            FsmState::Active => "active",
            FsmState::OpenSent => "open sent",
            FsmState::OpenConfirm => "open confirm",
            FsmState::Established => "established",
        }
    }
}

impl Display for FsmState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Administrative state of a neighbor.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, JsonSchema,
)]
pub enum AdminState {
    Up,
    Down,
}

impl AdminState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminState::Up => "up",
            AdminState::Down => "down",
        }
    }
}

impl Display for AdminState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which connection wins a connection collision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollisionResolution {
    ExistWins,
    NewWins,
}

/// Pure collision resolution per RFC 4271 §6.8: when the local BGP
/// identifier is the lower one, the connection initiated by the remote
/// system is kept; otherwise the connection we initiated is kept.
pub fn collision_resolution(
    exist_direction: ConnectionDirection,
    local_id: u32,
    remote_id: u32,
) -> CollisionResolution {
    if local_id < remote_id {
        match exist_direction {
            ConnectionDirection::Inbound => CollisionResolution::ExistWins,
            ConnectionDirection::Outbound => CollisionResolution::NewWins,
        }
    } else {
        match exist_direction {
            ConnectionDirection::Inbound => CollisionResolution::NewWins,
            ConnectionDirection::Outbound => CollisionResolution::ExistWins,
        }
    }
}

/// Session-lifetime state machine context. Owns the connection-offer
/// channel, the administrative-state channel, the negotiated timers and the
/// current connection.
pub struct Fsm<Cnx: BgpConnection> {
    pub neighbor: NeighborInfo,
    pub config: PeerConfig,
    pub router: RouterConfig,

    /// Capacity-1 administrative channel; a full channel means a previous
    /// request is still pending.
    admin_tx: SyncSender<AdminState>,
    admin_rx: Mutex<Receiver<AdminState>>,
    admin_state: Mutex<AdminState>,

    conn_rx: Mutex<Option<Receiver<Cnx>>>,

    state: Mutex<FsmState>,
    negotiated_hold_time: Mutex<Duration>,
    idle_hold_time: Mutex<Duration>,
    remote_id: Mutex<Option<u32>>,
    conn: Mutex<Option<Arc<Cnx>>>,
    local_addr: Mutex<Option<SocketAddr>>,

    clock: SessionClock,
    counters: Arc<SessionCounters>,
    log: Logger,
}

impl<Cnx: BgpConnection> Fsm<Cnx> {
    pub fn new(
        config: PeerConfig,
        router: RouterConfig,
        neighbor: NeighborInfo,
        conn_rx: Receiver<Cnx>,
        counters: Arc<SessionCounters>,
        log: Logger,
    ) -> Self {
        let (admin_tx, admin_rx) = sync_channel(1);
        let clock = SessionClock::new(
            Duration::from_millis(config.resolution),
            Duration::from_secs(config.hold_time),
            Duration::from_secs(config.keepalive),
            Duration::from_secs(config.idle_hold_time),
        );
        Self {
            admin_tx,
            admin_rx: Mutex::new(admin_rx),
            admin_state: Mutex::new(AdminState::Up),
            conn_rx: Mutex::new(Some(conn_rx)),
            state: Mutex::new(FsmState::Idle),
            negotiated_hold_time: Mutex::new(Duration::from_secs(
                config.hold_time,
            )),
            idle_hold_time: Mutex::new(Duration::from_secs(
                config.idle_hold_time,
            )),
            remote_id: Mutex::new(None),
            conn: Mutex::new(None),
            local_addr: Mutex::new(None),
            clock,
            counters,
            neighbor,
            config,
            router,
            log,
        }
    }

    pub fn state(&self) -> FsmState {
        *lock!(self.state)
    }

    pub fn admin_state(&self) -> AdminState {
        *lock!(self.admin_state)
    }

    /// Non-blocking administrative-state request. An `Err` means a previous
    /// request is still pending.
    pub fn request_admin_state(
        &self,
        state: AdminState,
    ) -> Result<(), Error> {
        self.admin_tx.try_send(state).map_err(|e| match e {
            TrySendError::Full(_) => Error::ChannelSend(
                "previous request is still remaining".into(),
            ),
            TrySendError::Disconnected(_) => Error::Disconnected,
        })
    }

    pub fn negotiated_hold_time(&self) -> Duration {
        *lock!(self.negotiated_hold_time)
    }

    /// Called by the supervisor after OPEN processing with
    /// `min(local configured, remote advertised)`.
    pub fn set_negotiated_hold_time(&self, hold: Duration) {
        *lock!(self.negotiated_hold_time) = hold;
    }

    pub fn idle_hold_time(&self) -> Duration {
        *lock!(self.idle_hold_time)
    }

    pub fn set_idle_hold_time(&self, idle_hold: Duration) {
        *lock!(self.idle_hold_time) = idle_hold;
    }

    pub fn set_remote_id(&self, id: u32) {
        *lock!(self.remote_id) = Some(id);
    }

    /// Local address of the transport, known once a connection is owned.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock!(self.local_addr)
    }

    fn current_conn(&self) -> Option<Arc<Cnx>> {
        lock!(self.conn).clone()
    }

    /// Stop accepting connection offers. Called at session teardown so a
    /// subsequent offer fails fast instead of queueing forever.
    pub fn close_conn_channel(&self) {
        lock!(self.conn_rx).take();
    }

    /// Wait for a connection offer. `None` means the offer channel is
    /// closed and teardown is underway.
    fn recv_conn_offer(&self, timeout: Duration) -> Option<Result<Cnx, ()>> {
        let guard = lock!(self.conn_rx);
        let Some(rx) = guard.as_ref() else {
            return None;
        };
        match rx.recv_timeout(timeout) {
            Ok(conn) => Some(Ok(conn)),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Some(Err(())),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Non-blocking poll for a concurrently offered connection.
    fn poll_conn_offer(&self) -> Option<Cnx> {
        let guard = lock!(self.conn_rx);
        guard.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    fn adopt_conn(&self, conn: Cnx) {
        let conn = Arc::new(conn);
        *lock!(self.local_addr) = conn.local();
        *lock!(self.conn) = Some(conn);
    }

    fn drop_conn(&self) {
        *lock!(self.conn) = None;
    }

    /// Drain one pending administrative request, if any, updating the
    /// recorded administrative state.
    fn poll_admin(&self) -> Option<AdminState> {
        let next = lock!(self.admin_rx).try_recv().ok()?;
        *lock!(self.admin_state) = next;
        Some(next)
    }

    fn count_sent(&self, kind: MessageType) {
        self.counters.count_sent(kind);
    }

    fn count_received(&self, kind: MessageType) {
        self.counters.count_received(kind);
    }
}

/// A state-scoped driver bound to one FSM state. Constructed fresh by the
/// supervisor on every transition; `wait` joins the state's threads once a
/// transition has been observed.
pub struct FsmHandler<Cnx: BgpConnection> {
    fsm: Arc<Fsm<Cnx>>,
    generation: u64,
    event_tx: SyncSender<SessionEvent>,
    outgoing: Mutex<Option<MessageQueueRx>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
}

impl<Cnx: BgpConnection> FsmHandler<Cnx> {
    pub fn new(
        fsm: Arc<Fsm<Cnx>>,
        generation: u64,
        event_tx: SyncSender<SessionEvent>,
        outgoing: MessageQueueRx,
    ) -> Self {
        Self {
            fsm,
            generation,
            event_tx,
            outgoing: Mutex::new(Some(outgoing)),
            threads: Mutex::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the driver for the FSM's current state.
    pub fn start(&self) {
        let fsm = self.fsm.clone();
        let generation = self.generation;
        let event_tx = self.event_tx.clone();
        let outgoing = lock!(self.outgoing).take();
        let stop = self.stop.clone();
        let handle = spawn(move || {
            let driver = StateDriver {
                fsm,
                generation,
                event_tx,
                stop,
            };
            driver.run(outgoing);
        });
        lock!(self.threads).push(handle);
    }

    /// Join the state-scoped threads. Called by the supervisor after it
    /// observes a state-change event, before acting on the new state.
    pub fn wait(&self) {
        for handle in lock!(self.threads).drain(..) {
            let _ = handle.join();
        }
    }

    /// Stop the driver without waiting for a transition. Used at session
    /// teardown.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wait();
    }
}

struct StateDriver<Cnx: BgpConnection> {
    fsm: Arc<Fsm<Cnx>>,
    generation: u64,
    event_tx: SyncSender<SessionEvent>,
    stop: Arc<AtomicBool>,
}

impl<Cnx: BgpConnection> StateDriver<Cnx> {
    fn run(&self, outgoing: Option<MessageQueueRx>) {
        match self.fsm.state() {
            FsmState::Idle => self.run_idle(),
            FsmState::Connect | FsmState::Active => self.run_active(),
            FsmState::OpenSent => self.run_open_sent(),
            FsmState::OpenConfirm => self.run_open_confirm(),
            FsmState::Established => self.run_established(outgoing),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn transition(&self, next: FsmState) {
        let fsm = &self.fsm;
        let previous = fsm.state();
        *lock!(fsm.state) = next;
        neighbor_log!(
            fsm,
            info,
            "fsm transition {} -> {}",
            previous,
            next
        );
        let _ = self.event_tx.send(SessionEvent::Fsm {
            generation: self.generation,
            message: FsmMessage::StateChange(next),
        });
    }

    fn to_idle(&self) {
        self.fsm.drop_conn();
        self.fsm.clock.hold_timer.disable();
        self.fsm.clock.keepalive_timer.disable();
        self.transition(FsmState::Idle);
    }

    fn send_notification(
        &self,
        conn: &Arc<Cnx>,
        notification: NotificationMessage,
    ) {
        if conn
            .send(Message::Notification(notification))
            .is_ok()
        {
            self.fsm.count_sent(MessageType::Notification);
        }
    }

    fn forward(&self, message: FsmMessage) {
        let _ = self.event_tx.send(SessionEvent::Fsm {
            generation: self.generation,
            message,
        });
    }

    /// Idle: refuse offered connections, wait out the idle hold time, honor
    /// administrative DOWN by staying put.
    fn run_idle(&self) {
        let fsm = &self.fsm;
        let resolution = fsm.clock.resolution;
        let idle_hold = fsm.clock.idle_hold_timer.clone();
        idle_hold.set_interval(fsm.idle_hold_time());
        idle_hold.enable();
        loop {
            if self.stopped() {
                return;
            }
            if let Some(AdminState::Up) = fsm.poll_admin() {
                idle_hold.reset();
            }
            // connection offers stay queued until we go active
            if fsm.admin_state() == AdminState::Down {
                std::thread::sleep(resolution);
                continue;
            }
            idle_hold.tick(resolution);
            if idle_hold.expired() {
                idle_hold.disable();
                self.transition(FsmState::Active);
                return;
            }
            std::thread::sleep(resolution);
        }
    }

    /// Connect/Active: wait for a connection from the listener or the
    /// connect loop, then move to OpenSent with it.
    fn run_active(&self) {
        let fsm = &self.fsm;
        let resolution = fsm.clock.resolution;
        loop {
            if self.stopped() {
                return;
            }
            if let Some(AdminState::Down) = fsm.poll_admin() {
                self.to_idle();
                return;
            }
            match fsm.recv_conn_offer(resolution) {
                Some(Ok(conn)) => {
                    fsm.adopt_conn(conn);
                    self.transition(FsmState::OpenSent);
                    return;
                }
                Some(Err(())) => continue,
                None => {
                    // connection-offer channel closed: teardown underway
                    return;
                }
            }
        }
    }

    /// OpenSent: send our OPEN, wait for the peer's.
    fn run_open_sent(&self) {
        let fsm = &self.fsm;
        let resolution = fsm.clock.resolution;
        let Some(conn) = fsm.current_conn() else {
            self.to_idle();
            return;
        };

        let open = OpenMessage::new(
            fsm.router.asn.as_u32(),
            fsm.config.hold_time as u16,
            fsm.router.id,
            &fsm.config.families,
        );
        if conn.send(Message::Open(open)).is_err() {
            neighbor_log!(fsm, warn, "failed to send open");
            self.to_idle();
            return;
        }
        fsm.count_sent(MessageType::Open);

        let hold = fsm.clock.hold_timer.clone();
        hold.set_interval(OPEN_WAIT_HOLD_TIME);
        hold.enable();

        loop {
            if self.stopped() {
                return;
            }
            if let Some(AdminState::Down) = fsm.poll_admin() {
                self.send_notification(
                    &conn,
                    NotificationMessage::cease(
                        CeaseSubcode::AdministrativeShutdown,
                    ),
                );
                self.to_idle();
                return;
            }
            match conn.recv(resolution) {
                Ok(Message::Open(open)) => {
                    fsm.count_received(MessageType::Open);
                    fsm.set_remote_id(open.id);
                    self.forward(FsmMessage::Message(Message::Open(open)));
                    if conn.send(Message::KeepAlive).is_err() {
                        self.to_idle();
                        return;
                    }
                    fsm.count_sent(MessageType::KeepAlive);
                    self.transition(FsmState::OpenConfirm);
                    return;
                }
                Ok(Message::Notification(n)) => {
                    fsm.count_received(MessageType::Notification);
                    neighbor_log!(
                        fsm,
                        warn,
                        "notification while waiting for open: {:?}",
                        n
                    );
                    self.to_idle();
                    return;
                }
                Ok(other) => {
                    fsm.count_received(other.kind());
                    neighbor_log!(
                        fsm,
                        warn,
                        "unexpected {:?} while waiting for open",
                        other.kind()
                    );
                }
                Err(Error::Timeout) => {
                    hold.tick(resolution);
                    if hold.expired() {
                        self.send_notification(
                            &conn,
                            NotificationMessage::new(
                                ErrorCode::HoldTimerExpired as u8,
                                0,
                                Vec::new(),
                            ),
                        );
                        self.to_idle();
                        return;
                    }
                }
                Err(Error::Message(e)) => {
                    if e.code != 0 {
                        self.send_notification(
                            &conn,
                            e.to_notification(),
                        );
                    }
                    self.to_idle();
                    return;
                }
                Err(_) => {
                    self.to_idle();
                    return;
                }
            }
        }
    }

    /// OpenConfirm: wait for the peer's KEEPALIVE confirming our OPEN.
    fn run_open_confirm(&self) {
        let fsm = &self.fsm;
        let resolution = fsm.clock.resolution;
        let Some(conn) = fsm.current_conn() else {
            self.to_idle();
            return;
        };

        let hold = fsm.clock.hold_timer.clone();
        let negotiated = fsm.negotiated_hold_time();
        if negotiated.is_zero() {
            hold.disable();
        } else {
            hold.set_interval(negotiated);
            hold.enable();
        }

        loop {
            if self.stopped() {
                return;
            }
            if let Some(AdminState::Down) = fsm.poll_admin() {
                self.send_notification(
                    &conn,
                    NotificationMessage::cease(
                        CeaseSubcode::AdministrativeShutdown,
                    ),
                );
                self.to_idle();
                return;
            }
            if let Some(second) = fsm.poll_conn_offer() {
                if self.resolve_collision(&conn, second) {
                    return;
                }
            }
            match conn.recv(resolution) {
                Ok(Message::KeepAlive) => {
                    fsm.count_received(MessageType::KeepAlive);
                    self.transition(FsmState::Established);
                    return;
                }
                Ok(Message::Notification(n)) => {
                    fsm.count_received(MessageType::Notification);
                    neighbor_log!(
                        fsm,
                        warn,
                        "notification in open confirm: {:?}",
                        n
                    );
                    self.to_idle();
                    return;
                }
                Ok(other) => {
                    fsm.count_received(other.kind());
                    neighbor_log!(
                        fsm,
                        warn,
                        "unexpected {:?} in open confirm",
                        other.kind()
                    );
                }
                Err(Error::Timeout) => {
                    hold.tick(resolution);
                    if hold.expired() {
                        self.send_notification(
                            &conn,
                            NotificationMessage::new(
                                ErrorCode::HoldTimerExpired as u8,
                                0,
                                Vec::new(),
                            ),
                        );
                        self.to_idle();
                        return;
                    }
                }
                Err(Error::Message(e)) => {
                    if e.code != 0 {
                        self.send_notification(&conn, e.to_notification());
                    }
                    self.to_idle();
                    return;
                }
                Err(_) => {
                    self.to_idle();
                    return;
                }
            }
        }
    }

    /// Resolve a connection collision. Returns true when the state driver
    /// must return because a transition was made.
    fn resolve_collision(&self, existing: &Arc<Cnx>, second: Cnx) -> bool {
        let fsm = &self.fsm;
        let remote_id = lock!(fsm.remote_id).unwrap_or(0);
        match collision_resolution(
            existing.direction(),
            fsm.router.id,
            remote_id,
        ) {
            CollisionResolution::ExistWins => {
                neighbor_log!(
                    fsm,
                    info,
                    "connection collision: keeping existing connection"
                );
                drop(second);
                false
            }
            CollisionResolution::NewWins => {
                neighbor_log!(
                    fsm,
                    info,
                    "connection collision: adopting new connection"
                );
                self.send_notification(
                    existing,
                    NotificationMessage::cease(
                        CeaseSubcode::ConnectionCollisionResolution,
                    ),
                );
                fsm.adopt_conn(second);
                self.transition(FsmState::OpenSent);
                true
            }
        }
    }

    /// Established: forward peer messages to the supervisor, drain the
    /// outgoing queue onto the wire, run hold and keepalive timers.
    fn run_established(&self, outgoing: Option<MessageQueueRx>) {
        let fsm = &self.fsm;
        let resolution = fsm.clock.resolution;
        let Some(conn) = fsm.current_conn() else {
            self.to_idle();
            return;
        };

        let hold = fsm.clock.hold_timer.clone();
        let keepalive = fsm.clock.keepalive_timer.clone();
        let negotiated = fsm.negotiated_hold_time();
        if negotiated.is_zero() {
            hold.disable();
            keepalive.disable();
        } else {
            hold.set_interval(negotiated);
            hold.enable();
            keepalive.set_interval(negotiated / 3);
            keepalive.enable();
        }

        // Writer: drains the supervisor's outgoing queue onto the wire for
        // the lifetime of this state.
        let done = Arc::new(AtomicBool::new(false));
        let writer = outgoing.map(|outgoing| {
            let conn = conn.clone();
            let counters = fsm.counters.clone();
            let stop = self.stop.clone();
            let done = done.clone();
            let log = fsm.log.clone();
            let host = fsm.neighbor.host;
            spawn(move || loop {
                if stop.load(Ordering::Acquire) || done.load(Ordering::Acquire)
                {
                    return;
                }
                match outgoing.recv_timeout(resolution) {
                    Ok(msg) => {
                        let kind = msg.kind();
                        match conn.send(msg) {
                            Ok(()) => counters.count_sent(kind),
                            Err(e) => {
                                slog::warn!(log, "send failed: {e}";
                                    "neighbor" => %host);
                                return;
                            }
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        continue
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        return
                    }
                }
            })
        });

        loop {
            if self.stopped() {
                break;
            }
            if let Some(AdminState::Down) = fsm.poll_admin() {
                self.send_notification(
                    &conn,
                    NotificationMessage::cease(
                        CeaseSubcode::AdministrativeShutdown,
                    ),
                );
                self.to_idle();
                break;
            }
            // A concurrently offered connection loses to an established one.
            if let Some(second) = fsm.poll_conn_offer() {
                neighbor_log!(
                    fsm,
                    info,
                    "dropping connection offered while established"
                );
                drop(second);
            }
            match conn.recv(resolution) {
                Ok(msg) => {
                    hold.reset();
                    match msg {
                        Message::KeepAlive => {
                            fsm.count_received(MessageType::KeepAlive);
                        }
                        Message::Notification(n) => {
                            fsm.count_received(MessageType::Notification);
                            neighbor_log!(
                                fsm,
                                warn,
                                "notification received: {:?}",
                                n
                            );
                            self.to_idle();
                            break;
                        }
                        other => {
                            fsm.count_received(other.kind());
                            self.forward(FsmMessage::Message(other));
                        }
                    }
                }
                Err(Error::Timeout) => {
                    hold.tick(resolution);
                    keepalive.tick(resolution);
                    if hold.expired() {
                        self.send_notification(
                            &conn,
                            NotificationMessage::new(
                                ErrorCode::HoldTimerExpired as u8,
                                0,
                                Vec::new(),
                            ),
                        );
                        self.to_idle();
                        break;
                    }
                    if keepalive.expired() {
                        if conn.send(Message::KeepAlive).is_ok() {
                            fsm.count_sent(MessageType::KeepAlive);
                        }
                        keepalive.reset();
                    }
                }
                Err(Error::Message(e)) => {
                    // Malformed PDU: surface to the supervisor, which
                    // answers with a NOTIFICATION; the session continues.
                    self.forward(FsmMessage::MessageError(e));
                }
                Err(_) => {
                    self.to_idle();
                    break;
                }
            }
        }

        done.store(true, Ordering::Release);
        if let Some(writer) = writer {
            let _ = writer.join();
        }
    }
}
