// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The outbound connect loop for non-passive peers. Dials the neighbor
//! while the FSM sits in ACTIVE; paced by a ticker that arms on the first
//! become-active token from the supervisor.

use crate::connection::{BgpConnection, BgpConnector};
use crate::fsm::{Fsm, FsmState};
use crate::CONNECT_RETRY_FLOOR;
use slog::{debug, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

pub fn spawn_connect_loop<Cnx: BgpConnection>(
    connector: Arc<dyn BgpConnector<Conn = Cnx>>,
    fsm: Arc<Fsm<Cnx>>,
    conn_tx: SyncSender<Cnx>,
    get_active_rx: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    log: Logger,
) -> JoinHandle<()> {
    let period = Duration::from_secs(fsm.config.connect_retry)
        .max(CONNECT_RETRY_FLOOR);
    let dial_timeout = CONNECT_RETRY_FLOOR - Duration::from_secs(1);

    spawn(move || {
        // The ticker only runs once the session has been active at least
        // once; until then we sit on the token channel.
        let mut armed = false;
        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            match get_active_rx.recv_timeout(period) {
                Ok(()) => {
                    armed = true;
                    try_connect(
                        &connector,
                        &fsm,
                        &conn_tx,
                        dial_timeout,
                        &log,
                    );
                }
                Err(RecvTimeoutError::Timeout) => {
                    if armed {
                        try_connect(
                            &connector,
                            &fsm,
                            &conn_tx,
                            dial_timeout,
                            &log,
                        );
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(log, "stop connect loop";
                        "neighbor" => %fsm.neighbor.host);
                    return;
                }
            }
        }
    })
}

fn try_connect<Cnx: BgpConnection>(
    connector: &Arc<dyn BgpConnector<Conn = Cnx>>,
    fsm: &Arc<Fsm<Cnx>>,
    conn_tx: &SyncSender<Cnx>,
    dial_timeout: Duration,
    log: &Logger,
) {
    if fsm.state() != FsmState::Active {
        return;
    }
    match connector.connect(fsm.config.host, dial_timeout) {
        Ok(conn) => {
            let _ = conn_tx.send(conn);
        }
        Err(e) => {
            debug!(log, "failed to connect: {e}";
                "neighbor" => %fsm.neighbor.host);
        }
    }
}
