// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory transport for whole-session tests: bidirectional channel
//! endpoints plus a process-global network registry, so sessions can dial
//! and accept each other without sockets.

use crate::connection::{
    BgpConnection, BgpConnector, BgpListener, ConnectionDirection,
};
use crate::error::Error;
use crate::messages::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

lazy_static! {
    static ref NET: Network = Network::new();
}

/// A combined mpsc sender/receiver.
pub struct Endpoint<T> {
    pub rx: Mutex<Receiver<T>>,
    pub tx: Sender<T>,
}

/// Analogous to `std::sync::mpsc::channel` for bidirectional endpoints.
pub fn endpoint_pair<T>() -> (Endpoint<T>, Endpoint<T>) {
    let (tx_a, rx_b) = channel();
    let (tx_b, rx_a) = channel();
    (
        Endpoint {
            rx: Mutex::new(rx_a),
            tx: tx_a,
        },
        Endpoint {
            rx: Mutex::new(rx_b),
            tx: tx_b,
        },
    )
}

pub struct Network {
    #[allow(clippy::type_complexity)]
    endpoints:
        Mutex<HashMap<SocketAddr, Sender<(SocketAddr, Endpoint<Message>)>>>,
}

impl Network {
    fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    fn bind(
        &self,
        addr: SocketAddr,
    ) -> Receiver<(SocketAddr, Endpoint<Message>)> {
        let (tx, rx) = channel();
        self.endpoints.lock().unwrap().insert(addr, tx);
        rx
    }

    fn connect(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        ep: Endpoint<Message>,
    ) -> Result<(), Error> {
        match self.endpoints.lock().unwrap().get(&to) {
            None => Err(Error::ChannelConnect),
            Some(listener) => {
                listener
                    .send((from, ep))
                    .map_err(|e| Error::ChannelSend(e.to_string()))?;
                Ok(())
            }
        }
    }
}

pub struct BgpConnectionChannel {
    addr: SocketAddr,
    peer: SocketAddr,
    direction: ConnectionDirection,
    conn: Endpoint<Message>,
}

impl BgpConnectionChannel {
    fn with_conn(
        addr: SocketAddr,
        peer: SocketAddr,
        direction: ConnectionDirection,
        conn: Endpoint<Message>,
    ) -> Self {
        Self {
            addr,
            peer,
            direction,
            conn,
        }
    }

    /// A directly wired connection pair: `(a_side, b_side)` where the `a`
    /// side believes it dialed out and the `b` side believes it accepted.
    pub fn pair(
        a: SocketAddr,
        b: SocketAddr,
    ) -> (BgpConnectionChannel, BgpConnectionChannel) {
        let (ep_a, ep_b) = endpoint_pair();
        (
            Self::with_conn(a, b, ConnectionDirection::Outbound, ep_a),
            Self::with_conn(b, a, ConnectionDirection::Inbound, ep_b),
        )
    }
}

impl BgpConnection for BgpConnectionChannel {
    fn send(&self, msg: Message) -> Result<(), Error> {
        self.conn
            .tx
            .send(msg)
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    fn recv(&self, timeout: Duration) -> Result<Message, Error> {
        match self.conn.rx.lock().unwrap().recv_timeout(timeout) {
            Ok(msg) => Ok(msg),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    fn direction(&self) -> ConnectionDirection {
        self.direction
    }
}

pub struct BgpListenerChannel {
    rx: Receiver<(SocketAddr, Endpoint<Message>)>,
    addr: SocketAddr,
}

impl BgpListenerChannel {
    pub fn bind(addr: SocketAddr) -> Self {
        Self {
            rx: NET.bind(addr),
            addr,
        }
    }
}

impl BgpListener<BgpConnectionChannel> for BgpListenerChannel {
    fn accept(&self) -> Result<BgpConnectionChannel, Error> {
        let (peer, endpoint) = self.rx.recv()?;
        Ok(BgpConnectionChannel::with_conn(
            self.addr,
            peer,
            ConnectionDirection::Inbound,
            endpoint,
        ))
    }
}

pub struct BgpConnectorChannel {
    pub source: SocketAddr,
}

impl BgpConnector for BgpConnectorChannel {
    type Conn = BgpConnectionChannel;

    fn connect(
        &self,
        peer: SocketAddr,
        _timeout: Duration,
    ) -> Result<BgpConnectionChannel, Error> {
        let (local, remote) = endpoint_pair();
        NET.connect(self.source, peer, remote)?;
        Ok(BgpConnectionChannel::with_conn(
            self.source,
            peer,
            ConnectionDirection::Outbound,
            local,
        ))
    }
}
