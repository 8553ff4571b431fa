// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::messages::Message;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

/// Which side initiated the underlying transport connection. Needed for
/// connection collision resolution.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

/// One transport connection to a BGP neighbor, carrying decoded messages.
/// Implementations must be usable from a reader and a writer thread
/// concurrently.
pub trait BgpConnection: Send + Sync + 'static {
    /// Send a message to the peer.
    fn send(&self, msg: Message) -> Result<(), Error>;

    /// Receive the next message from the peer, waiting at most `timeout`.
    /// `Error::Timeout` means nothing arrived; `Error::Disconnected` means
    /// the transport is gone; `Error::Message` carries a typed decode
    /// failure for an arrived-but-malformed PDU.
    fn recv(&self, timeout: Duration) -> Result<Message, Error>;

    fn peer(&self) -> SocketAddr;

    fn local(&self) -> Option<SocketAddr>;

    fn direction(&self) -> ConnectionDirection;
}

/// Dials new connections to a neighbor. The connect loop holds one of
/// these; tests substitute an in-memory implementation.
pub trait BgpConnector: Send + Sync + 'static {
    type Conn: BgpConnection;

    fn connect(
        &self,
        peer: SocketAddr,
        timeout: Duration,
    ) -> Result<Self::Conn, Error>;
}

/// Accepts inbound connections; the server bootstrap owns the listener and
/// offers accepted connections to the right session.
pub trait BgpListener<Cnx: BgpConnection> {
    fn accept(&self) -> Result<Cnx, Error>;
}

/// The seam to the wire codec. The session core never encodes or decodes
/// BGP PDUs itself; a codec implementation is supplied to the TCP transport
/// by the embedding server.
pub trait MessageCodec: Send + Sync + 'static {
    fn write_message(
        &self,
        stream: &mut dyn Write,
        msg: &Message,
    ) -> Result<(), Error>;

    fn read_message(&self, stream: &mut dyn Read) -> Result<Message, Error>;
}
