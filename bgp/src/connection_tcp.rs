// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{
    BgpConnection, BgpConnector, BgpListener, ConnectionDirection,
    MessageCodec,
};
use crate::error::Error;
use crate::messages::Message;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A TCP transport to a neighbor. Reading and writing are independently
/// locked so the FSM's reader and writer threads do not serialize each
/// other.
pub struct BgpConnectionTcp {
    peer: SocketAddr,
    local: Option<SocketAddr>,
    direction: ConnectionDirection,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    codec: Arc<dyn MessageCodec>,
}

impl BgpConnectionTcp {
    pub fn new(
        stream: TcpStream,
        direction: ConnectionDirection,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<Self, Error> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr().ok();
        let writer = stream.try_clone()?;
        Ok(Self {
            peer,
            local,
            direction,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
            codec,
        })
    }
}

impl BgpConnection for BgpConnectionTcp {
    fn send(&self, msg: Message) -> Result<(), Error> {
        let mut stream = rsd_common::lock!(self.writer);
        self.codec.write_message(&mut *stream, &msg)
    }

    fn recv(&self, timeout: Duration) -> Result<Message, Error> {
        let mut stream = rsd_common::lock!(self.reader);
        stream.set_read_timeout(Some(timeout))?;
        match self.codec.read_message(&mut *stream) {
            Ok(msg) => Ok(msg),
            Err(Error::Io(e))
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Err(Error::Timeout)
            }
            Err(Error::Io(e))
                if e.kind() == io::ErrorKind::UnexpectedEof
                    || e.kind() == io::ErrorKind::ConnectionReset =>
            {
                Err(Error::Disconnected)
            }
            Err(e) => Err(e),
        }
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    fn direction(&self) -> ConnectionDirection {
        self.direction
    }
}

/// Dials neighbors over TCP. IPv6 neighbor addresses need no bracketing
/// here; `SocketAddr` carries the address family.
pub struct BgpConnectorTcp {
    codec: Arc<dyn MessageCodec>,
}

impl BgpConnectorTcp {
    pub fn new(codec: Arc<dyn MessageCodec>) -> Self {
        Self { codec }
    }
}

impl BgpConnector for BgpConnectorTcp {
    type Conn = BgpConnectionTcp;

    fn connect(
        &self,
        peer: SocketAddr,
        timeout: Duration,
    ) -> Result<BgpConnectionTcp, Error> {
        let stream = TcpStream::connect_timeout(&peer, timeout)?;
        BgpConnectionTcp::new(
            stream,
            ConnectionDirection::Outbound,
            self.codec.clone(),
        )
    }
}

pub struct BgpListenerTcp {
    listener: TcpListener,
    codec: Arc<dyn MessageCodec>,
}

impl BgpListenerTcp {
    pub fn bind(
        addr: SocketAddr,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<Self, Error> {
        Ok(Self {
            listener: TcpListener::bind(addr)?,
            codec,
        })
    }
}

impl BgpListenerTcp {
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }
}

impl BgpListener<BgpConnectionTcp> for BgpListenerTcp {
    fn accept(&self) -> Result<BgpConnectionTcp, Error> {
        let (stream, _peer) = self.listener.accept()?;
        BgpConnectionTcp::new(
            stream,
            ConnectionDirection::Inbound,
            self.codec.clone(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::{Message, UpdateMessage};
    use std::io::{Read, Write};

    /// Length-prefixed JSON framing, standing in for the real wire codec.
    struct JsonCodec;

    impl MessageCodec for JsonCodec {
        fn write_message(
            &self,
            stream: &mut dyn Write,
            msg: &Message,
        ) -> Result<(), Error> {
            let body = serde_json::to_vec(msg)
                .map_err(|e| Error::ChannelSend(e.to_string()))?;
            stream.write_all(&(body.len() as u32).to_be_bytes())?;
            stream.write_all(&body)?;
            stream.flush()?;
            Ok(())
        }

        fn read_message(
            &self,
            stream: &mut dyn Read,
        ) -> Result<Message, Error> {
            let mut len = [0u8; 4];
            stream.read_exact(&mut len)?;
            let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut body)?;
            serde_json::from_slice(&body)
                .map_err(|e| Error::ChannelSend(e.to_string()))
        }
    }

    #[test]
    fn loopback_round_trip() {
        let codec: Arc<dyn MessageCodec> = Arc::new(JsonCodec);
        let listener = BgpListenerTcp::bind(
            "127.0.0.1:0".parse().unwrap(),
            codec.clone(),
        )
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = BgpConnectorTcp::new(codec);
        let dialed = connector
            .connect(addr, Duration::from_secs(2))
            .unwrap();
        let accepted = listener.accept().unwrap();
        assert_eq!(dialed.direction(), ConnectionDirection::Outbound);
        assert_eq!(accepted.direction(), ConnectionDirection::Inbound);

        dialed.send(Message::KeepAlive).unwrap();
        let got = accepted.recv(Duration::from_secs(2)).unwrap();
        assert_eq!(got, Message::KeepAlive);

        let update = Message::Update(UpdateMessage {
            withdrawn: vec!["10.0.0.0/24".parse().unwrap()],
            path_attributes: Vec::new(),
            nlri: Vec::new(),
        });
        accepted.send(update.clone()).unwrap();
        assert_eq!(dialed.recv(Duration::from_secs(2)).unwrap(), update);

        // nothing pending: the read times out rather than blocking
        assert!(matches!(
            accepted.recv(Duration::from_millis(50)),
            Err(Error::Timeout)
        ));
    }
}
