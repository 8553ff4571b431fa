// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::messages::MessageError;
use std::net::IpAddr;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("disconnected")]
    Disconnected,

    #[error("channel send {0}")]
    ChannelSend(String),

    #[error("channel recv {0}")]
    ChannelRecv(#[from] std::sync::mpsc::RecvError),

    #[error("attempt to send a message when not connected")]
    NotConnected,

    #[error("connection attempt from unknown peer: {0}")]
    UnknownPeer(IpAddr),

    #[error("message error {0}")]
    Message(#[from] MessageError),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("channel connect error")]
    ChannelConnect,
}

impl<T> From<std::sync::mpsc::SendError<T>> for Error {
    fn from(e: std::sync::mpsc::SendError<T>) -> Error {
        Error::ChannelSend(e.to_string())
    }
}
