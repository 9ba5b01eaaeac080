use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::{channel::ChannelKind, protocol::ProtocolError};

pub type Result<T> = std::result::Result<T, NetMsgError>;

#[derive(Debug, Error)]
pub enum NetMsgError {
    #[error("failed to bind {channel} endpoint on {addr}: {source}")]
    Bind {
        channel: ChannelKind,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {channel} endpoint at {addr}: {source}")]
    Connect {
        channel: ChannelKind,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to open log sink '{path}': {source}")]
    OpenSink {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{channel} endpoint closed the connection before replying")]
    NoReply { channel: ChannelKind },

    #[error("{channel} request rejected with '{reply}'")]
    Rejected {
        channel: ChannelKind,
        reply: String,
    },

    #[error("client already stopped")]
    ClientStopped,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl NetMsgError {
    /// Process exit status used when the server cannot claim its addresses.
    pub const BIND_EXIT_CODE: u8 = 8;

    pub fn is_bind(&self) -> bool {
        matches!(self, NetMsgError::Bind { .. })
    }
}
