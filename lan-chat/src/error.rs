use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::{channel::ChannelState, endpoint::Endpoint, role::Role};

/// Rejected address or port input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("'{0}' is not an IPv4 dotted-quad address")]
    InvalidAddress(String),
    #[error("'{0}' is not a port in 0-65535")]
    InvalidPort(String),
    #[error("'{0}' is missing a ':port' suffix")]
    MissingPort(String),
    #[error("{0} is not an IPv4 socket address")]
    NotIpv4(SocketAddr),
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("{endpoint} is already in use")]
    InUse {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("cannot bind {endpoint}: {source}")]
    Unbindable {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("channel cannot be started from state {0:?}")]
    NotIdle(ChannelState),
}

impl BindError {
    pub(crate) fn from_io(endpoint: Endpoint, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::AddrInUse {
            Self::InUse { endpoint, source }
        } else {
            Self::Unbindable { endpoint, source }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection to {remote} refused")]
    Refused {
        remote: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("{remote} is unreachable: {source}")]
    Unreachable {
        remote: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("channel cannot connect from state {0:?}")]
    NotIdle(ChannelState),
}

impl ConnectError {
    pub(crate) fn from_io(remote: Endpoint, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::ConnectionRefused {
            Self::Refused { remote, source }
        } else {
            Self::Unreachable { remote, source }
        }
    }
}

/// Why an outbound message was not transmitted.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no channel is active")]
    NoActiveChannel,
    #[error("no peer is connected")]
    NotConnected,
    #[error("udp socket is not bound")]
    NotBound,
    #[error("message is empty")]
    EmptyMessage,
    #[error("message contains a line break")]
    EmbeddedDelimiter,
    #[error("message is {len} bytes, limit is {max}")]
    Oversized { len: usize, max: usize },
    #[error("transport write failed: {0}")]
    Io(#[from] io::Error),
}

/// Inbound data that could not be turned into a message. The framer drops
/// the offending bytes and resumes at the next delimiter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("dropped {len} bytes of invalid UTF-8")]
    InvalidUtf8 { len: usize },
    #[error("dropped frame longer than {max} bytes")]
    Oversized { max: usize },
}

/// Only ever logged; teardown always appears to succeed.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("channel task panicked during shutdown")]
    Panicked(#[source] tokio::task::JoinError),
}

/// Failures surfaced by [`crate::role::RoleManager`] commands.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("operation requires the {expected} role, active role is {actual}")]
    RoleMismatch { expected: Role, actual: Role },
}
