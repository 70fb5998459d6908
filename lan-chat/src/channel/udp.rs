use std::{net::SocketAddr, sync::Arc};

use tokio::{
    net::UdpSocket,
    sync::{RwLock, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{ChannelState, cancel_task, state_cell};
use crate::{
    endpoint::Endpoint,
    error::{BindError, FramingError, SendError},
    event::{ChannelEvent, EventSink},
};

/// Largest UDP payload an IPv4 datagram can carry.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Connectionless peer: one datagram is one message, in either direction.
#[derive(Debug)]
pub struct UdpChannel {
    // Shared with the receive loop; `None` once unbound.
    socket: RwLock<Option<Arc<UdpSocket>>>,
    local_addr: Option<SocketAddr>,
    state: watch::Sender<ChannelState>,
    sink: EventSink,
    task: Option<JoinHandle<()>>,
}

impl UdpChannel {
    pub fn new(sink: EventSink) -> Self {
        Self {
            socket: RwLock::new(None),
            local_addr: None,
            state: state_cell(),
            sink,
            task: None,
        }
    }

    /// Binds `local` and starts the receive loop.
    pub async fn bind(&mut self, local: Endpoint) -> Result<SocketAddr, BindError> {
        let state = self.state();
        if state != ChannelState::Idle {
            return Err(BindError::NotIdle(state));
        }

        let socket = match UdpSocket::bind(local.socket_addr()).await {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                self.state.send_replace(ChannelState::Failed);
                return Err(BindError::from_io(local, err));
            }
        };
        let addr = socket
            .local_addr()
            .map_err(|err| BindError::from_io(local, err))?;

        info!(%addr, "udp socket bound");
        *self.socket.write().await = Some(Arc::clone(&socket));
        self.local_addr = Some(addr);
        self.state.send_replace(ChannelState::Active);
        self.task = Some(tokio::spawn(receive_loop(socket, addr, self.sink.clone())));
        Ok(addr)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn send_to(&self, dest: Endpoint, text: &str) -> Result<(), SendError> {
        if text.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if text.len() > MAX_DATAGRAM_LEN {
            return Err(SendError::Oversized {
                len: text.len(),
                max: MAX_DATAGRAM_LEN,
            });
        }

        let socket = self.socket.read().await;
        let socket = socket.as_ref().ok_or(SendError::NotBound)?;
        let sent = socket.send_to(text.as_bytes(), dest.socket_addr()).await?;
        debug!(%dest, bytes = sent, "datagram sent");
        Ok(())
    }

    /// Releases the socket. Safe to call repeatedly.
    pub async fn unbind(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        self.state.send_replace(ChannelState::Closing);
        cancel_task(self.task.take()).await;
        self.socket.write().await.take();
        self.state.send_replace(ChannelState::Closed);
        if let Some(addr) = self.local_addr {
            info!(%addr, "udp socket released");
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, local: SocketAddr, sink: EventSink) {
    sink.emit(ChannelEvent::Bound { local });

    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => deliver_datagram(&buf[..len], from, &sink),
            // ICMP port-unreachable from an earlier send surfaces here on
            // some platforms; the socket itself is still usable.
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(error = ?err, "ignoring reset on udp socket");
            }
            Err(err) => {
                warn!(error = ?err, "udp receive failed, receive loop stopped");
                sink.emit(ChannelEvent::Fault {
                    detail: err.to_string(),
                });
                return;
            }
        }
    }
}

fn deliver_datagram(payload: &[u8], from: SocketAddr, sink: &EventSink) {
    if payload.is_empty() {
        return;
    }
    match std::str::from_utf8(payload) {
        Ok(text) => {
            sink.emit(ChannelEvent::Message {
                from,
                text: text.to_string(),
            });
        }
        Err(_) => {
            let err = FramingError::InvalidUtf8 { len: payload.len() };
            warn!(peer = %from, error = %err, "dropping datagram");
        }
    }
}
