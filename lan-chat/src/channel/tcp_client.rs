use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use tokio::{
    io::AsyncReadExt,
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use super::{ChannelState, READ_CHUNK, cancel_task, deliver_frames, state_cell, write_frame};
use crate::{
    endpoint::Endpoint,
    error::{ConnectError, SendError},
    event::{ChannelEvent, EventSink},
    framer::Framer,
};

/// Outbound TCP connection. Connecting happens in the background; the
/// outcome arrives as `Connected` or `ConnectFailed`.
#[derive(Debug)]
pub struct TcpClientChannel {
    shared: Arc<ClientShared>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct ClientShared {
    link: Mutex<Option<ServerLink>>,
    local: OnceLock<SocketAddr>,
    state: watch::Sender<ChannelState>,
    sink: EventSink,
}

#[derive(Debug)]
struct ServerLink {
    peer: SocketAddr,
    writer: OwnedWriteHalf,
}

impl TcpClientChannel {
    pub fn new(sink: EventSink) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                link: Mutex::new(None),
                local: OnceLock::new(),
                state: state_cell(),
                sink,
            }),
            task: None,
        }
    }

    /// Starts connecting to `remote` and returns without waiting for the
    /// handshake. A channel connects at most once.
    pub fn connect_to(&mut self, remote: Endpoint) -> Result<(), ConnectError> {
        let state = self.state();
        if state != ChannelState::Idle {
            return Err(ConnectError::NotIdle(state));
        }

        self.shared.state.send_replace(ChannelState::Connecting);
        self.task = Some(tokio::spawn(run(remote, Arc::clone(&self.shared))));
        Ok(())
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Local address of the established connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local.get().copied()
    }

    pub async fn send(&self, text: &str) -> Result<(), SendError> {
        let frame = Framer::encode(text)?;
        let mut slot = self.shared.link.lock().await;
        let link = slot.as_mut().ok_or(SendError::NotConnected)?;

        if let Err(err) = write_frame(&mut link.writer, &frame).await {
            debug!(peer = %link.peer, error = ?err, "write to server failed");
            return Err(SendError::Io(err));
        }
        Ok(())
    }

    /// Closes the connection, or abandons a connect still in flight without
    /// reporting its outcome. Idempotent.
    pub async fn close(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        self.shared.state.send_replace(ChannelState::Closing);
        cancel_task(self.task.take()).await;

        let link = self.shared.link.lock().await.take();
        self.shared.state.send_replace(ChannelState::Closed);
        if let Some(link) = link {
            let peer = link.peer;
            drop(link);
            info!(%peer, "connection closed locally");
            self.shared.sink.emit(ChannelEvent::Disconnected { peer });
        }
    }
}

async fn run(remote: Endpoint, shared: Arc<ClientShared>) {
    let stream = match TcpStream::connect(remote.socket_addr()).await {
        Ok(stream) => stream,
        Err(err) => {
            let reason = ConnectError::from_io(remote, err);
            info!(%remote, error = %reason, "connect failed");
            shared.state.send_replace(ChannelState::Failed);
            shared.sink.emit(ChannelEvent::ConnectFailed { reason });
            return;
        }
    };

    let peer = remote.socket_addr();
    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(err) => {
            shared.state.send_replace(ChannelState::Failed);
            shared.sink.emit(ChannelEvent::ConnectFailed {
                reason: ConnectError::from_io(remote, err),
            });
            return;
        }
    };

    let (mut reader, writer) = stream.into_split();
    let _ = shared.local.set(local);
    *shared.link.lock().await = Some(ServerLink { peer, writer });
    shared.state.send_replace(ChannelState::Active);
    info!(%peer, %local, "connected");
    shared.sink.emit(ChannelEvent::Connected { peer });

    let mut framer = Framer::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => deliver_frames(&mut framer, &buf[..n], peer, &shared.sink),
            Err(err) => {
                debug!(%peer, error = ?err, "read from server failed");
                break;
            }
        }
    }

    drop(shared.link.lock().await.take());
    drop(reader);
    shared.state.send_replace(ChannelState::Closed);
    info!(%peer, "server closed the connection");
    shared.sink.emit(ChannelEvent::Disconnected { peer });
}
