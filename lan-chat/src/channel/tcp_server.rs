use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::AsyncReadExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{ChannelState, READ_CHUNK, cancel_task, deliver_frames, state_cell, write_frame};
use crate::{
    endpoint::Endpoint,
    error::{BindError, SendError},
    event::{ChannelEvent, EventSink},
    framer::Framer,
};

/// Listens on one port and talks to a single peer at a time.
///
/// A connection that arrives while a peer is active is accepted and closed
/// straight away, so the active peer is never displaced.
#[derive(Debug)]
pub struct TcpServerChannel {
    shared: Arc<ServerShared>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct ServerShared {
    peer: Mutex<Option<PeerLink>>,
    state: watch::Sender<ChannelState>,
    sink: EventSink,
}

#[derive(Debug)]
struct PeerLink {
    addr: SocketAddr,
    writer: OwnedWriteHalf,
    // Dropping the link wakes the session task so it releases the read half.
    _kick: oneshot::Sender<()>,
}

impl TcpServerChannel {
    pub fn new(sink: EventSink) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                peer: Mutex::new(None),
                state: state_cell(),
                sink,
            }),
            local_addr: None,
            task: None,
        }
    }

    /// Binds `local` and starts accepting. Returns the bound address, which
    /// differs from `local` when port 0 was requested.
    pub async fn listen(&mut self, local: Endpoint) -> Result<SocketAddr, BindError> {
        let state = self.state();
        if state != ChannelState::Idle {
            return Err(BindError::NotIdle(state));
        }

        let listener = match TcpListener::bind(local.socket_addr()).await {
            Ok(listener) => listener,
            Err(err) => {
                self.shared.state.send_replace(ChannelState::Failed);
                return Err(BindError::from_io(local, err));
            }
        };
        let addr = listener
            .local_addr()
            .map_err(|err| BindError::from_io(local, err))?;

        info!(%addr, "tcp server listening");
        self.local_addr = Some(addr);
        self.shared.state.send_replace(ChannelState::Listening);
        self.task = Some(tokio::spawn(serve(listener, addr, Arc::clone(&self.shared))));
        Ok(addr)
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn send(&self, text: &str) -> Result<(), SendError> {
        let frame = Framer::encode(text)?;
        let mut slot = self.shared.peer.lock().await;
        let link = slot.as_mut().ok_or(SendError::NotConnected)?;

        if let Err(err) = write_frame(&mut link.writer, &frame).await {
            debug!(peer = %link.addr, error = ?err, "write to peer failed");
            drop(slot.take());
            return Err(SendError::Io(err));
        }
        Ok(())
    }

    /// Drops the current peer and keeps listening for the next one.
    pub async fn disconnect_peer(&self) -> Result<(), SendError> {
        let link = self.shared.peer.lock().await.take();
        match link {
            Some(link) => {
                info!(peer = %link.addr, "dropping peer");
                self.shared.state.send_replace(ChannelState::Listening);
                Ok(())
            }
            None => Err(SendError::NotConnected),
        }
    }

    /// Closes the listener and any peer. Idempotent.
    pub async fn stop(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        self.shared.state.send_replace(ChannelState::Closing);
        cancel_task(self.task.take()).await;

        let link = self.shared.peer.lock().await.take();
        self.shared.state.send_replace(ChannelState::Closed);
        if let Some(link) = link {
            let peer = link.addr;
            drop(link);
            self.shared.sink.emit(ChannelEvent::Disconnected { peer });
        }
        if let Some(addr) = self.local_addr {
            info!(%addr, "tcp server stopped");
        }
    }
}

async fn serve(listener: TcpListener, local: SocketAddr, shared: Arc<ServerShared>) {
    loop {
        shared.sink.emit(ChannelEvent::Listening { local });
        let (stream, peer) = accept_next(&listener).await;
        run_session(&listener, stream, peer, &shared).await;
    }
}

async fn accept_next(listener: &TcpListener) -> (TcpStream, SocketAddr) {
    loop {
        match listener.accept().await {
            Ok(accepted) => return accepted,
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }
}

async fn run_session(
    listener: &TcpListener,
    stream: TcpStream,
    peer: SocketAddr,
    shared: &ServerShared,
) {
    let (mut reader, writer) = stream.into_split();
    let (kick_tx, mut kick_rx) = oneshot::channel();

    *shared.peer.lock().await = Some(PeerLink {
        addr: peer,
        writer,
        _kick: kick_tx,
    });
    shared.state.send_replace(ChannelState::Active);
    info!(%peer, "peer connected");
    shared.sink.emit(ChannelEvent::Connected { peer });

    let mut framer = Framer::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        select! {
            read = reader.read(&mut buf) => {
                if !handle_read(read, &buf, &mut framer, peer, &shared.sink) {
                    break;
                }
            }
            _ = &mut kick_rx => {
                debug!(%peer, "peer released locally");
                break;
            }
            accepted = listener.accept() => reject_extra_peer(accepted, &shared.sink),
        }
    }

    release_peer(reader, peer, shared).await;
}

fn handle_read(
    read: std::io::Result<usize>,
    buf: &[u8],
    framer: &mut Framer,
    peer: SocketAddr,
    sink: &EventSink,
) -> bool {
    match read {
        Ok(0) => false,
        Ok(n) => {
            deliver_frames(framer, &buf[..n], peer, sink);
            true
        }
        Err(err) => {
            debug!(%peer, error = ?err, "read from peer failed");
            false
        }
    }
}

fn reject_extra_peer(accepted: std::io::Result<(TcpStream, SocketAddr)>, sink: &EventSink) {
    match accepted {
        Ok((stream, peer)) => {
            info!(%peer, "rejecting connection, a peer is already active");
            drop(stream);
            sink.emit(ChannelEvent::Rejected { peer });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn release_peer(reader: OwnedReadHalf, peer: SocketAddr, shared: &ServerShared) {
    // The link may already be gone if it was dropped locally or a write failed.
    let link = shared.peer.lock().await.take();
    drop(link);
    drop(reader);

    shared.state.send_replace(ChannelState::Listening);
    info!(%peer, "peer disconnected");
    shared.sink.emit(ChannelEvent::Disconnected { peer });
}
