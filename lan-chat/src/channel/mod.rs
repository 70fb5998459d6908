//! Transport channels. Each owns exactly one socket plus the background task
//! that services it, and reports through an [`EventSink`](crate::event::EventSink).

use std::net::SocketAddr;

use tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::watch,
    task::JoinHandle,
};
use tracing::warn;

use crate::{
    error::TeardownError,
    event::{ChannelEvent, EventSink},
    framer::Framer,
};

pub mod tcp_client;
pub mod tcp_server;
pub mod udp;

pub use tcp_client::TcpClientChannel;
pub use tcp_server::TcpServerChannel;
pub use udp::UdpChannel;

/// Bytes requested per socket read.
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    /// Server only: bound and waiting for a peer.
    Listening,
    Active,
    Closing,
    Closed,
    Failed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// The transport behind the active role, built fresh for every activation.
#[derive(Debug)]
pub enum Channel {
    TcpServer(TcpServerChannel),
    TcpClient(TcpClientChannel),
    Udp(UdpChannel),
}

impl Channel {
    pub fn state(&self) -> ChannelState {
        match self {
            Self::TcpServer(server) => server.state(),
            Self::TcpClient(client) => client.state(),
            Self::Udp(udp) => udp.state(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Active
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::TcpServer(server) => server.local_addr(),
            Self::TcpClient(client) => client.local_addr(),
            Self::Udp(udp) => udp.local_addr(),
        }
    }

    /// Releases the socket; the channel is unusable afterwards.
    pub async fn close(&mut self) {
        match self {
            Self::TcpServer(server) => server.stop().await,
            Self::TcpClient(client) => client.close().await,
            Self::Udp(udp) => udp.unbind().await,
        }
    }
}

fn state_cell() -> watch::Sender<ChannelState> {
    watch::Sender::new(ChannelState::Idle)
}

/// Cancels a channel task and waits until it has been dropped, together with
/// every socket half it owned.
async fn cancel_task(task: Option<JoinHandle<()>>) {
    let Some(task) = task else {
        return;
    };
    task.abort();
    if let Err(err) = task.await {
        if err.is_panic() {
            let err = TeardownError::Panicked(err);
            warn!(error = %err, "channel teardown was not clean");
        }
    }
}

/// Runs freshly read bytes through the connection's framer and reports every
/// completed message in order.
fn deliver_frames(framer: &mut Framer, bytes: &[u8], from: SocketAddr, sink: &EventSink) {
    for frame in framer.feed(bytes) {
        match frame {
            Ok(text) => {
                sink.emit(ChannelEvent::Message { from, text });
            }
            Err(err) => warn!(peer = %from, error = %err, "dropping malformed frame"),
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
