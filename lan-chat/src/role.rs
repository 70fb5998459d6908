//! Role switching and the uniform command/event surface.
//!
//! [`RoleManager`] owns at most one [`Channel`]. Activating a role first
//! severs the previous channel's subscription, then closes it and waits for
//! its socket to be released, and only then starts the new channel. Events
//! from a torn-down channel can therefore never interleave with events from
//! its successor.

use std::{fmt, net::SocketAddr};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    channel::{Channel, TcpClientChannel, TcpServerChannel, UdpChannel},
    endpoint::Endpoint,
    error::{ChatError, SendError},
    event::{ChatEvent, EventSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    TcpServer,
    TcpClient,
    Udp,
}

impl Role {
    /// Label used for locally sent lines.
    pub fn label(self) -> &'static str {
        match self {
            Self::TcpServer => "server",
            Self::TcpClient => "client",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TcpServer => "tcp server",
            Self::TcpClient => "tcp client",
            Self::Udp => "udp",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct ActiveChannel {
    role: Role,
    channel: Channel,
    sink: EventSink,
    remote: Endpoint,
}

/// Owns the active transport and relays its events upward.
#[derive(Debug)]
pub struct RoleManager {
    events: mpsc::UnboundedSender<ChatEvent>,
    active: Option<ActiveChannel>,
}

impl RoleManager {
    /// Creates an idle manager along with the stream of upward events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                active: None,
            },
            rx,
        )
    }

    pub fn role(&self) -> Option<Role> {
        self.active.as_ref().map(|active| active.role)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active
            .as_ref()
            .and_then(|active| active.channel.local_addr())
    }

    pub fn is_connected(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.channel.is_connected())
    }

    /// Replaces whatever channel is running with a fresh one for `role`.
    ///
    /// The server binds `local`, the client connects to `remote`, and the UDP
    /// peer binds `local` and addresses every message to `remote`. Endpoints a
    /// role does not use are ignored. Connect failures are reported through
    /// the event stream; bind failures are also returned.
    pub async fn activate(
        &mut self,
        role: Role,
        local: Endpoint,
        remote: Endpoint,
    ) -> Result<(), ChatError> {
        self.deactivate().await;

        let sink = self.subscribe();
        let started = match role {
            Role::TcpServer => {
                let mut server = TcpServerChannel::new(sink.clone());
                let bound = server.listen(local).await;
                bound.map(|_| Channel::TcpServer(server))
            }
            Role::Udp => {
                let mut udp = UdpChannel::new(sink.clone());
                let bound = udp.bind(local).await;
                if bound.is_ok() {
                    self.emit(ChatEvent::status(format!("sending to {remote}")));
                }
                bound.map(|_| Channel::Udp(udp))
            }
            Role::TcpClient => {
                self.emit(ChatEvent::status(format!("connecting to {remote}")));
                let mut client = TcpClientChannel::new(sink.clone());
                client.connect_to(remote)?;
                Ok(Channel::TcpClient(client))
            }
        };

        let channel = match started {
            Ok(channel) => channel,
            Err(err) => {
                sink.unsubscribe();
                info!(%role, %local, error = %err, "activation failed");
                self.emit(ChatEvent::status(format!("failed to start {role}: {err}")));
                return Err(err.into());
            }
        };

        info!(%role, "role activated");
        self.active = Some(ActiveChannel {
            role,
            channel,
            sink,
            remote,
        });
        Ok(())
    }

    /// Tears down the active channel, if any. Always succeeds.
    pub async fn deactivate(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        let was_connected = active.channel.is_connected();
        active.sink.unsubscribe();
        active.channel.close().await;
        debug!(role = %active.role, "channel released");

        if was_connected {
            self.emit(ChatEvent::ConnectionStateChanged { connected: false });
        }
        self.emit(ChatEvent::status(format!("stopped {}", active.role)));
    }

    /// Sends `text` over whichever channel is active.
    pub async fn send(&self, text: &str) -> Result<(), SendError> {
        let active = self.active.as_ref().ok_or(SendError::NoActiveChannel)?;
        match &active.channel {
            Channel::TcpServer(server) => server.send(text).await?,
            Channel::TcpClient(client) => client.send(text).await?,
            Channel::Udp(udp) => udp.send_to(active.remote, text).await?,
        }

        self.emit(ChatEvent::Outgoing {
            from: active.role.label().to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    /// Drops the server's current peer while continuing to listen.
    pub async fn disconnect_peer(&self) -> Result<(), ChatError> {
        let active = self.active.as_ref().ok_or(SendError::NoActiveChannel)?;
        match &active.channel {
            Channel::TcpServer(server) => Ok(server.disconnect_peer().await?),
            _ => Err(ChatError::RoleMismatch {
                expected: Role::TcpServer,
                actual: active.role,
            }),
        }
    }

    fn subscribe(&self) -> EventSink {
        let events = self.events.clone();
        EventSink::new(move |event| {
            for chat_event in event.into_chat_events() {
                let _ = events.send(chat_event);
            }
        })
    }

    fn emit(&self, event: ChatEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}
