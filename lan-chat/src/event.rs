use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ConnectError;

/// Events delivered upward to the display layer, whatever role is active.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A chat line received from a peer.
    Message { from: String, text: String },
    /// A chat line this side sent successfully, labelled with the local role.
    Outgoing { from: String, text: String },
    /// Synthesized by the role manager; not from any peer.
    SystemStatus { text: String },
    ConnectionStateChanged { connected: bool },
}

impl ChatEvent {
    pub fn status(text: impl Into<String>) -> Self {
        Self::SystemStatus { text: text.into() }
    }
}

/// Lifecycle and data notifications raised by a single channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The server is accepting connections (again).
    Listening { local: SocketAddr },
    /// The UDP socket is bound and its receive loop is running.
    Bound { local: SocketAddr },
    Connected { peer: SocketAddr },
    ConnectFailed { reason: ConnectError },
    Disconnected { peer: SocketAddr },
    /// A second peer tried to connect while one was already active.
    Rejected { peer: SocketAddr },
    Message { from: SocketAddr, text: String },
    Fault { detail: String },
}

impl ChannelEvent {
    /// Maps a channel notification onto the uniform upward contract.
    pub fn into_chat_events(self) -> Vec<ChatEvent> {
        match self {
            Self::Listening { local } => vec![ChatEvent::status(format!("listening on {local}"))],
            Self::Bound { local } => vec![
                ChatEvent::ConnectionStateChanged { connected: true },
                ChatEvent::status(format!("udp bound to {local}")),
            ],
            Self::Connected { peer } => vec![
                ChatEvent::ConnectionStateChanged { connected: true },
                ChatEvent::status(format!("connected to {peer}")),
            ],
            Self::ConnectFailed { reason } => vec![ChatEvent::status(reason.to_string())],
            Self::Disconnected { peer } => vec![
                ChatEvent::ConnectionStateChanged { connected: false },
                ChatEvent::status(format!("disconnected from {peer}")),
            ],
            Self::Rejected { peer } => vec![ChatEvent::status(format!(
                "rejected {peer}: a peer is already connected"
            ))],
            Self::Message { from, text } => {
                if text.is_empty() {
                    return Vec::new();
                }
                vec![ChatEvent::Message {
                    from: from.to_string(),
                    text,
                }]
            }
            Self::Fault { detail } => vec![ChatEvent::status(format!("error: {detail}"))],
        }
    }
}

type Handler = Box<dyn Fn(ChannelEvent) + Send>;

/// Subscription point a channel reports through.
///
/// Delivery happens while holding the sink's lock, so once
/// [`EventSink::unsubscribe`] returns no event from the channel can reach the
/// handler, including one that was mid-delivery when teardown started.
/// Handlers must not call back into the sink.
#[derive(Clone)]
pub struct EventSink {
    handler: Arc<Mutex<Option<Handler>>>,
}

impl EventSink {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(ChannelEvent) + Send + 'static,
    {
        Self {
            handler: Arc::new(Mutex::new(Some(Box::new(handler)))),
        }
    }

    /// Forwards raw channel events into an mpsc queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    /// Returns false when the event was dropped because nobody is subscribed.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        let guard = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self) {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_subscribed(&self) -> bool {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}
