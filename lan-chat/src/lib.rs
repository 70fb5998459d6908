//! Point-to-point LAN chat over a TCP server, TCP client, or UDP peer.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`framer`] splits newline-delimited TCP byte streams into messages.
//! - [`channel`] holds the three transports, each owning one socket.
//! - [`role`] keeps exactly one channel active and exposes the uniform
//!   `send` / event contract, switching roles without leaking sockets or
//!   events from a torn-down channel.
//! - [`event`] defines the upward [`event::ChatEvent`] stream and the
//!   subscription channels report through.
//! - [`endpoint`] validates IPv4 address/port pairs.
//! - [`cli`] and [`console`] make up the terminal front-end used by the
//!   `lan-chat` binary.
//!
//! Integration tests drive the role manager and the binary directly.

pub mod channel;
pub mod cli;
pub mod console;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod framer;
pub mod role;

pub use endpoint::Endpoint;
pub use error::{BindError, ChatError, ConnectError, EndpointError, FramingError, SendError};
pub use event::ChatEvent;
pub use role::{Role, RoleManager};
