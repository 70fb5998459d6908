use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{endpoint::Endpoint, role::Role};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// How chat events are written to stdout.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Listen for a single TCP peer.
    Server(ServerArgs),
    /// Connect to a TCP server.
    Client(ClientArgs),
    /// Exchange datagrams with one UDP peer.
    Udp(UdpArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address and port to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:1234")]
    pub listen: Endpoint,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:1234")]
    pub connect: Endpoint,
}

#[derive(Args, Debug, Clone)]
pub struct UdpArgs {
    /// Local address and port to receive on.
    #[arg(long, default_value = "0.0.0.0:1234")]
    pub bind: Endpoint,

    /// Peer every message is sent to.
    #[arg(long, default_value = "127.0.0.1:1234")]
    pub target: Endpoint,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// `<from> text` for chat lines, `*** text` for status.
    Text,
    /// One JSON object per event.
    Json,
}

impl Command {
    /// The role and endpoints this command activates with.
    pub fn activation(&self) -> (Role, Endpoint, Endpoint) {
        match self {
            Self::Server(args) => (Role::TcpServer, args.listen, Endpoint::UNSPECIFIED),
            Self::Client(args) => (Role::TcpClient, Endpoint::UNSPECIFIED, args.connect),
            Self::Udp(args) => (Role::Udp, args.bind, args.target),
        }
    }
}
