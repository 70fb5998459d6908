use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
};
use tracing::warn;

use crate::{
    cli::{Cli, OutputFormat},
    endpoint::Endpoint,
    event::ChatEvent,
    role::{Role, RoleManager},
};

/// Runs the interactive terminal session until `/quit`, end of input, or ctrl-c.
pub async fn run(cli: Cli) -> Result<()> {
    let (mut manager, mut events) = RoleManager::new();
    let (role, local, remote) = cli.command.activation();

    if let Err(err) = manager.activate(role, local, remote).await {
        flush_pending_events(&mut events, cli.format).await?;
        return Err(err).with_context(|| format!("failed to start {role}"));
    }

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_console_loop(&mut manager, &mut events, &mut stdin, &mut input, cli.format).await?;
    manager.deactivate().await;

    Ok(())
}

async fn run_console_loop(
    manager: &mut RoleManager,
    events: &mut mpsc::UnboundedReceiver<ChatEvent>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    format: OutputFormat,
) -> Result<()> {
    loop {
        select! {
            event = events.recv() => {
                match event {
                    Some(event) => write_event(&event, format).await?,
                    None => break,
                }
            }
            bytes_read = stdin.read_line(input) => {
                let keep_going = handle_stdin_input(bytes_read, input, manager, format).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

/// A line typed at the console.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleInput {
    Say(String),
    Quit,
    Stop,
    Disconnect,
    Activate {
        role: Role,
        local: Endpoint,
        remote: Endpoint,
    },
    Unknown(String),
    Usage(&'static str),
}

const SERVER_USAGE: &str = "usage: /server <ip:port>";
const CLIENT_USAGE: &str = "usage: /client <ip:port>";
const UDP_USAGE: &str = "usage: /udp <local ip:port> <remote ip:port>";

impl ConsoleInput {
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let text = line.trim_end_matches(['\r', '\n']);
        if text.trim().is_empty() {
            return None;
        }
        if !text.starts_with('/') {
            return Some(Self::Say(text.to_string()));
        }

        let mut words = text.split_whitespace();
        let command = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        let parsed = match (command.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("/quit", []) => Self::Quit,
            ("/stop", []) => Self::Stop,
            ("/disconnect", []) => Self::Disconnect,
            ("/server", [local]) => match local.parse() {
                Ok(local) => Self::Activate {
                    role: Role::TcpServer,
                    local,
                    remote: Endpoint::UNSPECIFIED,
                },
                Err(_) => Self::Usage(SERVER_USAGE),
            },
            ("/server", _) => Self::Usage(SERVER_USAGE),
            ("/client", [remote]) => match remote.parse() {
                Ok(remote) => Self::Activate {
                    role: Role::TcpClient,
                    local: Endpoint::UNSPECIFIED,
                    remote,
                },
                Err(_) => Self::Usage(CLIENT_USAGE),
            },
            ("/client", _) => Self::Usage(CLIENT_USAGE),
            ("/udp", [local, remote]) => match (local.parse(), remote.parse()) {
                (Ok(local), Ok(remote)) => Self::Activate {
                    role: Role::Udp,
                    local,
                    remote,
                },
                _ => Self::Usage(UDP_USAGE),
            },
            ("/udp", _) => Self::Usage(UDP_USAGE),
            _ => Self::Unknown(command.to_string()),
        };
        Some(parsed)
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    manager: &mut RoleManager,
    format: OutputFormat,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let Some(command) = ConsoleInput::parse(input) else {
        return Ok(true);
    };

    match command {
        ConsoleInput::Say(text) => {
            if let Err(err) = manager.send(&text).await {
                write_notice(&err.to_string()).await?;
            }
        }
        ConsoleInput::Quit => {
            write_event(&ChatEvent::status("leaving chat"), format).await?;
            return Ok(false);
        }
        ConsoleInput::Stop => manager.deactivate().await,
        ConsoleInput::Disconnect => {
            if let Err(err) = manager.disconnect_peer().await {
                write_notice(&err.to_string()).await?;
            }
        }
        ConsoleInput::Activate {
            role,
            local,
            remote,
        } => {
            // The failure is also reported as a status event.
            if let Err(err) = manager.activate(role, local, remote).await {
                warn!(error = %err, "role switch failed");
            }
        }
        ConsoleInput::Unknown(command) => {
            write_notice(&format!("Unknown command: {command}")).await?;
        }
        ConsoleInput::Usage(usage) => write_notice(usage).await?,
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn flush_pending_events(
    events: &mut mpsc::UnboundedReceiver<ChatEvent>,
    format: OutputFormat,
) -> Result<()> {
    while let Ok(event) = events.try_recv() {
        write_event(&event, format).await?;
    }
    Ok(())
}

/// Formats an event for stdout; connection-state changes have no text form.
pub fn render_event(event: &ChatEvent, format: OutputFormat) -> Result<Option<String>> {
    let line = match format {
        OutputFormat::Json => Some(serde_json::to_string(event).context("encode event")?),
        OutputFormat::Text => match event {
            ChatEvent::Message { from, text } | ChatEvent::Outgoing { from, text } => {
                Some(format!("<{from}> {text}"))
            }
            ChatEvent::SystemStatus { text } => Some(format!("*** {text}")),
            ChatEvent::ConnectionStateChanged { .. } => None,
        },
    };
    Ok(line)
}

async fn write_event(event: &ChatEvent, format: OutputFormat) -> Result<()> {
    if let Some(line) = render_event(event, format)? {
        write_stdout(&line).await?;
    }
    Ok(())
}

async fn write_notice(text: &str) -> io::Result<()> {
    write_stderr(&format!("! {text}")).await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_chat() {
        assert_eq!(
            ConsoleInput::parse("hello there\n"),
            Some(ConsoleInput::Say("hello there".into()))
        );
        assert_eq!(ConsoleInput::parse("   \n"), None);
    }

    #[test]
    fn role_commands_parse_endpoints() {
        assert_eq!(
            ConsoleInput::parse("/udp 0.0.0.0:5000 127.0.0.1:5001"),
            Some(ConsoleInput::Activate {
                role: Role::Udp,
                local: "0.0.0.0:5000".parse().expect("endpoint"),
                remote: Endpoint::localhost(5001),
            })
        );
        assert_eq!(
            ConsoleInput::parse("/client 10.0.0.300:80"),
            Some(ConsoleInput::Usage(CLIENT_USAGE))
        );
    }

    #[test]
    fn unknown_commands_name_the_command_word() {
        assert_eq!(
            ConsoleInput::parse("/nick alice"),
            Some(ConsoleInput::Unknown("/nick".into()))
        );
    }

    #[test]
    fn text_rendering_distinguishes_status_from_chat() {
        let chat = ChatEvent::Message {
            from: "127.0.0.1:4000".into(),
            text: "hi".into(),
        };
        let status = ChatEvent::status("listening on 0.0.0.0:1234");

        assert_eq!(
            render_event(&chat, OutputFormat::Text).expect("render"),
            Some("<127.0.0.1:4000> hi".into())
        );
        assert_eq!(
            render_event(&status, OutputFormat::Text).expect("render"),
            Some("*** listening on 0.0.0.0:1234".into())
        );
        assert_eq!(
            render_event(
                &ChatEvent::ConnectionStateChanged { connected: true },
                OutputFormat::Text
            )
            .expect("render"),
            None
        );
    }

    #[test]
    fn json_rendering_covers_every_event() {
        let line = render_event(
            &ChatEvent::ConnectionStateChanged { connected: false },
            OutputFormat::Json,
        )
        .expect("render");
        assert_eq!(
            line.as_deref(),
            Some(r#"{"type":"connection_state_changed","connected":false}"#)
        );
    }
}
