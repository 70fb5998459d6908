use std::time::Duration;

use anyhow::{Context, Result};
use lan_chat::{BindError, ChatError, ChatEvent, Endpoint, Role, RoleManager, SendError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc::UnboundedReceiver,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(2);

async fn next_event(rx: &mut UnboundedReceiver<ChatEvent>) -> Result<ChatEvent> {
    timeout(WAIT, rx.recv())
        .await
        .context("timed out waiting for chat event")?
        .context("event stream closed")
}

/// Collects events up to and including the first one matching `done`.
async fn events_until(
    rx: &mut UnboundedReceiver<ChatEvent>,
    done: impl Fn(&ChatEvent) -> bool,
) -> Result<Vec<ChatEvent>> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await?;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return Ok(seen);
        }
    }
}

fn is_message(event: &ChatEvent) -> bool {
    matches!(event, ChatEvent::Message { .. })
}

fn connected(event: &ChatEvent) -> bool {
    *event == ChatEvent::ConnectionStateChanged { connected: true }
}

async fn start_server(
    manager: &mut RoleManager,
    rx: &mut UnboundedReceiver<ChatEvent>,
) -> Result<Endpoint> {
    manager
        .activate(Role::TcpServer, Endpoint::localhost(0), Endpoint::UNSPECIFIED)
        .await?;
    let addr = manager.local_addr().context("server has a local address")?;
    assert_eq!(
        next_event(rx).await?,
        ChatEvent::status(format!("listening on {addr}"))
    );
    Ok(Endpoint::try_from(addr)?)
}

#[tokio::test]
async fn send_without_active_channel_fails_silently() -> Result<()> {
    let (manager, mut rx) = RoleManager::new();

    assert!(matches!(
        manager.send("hello").await,
        Err(SendError::NoActiveChannel)
    ));
    assert!(matches!(
        manager.disconnect_peer().await,
        Err(ChatError::Send(SendError::NoActiveChannel))
    ));
    assert!(rx.try_recv().is_err());
    assert_eq!(manager.role(), None);
    Ok(())
}

#[tokio::test]
async fn tcp_client_message_reaches_server_once() -> Result<()> {
    let (mut server, mut server_rx) = RoleManager::new();
    let server_ep = start_server(&mut server, &mut server_rx).await?;

    let (mut client, mut client_rx) = RoleManager::new();
    client
        .activate(Role::TcpClient, Endpoint::UNSPECIFIED, server_ep)
        .await?;
    assert_eq!(
        next_event(&mut client_rx).await?,
        ChatEvent::status(format!("connecting to {server_ep}"))
    );

    let client_side = events_until(&mut client_rx, connected).await?;
    assert!(!client_side.iter().any(is_message));
    assert!(client.is_connected());

    client.send("hello").await?;
    let echoed = events_until(&mut client_rx, |event| {
        matches!(event, ChatEvent::Outgoing { .. })
    })
    .await?;
    assert!(!echoed.iter().any(is_message));
    assert_eq!(
        echoed.last(),
        Some(&ChatEvent::Outgoing {
            from: "client".into(),
            text: "hello".into()
        })
    );

    let server_side = events_until(&mut server_rx, is_message).await?;
    let connected_at = server_side
        .iter()
        .position(connected)
        .context("server saw the connection first")?;
    assert!(connected_at < server_side.len() - 1);

    let client_label = client
        .local_addr()
        .context("client has a local address")?
        .to_string();
    assert_eq!(
        server_side.last(),
        Some(&ChatEvent::Message {
            from: client_label,
            text: "hello".into()
        })
    );
    assert!(timeout(Duration::from_millis(200), server_rx.recv()).await.is_err());

    server.send("welcome").await?;
    let reply = events_until(&mut client_rx, is_message).await?;
    assert_eq!(
        reply.last(),
        Some(&ChatEvent::Message {
            from: server_ep.to_string(),
            text: "welcome".into()
        })
    );

    client.deactivate().await;
    server.deactivate().await;
    Ok(())
}

#[tokio::test]
async fn udp_peers_exchange_one_message() -> Result<()> {
    let (mut receiver, mut receiver_rx) = RoleManager::new();
    receiver
        .activate(Role::Udp, Endpoint::localhost(0), Endpoint::localhost(9))
        .await?;
    let receiver_ep = Endpoint::try_from(receiver.local_addr().context("bound")?)?;

    let (mut sender, _sender_rx) = RoleManager::new();
    sender
        .activate(Role::Udp, Endpoint::localhost(0), receiver_ep)
        .await?;
    let sender_label = sender.local_addr().context("bound")?.to_string();

    let ready = events_until(&mut receiver_rx, connected).await?;
    assert!(!ready.iter().any(is_message));

    sender.send("datagram: <ok> ünïcode").await?;

    let received = events_until(&mut receiver_rx, is_message).await?;
    assert_eq!(
        received.last(),
        Some(&ChatEvent::Message {
            from: sender_label,
            text: "datagram: <ok> ünïcode".into()
        })
    );
    assert!(timeout(Duration::from_millis(200), receiver_rx.recv()).await.is_err());

    sender.deactivate().await;
    receiver.deactivate().await;
    Ok(())
}

#[tokio::test]
async fn switching_roles_releases_server_and_peer() -> Result<()> {
    let (mut manager, mut rx) = RoleManager::new();
    let server_ep = start_server(&mut manager, &mut rx).await?;

    let mut peer = TcpStream::connect(server_ep.socket_addr()).await?;
    events_until(&mut rx, connected).await?;

    peer.write_all(b"in flight\n").await?;
    manager
        .activate(Role::Udp, Endpoint::localhost(0), Endpoint::localhost(9))
        .await?;
    assert_eq!(manager.role(), Some(Role::Udp));

    // Anything from the old channel must be queued before the teardown notice.
    let teardown = events_until(&mut rx, |event| {
        *event == ChatEvent::status("stopped tcp server")
    })
    .await?;
    assert!(teardown.contains(&ChatEvent::ConnectionStateChanged { connected: false }));
    let after: Vec<ChatEvent> = events_until(&mut rx, connected).await?;
    assert!(!after.iter().any(is_message), "{after:?}");

    let mut buf = [0u8; 16];
    let read = timeout(WAIT, peer.read(&mut buf)).await?;
    assert!(matches!(read, Ok(0) | Err(_)));

    let rebound = TcpListener::bind(server_ep.socket_addr()).await?;
    drop(rebound);

    manager.deactivate().await;
    Ok(())
}

#[tokio::test]
async fn bind_failure_is_returned_and_reported() -> Result<()> {
    let occupied = TcpListener::bind("127.0.0.1:0").await?;
    let taken = Endpoint::try_from(occupied.local_addr()?)?;

    let (mut manager, mut rx) = RoleManager::new();
    let result = manager
        .activate(Role::TcpServer, taken, Endpoint::UNSPECIFIED)
        .await;
    assert!(
        matches!(result, Err(ChatError::Bind(BindError::InUse { .. }))),
        "{result:?}"
    );
    assert_eq!(manager.role(), None);

    match next_event(&mut rx).await? {
        ChatEvent::SystemStatus { text } => {
            assert!(text.starts_with("failed to start tcp server"), "{text}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn refused_connection_becomes_status_message() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let closed = Endpoint::try_from(listener.local_addr()?)?;
    drop(listener);

    let (mut manager, mut rx) = RoleManager::new();
    manager
        .activate(Role::TcpClient, Endpoint::UNSPECIFIED, closed)
        .await?;

    assert_eq!(
        next_event(&mut rx).await?,
        ChatEvent::status(format!("connecting to {closed}"))
    );
    assert_eq!(
        next_event(&mut rx).await?,
        ChatEvent::status(format!("connection to {closed} refused"))
    );
    assert!(matches!(manager.send("hi").await, Err(SendError::NotConnected)));
    Ok(())
}

#[tokio::test]
async fn disconnect_peer_needs_server_role() -> Result<()> {
    let (mut manager, _rx) = RoleManager::new();
    manager
        .activate(Role::Udp, Endpoint::localhost(0), Endpoint::localhost(9))
        .await?;

    assert!(matches!(
        manager.disconnect_peer().await,
        Err(ChatError::RoleMismatch {
            expected: Role::TcpServer,
            actual: Role::Udp
        })
    ));
    manager.deactivate().await;
    manager.deactivate().await;
    assert_eq!(manager.role(), None);
    Ok(())
}
