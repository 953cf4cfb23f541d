//! Integration tests for the full serial session lifecycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use rfcomm_terminal::bluetooth::loopback::{ChannelBehavior, LoopbackTransport};
use rfcomm_terminal::bluetooth::{ConnectOutcome, LineEnding, PeerIdentity, RemotePeer, SPP_UUID};
use rfcomm_terminal::config::TerminalConfig;
use rfcomm_terminal::events::SerialEvent;
use rfcomm_terminal::message::Direction;
use rfcomm_terminal::state::ConnectionState;
use rfcomm_terminal::{SerialConsole, SerialError};

fn serial_peer(id: &str) -> PeerIdentity {
    PeerIdentity {
        id: id.to_string(),
        name: Some(format!("Device {id}")),
        service_uuids: vec![SPP_UUID],
        vendor_id: Some(0x0a12),
        product_id: Some(0x0001),
        address: Some(format!("addr-{id}")),
    }
}

fn setup() -> (Arc<LoopbackTransport>, SerialConsole) {
    let transport = Arc::new(LoopbackTransport::new());
    let console = SerialConsole::new(transport.clone(), &TerminalConfig::default());
    (transport, console)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_full_session() {
    let (transport, console) = setup();
    let mut state = console.watch_state();
    transport.add_peer(serial_peer("a"));
    console.start_watching().await.unwrap();
    eventually(|| console.devices().len() == 1).await;

    let device = console.select("a").unwrap();
    assert_eq!(
        console.connect_selected().await.unwrap(),
        ConnectOutcome::Connected
    );
    assert!(state.has_changed().unwrap());
    assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

    let mut remote = transport.next_remote().await.unwrap();

    // Outbound text with CRLF conversion
    console.send("a\nb", false, LineEnding::CrLf).await.unwrap();
    let mut buf = [0u8; 4];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"a\r\nb");

    // Outbound hex
    let sent = console
        .send("41 42", true, LineEnding::Lf)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent.hex(), "41 42 ");
    let mut buf = [0u8; 2];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, &[0x41, 0x42]);

    // Inbound bytes
    remote.write_all(b"pong").await.unwrap();
    eventually(|| device.transcript().len() == 3).await;
    let received = device.transcript().last().unwrap();
    assert_eq!(received.direction(), Direction::Received);
    assert_eq!(received.text(), "pong");

    // Hex view round trip
    let decoded = rfcomm_terminal::bluetooth::parse_hex(received.hex()).unwrap();
    assert_eq!(decoded, b"pong");

    assert!(console.disconnect());
    assert_eq!(console.state(), ConnectionState::Disconnected);
    assert!(!console.disconnect());
}

#[tokio::test]
async fn test_invalid_hex_transmits_nothing() {
    let (transport, console) = setup();
    transport.add_peer(serial_peer("a"));
    console.refresh().await.unwrap();
    let device = console.select("a").unwrap();
    console.connect_selected().await.unwrap();
    let mut remote = transport.next_remote().await.unwrap();

    let result = console.send("ZZ", true, LineEnding::Lf).await;
    assert!(matches!(result, Err(SerialError::InvalidHexInput(_))));
    assert!(device.transcript().is_empty());
    assert_eq!(console.state(), ConnectionState::Connected);

    // The next byte on the wire comes from the following send.
    console.send("7F", true, LineEnding::Lf).await.unwrap();
    let mut byte = [0u8; 1];
    remote.read_exact(&mut byte).await.unwrap();
    assert_eq!(byte, [0x7F]);
}

#[tokio::test]
async fn test_remote_close_reports_read_failed() {
    let (transport, console) = setup();
    transport.add_peer(serial_peer("a"));
    console.refresh().await.unwrap();
    let mut events = console.subscribe();

    console.connect(console.device("a")).await.unwrap();
    let remote = transport.next_remote().await.unwrap();
    drop(remote);

    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let SerialEvent::Error(e) = event {
            assert_eq!(e, SerialError::ReadFailed);
            break;
        }
    }
    assert_eq!(console.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_read_error_disconnects_silently() {
    let (transport, console) = setup();
    transport.add_peer(serial_peer("a"));
    transport.set_behavior("a", ChannelBehavior::FailingReads);
    console.refresh().await.unwrap();
    let mut events = console.subscribe();

    console.connect(console.device("a")).await.unwrap();
    eventually(|| console.state() == ConnectionState::Disconnected).await;

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SerialEvent::Error(_)));
    }
}

#[tokio::test]
async fn test_connect_while_connected_keeps_channel() {
    let (transport, console) = setup();
    transport.add_peer(serial_peer("a"));
    transport.add_peer(serial_peer("b"));
    console.refresh().await.unwrap();

    console.connect(console.device("a")).await.unwrap();
    let mut remote = transport.next_remote().await.unwrap();

    let outcome = console.connect(console.device("b")).await.unwrap();
    assert_eq!(outcome, ConnectOutcome::Busy);
    assert_eq!(console.active_device().unwrap().id(), "a");

    // Still the original channel
    console.send("x", false, LineEnding::Lf).await.unwrap();
    let mut byte = [0u8; 1];
    remote.read_exact(&mut byte).await.unwrap();
    assert_eq!(&byte, b"x");
}

#[tokio::test]
async fn test_removing_connected_device() {
    let (transport, console) = setup();
    console.start_watching().await.unwrap();
    transport.add_peer(serial_peer("a"));
    eventually(|| console.device("a").is_some()).await;

    console.connect(console.device("a")).await.unwrap();
    assert_eq!(console.selected_device().unwrap().id(), "a");

    transport.remove_peer("a");
    eventually(|| console.state() == ConnectionState::Disconnected).await;
    eventually(|| console.selected_device().is_none()).await;
    assert!(console.device("a").is_none());
}

#[tokio::test]
async fn test_registry_tracks_discovery_events() {
    let (transport, console) = setup();
    console.start_watching().await.unwrap();

    let mut expected = HashSet::new();
    for i in 0..12 {
        let id = format!("dev-{i}");
        match i % 4 {
            // Not a serial port
            0 => transport.add_peer(PeerIdentity {
                id: id.clone(),
                ..Default::default()
            }),
            // Lookup fails
            1 => transport.add_unresolvable_peer(&id),
            _ => {
                transport.add_peer(serial_peer(&id));
                expected.insert(id.clone());
            }
        }
        if i % 3 == 0 {
            transport.remove_peer(&id);
            expected.remove(&id);
        }
    }
    // Re-adding a removed peer brings it back
    transport.add_peer(serial_peer("dev-3"));
    expected.insert("dev-3".to_string());

    eventually(|| console.registry().ids() == expected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(console.registry().ids(), expected);
}

#[tokio::test]
async fn test_listen_mode_accepts_new_peer() {
    let (transport, console) = setup();
    console.set_listening(true).await.unwrap();
    assert!(console.is_listening());

    let mut remote = transport
        .connect_inbound(RemotePeer {
            id: "phone".to_string(),
            name: Some("Phone".to_string()),
            address: Some("11:22:33:44:55:66".to_string()),
        })
        .unwrap();

    eventually(|| console.selected_device().is_some()).await;
    assert_eq!(console.state(), ConnectionState::Connected);
    let device = console.selected_device().unwrap();
    assert_eq!(device.id(), "phone");
    assert_eq!(device.name(), "Phone");
    assert!(console.device("phone").is_some());

    remote.write_all(b"hi").await.unwrap();
    eventually(|| device.transcript().len() == 1).await;

    // Stopping listen mode leaves the session up
    console.set_listening(false).await.unwrap();
    assert!(!console.is_listening());
    assert_eq!(console.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_listen_denied() {
    let (transport, console) = setup();
    transport.deny_advertising(true);

    let result = console.set_listening(true).await;
    assert_eq!(
        result,
        Err(SerialError::BluetoothUnavailable {
            permission_denied: true
        })
    );
    assert!(!console.is_listening());
}
