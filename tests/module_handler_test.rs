//! Device modules under a `ModuleHandler`: handler selection, the Planar URX
//! display over TCP and the Sony camera over VISCA.

use av_control::connection::{link_mode, Backing, LinkMode};
use av_control::device::planar_urx::UrxCommand;
use av_control::device::sony_srg::{SrgCommand, RESET_SEQUENCE};
use av_control::device::{Device, PlanarUrx, Qualifier, SonySrg300, Value};
use av_control::transport::{MockClient, Protocol, TcpClient, UdpDispatcher};
use av_control::{AvError, ConnectionStatus, HandlerOptions, ModuleHandler};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(5);

type Packets = Arc<Mutex<Vec<Vec<u8>>>>;

fn statuses<D, T>(handler: &mut ModuleHandler<D, T>) -> Arc<Mutex<Vec<ConnectionStatus>>>
where
    D: av_control::device::Driver,
    T: av_control::transport::ClientTransport + 'static,
{
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    handler.on_connected(move |_, status| sink.lock().unwrap().push(status));
    let sink = Arc::clone(&seen);
    handler.on_disconnected(move |_, status| sink.lock().unwrap().push(status));
    seen
}

/// VISCA inquiry reply for `sequence` carrying `value`.
fn inquiry_reply(sequence: u8, value: u8) -> Vec<u8> {
    vec![0x01, 0x11, 0x00, 0x04, 0, 0, 0, sequence, 0x90, 0x50, value, 0xFF]
}

#[test]
fn handler_kind_follows_protocol_and_backing() {
    let cases = [
        (Protocol::Tcp, Backing::Raw, LinkMode::Stream),
        (Protocol::Ssh, Backing::Module, LinkMode::Stream),
        (Protocol::Dante, Backing::Raw, LinkMode::Stream),
        (Protocol::Serial, Backing::Raw, LinkMode::Pipe),
        (Protocol::Udp, Backing::Module, LinkMode::Pipe),
        (Protocol::SpInterface, Backing::Module, LinkMode::Pipe),
        (Protocol::Http, Backing::Module, LinkMode::Pipe),
    ];
    for (protocol, backing, mode) in cases {
        assert_eq!(link_mode(protocol, backing).unwrap(), mode, "{protocol} / {backing:?}");
    }
    assert!(matches!(
        link_mode(Protocol::Http, Backing::Raw),
        Err(AvError::UnsupportedTransport { handler: "ConnectionHandler", .. })
    ));
}

/// Fake UltraRes X: answers every power query with "On" and records the
/// rest.
async fn fake_display(listener: TcpListener, received: Arc<Mutex<Vec<u8>>>) {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 256];
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let chunk = &buf[..n];
        received.lock().unwrap().extend_from_slice(chunk);
        let queries = chunk.windows(7).filter(|w| *w == b"(STA?)\r").count();
        for _ in 0..queries {
            socket.write_all(b"(0;STA=2)\r").await.unwrap();
        }
    }
}

#[tokio::test]
async fn urx_display_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let received = Arc::new(Mutex::new(Vec::new()));
    let display = tokio::spawn(fake_display(listener, Arc::clone(&received)));

    let device = Device::new("Display", PlanarUrx::new().unwrap(), TcpClient::new("127.0.0.1", port));
    let options = HandlerOptions::default()
        .with_poll_interval(Duration::from_millis(50))
        .with_connect_retry(Duration::from_millis(100));
    let mut handler = ModuleHandler::new(device, &options, (UrxCommand::Power, Qualifier::new())).unwrap();
    let seen = statuses(&mut handler);
    let power = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&power);
    handler.subscribe_status(UrxCommand::Power, &Qualifier::new(), move |_, value, _| {
        sink.lock().unwrap().push(value.clone());
    });

    handler.connect().await;
    tokio::time::timeout(WAIT, async {
        while handler.read_status(UrxCommand::Power, &Qualifier::new()).is_none() {
            handler.step().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(handler.status(), ConnectionStatus::Connected);
    assert_eq!(*power.lock().unwrap(), vec![Value::from("On")]);

    handler.set(UrxCommand::Input, "HDMI 2", &Qualifier::new()).unwrap();
    tokio::time::timeout(WAIT, async {
        while !String::from_utf8_lossy(&received.lock().unwrap()).contains("(INS=5)\r") {
            handler.step().await;
        }
    })
    .await
    .unwrap();
    assert!(handler.set(UrxCommand::Input, "VGA", &Qualifier::new()).is_err());

    display.abort();
    tokio::time::timeout(WAIT, async {
        while handler.status() == ConnectionStatus::Connected {
            handler.step().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![ConnectionStatus::Connected, ConnectionStatus::Disconnected]
    );
}

/// Fake SRG-300: answers power inquiries with "On", commands with ACK then
/// completion, and records every packet.
async fn fake_camera(socket: UdpSocket, packets: Packets) {
    let mut buf = [0u8; 64];
    loop {
        let Ok((n, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let packet = buf[..n].to_vec();
        packets.lock().unwrap().push(packet.clone());
        if packet.len() < 9 || packet[0] != 0x01 {
            continue;
        }
        let sequence = packet[7];
        let replies = match packet[1] {
            0x10 => vec![inquiry_reply(sequence, 0x02)],
            _ => vec![
                vec![0x01, 0x11, 0x00, 0x03, 0, 0, 0, sequence, 0x90, 0x41, 0xFF],
                vec![0x01, 0x11, 0x00, 0x03, 0, 0, 0, sequence, 0x90, 0x51, 0xFF],
            ],
        };
        for reply in replies {
            socket.send_to(&reply, from).await.unwrap();
        }
    }
}

#[tokio::test]
async fn sony_camera_over_shared_visca_socket() {
    let dispatcher = UdpDispatcher::bind(0).await.unwrap();
    let camera = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let camera_addr: SocketAddr = camera.local_addr().unwrap();
    let packets: Packets = Arc::default();
    let _camera = tokio::spawn(fake_camera(camera, Arc::clone(&packets)));

    let endpoint = dispatcher.endpoint(camera_addr).unwrap();
    let device = Device::new("Camera", SonySrg300::new(), endpoint);
    let options = HandlerOptions::default().with_poll_interval(Duration::from_secs(3600));
    let mut handler = ModuleHandler::new(device, &options, (SrgCommand::Power, Qualifier::new())).unwrap();
    assert_eq!(handler.mode(), LinkMode::Pipe);

    handler.connect().await;
    handler.update(SrgCommand::Power, &Qualifier::new()).unwrap();
    assert_eq!(handler.status(), ConnectionStatus::Connected);
    tokio::time::timeout(WAIT, async {
        while handler.read_status(SrgCommand::Power, &Qualifier::new()).is_none() {
            handler.step().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        handler.read_status(SrgCommand::Power, &Qualifier::new()),
        Some(&Value::from("On"))
    );

    // A command waits for its completion before the next request goes out.
    handler.set(SrgCommand::Home, "Home", &Qualifier::new()).unwrap();
    handler.update(SrgCommand::Power, &Qualifier::new()).unwrap();
    tokio::time::timeout(WAIT, async {
        while packets.lock().unwrap().len() < 4 {
            handler.step().await;
        }
    })
    .await
    .unwrap();

    let packets = packets.lock().unwrap();
    assert_eq!(packets[0], RESET_SEQUENCE);
    assert_eq!(packets[1], [0x01, 0x10, 0x00, 0x05, 0, 0, 0, 1, 0x81, 0x09, 0x04, 0x00, 0xFF]);
    assert_eq!(packets[2], [0x01, 0x00, 0x00, 0x05, 0, 0, 0, 2, 0x81, 0x01, 0x06, 0x04, 0xFF]);
    assert_eq!(&packets[3][..8], [0x01, 0x10, 0x00, 0x05, 0, 0, 0, 3]);
}

#[tokio::test(start_paused = true)]
async fn silent_camera_goes_down_and_recovers() {
    let (client, peer) = MockClient::pair(Protocol::Udp);
    let device = Device::new("Camera", SonySrg300::new(), client);
    // Polls at 1.5 s steps never coincide with the 1 s reply timeouts.
    let options = HandlerOptions::default()
        .with_disconnect_limit(2)
        .with_poll_interval(Duration::from_millis(1500));
    let mut handler = ModuleHandler::new(device, &options, (SrgCommand::Power, Qualifier::new())).unwrap();
    let seen = statuses(&mut handler);

    let start = Instant::now();
    handler.connect().await;
    while handler.status() != ConnectionStatus::Disconnected {
        handler.step().await;
        assert!(start.elapsed() < Duration::from_secs(60));
    }
    assert_eq!(*seen.lock().unwrap(), vec![ConnectionStatus::Connected, ConnectionStatus::Disconnected]);
    let sent = peer.sent();
    assert_eq!(sent[0].as_ref(), RESET_SEQUENCE);
    // Three inquiries went unanswered.
    assert_eq!(sent.len(), 4);

    // Out of sync again: the next inquiry carries sequence 1.
    while peer.sent().len() == 4 {
        handler.step().await;
    }
    let inquiry = peer.sent()[4].clone();
    assert_eq!(&inquiry[..8], [0x01, 0x10, 0x00, 0x05, 0, 0, 0, 1]);

    peer.push_data(Bytes::from(inquiry_reply(1, 0x03)));
    handler.step().await;
    assert_eq!(handler.status(), ConnectionStatus::Connected);
    assert_eq!(
        handler.read_status(SrgCommand::Power, &Qualifier::new()),
        Some(&Value::from("Off"))
    );
    assert_eq!(peer.sent().last().unwrap().as_ref(), RESET_SEQUENCE);
}

#[tokio::test(start_paused = true)]
async fn visca_error_reply_is_ignored() {
    let (client, peer) = MockClient::pair(Protocol::Udp);
    let device = Device::new("Camera", SonySrg300::new(), client);
    let mut handler =
        ModuleHandler::new(device, &HandlerOptions::default(), (SrgCommand::Power, Qualifier::new())).unwrap();

    handler.connect().await;
    handler.update(SrgCommand::Power, &Qualifier::new()).unwrap();
    peer.push_data(&[0x01, 0x11, 0x00, 0x04, 0, 0, 0, 1, 0x90, 0x60, 0x02, 0xFF][..]);
    handler.step().await;
    assert_eq!(handler.read_status(SrgCommand::Power, &Qualifier::new()), None);

    // Still in flight: the real answer is accepted.
    peer.push_data(Bytes::from(inquiry_reply(1, 0x02)));
    handler.step().await;
    assert_eq!(
        handler.read_status(SrgCommand::Power, &Qualifier::new()),
        Some(&Value::from("On"))
    );
    assert_eq!(handler.device().counter(), 0);
}
