//! A whole room: configuration file, device supervision, event bus and
//! console working together over loopback sockets.

use av_control::config::RoomConfig;
use av_control::room::Room;
use av_control::{ConnectionStatus, PubSub};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const WAIT: Duration = Duration::from_secs(5);

/// Display stand-in that reports "On" to every power query.
async fn spawn_display() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        while let Ok(n) = socket.read(&mut buf).await {
            if n == 0 {
                break;
            }
            for _ in buf[..n].windows(7).filter(|w| *w == b"(STA?)\r") {
                if socket.write_all(b"(0;STA=2)\r").await.is_err() {
                    return;
                }
            }
        }
    });
    port
}

/// A port nothing is listening on right now.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn room_file(display_port: u16, console: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [application]
        name = "Test Room"

        [handlers]
        poll_interval = "50ms"
        connect_retry = "100ms"

        [console]
        {console}

        [[devices]]
        name = "Display"
        driver = "planar_urx"
        transport = {{ type = "tcp", host = "127.0.0.1", port = {display_port} }}
        "#
    )
    .unwrap();
    file
}

fn record(bus: &PubSub) -> Arc<Mutex<Vec<(String, Value)>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.register_listener(move |name, data| sink.lock().unwrap().push((name.to_string(), data.clone())));
    events
}

async fn wait_for(what: &str, mut ready: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[test]
fn bus_names_ignore_case_and_unregister_by_id() {
    let bus = PubSub::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = bus.register_event(["Display", "camera"], move |data| {
        sink.lock().unwrap().push(data.clone());
    });
    let everything = record(&bus);

    bus.trigger("DISPLAY", "Connected");
    bus.trigger("Camera", json!({"command": "Power", "value": "On"}));
    bus.trigger("Lights", 1);
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(bus.event_names(), vec!["camera", "display"]);

    assert!(bus.unregister_event(["display"], id));
    assert!(!bus.unregister_event(["display"], id));
    bus.trigger("Display", "Disconnected");
    bus.trigger("camera", "Disconnected");
    assert_eq!(seen.lock().unwrap().len(), 3);

    let names: Vec<String> = everything.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, vec!["DISPLAY", "Camera", "Lights", "Display", "camera"]);
}

#[tokio::test]
async fn room_supervises_a_tcp_display() {
    let display_port = spawn_display().await;
    let file = room_file(display_port, "enabled = false");
    let config = RoomConfig::load(file.path()).unwrap();
    assert_eq!(config.handlers.poll_interval, Duration::from_millis(50));

    let room = Room::new(config);
    let events = record(room.bus());
    let tasks = room.start().await.unwrap();
    assert_eq!(tasks.len(), 1);

    let board = room.board().clone();
    wait_for("the display to connect", || {
        board.get("Display") == Some(ConnectionStatus::Connected)
    })
    .await;
    wait_for("the power status", || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|(_, data)| data["command"] == "Power")
    })
    .await;

    let events = events.lock().unwrap();
    let startup = events.iter().find(|(name, _)| name == "System").unwrap();
    assert_eq!(startup.1["event"], "startup");
    assert_eq!(startup.1["msg"], "Test Room started.");
    let power = events
        .iter()
        .find(|(_, data)| data["command"] == "Power")
        .unwrap();
    assert_eq!(power.0, "Display");
    assert_eq!(power.1, json!({"command": "Power", "value": "On", "qualifier": {}}));
    assert!(events
        .iter()
        .any(|(name, data)| name == "Display" && *data == json!({"command": "ConnectionStatus", "value": "Connected", "qualifier": {}})));
    drop(events);

    tasks.shutdown().await;
}

#[tokio::test]
async fn room_console_lists_devices() {
    let display_port = spawn_display().await;
    let console_port = free_port();
    let file = room_file(display_port, &format!("port = {console_port}"));
    let room = Room::new(RoomConfig::load(file.path()).unwrap());
    let tasks = room.start().await.unwrap();
    assert_eq!(tasks.len(), 2);

    let board = room.board().clone();
    wait_for("the display to connect", || {
        board.get("Display") == Some(ConnectionStatus::Connected)
    })
    .await;

    let mut session = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", console_port)).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    session.write_all(b"user\rpassword\rdevices\r").await.unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 512];
    tokio::time::timeout(WAIT, async {
        while !String::from_utf8_lossy(&received).contains("Connected") {
            let n = session.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .unwrap();
    let shown = String::from_utf8_lossy(&received);
    assert!(shown.contains(&format!("\r\n {:24}Connected", "Display")));

    tasks.shutdown().await;
}

#[tokio::test]
async fn invalid_room_does_not_start() {
    let file = room_file(57, "port = 0");
    let room = Room::new(RoomConfig::load(file.path()).unwrap());
    let err = room.start().await.unwrap_err();
    assert!(err.to_string().contains("[console] port must not be 0"));
}
