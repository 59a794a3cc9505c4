//! Room runner: builds the configured devices, supervises each with a
//! [`ModuleHandler`], mirrors their statuses onto the event bus and serves
//! the debug console.
//!
//! Every status change of a device is published on the bus under the device
//! name as `{"command": ..., "value": ..., "qualifier": {...}}`. Connection
//! changes use the `ConnectionStatus` command.

use crate::config::{DeviceConfig, DriverKind, RoomConfig, TransportConfig};
use crate::connection::{ConnectionStatus, ModuleHandler, ServerHandler};
use crate::console::{AccessLevel, Console, CustomCommand};
use crate::device::{CommandId, Device, Driver, PlanarUrx, Qualifier, SonySrg300, Value};
use crate::error::{AvError, AvResult};
use crate::pubsub::PubSub;
use crate::transport::{ClientTransport, TcpClient, TcpServer, UdpClient, UdpDispatcher};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Transport type used for configured devices.
pub type DynTransport = Box<dyn ClientTransport>;

/// Last known connection status of every device, by name.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<Mutex<BTreeMap<String, ConnectionStatus>>>,
}

impl StatusBoard {
    pub fn set(&self, device: &str, status: ConnectionStatus) {
        self.inner.lock().insert(device.to_string(), status);
    }

    #[must_use]
    pub fn get(&self, device: &str) -> Option<ConnectionStatus> {
        self.inner.lock().get(device).copied()
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ConnectionStatus> {
        self.inner.lock().clone()
    }

    /// One line per device, for the console.
    #[must_use]
    pub fn render(&self) -> String {
        let board = self.inner.lock();
        if board.is_empty() {
            return "No devices.".to_string();
        }
        let mut text = String::new();
        for (name, status) in board.iter() {
            let _ = write!(text, "\r\n {name:24}{status}");
        }
        text
    }
}

/// Publish every status of `handler` on `bus` under `name`, and keep `board`
/// current with its connection status.
pub fn publish_statuses<D, T>(handler: &mut ModuleHandler<D, T>, name: &str, bus: &PubSub, board: &StatusBoard)
where
    D: Driver,
    T: ClientTransport + 'static,
{
    board.set(name, handler.status());
    let connection = D::Command::CONNECTION_STATUS;
    for command in D::Command::all().iter().copied() {
        let bus = bus.clone();
        let board = board.clone();
        let device = name.to_string();
        handler.subscribe_status(command, &Qualifier::new(), move |command, value, qualifier| {
            if command == connection {
                if let Ok(status) = value.to_string().parse::<ConnectionStatus>() {
                    board.set(&device, status);
                }
            }
            bus.trigger(&device, status_event(command, value, qualifier));
        });
    }
}

fn status_event<C: CommandId>(command: C, value: &Value, qualifier: &Qualifier) -> serde_json::Value {
    json!({
        "command": command.to_string(),
        "value": serde_json::Value::from(value.clone()),
        "qualifier": serde_json::to_value(qualifier).unwrap_or_default(),
    })
}

/// Wrap `transport` in a device and its handler, as configured.
pub fn supervise<D, T>(
    config: &RoomConfig,
    device_config: &DeviceConfig,
    driver: D,
    transport: T,
) -> AvResult<ModuleHandler<D, T>>
where
    D: Driver,
    T: ClientTransport + 'static,
{
    let keep_alive = device_config.keep_alive();
    let command: D::Command = keep_alive.command.parse()?;
    let mut device = Device::new(device_config.name.clone(), driver, transport);
    if device_config.unidirectional {
        device = device.unidirectional();
    }
    let mut handler = ModuleHandler::new(device, &config.handlers, (command, keep_alive.qualifier))?;
    let name = device_config.name.clone();
    handler.on_connect_failed(move |_, reason| warn!(device = %name, %reason, "device unreachable"));
    Ok(handler)
}

/// Running room tasks. Dropping this stops them.
#[derive(Debug)]
pub struct RoomTasks {
    tasks: JoinSet<()>,
    _dispatcher: Option<UdpDispatcher>,
}

impl RoomTasks {
    /// Number of spawned tasks still running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Abort everything and wait for the tasks to finish.
    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
    }
}

/// A configured room.
#[derive(Debug)]
pub struct Room {
    config: RoomConfig,
    bus: PubSub,
    board: StatusBoard,
}

impl Room {
    #[must_use]
    pub fn new(config: RoomConfig) -> Self {
        Self {
            config,
            bus: PubSub::new(),
            board: StatusBoard::default(),
        }
    }

    #[must_use]
    pub fn bus(&self) -> &PubSub {
        &self.bus
    }

    #[must_use]
    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// Open every device and the console and spawn their handlers.
    pub async fn start(&self) -> AvResult<RoomTasks> {
        self.config.validate()?;
        let dispatcher = if self.config.uses_visca() {
            Some(UdpDispatcher::bind(self.config.visca.port).await?)
        } else {
            None
        };

        let mut tasks = JoinSet::new();
        for device_config in &self.config.devices {
            let transport = open_transport(&device_config.transport, dispatcher.as_ref()).await?;
            match device_config.driver {
                DriverKind::PlanarUrx => {
                    self.spawn_device(&mut tasks, device_config, PlanarUrx::new()?, transport)?;
                }
                DriverKind::SonySrg300 => {
                    self.spawn_device(&mut tasks, device_config, SonySrg300::new(), transport)?;
                }
            }
        }

        if self.config.console.enabled {
            let console = Console::new(&self.config.console, Some(self.bus.clone()));
            let board = self.board.clone();
            console.register_command(CustomCommand::new(
                "devices",
                "Show the connection status of every device.",
                "Usage: devices",
                AccessLevel::User,
                move |_| board.render(),
            ))?;
            let server = TcpServer::new(self.config.console.port);
            let handler = ServerHandler::new(server, &self.config.handlers)?;
            tasks.spawn(console.serve(handler));
        }

        info!(
            room = %self.config.application.name,
            devices = self.config.devices.len(),
            console = self.config.console.enabled,
            "room started"
        );
        self.bus.trigger(
            "System",
            json!({ "event": "startup", "msg": format!("{} started.", self.config.application.name) }),
        );
        Ok(RoomTasks {
            tasks,
            _dispatcher: dispatcher,
        })
    }

    /// Start the room and run until Ctrl-C.
    pub async fn run(self) -> AvResult<()> {
        let tasks = self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        tasks.shutdown().await;
        Ok(())
    }

    fn spawn_device<D: Driver>(
        &self,
        tasks: &mut JoinSet<()>,
        device_config: &DeviceConfig,
        driver: D,
        transport: DynTransport,
    ) -> AvResult<()> {
        let mut handler = supervise(&self.config, device_config, driver, transport)?;
        publish_statuses(&mut handler, &device_config.name, &self.bus, &self.board);
        tasks.spawn(async move {
            handler.connect().await;
            handler.run().await;
        });
        Ok(())
    }
}

async fn open_transport(config: &TransportConfig, dispatcher: Option<&UdpDispatcher>) -> AvResult<DynTransport> {
    Ok(match config {
        TransportConfig::Tcp { host, port } => Box::new(TcpClient::new(host.clone(), *port)),
        TransportConfig::Udp {
            host,
            port,
            local_port,
        } => Box::new(UdpClient::open(&format!("{host}:{port}"), *local_port).await?),
        TransportConfig::Serial { path, baud_rate } => open_serial(path, *baud_rate)?,
        TransportConfig::Visca { host, port } => {
            let dispatcher = dispatcher
                .ok_or_else(|| AvError::Configuration("VISCA dispatcher is not running".to_string()))?;
            let remote = tokio::net::lookup_host((host.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| AvError::Configuration(format!("cannot resolve {host}")))?;
            Box::new(dispatcher.endpoint(remote)?)
        }
    })
}

#[cfg(feature = "serial")]
fn open_serial(path: &str, baud_rate: u32) -> AvResult<DynTransport> {
    Ok(Box::new(crate::transport::SerialClient::open(path, baud_rate)?))
}

#[cfg(not(feature = "serial"))]
fn open_serial(path: &str, _baud_rate: u32) -> AvResult<DynTransport> {
    Err(AvError::Configuration(format!(
        "serial port {path}: built without the `serial` feature"
    )))
}
