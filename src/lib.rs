//! # AV Control Runtime
//!
//! Connection health and keep-alive supervision for the devices of an AV
//! control processor: displays, cameras and the like reached over TCP, UDP,
//! serial or a shared VISCA-over-IP socket.
//!
//! ## Crate Structure
//!
//! - **`transport`**: The transport facade (`ClientTransport`, `ServerTransport`)
//!   and its TCP, UDP, serial, VISCA dispatch and in-memory mock implementations.
//! - **`connection`**: Handlers layered over a transport. `ConnectionHandler`
//!   counts unanswered sends for raw callers, `ModuleHandler` supervises a
//!   device module, `ServerHandler` evicts idle clients. All of them poll with
//!   a keep-alive query and reconnect stream links.
//! - **`device`**: The `Driver` trait, the `Device` status table and the Planar
//!   URX and Sony SRG-300 drivers.
//! - **`pubsub`**: In-process event bus.
//! - **`console`**: Telnet-style debug console with logins and bus subscriptions.
//! - **`room`**: Builds a room from configuration and runs it.
//! - **`config`** / **`logging`**: Figment configuration and tracing setup.
//! - **`error`**: The `AvError` type.

pub mod config;
pub mod connection;
pub mod console;
pub mod device;
pub mod error;
pub mod logging;
pub mod pubsub;
pub mod room;
pub mod transport;

pub use connection::{ConnectionHandler, ConnectionStatus, HandlerOptions, ModuleHandler, ServerHandler};
pub use error::{AvError, AvResult};
pub use pubsub::PubSub;
