//! # nodecast-server
//!
//! Network front of the nodecast broker.
//!
//! - [`transport`]: the [`Connection`] abstraction over raw TCP and WebSocket
//! - [`session`]: one loop per connection, identical for both transports
//! - [`Disposer`]: both listeners, the live client set, `/health`, `/metrics`
//! - [`config`]: defaults, JSON file merge, `NODECAST_*` overrides

#![deny(unsafe_code)]

pub mod clients;
pub mod config;
pub mod disposer;
pub mod error;
pub mod health;
pub mod metrics;
pub mod session;
pub mod shutdown;
pub mod transport;

pub use clients::ClientSet;
pub use config::{ConfigError, ListenerConfig, ServerConfig};
pub use disposer::{BoundAddrs, Disposer};
pub use error::ServerError;
pub use transport::{Connection, ConnectionEvent, TransportError, TransportKind};
