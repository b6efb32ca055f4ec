//! # tor-provider
//!
//! A control-port client, process supervisor, and state provider for a
//! local Tor daemon.
//!
//! This crate covers three layers that usually travel together in an
//! application embedding the daemon:
//!
//! - A **control-port client** ([`TorController`] over [`ControlSocket`]):
//!   an async client for the daemon's line-oriented control protocol, with
//!   a command queue that serializes concurrent callers onto one
//!   connection and routes replies and asynchronous events correctly.
//! - A **process supervisor** ([`TorProcess`]): launches the daemon with
//!   deterministic arguments, repairs conflicting port options in its
//!   configuration file, drains its output, and reports unexpected exit.
//! - A **provider** ([`TorProvider`]): ties the two together, retries the
//!   control connection with exponential backoff, folds bootstrap,
//!   circuit, and bridge events into state, and broadcasts typed events to
//!   the rest of the application.
//!
//! ## Quick start: owning the daemon
//!
//! ```rust,no_run
//! use tor_provider::{TorProvider, TorProviderConfig, TorProviderEvent};
//!
//! #[tokio::main]
//! async fn main() -> tor_provider::Result<()> {
//!     let config = TorProviderConfig::new()
//!         .executable("/usr/bin/tor")
//!         .torrc("/var/lib/tor-app/torrc")
//!         .data_dir("/var/lib/tor-app")
//!         .start_disabled(true);
//!
//!     let provider = TorProvider::new(config);
//!     let mut events = provider.subscribe();
//!
//!     provider.init().await?;
//!     provider.begin_bootstrap().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let TorProviderEvent::BootstrapStatus(status) = event {
//!             println!("bootstrap: {}% ({})", status.progress, status.tag);
//!             if status.is_done() {
//!                 break;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Talking to an already-running daemon
//!
//! ```rust,no_run
//! use tor_provider::{AuthCredential, ControlAddress, TorController};
//!
//! # async fn example() -> tor_provider::Result<()> {
//! let controller = TorController::open(&ControlAddress::tcp("127.0.0.1", 9051)).await?;
//! controller
//!     .authenticate(&AuthCredential::Password("secret".to_string()))
//!     .await?;
//!
//! let version = controller.get_version().await?;
//! println!("connected to {}", version);
//!
//! for bridge in controller.get_bridges().await? {
//!     println!("bridge: {}", bridge);
//! }
//!
//! controller.newnym().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Connection discovery
//!
//! `init` resolves where the control port lives and how to authenticate.
//! The environment variables `TOR_CONTROL_HOST`, `TOR_CONTROL_PORT`,
//! `TOR_CONTROL_IPC_PATH`, `TOR_CONTROL_PASSWD`, and
//! `TOR_CONTROL_COOKIE_AUTH_FILE` override configured values, and a
//! Unix-domain socket is preferred over TCP where the platform has them.
//!
//! ## Concurrency model
//!
//! One pump task per connection reads messages continuously. Callers may
//! issue commands concurrently from any task; each command is queued and
//! serviced strictly in submission order, with exactly one on the wire at
//! a time. Event handlers run on the pump task and hand their work to the
//! provider's event loop, which may itself issue controller commands.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod process;
pub mod protocol;
pub mod provider;
pub mod socket;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use auth::AuthCredential;
pub use config::{
    resolve_control_connection, ControlAddress, ControlConnection, TorProviderConfig,
};
pub use controller::{SettingsCache, TorController};
pub use error::{Result, TorError};
pub use events::{
    CircuitEvent, CircuitStatus, ControlEvent, EventType, StreamEvent, StreamStatus,
    TorProviderEvent,
};
pub use process::{TorProcess, TorProcessStatus};
pub use protocol::{
    escape_string, parse_bootstrap_status, parse_bridge_line, unescape_string, MessageBuilder,
    Reply,
};
pub use provider::TorProvider;
pub use socket::ControlSocket;
pub use transport::Transport;
pub use types::{
    BootstrapStatus, BridgeLine, CircuitId, ConfValue, Fingerprint, NodeData, OnionAuthKey,
    Signal, StatusSeverity,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
