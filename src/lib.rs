//! termbridge - SSH connection lifecycle core for tabbed terminal clients
//!
//! Multiplexes terminal tabs onto pooled SSH transports, drives password and
//! keyboard-interactive authentication through the terminal itself, coalesces
//! input for bastion-routed tabs and tears connections down without touching
//! transports other tabs still use.
//!
//! ```no_run
//! use std::sync::Arc;
//! use termbridge::config::ConfigStorage;
//! use termbridge::session::{ChannelOutput, ConnectionManager, OpenTabRequest, SessionRecorder};
//! use termbridge::ssh::{AuthMethod, KnownHostsStore, RusshConnector, SshConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! termbridge::init_logging();
//! let config = ConfigStorage::new()?.load().await?;
//! let connector = Arc::new(RusshConnector::from_config(
//!     &config.auth,
//!     Arc::new(KnownHostsStore::new()),
//! ));
//! let (output, _events) = ChannelOutput::new();
//! let manager = ConnectionManager::new(
//!     config,
//!     connector,
//!     Arc::new(output),
//!     Arc::new(SessionRecorder::new()),
//! );
//! manager.start();
//!
//! let ssh = SshConfig {
//!     host: "db01".into(),
//!     username: "alice".into(),
//!     auth: AuthMethod::password(""),
//!     ..Default::default()
//! };
//! manager.open_tab(OpenTabRequest::new("tab-1", ssh))?;
//! manager.handle_input("tab-1", b"secret\r")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod session;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConfigStorage, CoreConfig};
pub use session::{ConnectionManager, OpenTabRequest, OutputSink, TerminalEvent};
pub use ssh::{Connector, SshConfig, SshError, Transport};

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
///
/// Does nothing if a subscriber is already installed.
pub fn init_logging() {
    let result = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
