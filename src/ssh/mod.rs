//! SSH module - transports for the session core
//!
//! The session core only sees the [`Connector`] / [`Transport`] /
//! [`ShellStream`] traits. The russh implementation lives here too.
//!
//! # Features
//! - Direct and bastion-routed (Wallix style) connections
//! - Password, key and keyboard-interactive (2FA) authentication
//! - Host key verification with trust-on-first-use
//! - Shell and exec channels over a single handle owner task

mod client;
mod config;
mod error;
mod handle_owner;
pub mod keyboard_interactive;
pub mod known_hosts;
mod session;
mod transport;

pub use client::{ClientHandler, RusshConnector, DEFAULT_KBI_TIMEOUT};
pub use config::{AuthMethod, BastionRoute, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use keyboard_interactive::{Challenge, KbiError, KbiPrompt};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use session::{ShellCommand, ShellHandle, SshSession};
pub use transport::{
    Connector, ExecOutput, PtyRequest, ShellChannel, ShellEvent, ShellStream, Transport,
};
