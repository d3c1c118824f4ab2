//! Transport abstraction consumed by the session core
//!
//! The core never touches russh directly. It sees:
//! - [`Connector`]: dials and authenticates, delivering keyboard-interactive
//!   rounds as [`Challenge`]s
//! - [`Transport`]: one authenticated connection, shareable across tabs
//! - [`ShellStream`]: one interactive shell channel, owned by a single tab

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::config::SshConfig;
use super::error::SshError;
use super::keyboard_interactive::Challenge;

/// PTY parameters for an interactive shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl PtyRequest {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols,
            rows,
        }
    }
}

/// Captured result of a one-shot remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Events delivered by a shell channel, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// stdout or stderr bytes
    Data(Vec<u8>),
    /// The remote side closed the channel
    Closed { exit_status: Option<u32> },
}

/// An opened shell: the writable stream plus its event feed
pub struct ShellChannel {
    pub stream: Arc<dyn ShellStream>,
    pub events: mpsc::Receiver<ShellEvent>,
}

/// Writable side of an interactive shell channel.
///
/// All methods are synchronous and non-blocking; implementations enqueue work
/// to the task that owns the channel.
pub trait ShellStream: Send + Sync {
    /// Queue bytes for the remote stdin
    fn write(&self, data: &[u8]) -> Result<(), SshError>;

    /// Queue a window-change request
    fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError>;

    /// True while writes can still be delivered
    fn is_writable(&self) -> bool;

    /// Stop delivering events to the current event receiver
    fn remove_all_listeners(&self);

    /// Close the channel. Idempotent.
    fn destroy(&self) -> Result<(), SshError>;

    fn is_destroyed(&self) -> bool;
}

/// One authenticated connection to a remote endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier for logging
    fn id(&self) -> &str;

    /// False once the underlying connection is gone
    fn is_alive(&self) -> bool;

    /// Open a PTY-backed interactive shell
    async fn open_shell(&self, pty: &PtyRequest) -> Result<ShellChannel, SshError>;

    /// Run a command and capture stdout/stderr/exit code
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError>;

    /// Stop delivering events from any channel opened on this transport
    fn detach_listeners(&self);

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Dials and authenticates transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish an authenticated transport.
    ///
    /// `password` overrides the configured password (set after a terminal
    /// prompt). Keyboard-interactive rounds are sent on `challenges`; the call
    /// resolves once the server accepts or rejects the answers.
    async fn connect(
        &self,
        config: &SshConfig,
        password: Option<String>,
        challenges: mpsc::Sender<Challenge>,
    ) -> Result<Arc<dyn Transport>, SshError>;
}
