//! SSH Session management
//!
//! [`SshSession`] is the russh-backed [`Transport`]: it holds the
//! `HandleController` of an authenticated connection and opens shell and exec
//! channels through it. Each shell channel is driven by its own task; the
//! writable side is a [`ShellHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::ChannelMsg;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::error::SshError;
use super::handle_owner::HandleController;
use super::transport::{ExecOutput, PtyRequest, ShellChannel, ShellEvent, ShellStream, Transport};

/// Upper bound for a one-shot command
const EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue depth between callers and the shell task
const SHELL_QUEUE_DEPTH: usize = 1024;

/// Commands that can be sent to a shell channel task
#[derive(Debug)]
pub enum ShellCommand {
    /// Data to send to SSH stdin
    Data(Vec<u8>),
    /// Resize the PTY (cols, rows)
    Resize(u32, u32),
    /// Close the channel
    Close,
}

/// Writable handle to a running shell channel task
pub struct ShellHandle {
    id: String,
    cmd_tx: mpsc::Sender<ShellCommand>,
    /// Shared with the channel task; cleared to stop event delivery
    listening: Arc<AtomicBool>,
    destroyed: AtomicBool,
}

impl ShellStream for ShellHandle {
    fn write(&self, data: &[u8]) -> Result<(), SshError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SshError::StreamClosed);
        }
        self.cmd_tx
            .try_send(ShellCommand::Data(data.to_vec()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    SshError::ChannelError(format!("write queue full for shell {}", self.id))
                }
                mpsc::error::TrySendError::Closed(_) => SshError::StreamClosed,
            })
    }

    fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.cmd_tx
            .try_send(ShellCommand::Resize(cols, rows))
            .map_err(|_| SshError::StreamClosed)
    }

    fn is_writable(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && !self.cmd_tx.is_closed()
    }

    fn remove_all_listeners(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    fn destroy(&self) -> Result<(), SshError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Destroying shell {}", self.id);
        match self.cmd_tx.try_send(ShellCommand::Close) {
            Ok(()) => Ok(()),
            // Task already gone: nothing left to close
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SshError::ChannelError(format!(
                "close request dropped for shell {}",
                self.id
            ))),
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for ShellHandle {
    fn drop(&mut self) {
        // Best-effort: make sure the remote shell goes away with its last handle
        let _ = self.cmd_tx.try_send(ShellCommand::Close);
    }
}

/// Authenticated SSH connection
pub struct SshSession {
    id: String,
    controller: HandleController,
    /// Cleared by `detach_listeners`; every shell opened here observes it
    listening: Arc<AtomicBool>,
}

impl SshSession {
    pub fn new(id: String, controller: HandleController) -> Self {
        Self {
            id,
            controller,
            listening: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[async_trait]
impl Transport for SshSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.controller.is_connected()
    }

    async fn open_shell(&self, pty: &PtyRequest) -> Result<ShellChannel, SshError> {
        let mut channel = self.controller.open_session_channel().await?;

        debug!("Channel opened on {}, requesting PTY", self.id);

        channel
            .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        let shell_id = uuid::Uuid::new_v4().to_string();
        info!("Interactive shell {} started on {}", shell_id, self.id);

        Ok(spawn_shell_task(channel, shell_id, self.listening.clone()))
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        let mut channel = self.controller.open_session_channel().await?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::CommandFailed(format!("exec '{}' failed: {}", command, e)))?;

        let mut output = ExecOutput::default();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let drain = tokio::time::timeout(EXEC_TIMEOUT, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                        stderr.extend_from_slice(&data)
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        output.exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
        })
        .await;

        if drain.is_err() {
            let _ = channel.close().await;
            return Err(SshError::Timeout(format!("command '{}' did not finish", command)));
        }

        output.stdout = String::from_utf8_lossy(&stdout).into_owned();
        output.stderr = String::from_utf8_lossy(&stderr).into_owned();
        Ok(output)
    }

    fn detach_listeners(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.controller.disconnect().await;
    }
}

/// Drive one shell channel until either side closes it
fn spawn_shell_task(
    mut channel: russh::Channel<russh::client::Msg>,
    shell_id: String,
    transport_listening: Arc<AtomicBool>,
) -> ShellChannel {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(SHELL_QUEUE_DEPTH);
    let (event_tx, event_rx) = mpsc::channel::<ShellEvent>(SHELL_QUEUE_DEPTH);
    let listening = Arc::new(AtomicBool::new(true));

    let task_listening = listening.clone();
    let sid = shell_id.clone();
    tokio::spawn(async move {
        debug!("Shell channel handler started for {}", sid);
        let delivering = || {
            task_listening.load(Ordering::SeqCst) && transport_listening.load(Ordering::SeqCst)
        };
        let mut exit_status = None;

        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        ShellCommand::Data(data) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to shell {}: {}", sid, e);
                                break;
                            }
                        }
                        ShellCommand::Resize(cols, rows) => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                // Don't break on resize error, continue
                                warn!("Failed to resize PTY for shell {}: {}", sid, e);
                            } else {
                                debug!("PTY resized to {}x{} for shell {}", cols, rows, sid);
                            }
                        }
                        ShellCommand::Close => {
                            info!("Close command received for shell {}", sid);
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }

                Some(msg) = channel.wait() => {
                    match msg {
                        ChannelMsg::Data { data } => {
                            if delivering() {
                                let _ = event_tx.send(ShellEvent::Data(data.to_vec())).await;
                            }
                        }
                        ChannelMsg::ExtendedData { data, ext } => {
                            // stderr goes to the same terminal
                            if ext == 1 && delivering() {
                                let _ = event_tx.send(ShellEvent::Data(data.to_vec())).await;
                            }
                        }
                        ChannelMsg::ExitStatus { exit_status: status } => {
                            info!("Shell {} exit status {}", sid, status);
                            exit_status = Some(status);
                        }
                        ChannelMsg::Eof => {
                            debug!("Shell {} EOF", sid);
                        }
                        ChannelMsg::Close => {
                            info!("Shell {} closed by remote", sid);
                            break;
                        }
                        _ => {}
                    }
                }

                else => {
                    debug!("Shell {} handler loop ended", sid);
                    break;
                }
            }
        }

        if delivering() {
            let _ = event_tx.send(ShellEvent::Closed { exit_status }).await;
        }
        info!("Shell channel handler terminated for {}", sid);
    });

    ShellChannel {
        stream: Arc::new(ShellHandle {
            id: shell_id,
            cmd_tx,
            listening,
            destroyed: AtomicBool::new(false),
        }),
        events: event_rx,
    }
}
