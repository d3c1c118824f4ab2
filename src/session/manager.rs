//! Connection Manager
//!
//! Owns every service of the session core and routes tab operations to them.
//! One instance is built per application and shared as `Arc<ConnectionManager>`.
//!
//! ```text
//!  open_tab ──▶ AuthStateMachine ──▶ ConnectionPool::acquire ──▶ Connector
//!                     │                        │
//!  handle_input ──────┤ (prompt states)        ▼
//!                     │                  on_transport_ready ──▶ shell + output pump
//!                     ▼
//!              WriteBufferCoordinator ──▶ ShellStream
//!
//!  close_tab ──▶ CleanupCoordinator ──▶ pool.close (last tab only)
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::auth::{AuthStateMachine, ReadyHooks};
use super::cleanup::CleanupCoordinator;
use super::output::{OutputSink, TerminalEvent};
use super::pool::{ConnectionPool, ConnectionPoolStats};
use super::recorder::{InputRecorder, SessionRecorder, Transcript};
use super::types::{
    new_active_connections, ActiveConnections, AuthState, AuthStateKind, Connection,
    ConnectionInfo,
};
use super::write_buffer::{WriteBufferCoordinator, WriteOutcome};
use crate::config::CoreConfig;
use crate::ssh::{AuthMethod, Connector, SshConfig, SshError, Transport};

/// Challenges in flight between a connect attempt and the tab
const CHALLENGE_QUEUE_DEPTH: usize = 4;

/// Parameters for a new tab
#[derive(Debug, Clone)]
pub struct OpenTabRequest {
    pub tab_id: String,
    pub config: SshConfig,
    /// Identifier for disconnect notifications; defaults to `user@host:port`
    pub original_key: Option<String>,
    /// Record the session from the start
    pub record: bool,
}

impl OpenTabRequest {
    pub fn new(tab_id: impl Into<String>, config: SshConfig) -> Self {
        Self {
            tab_id: tab_id.into(),
            config,
            original_key: None,
            record: false,
        }
    }
}

pub struct ConnectionManager {
    config: CoreConfig,
    connector: Arc<dyn Connector>,
    output: Arc<dyn OutputSink>,
    recorder: Arc<SessionRecorder>,
    active: ActiveConnections,
    pool: Arc<ConnectionPool>,
    auth: Arc<AuthStateMachine>,
    write_buffer: WriteBufferCoordinator,
    cleanup: CleanupCoordinator,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        config: CoreConfig,
        connector: Arc<dyn Connector>,
        output: Arc<dyn OutputSink>,
        recorder: Arc<SessionRecorder>,
    ) -> Arc<Self> {
        let active = new_active_connections();
        let pool = Arc::new(ConnectionPool::new());
        let input_recorder: Arc<dyn InputRecorder> = recorder.clone();

        let auth = Arc::new(AuthStateMachine::new(
            &config,
            output.clone(),
            input_recorder.clone(),
        ));
        let write_buffer = WriteBufferCoordinator::new(&config.write_buffer, input_recorder);
        let cleanup = CleanupCoordinator::new(
            active.clone(),
            pool.clone(),
            write_buffer.clone(),
            output.clone(),
        );

        Arc::new(Self {
            config,
            connector,
            output,
            recorder,
            active,
            pool,
            auth,
            write_buffer,
            cleanup,
            sweeper: Mutex::new(None),
        })
    }

    /// Launch background maintenance (orphaned-transport sweeping)
    pub fn start(&self) {
        let interval = self.config.pool.sweep_interval_secs;
        if interval == 0 {
            info!("Pool sweeper disabled");
            return;
        }
        let handle = self
            .pool
            .start_sweeper(self.active.clone(), Duration::from_secs(interval));
        if let Some(old) = self.sweeper.lock().replace(handle) {
            old.abort();
        }
        info!("Pool sweeper started ({}s interval)", interval);
    }

    fn connection(&self, tab_id: &str) -> Result<Arc<Connection>, SshError> {
        self.active
            .get(tab_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SshError::SessionNotFound(tab_id.to_string()))
    }

    // ========================================================================
    // Tab lifecycle
    // ========================================================================

    /// Register a tab and start authenticating it
    pub fn open_tab(self: &Arc<Self>, request: OpenTabRequest) -> Result<(), SshError> {
        let OpenTabRequest {
            tab_id,
            config,
            original_key,
            record,
        } = request;

        let conn = Arc::new(Connection::new(tab_id.clone(), config, original_key));
        match self.active.entry(tab_id.clone()) {
            Entry::Occupied(_) => return Err(SshError::SessionExists(tab_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(conn.clone());
            }
        }
        info!(
            "Opening tab {} for {} (transport {})",
            tab_id, conn.original_key, conn.cache_key
        );

        if record {
            self.recorder.start(
                &tab_id,
                &conn.config.host,
                &conn.config.username,
                conn.config.cols,
                conn.config.rows,
            );
        }

        // A pooled transport needs no credentials
        let has_password =
            !conn.config.needs_password_prompt() || self.pool.contains_live(&conn.cache_key);
        self.auth.initialize(&conn, has_password);

        if has_password {
            self.spawn_attempt(conn, None);
        } else {
            self.auth
                .enable_manual_password_prompt(&conn, self.auth.password_prompt());
        }
        Ok(())
    }

    /// Tear down a tab. Returns false if it was unknown or a step failed.
    pub fn close_tab(&self, tab_id: &str) -> bool {
        let closed = self.cleanup.cleanup_connection(tab_id);
        if let Some(transcript) = self.recorder.stop(tab_id) {
            self.publish_transcript(tab_id, &transcript);
        }
        closed
    }

    /// Close every tab and transport
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let closing = self.cleanup.cleanup_all();
        info!("Shutting down, closing {} transport(s)", closing.len());
        for handle in closing {
            if let Err(e) = handle.await {
                warn!("Transport close task failed: {}", e);
            }
        }
    }

    // ========================================================================
    // Connect attempts
    // ========================================================================

    fn spawn_attempt(self: &Arc<Self>, conn: Arc<Connection>, password: Option<String>) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_attempt(conn, password).await;
        });
    }

    async fn run_attempt(self: &Arc<Self>, conn: Arc<Connection>, password: Option<String>) {
        let (challenge_tx, challenge_rx) = mpsc::channel(CHALLENGE_QUEUE_DEPTH);
        let challenge_feed = self
            .auth
            .setup_keyboard_interactive(conn.clone(), challenge_rx);

        let connector = self.connector.clone();
        let config = conn.config.clone();
        debug!("Connecting tab {} via {}", conn.tab_id, conn.cache_key);
        let result = self
            .pool
            .acquire(&conn.cache_key, move || async move {
                connector.connect(&config, password, challenge_tx).await
            })
            .await;

        // The feed ends once the attempt has dropped its sender
        let challenges_shown = challenge_feed.await.unwrap_or(0);

        if conn.is_closing() || !self.active.contains_key(&conn.tab_id) {
            debug!("Tab {} closed while connecting", conn.tab_id);
            if result.is_ok() && self.pool.release(&conn.cache_key, &conn.tab_id, &self.active) == 0
            {
                self.pool.close(&conn.cache_key);
            }
            return;
        }

        match result {
            Ok(transport) => self.on_connected(&conn, transport).await,
            Err(e) => self.on_attempt_failed(&conn, e, challenges_shown),
        }
    }

    async fn on_connected(self: &Arc<Self>, conn: &Arc<Connection>, transport: Arc<dyn Transport>) {
        conn.set_transport(transport.clone());

        let manager: Weak<Self> = Arc::downgrade(self);
        let tab_id = conn.tab_id.clone();
        let write_buffer = self.write_buffer.clone();
        let weak_conn = Arc::downgrade(conn);
        let hooks = ReadyHooks::new(move || {
            if let Some(manager) = manager.upgrade() {
                info!("Remote side closed the shell of tab {}", tab_id);
                manager.close_tab(&tab_id);
            }
        })
        .with_on_shell(move || {
            // Input typed while connecting goes out as soon as the shell exists
            if let Some(conn) = weak_conn.upgrade().filter(|c| !c.is_closing()) {
                write_buffer.flush(&conn);
            }
        });

        match self.auth.on_transport_ready(transport, conn, hooks).await {
            Ok(_) if conn.is_closing() => {
                // Closed while the shell was opening; cleanup missed this stream
                conn.detach_output_pump();
                if let Some(stream) = conn.take_stream() {
                    stream.remove_all_listeners();
                    if let Err(e) = stream.destroy() {
                        debug!("Late stream for tab {} failed to close: {}", conn.tab_id, e);
                    }
                }
            }
            Ok(_) => self.start_stats_timer(conn),
            Err(e) => {
                // The prompt is back; make the retry dial a fresh transport
                debug!("Dropping transport of tab {} after shell failure: {}", conn.tab_id, e);
                conn.take_transport();
                if self.pool.release(&conn.cache_key, &conn.tab_id, &self.active) == 0 {
                    self.pool.close(&conn.cache_key);
                }
            }
        }
    }

    fn on_attempt_failed(self: &Arc<Self>, conn: &Arc<Connection>, err: SshError, challenges_shown: usize) {
        if !self.auth.classify_auth_error(&err) {
            error!("Connection failed for tab {}: {}", conn.tab_id, err);
            self.fail(conn, err.to_string());
            return;
        }

        warn!("Authentication failed for tab {}: {}", conn.tab_id, err);
        match &conn.config.auth {
            AuthMethod::Password { .. } => {
                self.auth
                    .enable_manual_password_prompt(conn, &self.auth.retry_prompt());
            }
            AuthMethod::KeyboardInteractive if challenges_shown > 0 => {
                self.output.send(
                    &conn.tab_id,
                    TerminalEvent::data(format!("\r\n{}", self.config.auth.retry_message)),
                );
                self.spawn_attempt(conn.clone(), None);
            }
            AuthMethod::KeyboardInteractive | AuthMethod::Key { .. } => {
                self.fail(conn, err.to_string());
            }
        }
    }

    fn fail(&self, conn: &Connection, message: String) {
        conn.set_auth_state(AuthState::Failed(message.clone()));
        self.output.send(&conn.tab_id, TerminalEvent::error(message));
    }

    fn start_stats_timer(&self, conn: &Arc<Connection>) {
        let secs = self.config.session.stats_interval_secs;
        if secs == 0 {
            return;
        }
        let weak = Arc::downgrade(conn);
        let output = self.output.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                output.send(
                    &conn.tab_id,
                    TerminalEvent::Stats {
                        bytes_in: conn.bytes_in(),
                        bytes_out: conn.bytes_out(),
                    },
                );
            }
        });
        conn.set_stats_timer(handle);
    }

    // ========================================================================
    // Terminal I/O
    // ========================================================================

    /// Route keystrokes from the tab
    pub fn handle_input(self: &Arc<Self>, tab_id: &str, data: &[u8]) -> Result<(), SshError> {
        let conn = self.connection(tab_id)?;

        match conn.auth_state() {
            AuthStateKind::AwaitingManualPassword => {
                let text = String::from_utf8_lossy(data);
                if let Some(password) = self.auth.process_manual_password_keystroke(&conn, &text) {
                    self.spawn_attempt(conn, Some(password));
                }
                return Ok(());
            }
            AuthStateKind::AwaitingKeyboardInteractive => {
                let text = String::from_utf8_lossy(data);
                if self.auth.process_keyboard_interactive_keystroke(&conn, &text) {
                    return Ok(());
                }
            }
            _ => {}
        }

        if self.write_buffer.write(&conn, data) == WriteOutcome::Handled {
            return Ok(());
        }

        let Some(stream) = conn.stream() else {
            debug!("Dropping {} bytes for tab {}: shell not open", data.len(), tab_id);
            return Ok(());
        };
        stream.write(data)?;
        conn.add_bytes_out(data.len());
        if self.recorder.is_recording(tab_id) {
            self.recorder
                .record_input(tab_id, &String::from_utf8_lossy(data));
        }
        Ok(())
    }

    pub fn resize(&self, tab_id: &str, cols: u32, rows: u32) -> Result<(), SshError> {
        let conn = self.connection(tab_id)?;
        match conn.stream() {
            Some(stream) => stream.resize(cols, rows),
            None => {
                debug!("Resize for tab {} ignored: shell not open", tab_id);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Recording
    // ========================================================================

    pub fn start_recording(&self, tab_id: &str) -> Result<bool, SshError> {
        let conn = self.connection(tab_id)?;
        Ok(self.recorder.start(
            tab_id,
            &conn.config.host,
            &conn.config.username,
            conn.config.cols,
            conn.config.rows,
        ))
    }

    /// Finish a recording and publish it to the tab
    pub fn stop_recording(&self, tab_id: &str) -> Option<Transcript> {
        let transcript = self.recorder.stop(tab_id)?;
        self.publish_transcript(tab_id, &transcript);
        Some(transcript)
    }

    fn publish_transcript(&self, tab_id: &str, transcript: &Transcript) {
        match transcript.to_asciicast() {
            Ok(asciicast) => self
                .output
                .send(tab_id, TerminalEvent::Recording { asciicast }),
            Err(e) => warn!("Failed to export recording of tab {}: {}", tab_id, e),
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn connection_info(&self, tab_id: &str) -> Option<ConnectionInfo> {
        self.active.get(tab_id).map(|e| e.value().info())
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> =
            self.active.iter().map(|e| e.value().info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.tab_id.cmp(&b.tab_id)));
        infos
    }

    pub fn pool_stats(&self) -> ConnectionPoolStats {
        self.pool.stats(&self.active)
    }
}
