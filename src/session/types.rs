//! Session types
//!
//! 每个终端标签页对应一个 [`Connection`]。多个标签页可以通过相同的
//! `cache_key` 共享同一个已认证的 [`Transport`]，但每个标签页拥有
//! 自己的 shell 流、认证状态和写缓冲。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::ssh::keyboard_interactive::Challenge;
use crate::ssh::{ShellStream, SshConfig, Transport};

/// 活跃连接表：tab_id -> Connection
pub type ActiveConnections = Arc<DashMap<String, Arc<Connection>>>;

/// Create an empty active-connection map
pub fn new_active_connections() -> ActiveConnections {
    Arc::new(DashMap::new())
}

/// Remote host facts resolved once the shell is up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub hostname: String,
    pub os_id: String,
}

/// Keyboard-interactive round in progress
#[derive(Debug)]
pub struct KbiProgress {
    pub(crate) challenge: Challenge,
    /// Answers collected so far; its length is the index of the active prompt
    pub(crate) responses: Vec<String>,
    pub(crate) buffer: String,
}

impl KbiProgress {
    pub(crate) fn new(challenge: Challenge) -> Self {
        Self {
            challenge,
            responses: Vec::new(),
            buffer: String::new(),
        }
    }

    pub fn current_prompt(&self) -> usize {
        self.responses.len()
    }
}

/// Per-tab authentication state.
///
/// Only the two `Awaiting*` variants intercept keystrokes; each carries the
/// data it needs, so there is no stale buffer once the state moves on.
#[derive(Debug, Default)]
pub enum AuthState {
    /// Credentials are available (stored, cached, or already submitted)
    #[default]
    NoAuthNeeded,
    /// Collecting a password typed into the terminal
    AwaitingManualPassword { prompt: String, buffer: String },
    /// Answering a server challenge, one prompt at a time
    AwaitingKeyboardInteractive(KbiProgress),
    /// Shell is open
    Authenticated,
    /// Gave up; the message has been shown to the user
    Failed(String),
}

impl AuthState {
    pub fn kind(&self) -> AuthStateKind {
        match self {
            AuthState::NoAuthNeeded => AuthStateKind::NoAuthNeeded,
            AuthState::AwaitingManualPassword { .. } => AuthStateKind::AwaitingManualPassword,
            AuthState::AwaitingKeyboardInteractive(_) => AuthStateKind::AwaitingKeyboardInteractive,
            AuthState::Authenticated => AuthStateKind::Authenticated,
            AuthState::Failed(_) => AuthStateKind::Failed,
        }
    }
}

/// Data-free view of [`AuthState`] for callers and status reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStateKind {
    NoAuthNeeded,
    AwaitingManualPassword,
    AwaitingKeyboardInteractive,
    Authenticated,
    Failed,
}

/// Input held back for a bastion-routed tab
#[derive(Debug, Default)]
pub struct WriteBuffer {
    pub(crate) bytes: Vec<u8>,
    pub(crate) flush_timer: Option<JoinHandle<()>>,
}

/// 单个标签页的连接状态
///
/// # 锁获取顺序约定
///
/// 需要同时持有多个锁时按以下顺序获取：
///
/// 1. `auth`
/// 2. `write_buffer`
/// 3. `stream`
/// 4. `transport`
/// 5. `stats_timer` / `output_pump` / `metadata`
///
/// 各方法只获取单个锁，且不会跨 `.await` 持有。
pub struct Connection {
    /// 标签页 ID
    pub tab_id: String,

    /// 连接池键（同一键的标签页共享 transport）
    pub cache_key: String,

    /// 断开通知使用的稳定标识
    pub original_key: String,

    /// 是否经由堡垒机路由（启用写缓冲）
    pub bastion_routed: bool,

    /// 连接配置
    pub config: SshConfig,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    transport: Mutex<Option<Arc<dyn Transport>>>,
    stream: Mutex<Option<Arc<dyn ShellStream>>>,
    pub(crate) auth: Mutex<AuthState>,
    pub(crate) write_buffer: Mutex<WriteBuffer>,
    stats_timer: Mutex<Option<JoinHandle<()>>>,
    output_pump: Mutex<Option<JoinHandle<()>>>,
    metadata: Mutex<Option<SessionMetadata>>,

    bytes_in: AtomicU64,
    bytes_out: AtomicU64,

    /// 清理开始后置位，保证清理只执行一次
    closing: AtomicBool,
}

impl Connection {
    /// Build a connection for `tab_id`. Without an explicit `original_key`
    /// the `user@host:port` of the config is used.
    pub fn new(tab_id: impl Into<String>, config: SshConfig, original_key: Option<String>) -> Self {
        Self {
            tab_id: tab_id.into(),
            cache_key: config.cache_key(),
            original_key: original_key.unwrap_or_else(|| config.original_key()),
            bastion_routed: config.is_bastion_routed(),
            config,
            created_at: Utc::now(),
            transport: Mutex::new(None),
            stream: Mutex::new(None),
            auth: Mutex::new(AuthState::NoAuthNeeded),
            write_buffer: Mutex::new(WriteBuffer::default()),
            stats_timer: Mutex::new(None),
            output_pump: Mutex::new(None),
            metadata: Mutex::new(None),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // Transport / stream
    // ========================================================================

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock() = Some(transport);
    }

    pub fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().take()
    }

    pub fn stream(&self) -> Option<Arc<dyn ShellStream>> {
        self.stream.lock().clone()
    }

    pub fn set_stream(&self, stream: Arc<dyn ShellStream>) {
        *self.stream.lock() = Some(stream);
    }

    pub fn take_stream(&self) -> Option<Arc<dyn ShellStream>> {
        self.stream.lock().take()
    }

    // ========================================================================
    // Auth
    // ========================================================================

    pub fn auth_state(&self) -> AuthStateKind {
        self.auth.lock().kind()
    }

    /// Replace the auth state. Dropping a pending challenge cancels it.
    pub fn set_auth_state(&self, state: AuthState) {
        *self.auth.lock() = state;
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    pub fn set_stats_timer(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.stats_timer.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn set_output_pump(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.output_pump.lock().replace(handle) {
            old.abort();
        }
    }

    /// Abort the flush and stats timers
    pub fn cancel_timers(&self) {
        if let Some(timer) = self.write_buffer.lock().flush_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.stats_timer.lock().take() {
            timer.abort();
        }
    }

    /// Stop forwarding shell output for this tab
    pub fn detach_output_pump(&self) {
        if let Some(pump) = self.output_pump.lock().take() {
            pump.abort();
        }
    }

    pub fn has_pending_flush(&self) -> bool {
        self.write_buffer.lock().flush_timer.is_some()
    }

    pub fn buffered_len(&self) -> usize {
        self.write_buffer.lock().bytes.len()
    }

    // ========================================================================
    // Metadata / counters
    // ========================================================================

    pub fn metadata(&self) -> Option<SessionMetadata> {
        self.metadata.lock().clone()
    }

    pub fn set_metadata(&self, metadata: SessionMetadata) {
        *self.metadata.lock() = Some(metadata);
    }

    pub fn add_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Mark the connection as closing. Returns false if it already was.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Snapshot for status displays
    pub fn info(&self) -> ConnectionInfo {
        let metadata = self.metadata();
        ConnectionInfo {
            tab_id: self.tab_id.clone(),
            cache_key: self.cache_key.clone(),
            original_key: self.original_key.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            bastion_routed: self.bastion_routed,
            auth_state: self.auth_state(),
            shell_open: self.stream.lock().is_some(),
            hostname: metadata.as_ref().map(|m| m.hostname.clone()),
            os_id: metadata.map(|m| m.os_id),
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("tab_id", &self.tab_id)
            .field("cache_key", &self.cache_key)
            .field("original_key", &self.original_key)
            .field("bastion_routed", &self.bastion_routed)
            .finish_non_exhaustive()
    }
}

/// 连接信息（用于前端显示）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub tab_id: String,
    pub cache_key: String,
    pub original_key: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub bastion_routed: bool,
    pub auth_state: AuthStateKind,
    pub shell_open: bool,
    pub hostname: Option<String>,
    pub os_id: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{AuthMethod, BastionRoute};

    fn bastion_config() -> SshConfig {
        SshConfig {
            host: "db01".to_string(),
            username: "alice".to_string(),
            auth: AuthMethod::password("secret"),
            bastion: Some(BastionRoute {
                host: "wallix".to_string(),
                port: 22,
                username: "jdoe".to_string(),
                protocol: "SSH".to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_keys_derived_from_config() {
        let conn = Connection::new("tab-1", bastion_config(), None);
        assert!(conn.bastion_routed);
        assert_eq!(conn.original_key, "alice@db01:22");
        assert_eq!(conn.cache_key, conn.config.cache_key());
    }

    #[test]
    fn test_explicit_original_key() {
        let conn = Connection::new("tab-1", SshConfig::default(), Some("saved-42".to_string()));
        assert_eq!(conn.original_key, "saved-42");
        assert!(!conn.bastion_routed);
    }

    #[test]
    fn test_begin_close_once() {
        let conn = Connection::new("tab-1", SshConfig::default(), None);
        assert!(conn.begin_close());
        assert!(!conn.begin_close());
        assert!(conn.is_closing());
    }

    #[test]
    fn test_auth_state_kind() {
        let conn = Connection::new("tab-1", SshConfig::default(), None);
        assert_eq!(conn.auth_state(), AuthStateKind::NoAuthNeeded);
        conn.set_auth_state(AuthState::AwaitingManualPassword {
            prompt: "Password: ".to_string(),
            buffer: String::new(),
        });
        assert_eq!(conn.auth_state(), AuthStateKind::AwaitingManualPassword);
        assert_eq!(conn.info().auth_state, AuthStateKind::AwaitingManualPassword);
    }
}
