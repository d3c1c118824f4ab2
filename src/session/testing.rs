//! In-crate test doubles for the session core

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::output::{DisconnectEvent, OutputSink, TerminalEvent};
use super::types::Connection;
use crate::ssh::keyboard_interactive::{Challenge, KbiPrompt};
use crate::ssh::{
    AuthMethod, BastionRoute, Connector, ExecOutput, PtyRequest, ShellChannel, ShellEvent,
    ShellStream, SshConfig, SshError, Transport,
};

// ============================================================================
// Shell stream
// ============================================================================

#[derive(Default)]
pub struct MockStream {
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<(u32, u32)>>,
    destroyed: AtomicBool,
    listeners_removed: AtomicBool,
    pub destroy_calls: AtomicUsize,
    fail_destroy: bool,
}

impl MockStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A stream whose `destroy` always errors
    pub fn failing_destroy() -> Arc<Self> {
        Arc::new(Self {
            fail_destroy: true,
            ..Default::default()
        })
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn written(&self) -> Vec<u8> {
        self.writes.lock().concat()
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.resizes.lock().clone()
    }

    pub fn listeners_removed(&self) -> bool {
        self.listeners_removed.load(Ordering::SeqCst)
    }
}

impl ShellStream for MockStream {
    fn write(&self, data: &[u8]) -> Result<(), SshError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SshError::StreamClosed);
        }
        self.writes.lock().push(data.to_vec());
        Ok(())
    }

    fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.resizes.lock().push((cols, rows));
        Ok(())
    }

    fn is_writable(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
    }

    fn remove_all_listeners(&self) {
        self.listeners_removed.store(true, Ordering::SeqCst);
    }

    fn destroy(&self) -> Result<(), SshError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy {
            return Err(SshError::ChannelError("destroy failed".to_string()));
        }
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct MockTransport {
    id: String,
    alive: AtomicBool,
    fail_shell: AtomicBool,
    pub close_calls: AtomicUsize,
    pub detach_calls: AtomicUsize,
    streams: Mutex<Vec<Arc<MockStream>>>,
    event_senders: Mutex<Vec<mpsc::Sender<ShellEvent>>>,
    exec_results: Mutex<HashMap<String, ExecOutput>>,
}

impl MockTransport {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            alive: AtomicBool::new(true),
            fail_shell: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            detach_calls: AtomicUsize::new(0),
            streams: Mutex::new(Vec::new()),
            event_senders: Mutex::new(Vec::new()),
            exec_results: Mutex::new(HashMap::new()),
        })
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn fail_shell(&self, fail: bool) {
        self.fail_shell.store(fail, Ordering::SeqCst);
    }

    /// Successful output for a command; unknown commands fail
    pub fn set_exec(&self, command: &str, stdout: &str) {
        self.exec_results.lock().insert(
            command.to_string(),
            ExecOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: Some(0),
            },
        );
    }

    pub fn closes(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn last_stream(&self) -> Option<Arc<MockStream>> {
        self.streams.lock().last().cloned()
    }

    pub fn shells_opened(&self) -> usize {
        self.streams.lock().len()
    }

    /// Push an event into the most recently opened shell
    pub async fn emit(&self, event: ShellEvent) {
        let sender = self.event_senders.lock().last().cloned();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn open_shell(&self, _pty: &PtyRequest) -> Result<ShellChannel, SshError> {
        if self.fail_shell.load(Ordering::SeqCst) {
            return Err(SshError::ChannelError("shell refused".to_string()));
        }
        let stream = MockStream::new();
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().push(stream.clone());
        self.event_senders.lock().push(tx);
        Ok(ShellChannel {
            stream,
            events: rx,
        })
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        self.exec_results
            .lock()
            .get(command)
            .cloned()
            .ok_or_else(|| SshError::CommandFailed(command.to_string()))
    }

    fn detach_listeners(&self) {
        self.detach_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Connector
// ============================================================================

/// One scripted outcome of `MockConnector::connect`
pub enum ConnectStep {
    Succeed(Arc<MockTransport>),
    AuthFail,
    Fail(String),
    /// Send one challenge and succeed if the answers match
    Kbi {
        prompts: Vec<KbiPrompt>,
        expected: Vec<String>,
        transport: Arc<MockTransport>,
    },
}

#[derive(Default)]
pub struct MockConnector {
    steps: Mutex<VecDeque<ConnectStep>>,
    passwords: Mutex<Vec<Option<String>>>,
}

impl MockConnector {
    pub fn new(steps: Vec<ConnectStep>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            passwords: Mutex::new(Vec::new()),
        })
    }

    /// Passwords passed to each `connect` call
    pub fn passwords(&self) -> Vec<Option<String>> {
        self.passwords.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.passwords.lock().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _config: &SshConfig,
        password: Option<String>,
        challenges: mpsc::Sender<Challenge>,
    ) -> Result<Arc<dyn Transport>, SshError> {
        self.passwords.lock().push(password);
        let step = self.steps.lock().pop_front();
        match step {
            Some(ConnectStep::Succeed(transport)) => Ok(transport),
            Some(ConnectStep::AuthFail) => Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            )),
            Some(ConnectStep::Fail(message)) => Err(SshError::ConnectionFailed(message)),
            Some(ConnectStep::Kbi {
                prompts,
                expected,
                transport,
            }) => {
                let (challenge, reply) = Challenge::new("", "", prompts);
                challenges
                    .send(challenge)
                    .await
                    .map_err(|_| SshError::AuthenticationFailed("no handler".to_string()))?;
                let answers = reply
                    .await
                    .map_err(|_| SshError::AuthenticationFailed("cancelled".to_string()))?;
                if answers == expected {
                    Ok(transport)
                } else {
                    Err(SshError::AuthenticationFailed("wrong answers".to_string()))
                }
            }
            None => Err(SshError::ConnectionFailed("no scripted step".to_string())),
        }
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Default)]
pub struct RecordingOutput {
    events: Mutex<Vec<(String, TerminalEvent)>>,
    disconnects: Mutex<Vec<DisconnectEvent>>,
}

impl RecordingOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self, tab_id: &str) -> Vec<TerminalEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(tab, _)| tab == tab_id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Concatenated `Data` text sent to `tab_id`
    pub fn text(&self, tab_id: &str) -> String {
        self.events(tab_id)
            .into_iter()
            .filter_map(|event| match event {
                TerminalEvent::Data { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self, tab_id: &str) -> Vec<String> {
        self.events(tab_id)
            .into_iter()
            .filter_map(|event| match event {
                TerminalEvent::Error { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn disconnects(&self) -> Vec<DisconnectEvent> {
        self.disconnects.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl OutputSink for RecordingOutput {
    fn send(&self, tab_id: &str, event: TerminalEvent) {
        self.events.lock().push((tab_id.to_string(), event));
    }

    fn disconnected(&self, event: DisconnectEvent) {
        self.disconnects.lock().push(event);
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn direct_config(password: &str) -> SshConfig {
    SshConfig {
        host: "db01".to_string(),
        username: "alice".to_string(),
        auth: AuthMethod::password(password),
        ..Default::default()
    }
}

pub fn bastion_config(password: &str) -> SshConfig {
    SshConfig {
        bastion: Some(BastionRoute {
            host: "wallix".to_string(),
            port: 22,
            username: "jdoe".to_string(),
            protocol: "SSH".to_string(),
        }),
        ..direct_config(password)
    }
}

/// A connection with an open shell on `transport`
pub fn wired_connection(
    tab_id: &str,
    config: SshConfig,
    original_key: Option<&str>,
    transport: &Arc<MockTransport>,
) -> (Arc<Connection>, Arc<MockStream>) {
    let conn = Arc::new(Connection::new(
        tab_id,
        config,
        original_key.map(str::to_string),
    ));
    let stream = MockStream::new();
    conn.set_transport(transport.clone());
    conn.set_stream(stream.clone());
    (conn, stream)
}
