//! Terminal-side authentication
//!
//! Passwords and keyboard-interactive answers are typed into the tab itself.
//! While a tab is in an `Awaiting*` state its keystrokes are intercepted,
//! buffered, and echoed as `*`; nothing reaches a shell.
//!
//! ```text
//!                initialize
//!                    │
//!      ┌─────────────┴──────────────┐
//!      ▼                            ▼
//!  NoAuthNeeded ◀── Enter ── AwaitingManualPassword
//!      │  ▲                          ▲
//!      │  └── last answer ──┐        │ auth error / shell refused
//!      │                    │        │
//!      │   challenge ──▶ AwaitingKeyboardInteractive
//!      ▼
//!  Authenticated (shell open)
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::metadata::resolve_session_metadata;
use super::output::{OutputSink, TerminalEvent};
use super::recorder::InputRecorder;
use super::types::{AuthState, Connection, KbiProgress, SessionMetadata};
use crate::config::{AuthConfig, CoreConfig};
use crate::ssh::keyboard_interactive::Challenge;
use crate::ssh::{PtyRequest, ShellEvent, SshError, Transport};

const BACKSPACE: char = '\u{8}';
const DELETE: char = '\u{7f}';

/// Terminal sequence that erases the last echoed character
const ERASE: &str = "\u{8} \u{8}";

/// Lowercased fragments of transport errors that mean "credentials rejected"
const AUTH_FAILURE_PATTERNS: &[&str] = &[
    "authentication failed",
    "all configured authentication methods failed",
    "permission denied",
    "auth fail",
    "authentication rejected",
    "no password supplied",
];

/// True when `err` means the credentials were rejected
pub fn classify_auth_error(err: &SshError) -> bool {
    match err {
        SshError::AuthenticationFailed(_) => true,
        other => {
            let message = other.to_string().to_lowercase();
            AUTH_FAILURE_PATTERNS.iter().any(|p| message.contains(p))
        }
    }
}

/// Callbacks for an opened shell
pub struct ReadyHooks {
    /// Runs once when the remote side closes the shell
    pub on_close: Box<dyn FnOnce() + Send>,
    /// Runs once the stream is writable, before metadata lookup
    pub on_shell: Option<Box<dyn FnOnce() + Send>>,
}

impl ReadyHooks {
    pub fn new(on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_close: Box::new(on_close),
            on_shell: None,
        }
    }

    pub fn with_on_shell(mut self, on_shell: impl FnOnce() + Send + 'static) -> Self {
        self.on_shell = Some(Box::new(on_shell));
        self
    }
}

/// Outcome of feeding one chunk to a masked input buffer
#[derive(Default)]
struct MaskedInput {
    echo: String,
    submitted: Vec<String>,
}

pub struct AuthStateMachine {
    config: AuthConfig,
    resolve_metadata: bool,
    output: Arc<dyn OutputSink>,
    recorder: Arc<dyn InputRecorder>,
}

impl AuthStateMachine {
    pub fn new(
        config: &CoreConfig,
        output: Arc<dyn OutputSink>,
        recorder: Arc<dyn InputRecorder>,
    ) -> Self {
        Self {
            config: config.auth.clone(),
            resolve_metadata: config.session.resolve_metadata,
            output,
            recorder,
        }
    }

    pub fn password_prompt(&self) -> &str {
        &self.config.password_prompt
    }

    /// Prompt shown after a rejected attempt
    pub fn retry_prompt(&self) -> String {
        format!(
            "\r\n{}\r\n{}",
            self.config.retry_message, self.config.password_prompt
        )
    }

    fn emit(&self, conn: &Connection, text: impl Into<String>) {
        self.output.send(&conn.tab_id, TerminalEvent::data(text));
    }

    // ========================================================================
    // Manual password
    // ========================================================================

    /// Set the initial state. Emits nothing.
    pub fn initialize(&self, conn: &Connection, has_stored_password: bool) {
        let state = if has_stored_password {
            AuthState::NoAuthNeeded
        } else {
            AuthState::AwaitingManualPassword {
                prompt: self.config.password_prompt.clone(),
                buffer: String::new(),
            }
        };
        conn.set_auth_state(state);
    }

    /// Ask for a password in the terminal.
    ///
    /// The last line of `prompt` is what gets repeated after an empty entry.
    pub fn enable_manual_password_prompt(&self, conn: &Connection, prompt: &str) {
        let repeat = prompt.rsplit('\n').next().unwrap_or(prompt).to_string();
        conn.set_auth_state(AuthState::AwaitingManualPassword {
            prompt: repeat,
            buffer: String::new(),
        });
        debug!("Tab {} waiting for a password", conn.tab_id);
        self.emit(conn, prompt);
    }

    /// Feed keystrokes to the password prompt.
    ///
    /// Returns the password once Enter is pressed on a non-empty entry; input
    /// after that Enter is dropped. Outside the prompt state this is a no-op.
    pub fn process_manual_password_keystroke(&self, conn: &Connection, chunk: &str) -> Option<String> {
        let (echo, password) = {
            let mut auth = conn.auth.lock();
            let AuthState::AwaitingManualPassword { prompt, buffer } = &mut *auth else {
                return None;
            };

            let input = feed_masked(buffer, chunk, 1, |_| prompt.clone());
            let password = input.submitted.into_iter().next();
            if password.is_some() {
                *auth = AuthState::NoAuthNeeded;
            }
            (input.echo, password)
        };

        if !echo.is_empty() {
            self.emit(conn, echo);
        }
        if password.is_some() {
            info!("Password entered for tab {}", conn.tab_id);
        }
        password
    }

    // ========================================================================
    // Keyboard-interactive
    // ========================================================================

    /// Deliver challenges from a connect attempt to `conn` until the
    /// attempt drops its sender. Resolves to the number of challenges shown.
    pub fn setup_keyboard_interactive(
        self: &Arc<Self>,
        conn: Arc<Connection>,
        mut challenges: mpsc::Receiver<Challenge>,
    ) -> JoinHandle<usize> {
        let machine = self.clone();
        tokio::spawn(async move {
            let mut delivered = 0;
            while let Some(challenge) = challenges.recv().await {
                machine.on_challenge(&conn, challenge);
                delivered += 1;
            }
            debug!("Challenge feed closed for tab {} after {} challenge(s)", conn.tab_id, delivered);
            delivered
        })
    }

    /// Show a challenge and start collecting answers
    pub fn on_challenge(&self, conn: &Connection, challenge: Challenge) {
        let mut text = String::new();
        let instructions = challenge.instructions.trim_end();
        if !instructions.is_empty() {
            text.push_str("\r\n");
            text.push_str(&instructions.replace('\n', "\r\n"));
        }

        if challenge.prompt_count() == 0 {
            debug!("Empty challenge for tab {}, answering immediately", conn.tab_id);
            if !text.is_empty() {
                self.emit(conn, text);
            }
            if let Err(e) = challenge.respond(Vec::new()) {
                warn!("Empty challenge for tab {} could not be answered: {}", conn.tab_id, e);
            }
            return;
        }

        text.push_str("\r\n");
        text.push_str(challenge.prompt_text(0));
        info!(
            "Tab {} received a {}-prompt challenge",
            conn.tab_id,
            challenge.prompt_count()
        );
        conn.set_auth_state(AuthState::AwaitingKeyboardInteractive(KbiProgress::new(challenge)));
        self.emit(conn, text);
    }

    /// Feed keystrokes to the active challenge. Returns true if consumed.
    pub fn process_keyboard_interactive_keystroke(&self, conn: &Connection, chunk: &str) -> bool {
        let (echo, completed) = {
            let mut auth = conn.auth.lock();
            let AuthState::AwaitingKeyboardInteractive(progress) = &mut *auth else {
                return false;
            };

            let remaining = progress.challenge.prompt_count() - progress.responses.len();
            let answered = progress.responses.len();
            let challenge = &progress.challenge;
            let input = feed_masked(&mut progress.buffer, chunk, remaining, |n| {
                challenge.prompt_text(answered + n).to_string()
            });
            progress.responses.extend(input.submitted);

            let done = progress.responses.len() >= progress.challenge.prompt_count();
            let completed = if done {
                match std::mem::take(&mut *auth) {
                    AuthState::AwaitingKeyboardInteractive(progress) => Some(progress),
                    _ => None,
                }
            } else {
                None
            };
            (input.echo, completed)
        };

        if !echo.is_empty() {
            self.emit(conn, echo);
        }
        if let Some(KbiProgress {
            challenge,
            responses,
            ..
        }) = completed
        {
            info!("Challenge answered for tab {}", conn.tab_id);
            if let Err(e) = challenge.respond(responses) {
                warn!("Challenge for tab {} expired before the answer: {}", conn.tab_id, e);
            }
        }
        true
    }

    // ========================================================================
    // Shell setup
    // ========================================================================

    pub fn classify_auth_error(&self, err: &SshError) -> bool {
        classify_auth_error(err)
    }

    /// Open the tab's shell on an authenticated transport.
    ///
    /// A refused shell re-opens the password prompt and returns the error.
    pub async fn on_transport_ready(
        &self,
        transport: Arc<dyn Transport>,
        conn: &Arc<Connection>,
        hooks: ReadyHooks,
    ) -> Result<SessionMetadata, SshError> {
        let pty = PtyRequest::new(conn.config.cols, conn.config.rows);
        let channel = match transport.open_shell(&pty).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Shell open failed for tab {}: {}", conn.tab_id, e);
                if conn.is_closing() {
                    debug!("Tab {} closed while its shell was opening, no prompt", conn.tab_id);
                } else {
                    self.enable_manual_password_prompt(conn, &self.retry_prompt());
                }
                return Err(e);
            }
        };

        conn.set_stream(channel.stream);
        conn.set_auth_state(AuthState::Authenticated);
        conn.set_output_pump(spawn_output_pump(
            conn.clone(),
            channel.events,
            self.output.clone(),
            self.recorder.clone(),
            hooks.on_close,
        ));
        info!("Shell ready for tab {} on {}", conn.tab_id, transport.id());
        if let Some(on_shell) = hooks.on_shell {
            on_shell();
        }

        let metadata = if self.resolve_metadata {
            resolve_session_metadata(transport.as_ref(), &conn.tab_id).await
        } else {
            SessionMetadata {
                hostname: super::metadata::UNKNOWN_HOSTNAME.to_string(),
                os_id: super::metadata::DEFAULT_OS_ID.to_string(),
            }
        };
        conn.set_metadata(metadata.clone());
        self.output.send(
            &conn.tab_id,
            TerminalEvent::Ready {
                hostname: metadata.hostname.clone(),
                os_id: metadata.os_id.clone(),
            },
        );
        Ok(metadata)
    }
}

/// Apply `chunk` to a masked buffer.
///
/// Backspace/delete erase one character, Enter submits the trimmed buffer.
/// An empty submission re-shows the current prompt. After `limit`
/// submissions the rest of the chunk is dropped; between submissions the
/// next prompt comes from `next_prompt(index)`.
fn feed_masked(
    buffer: &mut String,
    chunk: &str,
    limit: usize,
    next_prompt: impl Fn(usize) -> String,
) -> MaskedInput {
    let mut out = MaskedInput::default();
    let mut after_cr = false;

    for ch in chunk.chars() {
        if ch == '\n' && after_cr {
            // CRLF is one Enter
            after_cr = false;
            continue;
        }
        after_cr = ch == '\r';

        match ch {
            BACKSPACE | DELETE => {
                if buffer.pop().is_some() {
                    out.echo.push_str(ERASE);
                }
            }
            '\r' | '\n' => {
                let entry = buffer.trim().to_string();
                buffer.clear();
                out.echo.push_str("\r\n");
                if entry.is_empty() {
                    out.echo.push_str(&next_prompt(out.submitted.len()));
                    continue;
                }
                out.submitted.push(entry);
                if out.submitted.len() >= limit {
                    break;
                }
                out.echo.push_str(&next_prompt(out.submitted.len()));
            }
            c => {
                buffer.push(c);
                out.echo.push('*');
            }
        }
    }
    out
}

/// Forward shell output to the tab until the channel closes
fn spawn_output_pump(
    conn: Arc<Connection>,
    mut events: mpsc::Receiver<ShellEvent>,
    output: Arc<dyn OutputSink>,
    recorder: Arc<dyn InputRecorder>,
    on_close: Box<dyn FnOnce() + Send>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = Utf8Stream::default();
        while let Some(event) = events.recv().await {
            match event {
                ShellEvent::Data(bytes) => {
                    conn.add_bytes_in(bytes.len());
                    let text = decoder.decode(&bytes);
                    if text.is_empty() {
                        continue;
                    }
                    if recorder.is_recording(&conn.tab_id) {
                        recorder.record_output(&conn.tab_id, &text);
                    }
                    output.send(&conn.tab_id, TerminalEvent::Data { text });
                }
                ShellEvent::Closed { exit_status } => {
                    info!("Shell for tab {} closed (exit status {:?})", conn.tab_id, exit_status);
                    break;
                }
            }
        }
        on_close();
    })
}

/// Decodes a byte stream whose chunks may split UTF-8 sequences
#[derive(Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid_up_to);
                            return text;
                        }
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + len);
                        }
                    }
                }
            }
        }
    }
}
