//! Keyboard-Interactive Authentication (2FA) Support
//!
//! A server info request is surfaced to the core as a [`Challenge`]. The
//! challenge owns the only way to answer the request, so it can be completed
//! exactly once: [`Challenge::respond`] consumes it, and dropping it cancels
//! the authentication round.
//!
//! ```text
//! Transport (russh)                      AuthStateMachine
//!    │                                     │
//!    │──── Challenge { prompts } ─────────▶│ shows prompts in the tab
//!    │                                     │ collects masked keystrokes
//!    │◀─── respond(answers) ───────────────│
//!    │                                     │
//!    │ authenticate_keyboard_interactive_respond
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Keyboard-Interactive prompt from server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiPrompt {
    /// The prompt text to display
    pub prompt: String,
    /// true = server allows echo; input is masked in the terminal regardless
    pub echo: bool,
}

impl KbiPrompt {
    pub fn new(prompt: impl Into<String>, echo: bool) -> Self {
        Self {
            prompt: prompt.into(),
            echo,
        }
    }
}

/// Error types for KBI flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbiError {
    /// The challenge was dropped without an answer (tab closed, state reset)
    Cancelled,
    /// Timeout waiting for user input
    Timeout,
    /// The waiting side is gone
    ChannelError(String),
}

impl std::fmt::Display for KbiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KbiError::Cancelled => write!(f, "Authentication cancelled"),
            KbiError::Timeout => write!(f, "Authentication timeout"),
            KbiError::ChannelError(e) => write!(f, "Channel error: {}", e),
        }
    }
}

impl std::error::Error for KbiError {}

/// Receiving half held by the transport while the user answers
pub type ChallengeReply = oneshot::Receiver<Vec<String>>;

/// One keyboard-interactive round awaiting answers
#[derive(Debug)]
pub struct Challenge {
    /// Display name from server (may be empty)
    pub name: String,
    /// Instructions from server (may be empty)
    pub instructions: String,
    /// Prompts, answered in order
    pub prompts: Vec<KbiPrompt>,
    responder: oneshot::Sender<Vec<String>>,
}

impl Challenge {
    /// Create a challenge and the receiver the transport waits on
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        prompts: Vec<KbiPrompt>,
    ) -> (Self, ChallengeReply) {
        let (responder, rx) = oneshot::channel();
        (
            Self {
                name: name.into(),
                instructions: instructions.into(),
                prompts,
                responder,
            },
            rx,
        )
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.len()
    }

    /// Prompt text at `index`, or the generic fallback
    pub fn prompt_text(&self, index: usize) -> &str {
        self.prompts
            .get(index)
            .map(|p| p.prompt.as_str())
            .filter(|p| !p.trim().is_empty())
            .unwrap_or("Password:")
    }

    /// Complete the round. Consumes the challenge.
    pub fn respond(self, answers: Vec<String>) -> Result<(), KbiError> {
        self.responder
            .send(answers)
            .map_err(|_| KbiError::ChannelError("transport stopped waiting".to_string()))
    }

    /// True when the transport has stopped waiting for this round
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }
}

/// Wait for the answers to a challenge, bounded by `timeout`
pub async fn await_answers(reply: ChallengeReply, timeout: Duration) -> Result<Vec<String>, KbiError> {
    match tokio::time::timeout(timeout, reply).await {
        Ok(Ok(answers)) => Ok(answers),
        Ok(Err(_)) => Err(KbiError::Cancelled),
        Err(_) => Err(KbiError::Timeout),
    }
}
