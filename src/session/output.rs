//! Terminal output sink
//!
//! 会话核心通过 [`OutputSink`] 把文本和事件推送给宿主界面。
//! 发送是即发即弃的：接收端不存在时事件被丢弃，不会阻塞调用方。

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Events addressed to one tab
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    /// Text for the terminal: shell output, prompts, masked echo
    Data { text: String },
    /// Connection or authentication error banner
    Error { message: String },
    /// Shell is open and metadata has been resolved
    Ready { hostname: String, os_id: String },
    /// Periodic traffic counters
    Stats { bytes_in: u64, bytes_out: u64 },
    /// Finished recording in asciicast v2 format
    Recording { asciicast: String },
}

impl TerminalEvent {
    pub fn data(text: impl Into<String>) -> Self {
        TerminalEvent::Data { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TerminalEvent::Error {
            message: message.into(),
        }
    }
}

/// Emitted when the last tab of a logical endpoint goes away
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectEvent {
    pub original_key: String,
    pub tab_id: String,
}

/// Destination for everything the core shows to the user
pub trait OutputSink: Send + Sync {
    fn send(&self, tab_id: &str, event: TerminalEvent);

    fn disconnected(&self, event: DisconnectEvent);
}

/// Message delivered by [`ChannelOutput`]
#[derive(Debug, Clone, PartialEq)]
pub enum OutputMessage {
    Terminal { tab_id: String, event: TerminalEvent },
    Disconnected(DisconnectEvent),
}

/// [`OutputSink`] backed by an unbounded mpsc channel
#[derive(Clone)]
pub struct ChannelOutput {
    tx: mpsc::UnboundedSender<OutputMessage>,
}

impl ChannelOutput {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutputMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutputSink for ChannelOutput {
    fn send(&self, tab_id: &str, event: TerminalEvent) {
        let message = OutputMessage::Terminal {
            tab_id: tab_id.to_string(),
            event,
        };
        if self.tx.send(message).is_err() {
            debug!("Output receiver gone, dropping event for tab {}", tab_id);
        }
    }

    fn disconnected(&self, event: DisconnectEvent) {
        if self.tx.send(OutputMessage::Disconnected(event)).is_err() {
            debug!("Output receiver gone, dropping disconnect event");
        }
    }
}
