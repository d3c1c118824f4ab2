//! Session recording
//!
//! Captures timestamped terminal input and output per tab and exports the
//! finished transcript as asciicast v2 (a JSON header line followed by one
//! `[elapsed, "i" | "o", data]` line per event).
//!
//! Input and output are stamped independently as they pass through the core;
//! their relative order is only as precise as the timestamps.

use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

/// Observer of terminal traffic. Calls must not block.
pub trait InputRecorder: Send + Sync {
    fn is_recording(&self, tab_id: &str) -> bool;

    fn record_input(&self, tab_id: &str, text: &str);

    fn record_output(&self, tab_id: &str, text: &str);
}

/// Direction of a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordedStream {
    #[serde(rename = "i")]
    Input,
    #[serde(rename = "o")]
    Output,
}

impl RecordedStream {
    fn code(self) -> &'static str {
        match self {
            RecordedStream::Input => "i",
            RecordedStream::Output => "o",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedEvent {
    /// Seconds since the recording started
    pub elapsed: f64,
    pub stream: RecordedStream,
    pub data: String,
}

/// Recording in progress for one tab
struct RecordingSession {
    host: String,
    user: String,
    cols: u32,
    rows: u32,
    started_at: DateTime<Utc>,
    started: Instant,
    events: Vec<RecordedEvent>,
}

impl RecordingSession {
    fn push(&mut self, stream: RecordedStream, text: &str) {
        self.events.push(RecordedEvent {
            elapsed: self.started.elapsed().as_secs_f64(),
            stream,
            data: text.to_string(),
        });
    }
}

/// Finished, immutable recording
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub tab_id: String,
    pub host: String,
    pub user: String,
    pub cols: u32,
    pub rows: u32,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub events: Vec<RecordedEvent>,
}

#[derive(Serialize)]
struct AsciicastHeader<'a> {
    version: u8,
    width: u32,
    height: u32,
    timestamp: i64,
    duration: f64,
    title: String,
    env: AsciicastEnv<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "UPPERCASE")]
struct AsciicastEnv<'a> {
    term: &'a str,
}

impl Transcript {
    /// Render as asciicast v2
    pub fn to_asciicast(&self) -> Result<String, serde_json::Error> {
        let header = AsciicastHeader {
            version: 2,
            width: self.cols,
            height: self.rows,
            timestamp: self.started_at.timestamp(),
            duration: self.duration_secs,
            title: format!("{}@{}", self.user, self.host),
            env: AsciicastEnv {
                term: "xterm-256color",
            },
        };

        let mut out = serde_json::to_string(&header)?;
        out.push('\n');
        for event in &self.events {
            out.push_str(&serde_json::to_string(&(
                event.elapsed,
                event.stream.code(),
                &event.data,
            ))?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn input(&self) -> String {
        self.collect(RecordedStream::Input)
    }

    pub fn output(&self) -> String {
        self.collect(RecordedStream::Output)
    }

    fn collect(&self, stream: RecordedStream) -> String {
        self.events
            .iter()
            .filter(|e| e.stream == stream)
            .map(|e| e.data.as_str())
            .collect()
    }
}

/// Per-tab recorder
#[derive(Default)]
pub struct SessionRecorder {
    sessions: DashMap<String, RecordingSession>,
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording `tab_id`. Returns false if it is already recording.
    pub fn start(&self, tab_id: &str, host: &str, user: &str, cols: u32, rows: u32) -> bool {
        if self.sessions.contains_key(tab_id) {
            debug!("Tab {} is already recording", tab_id);
            return false;
        }
        self.sessions.insert(
            tab_id.to_string(),
            RecordingSession {
                host: host.to_string(),
                user: user.to_string(),
                cols,
                rows,
                started_at: Utc::now(),
                started: Instant::now(),
                events: Vec::new(),
            },
        );
        info!("Recording started for tab {}", tab_id);
        true
    }

    /// Finish recording `tab_id`
    pub fn stop(&self, tab_id: &str) -> Option<Transcript> {
        let (tab_id, session) = self.sessions.remove(tab_id)?;
        info!(
            "Recording stopped for tab {} ({} events)",
            tab_id,
            session.events.len()
        );
        Some(Transcript {
            duration_secs: session.started.elapsed().as_secs_f64(),
            tab_id,
            host: session.host,
            user: session.user,
            cols: session.cols,
            rows: session.rows,
            started_at: session.started_at,
            events: session.events,
        })
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    fn record(&self, tab_id: &str, stream: RecordedStream, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(mut session) = self.sessions.get_mut(tab_id) {
            session.push(stream, text);
        }
    }
}

impl InputRecorder for SessionRecorder {
    fn is_recording(&self, tab_id: &str) -> bool {
        self.sessions.contains_key(tab_id)
    }

    fn record_input(&self, tab_id: &str, text: &str) {
        self.record(tab_id, RecordedStream::Input, text);
    }

    fn record_output(&self, tab_id: &str, text: &str) {
        self.record(tab_id, RecordedStream::Output, text);
    }
}
