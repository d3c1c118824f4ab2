//! Session core
//!
//! Per-tab connection lifecycle on top of shared SSH transports:
//! - Terminal-driven authentication (password prompt, keyboard-interactive)
//! - Transport pooling with reference counting by cache key
//! - Input coalescing for bastion-routed tabs
//! - Ordered teardown that never closes a transport another tab still uses
//! - asciicast recording

pub mod auth;
pub mod cleanup;
pub mod manager;
pub mod metadata;
pub mod output;
pub mod pool;
pub mod recorder;
pub mod types;
pub mod write_buffer;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{classify_auth_error, AuthStateMachine, ReadyHooks};
pub use cleanup::CleanupCoordinator;
pub use manager::{ConnectionManager, OpenTabRequest};
pub use metadata::resolve_session_metadata;
pub use output::{ChannelOutput, DisconnectEvent, OutputMessage, OutputSink, TerminalEvent};
pub use pool::{count_references, ConnectionPool, ConnectionPoolStats, PoolKeyInfo};
pub use recorder::{InputRecorder, RecordedEvent, RecordedStream, SessionRecorder, Transcript};
pub use types::{
    ActiveConnections, AuthState, AuthStateKind, Connection, ConnectionInfo, SessionMetadata,
};
pub use write_buffer::{WriteBufferCoordinator, WriteOutcome};
