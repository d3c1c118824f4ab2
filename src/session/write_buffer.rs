//! Write buffering for bastion-routed connections
//!
//! Access gateways re-frame every SSH data packet, so per-keystroke writes
//! cost a round trip each. For bastion-routed tabs, input is coalesced and
//! flushed after a short delay, immediately on a control byte (Enter,
//! Ctrl+C, Ctrl+D, Escape), or once the buffer reaches its size cap. Byte
//! order is preserved.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::recorder::InputRecorder;
use super::types::{AuthStateKind, Connection};
use crate::config::WriteBufferConfig;

/// Bytes that flush the buffer as soon as they are written
const FLUSH_TRIGGERS: &[u8] = b"\r\n\x03\x04\x1b";

/// Whether the coordinator took responsibility for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Buffered (and possibly already flushed)
    Handled,
    /// Buffering does not apply; the caller writes directly
    NotHandled,
}

#[derive(Clone)]
pub struct WriteBufferCoordinator {
    flush_delay: Duration,
    max_buffered_bytes: usize,
    recorder: Arc<dyn InputRecorder>,
}

impl WriteBufferCoordinator {
    pub fn new(config: &WriteBufferConfig, recorder: Arc<dyn InputRecorder>) -> Self {
        Self {
            flush_delay: Duration::from_millis(config.flush_delay_ms),
            max_buffered_bytes: config.max_buffered_bytes.max(1),
            recorder,
        }
    }

    pub fn should_buffer(&self, conn: &Connection) -> bool {
        conn.bastion_routed
    }

    pub fn write(&self, conn: &Arc<Connection>, data: &[u8]) -> WriteOutcome {
        if !self.should_buffer(conn) {
            return WriteOutcome::NotHandled;
        }
        if conn.auth_state() == AuthStateKind::Failed {
            // No shell will ever take these bytes
            debug!("Dropping {} bytes for failed tab {}", data.len(), conn.tab_id);
            self.cancel(conn);
            return WriteOutcome::Handled;
        }

        let flush_now = {
            let mut buffer = conn.write_buffer.lock();
            buffer.bytes.extend_from_slice(data);
            if let Some(timer) = buffer.flush_timer.take() {
                timer.abort();
            }
            data.iter().any(|b| FLUSH_TRIGGERS.contains(b))
                || buffer.bytes.len() >= self.max_buffered_bytes
        };

        if flush_now {
            self.flush(conn);
        } else {
            self.schedule_flush(conn);
        }
        WriteOutcome::Handled
    }

    fn schedule_flush(&self, conn: &Arc<Connection>) {
        let coordinator = self.clone();
        let weak = Arc::downgrade(conn);
        let delay = self.flush_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(conn) = weak.upgrade() {
                coordinator.flush(&conn);
            }
        });

        let mut buffer = conn.write_buffer.lock();
        if let Some(previous) = buffer.flush_timer.replace(timer) {
            previous.abort();
        }
    }

    /// Write everything buffered to the shell
    pub fn flush(&self, conn: &Connection) {
        let (bytes, stream) = {
            let mut buffer = conn.write_buffer.lock();
            if let Some(timer) = buffer.flush_timer.take() {
                timer.abort();
            }
            if buffer.bytes.is_empty() {
                return;
            }
            let Some(stream) = conn.stream().filter(|s| s.is_writable()) else {
                debug!(
                    "Tab {} has no writable stream, keeping {} buffered bytes",
                    conn.tab_id,
                    buffer.bytes.len()
                );
                return;
            };
            (std::mem::take(&mut buffer.bytes), stream)
        };

        match stream.write(&bytes) {
            Ok(()) => {
                conn.add_bytes_out(bytes.len());
                if self.recorder.is_recording(&conn.tab_id) {
                    self.recorder
                        .record_input(&conn.tab_id, &String::from_utf8_lossy(&bytes));
                }
            }
            Err(e) => warn!("Flush of {} bytes failed for tab {}: {}", bytes.len(), conn.tab_id, e),
        }
    }

    /// Best-effort flush during teardown; never records
    pub fn final_flush(&self, conn: &Connection) {
        let bytes = {
            let mut buffer = conn.write_buffer.lock();
            if let Some(timer) = buffer.flush_timer.take() {
                timer.abort();
            }
            std::mem::take(&mut buffer.bytes)
        };
        if bytes.is_empty() {
            return;
        }

        match conn.stream() {
            Some(stream) if stream.is_writable() => {
                if let Err(e) = stream.write(&bytes) {
                    debug!("Final flush failed for tab {}: {}", conn.tab_id, e);
                }
            }
            _ => debug!("Final flush skipped for tab {}: stream closed", conn.tab_id),
        }
    }

    /// Drop buffered input without writing it
    pub fn cancel(&self, conn: &Connection) {
        let mut buffer = conn.write_buffer.lock();
        if let Some(timer) = buffer.flush_timer.take() {
            timer.abort();
        }
        buffer.bytes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::recorder::SessionRecorder;
    use crate::session::testing::{bastion_config, direct_config, wired_connection, MockTransport};
    use crate::ssh::ShellStream;

    fn coordinator(recorder: Arc<SessionRecorder>) -> WriteBufferCoordinator {
        WriteBufferCoordinator::new(&WriteBufferConfig::default(), recorder)
    }

    #[tokio::test]
    async fn test_direct_connection_not_handled() {
        let transport = MockTransport::new("t");
        let (conn, stream) = wired_connection("tab", direct_config("pw"), None, &transport);
        let wb = coordinator(Arc::new(SessionRecorder::new()));

        assert!(!wb.should_buffer(&conn));
        assert_eq!(wb.write(&conn, b"ls"), WriteOutcome::NotHandled);
        assert_eq!(conn.buffered_len(), 0);
        assert!(stream.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tab_discards_input() {
        let transport = MockTransport::new("t");
        let conn = Arc::new(Connection::new("tab", bastion_config("pw"), None));
        conn.set_transport(transport);
        let wb = coordinator(Arc::new(SessionRecorder::new()));

        assert_eq!(wb.write(&conn, b"ab"), WriteOutcome::Handled);
        assert_eq!(conn.buffered_len(), 2);

        conn.set_auth_state(crate::session::types::AuthState::Failed("refused".to_string()));
        assert_eq!(wb.write(&conn, b"cd\r"), WriteOutcome::Handled);
        assert_eq!(conn.buffered_len(), 0);
        assert!(!conn.has_pending_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_flushes_once_with_all_bytes() {
        let transport = MockTransport::new("t");
        let (conn, stream) = wired_connection("tab", bastion_config("pw"), None, &transport);
        let wb = coordinator(Arc::new(SessionRecorder::new()));

        assert_eq!(wb.write(&conn, b"ab"), WriteOutcome::Handled);
        assert!(stream.writes().is_empty());
        assert!(conn.has_pending_flush());

        assert_eq!(wb.write(&conn, b"c\r"), WriteOutcome::Handled);
        assert_eq!(stream.writes(), vec![b"abc\r".to_vec()]);
        assert!(!conn.has_pending_flush());

        // The cancelled timer must not write again
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stream.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_cap_flushes_without_timer() {
        let transport = MockTransport::new("t");
        let (conn, stream) = wired_connection("tab", bastion_config("pw"), None, &transport);
        let wb = coordinator(Arc::new(SessionRecorder::new()));

        for ch in b"abcdefgh" {
            wb.write(&conn, &[*ch]);
        }
        assert_eq!(stream.writes(), vec![b"abcdefgh".to_vec()]);
        assert!(!conn.has_pending_flush());

        wb.write(&conn, b"i");
        assert_eq!(stream.writes().len(), 1);
        assert_eq!(conn.buffered_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_after_delay() {
        let transport = MockTransport::new("t");
        let (conn, stream) = wired_connection("tab", bastion_config("pw"), None, &transport);
        let wb = coordinator(Arc::new(SessionRecorder::new()));

        wb.write(&conn, b"l");
        wb.write(&conn, b"s");
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(stream.writes().is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stream.writes(), vec![b"ls".to_vec()]);
        assert!(!conn.has_pending_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_bytes_trigger_flush() {
        let transport = MockTransport::new("t");
        let (conn, stream) = wired_connection("tab", bastion_config("pw"), None, &transport);
        let wb = coordinator(Arc::new(SessionRecorder::new()));

        wb.write(&conn, b"x");
        wb.write(&conn, &[0x03]);
        wb.write(&conn, &[0x1b]);
        assert_eq!(stream.writes(), vec![vec![b'x', 0x03], vec![0x1b]]);
    }

    #[tokio::test]
    async fn test_flush_records_input() {
        let recorder = Arc::new(SessionRecorder::new());
        recorder.start("tab", "db01", "alice", 80, 24);
        let transport = MockTransport::new("t");
        let (conn, _stream) = wired_connection("tab", bastion_config("pw"), None, &transport);
        let wb = coordinator(recorder.clone());

        wb.write(&conn, b"pwd\r");
        assert_eq!(recorder.stop("tab").unwrap().input(), "pwd\r");
        assert_eq!(conn.bytes_out(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_skips_recorder_and_cancel_discards() {
        let recorder = Arc::new(SessionRecorder::new());
        recorder.start("tab", "db01", "alice", 80, 24);
        let transport = MockTransport::new("t");
        let (conn, stream) = wired_connection("tab", bastion_config("pw"), None, &transport);
        let wb = coordinator(recorder.clone());

        wb.write(&conn, b"ex");
        wb.final_flush(&conn);
        assert_eq!(stream.written(), b"ex".to_vec());
        assert!(!conn.has_pending_flush());

        wb.write(&conn, b"it");
        wb.cancel(&conn);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stream.written(), b"ex".to_vec());
        assert_eq!(conn.buffered_len(), 0);
        assert!(recorder.stop("tab").unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn test_final_flush_tolerates_closed_stream() {
        let transport = MockTransport::new("t");
        let (conn, stream) = wired_connection("tab", bastion_config("pw"), None, &transport);
        let wb = coordinator(Arc::new(SessionRecorder::new()));

        conn.write_buffer.lock().bytes.extend_from_slice(b"zz");
        stream.destroy().unwrap();
        wb.final_flush(&conn);
        assert_eq!(conn.buffered_len(), 0);
        assert!(stream.writes().is_empty());
    }
}
