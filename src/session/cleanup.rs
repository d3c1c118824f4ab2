//! Connection teardown
//!
//! Closing a tab tears down what the tab owns (timers, buffered input, the
//! shell stream) and only touches the shared transport when no other tab
//! still uses it. The connection always leaves the active map, even when a
//! teardown step fails or panics.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::output::{DisconnectEvent, OutputSink};
use super::pool::ConnectionPool;
use super::types::{ActiveConnections, AuthState, Connection};
use super::write_buffer::WriteBufferCoordinator;
use crate::ssh::Transport;

/// Removes a tab from the active map when dropped
struct RemoveOnDrop<'a> {
    active: &'a ActiveConnections,
    tab_id: &'a str,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        if self.active.remove(self.tab_id).is_some() {
            debug!("Tab {} removed from active connections", self.tab_id);
        }
    }
}

pub struct CleanupCoordinator {
    active: ActiveConnections,
    pool: Arc<ConnectionPool>,
    write_buffer: WriteBufferCoordinator,
    output: Arc<dyn OutputSink>,
}

impl CleanupCoordinator {
    pub fn new(
        active: ActiveConnections,
        pool: Arc<ConnectionPool>,
        write_buffer: WriteBufferCoordinator,
        output: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            active,
            pool,
            write_buffer,
            output,
        }
    }

    /// Tear down one tab.
    ///
    /// Returns false for an unknown (or already closing) tab, or when a step
    /// failed; the tab is gone from the active map either way.
    pub fn cleanup_connection(&self, tab_id: &str) -> bool {
        let Some(conn) = self.active.get(tab_id).map(|e| e.value().clone()) else {
            debug!("Tab {} not active, nothing to clean up", tab_id);
            return false;
        };
        if !conn.begin_close() {
            debug!("Tab {} is already being cleaned up", tab_id);
            return false;
        }

        let _removal = RemoveOnDrop {
            active: &self.active,
            tab_id,
        };
        info!("Cleaning up tab {}", tab_id);

        // 1. timers, pending challenge
        conn.cancel_timers();
        conn.set_auth_state(AuthState::Failed("tab closed".to_string()));

        // 2. buffered input
        self.write_buffer.final_flush(&conn);

        // 3.
        let other_tabs = self.other_tabs_using_connection(&conn);

        // 4. this tab's shell
        let ok = self.destroy_stream(&conn);

        // 5. / 6. shared transport
        if other_tabs.is_empty() {
            self.output.disconnected(DisconnectEvent {
                original_key: conn.original_key.clone(),
                tab_id: tab_id.to_string(),
            });
            let transport = conn.take_transport();
            if !self.pool.close(&conn.cache_key) {
                match transport {
                    Some(transport) => close_in_background(transport),
                    None => debug!("Tab {} never got a transport", tab_id),
                }
            }
        } else {
            info!(
                "Transport {} kept open for {} other tab(s): {:?}",
                conn.cache_key,
                other_tabs.len(),
                other_tabs
            );
            drop(conn.take_transport());
        }

        ok
    }

    /// Tabs other than `conn` sharing its transport
    pub fn other_tabs_using_connection(&self, conn: &Connection) -> Vec<String> {
        self.active
            .iter()
            .filter(|e| e.key() != &conn.tab_id && e.value().cache_key == conn.cache_key)
            .map(|e| e.key().clone())
            .collect()
    }

    fn destroy_stream(&self, conn: &Connection) -> bool {
        conn.detach_output_pump();
        let Some(stream) = conn.take_stream() else {
            return true;
        };
        stream.remove_all_listeners();
        if stream.is_destroyed() {
            return true;
        }
        match stream.destroy() {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to destroy stream for tab {}: {}", conn.tab_id, e);
                false
            }
        }
    }

    /// Tear down every tab and every pooled transport without reference
    /// checks. Returns the close tasks.
    pub fn cleanup_all(&self) -> Vec<JoinHandle<()>> {
        let connections: Vec<Arc<Connection>> =
            self.active.iter().map(|e| e.value().clone()).collect();
        info!("Cleaning up all {} tabs", connections.len());

        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        for conn in &connections {
            conn.begin_close();
            conn.cancel_timers();
            conn.set_auth_state(AuthState::Failed("shutdown".to_string()));
            self.write_buffer.final_flush(conn);
            self.destroy_stream(conn);
            transports.extend(conn.take_transport());
        }
        transports.extend(self.pool.drain());
        self.active.clear();

        let mut seen = HashSet::new();
        transports
            .into_iter()
            .filter(|t| seen.insert(Arc::as_ptr(t) as *const () as usize))
            .map(|transport| {
                transport.detach_listeners();
                tokio::spawn(async move { transport.close().await })
            })
            .collect()
    }
}

fn close_in_background(transport: Arc<dyn Transport>) {
    transport.detach_listeners();
    tokio::spawn(async move { transport.close().await });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteBufferConfig;
    use crate::session::recorder::SessionRecorder;
    use crate::session::testing::{
        bastion_config, direct_config, wired_connection, MockStream, MockTransport,
        RecordingOutput,
    };
    use crate::session::types::new_active_connections;
    use crate::ssh::ShellStream;
    use std::sync::atomic::Ordering;

    struct Fixture {
        active: ActiveConnections,
        pool: Arc<ConnectionPool>,
        output: Arc<RecordingOutput>,
        cleanup: CleanupCoordinator,
    }

    fn fixture() -> Fixture {
        let active = new_active_connections();
        let pool = Arc::new(ConnectionPool::new());
        let output = RecordingOutput::new();
        let write_buffer = WriteBufferCoordinator::new(
            &WriteBufferConfig::default(),
            Arc::new(SessionRecorder::new()),
        );
        let cleanup =
            CleanupCoordinator::new(active.clone(), pool.clone(), write_buffer, output.clone());
        Fixture {
            active,
            pool,
            output,
            cleanup,
        }
    }

    async fn pool_transport(pool: &ConnectionPool, key: &str, transport: &Arc<MockTransport>) {
        let t = transport.clone();
        pool.acquire(key, || async { Ok(t as Arc<dyn Transport>) })
            .await
            .unwrap();
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_last_tab_closes_transport_and_notifies() {
        let f = fixture();
        let transport = MockTransport::new("t");
        let (conn, stream) = wired_connection("a", direct_config("pw"), None, &transport);
        pool_transport(&f.pool, &conn.cache_key, &transport).await;
        f.active.insert("a".to_string(), conn.clone());

        assert!(f.cleanup.cleanup_connection("a"));
        settle().await;

        assert!(f.active.is_empty());
        assert!(f.pool.is_empty());
        assert_eq!(transport.closes(), 1);
        assert!(stream.is_destroyed());
        assert!(stream.listeners_removed());
        assert_eq!(
            f.output.disconnects(),
            vec![DisconnectEvent {
                original_key: "alice@db01:22".to_string(),
                tab_id: "a".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_shared_transport_survives_other_tab_close() {
        let f = fixture();
        let transport = MockTransport::new("t");
        let (a, stream_a) = wired_connection("a", direct_config("pw"), None, &transport);
        let (b, stream_b) = wired_connection("b", direct_config("pw"), None, &transport);
        pool_transport(&f.pool, &a.cache_key, &transport).await;
        f.active.insert("a".to_string(), a);
        f.active.insert("b".to_string(), b);

        assert!(f.cleanup.cleanup_connection("a"));
        settle().await;

        assert_eq!(transport.closes(), 0);
        assert!(stream_a.is_destroyed());
        assert!(!stream_b.is_destroyed());
        assert!(f.output.disconnects().is_empty());
        assert!(f.active.contains_key("b"));
        assert_eq!(f.pool.len(), 1);
    }

    #[tokio::test]
    async fn test_removed_from_map_when_destroy_fails() {
        let f = fixture();
        let transport = MockTransport::new("t");
        let conn = Arc::new(Connection::new("a", direct_config("pw"), None));
        let stream = MockStream::failing_destroy();
        conn.set_transport(transport.clone());
        conn.set_stream(stream.clone());
        f.active.insert("a".to_string(), conn);

        assert!(!f.cleanup.cleanup_connection("a"));
        assert!(f.active.is_empty());
        assert_eq!(stream.destroy_calls.load(Ordering::SeqCst), 1);
        // The transport still goes away
        settle().await;
        assert_eq!(transport.closes(), 1);
    }

    #[tokio::test]
    async fn test_double_cleanup_is_safe() {
        let f = fixture();
        let transport = MockTransport::new("t");
        let (conn, stream) = wired_connection("a", direct_config("pw"), None, &transport);
        pool_transport(&f.pool, &conn.cache_key, &transport).await;
        f.active.insert("a".to_string(), conn);

        assert!(f.cleanup.cleanup_connection("a"));
        assert!(!f.cleanup.cleanup_connection("a"));
        assert!(!f.cleanup.cleanup_connection("never-opened"));
        settle().await;

        assert_eq!(transport.closes(), 1);
        assert_eq!(stream.destroy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.output.disconnects().len(), 1);
    }

    #[tokio::test]
    async fn test_shared_bastion_key_notifies_once_for_last_tab() {
        let f = fixture();
        let transport = MockTransport::new("t");
        let (a, _) = wired_connection("a", bastion_config("pw"), Some("ui-A"), &transport);
        let (b, _) = wired_connection("b", bastion_config("pw"), Some("ui-B"), &transport);
        assert_eq!(a.cache_key, b.cache_key);
        pool_transport(&f.pool, &a.cache_key, &transport).await;
        f.active.insert("a".to_string(), a);
        f.active.insert("b".to_string(), b);

        assert!(f.cleanup.cleanup_connection("a"));
        assert!(f.output.disconnects().is_empty());

        assert!(f.cleanup.cleanup_connection("b"));
        settle().await;
        assert_eq!(
            f.output.disconnects(),
            vec![DisconnectEvent {
                original_key: "ui-B".to_string(),
                tab_id: "b".to_string(),
            }]
        );
        assert_eq!(transport.closes(), 1);
    }

    #[tokio::test]
    async fn test_final_flush_writes_buffered_input() {
        let f = fixture();
        let transport = MockTransport::new("t");
        let (conn, stream) = wired_connection("a", bastion_config("pw"), None, &transport);
        f.active.insert("a".to_string(), conn.clone());
        conn.write_buffer.lock().bytes.extend_from_slice(b"exit");

        f.cleanup.cleanup_connection("a");
        assert_eq!(stream.written(), b"exit".to_vec());
    }

    #[tokio::test]
    async fn test_cleanup_all() {
        let f = fixture();
        let shared = MockTransport::new("shared");
        let other = MockTransport::new("other");
        let (a, sa) = wired_connection("a", direct_config("pw"), None, &shared);
        let (b, sb) = wired_connection("b", direct_config("pw"), None, &shared);
        let (c, sc) = wired_connection("c", bastion_config("pw"), None, &other);
        pool_transport(&f.pool, &a.cache_key, &shared).await;
        f.active.insert("a".to_string(), a);
        f.active.insert("b".to_string(), b);
        f.active.insert("c".to_string(), c);

        for handle in f.cleanup.cleanup_all() {
            handle.await.unwrap();
        }

        assert!(f.active.is_empty());
        assert!(f.pool.is_empty());
        assert!(sa.is_destroyed() && sb.is_destroyed() && sc.is_destroyed());
        assert_eq!(shared.closes(), 1);
        assert_eq!(other.closes(), 1);
        assert_eq!(shared.detach_calls.load(Ordering::SeqCst), 1);
    }
}
