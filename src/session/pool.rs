//! SSH Transport Pool
//!
//! 按 `cache_key` 共享已认证的 transport。
//!
//! # 架构
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  ConnectionPool                              │
//! │  cache_key ──▶ PoolEntry { transport, .. }   │
//! └──────────────────────────────────────────────┘
//!          │ Arc<dyn Transport>
//!    ┌─────┴─────┬─────────────┐
//!    ▼           ▼             ▼
//!  Tab 1       Tab 2         Tab 3     (各自的 shell 流)
//! ```
//!
//! # 引用计数
//!
//! 池中不保存引用计数。某个 `cache_key` 的引用数总是通过扫描活跃连接
//! 表实时推导（[`count_references`]），因此不会与实际标签页状态失去同步。
//!
//! # 关闭
//!
//! 关闭时先从表中移除条目，再异步关闭 transport，保证每个池化的
//! transport 最多被关闭一次。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{ActiveConnections, Connection};
use crate::ssh::{SshError, Transport};

/// Number of connections in `connections` that use `cache_key`
pub fn count_references<I>(cache_key: &str, connections: I) -> usize
where
    I: IntoIterator,
    I::Item: AsRef<Connection>,
{
    connections
        .into_iter()
        .filter(|conn| conn.as_ref().cache_key == cache_key)
        .count()
}

/// Clone the current set of active connections
pub fn snapshot(active: &ActiveConnections) -> Vec<Arc<Connection>> {
    active.iter().map(|entry| entry.value().clone()).collect()
}

/// 连接池条目
struct PoolEntry {
    transport: Arc<dyn Transport>,
    created_at: DateTime<Utc>,
}

/// 连接池统计信息（用于监控面板）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolStats {
    /// 池中 transport 数
    pub total_transports: usize,
    /// 存活的 transport 数
    pub alive_transports: usize,
    /// 没有任何标签页引用的 transport 数（等待清扫）
    pub orphaned_transports: usize,
    /// 所有键的引用总数
    pub total_references: usize,
    /// 池中的键及其创建时间
    pub keys: Vec<PoolKeyInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolKeyInfo {
    pub cache_key: String,
    pub references: usize,
    pub alive: bool,
    pub created_at: String,
}

/// 共享 transport 池
#[derive(Default)]
pub struct ConnectionPool {
    entries: DashMap<String, PoolEntry>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取存活的 transport；已断开的条目会被移除
    fn live(&self, cache_key: &str) -> Option<Arc<dyn Transport>> {
        let transport = self.entries.get(cache_key).map(|e| e.transport.clone())?;
        if transport.is_alive() {
            return Some(transport);
        }

        warn!("Pooled transport {} for {} is dead, evicting", transport.id(), cache_key);
        let removed = self
            .entries
            .remove_if(cache_key, |_, entry| Arc::ptr_eq(&entry.transport, &transport));
        if removed.is_some() {
            close_detached(transport);
        }
        None
    }

    /// True when a live transport is pooled under `cache_key`
    pub fn contains_live(&self, cache_key: &str) -> bool {
        self.live(cache_key).is_some()
    }

    /// 获取或创建 transport
    ///
    /// `factory` 只在池中没有存活 transport 时调用。如果创建期间其他调用方
    /// 已经放入了存活的 transport，新建的 transport 会被关闭，返回池中的那个。
    pub async fn acquire<F, Fut>(
        &self,
        cache_key: &str,
        factory: F,
    ) -> Result<Arc<dyn Transport>, SshError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Transport>, SshError>>,
    {
        if let Some(existing) = self.live(cache_key) {
            debug!("Reusing pooled transport {} for {}", existing.id(), cache_key);
            return Ok(existing);
        }

        let fresh = factory().await?;

        let pooled = match self.entries.entry(cache_key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().transport.is_alive() => {
                Some(occupied.get().transport.clone())
            }
            Entry::Occupied(mut occupied) => {
                let stale = occupied.insert(PoolEntry::new(fresh.clone()));
                close_detached(stale.transport);
                None
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PoolEntry::new(fresh.clone()));
                None
            }
        };

        match pooled {
            Some(pooled) => {
                info!(
                    "Transport for {} was pooled concurrently, closing duplicate {}",
                    cache_key,
                    fresh.id()
                );
                close_detached(fresh);
                Ok(pooled)
            }
            None => {
                info!("Pooled new transport {} for {}", fresh.id(), cache_key);
                Ok(fresh)
            }
        }
    }

    /// 释放一个标签页对 `cache_key` 的使用，返回其余标签页的引用数
    pub fn release(&self, cache_key: &str, tab_id: &str, active: &ActiveConnections) -> usize {
        let remaining = snapshot(active)
            .into_iter()
            .filter(|conn| conn.tab_id != tab_id)
            .filter(|conn| conn.cache_key == cache_key)
            .count();
        debug!(
            "Tab {} released {}, {} references remain",
            tab_id, cache_key, remaining
        );
        remaining
    }

    /// 关闭并移除 transport。返回是否确实移除了条目。
    pub fn close(&self, cache_key: &str) -> bool {
        match self.entries.remove(cache_key) {
            Some((_, entry)) => {
                info!("Closing pooled transport {} for {}", entry.transport.id(), cache_key);
                close_detached(entry.transport);
                true
            }
            None => {
                debug!("No pooled transport for {}", cache_key);
                false
            }
        }
    }

    /// 关闭所有没有被任何活跃连接引用的 transport，返回关闭数量
    pub fn sweep_orphaned(&self, active: &ActiveConnections) -> usize {
        let connections = snapshot(active);
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();

        let mut closed = 0;
        for key in keys {
            if count_references(&key, &connections) > 0 {
                continue;
            }
            // Each close is independent; a transport that fails to close
            // only logs from its own task
            if self.close(&key) {
                closed += 1;
            }
        }

        if closed > 0 {
            info!("Swept {} orphaned transports", closed);
        }
        closed
    }

    /// 启动周期性清扫任务
    pub fn start_sweeper(
        self: &Arc<Self>,
        active: ActiveConnections,
        interval: Duration,
    ) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    debug!("Pool dropped, sweeper exiting");
                    break;
                };
                pool.sweep_orphaned(&active);
            }
        })
    }

    /// Remove every entry and hand back the transports
    pub fn drain(&self) -> Vec<Arc<dyn Transport>> {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .map(|(_, entry)| entry.transport)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 获取连接池统计信息
    pub fn stats(&self, active: &ActiveConnections) -> ConnectionPoolStats {
        let connections = snapshot(active);
        let mut keys: Vec<PoolKeyInfo> = self
            .entries
            .iter()
            .map(|entry| PoolKeyInfo {
                cache_key: entry.key().clone(),
                references: count_references(entry.key(), &connections),
                alive: entry.transport.is_alive(),
                created_at: entry.created_at.to_rfc3339(),
            })
            .collect();
        keys.sort_by(|a, b| a.cache_key.cmp(&b.cache_key));

        ConnectionPoolStats {
            total_transports: keys.len(),
            alive_transports: keys.iter().filter(|k| k.alive).count(),
            orphaned_transports: keys.iter().filter(|k| k.references == 0).count(),
            total_references: keys.iter().map(|k| k.references).sum(),
            keys,
        }
    }
}

impl PoolEntry {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            created_at: Utc::now(),
        }
    }
}

/// Stop event delivery, then close in the background
fn close_detached(transport: Arc<dyn Transport>) {
    transport.detach_listeners();
    tokio::spawn(async move {
        transport.close().await;
        debug!("Transport {} closed", transport.id());
    });
}
