//! Configuration types

use serde::{Deserialize, Serialize};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Root of `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    /// Config file version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub write_buffer: WriteBufferConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub session: SessionSettings,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            write_buffer: WriteBufferConfig::default(),
            pool: PoolConfig::default(),
            auth: AuthConfig::default(),
            session: SessionSettings::default(),
        }
    }
}

/// Input coalescing for bastion-routed tabs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteBufferConfig {
    /// Delay before buffered input is flushed (ms)
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,

    /// Buffer size that forces an immediate flush
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
}

fn default_flush_delay_ms() -> u64 {
    5
}

fn default_max_buffered_bytes() -> usize {
    8
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: default_flush_delay_ms(),
            max_buffered_bytes: default_max_buffered_bytes(),
        }
    }
}

/// 连接池配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// 孤立连接清扫间隔（秒），0 = 不启动清扫任务
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Terminal-side authentication prompts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default = "default_password_prompt")]
    pub password_prompt: String,

    /// Shown above the prompt after a rejected attempt
    #[serde(default = "default_retry_message")]
    pub retry_message: String,

    /// How long a keyboard-interactive round may wait for the user (seconds)
    #[serde(default = "default_kbi_timeout_secs")]
    pub kbi_timeout_secs: u64,
}

fn default_password_prompt() -> String {
    "Password: ".to_string()
}

fn default_retry_message() -> String {
    "Authentication failed, please try again.".to_string()
}

fn default_kbi_timeout_secs() -> u64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            password_prompt: default_password_prompt(),
            retry_message: default_retry_message(),
            kbi_timeout_secs: default_kbi_timeout_secs(),
        }
    }
}

/// Per-tab session behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    /// Interval for byte-counter events (seconds), 0 = disabled
    #[serde(default)]
    pub stats_interval_secs: u64,

    /// Run `hostname` / os detection once the shell is open
    #[serde(default = "default_true")]
    pub resolve_metadata: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            stats_interval_secs: 0,
            resolve_metadata: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"writeBuffer":{"flushDelayMs":10}}"#).unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.write_buffer.flush_delay_ms, 10);
        assert_eq!(config.write_buffer.max_buffered_bytes, 8);
        assert_eq!(config.pool.sweep_interval_secs, 60);
        assert_eq!(config.auth.password_prompt, "Password: ");
        assert!(config.session.resolve_metadata);
    }

    #[test]
    fn test_camel_case_keys() {
        let json = serde_json::to_value(CoreConfig::default()).unwrap();
        assert_eq!(json["auth"]["kbiTimeoutSecs"], 60);
        assert_eq!(json["pool"]["sweepIntervalSecs"], 60);
        assert_eq!(json["session"]["statsIntervalSecs"], 0);
    }
}
