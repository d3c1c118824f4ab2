//! Configuration Management Module
//!
//! Core settings (write buffering, pool sweeping, authentication prompts,
//! session behaviour) and their persistent storage.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, ConfigStorage, StorageError, HOME_ENV};
pub use types::{
    AuthConfig, CoreConfig, PoolConfig, SessionSettings, WriteBufferConfig, CONFIG_VERSION,
};
