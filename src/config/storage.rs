//! Config file persistence
//!
//! `CoreConfig` lives in `~/.termbridge/config.json`; `TERMBRIDGE_HOME`
//! moves the directory. A missing file means defaults. A file that no longer
//! parses is moved aside (`config.json.corrupt-<timestamp>`) and defaults
//! are used, so one bad edit never blocks startup. A file written by a newer
//! release is refused rather than silently downgraded.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::types::{CoreConfig, CONFIG_VERSION};

/// Environment variable overriding the config directory
pub const HOME_ENV: &str = "TERMBRIDGE_HOME";

const DIR_NAME: &str = ".termbridge";
const FILE_NAME: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Config directory: `$TERMBRIDGE_HOME`, else `~/.termbridge`
pub fn config_dir() -> Result<PathBuf, StorageError> {
    resolve_dir(
        std::env::var_os(HOME_ENV).map(PathBuf::from),
        dirs::home_dir(),
    )
}

pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join(FILE_NAME))
}

fn resolve_dir(overridden: Option<PathBuf>, home: Option<PathBuf>) -> Result<PathBuf, StorageError> {
    match overridden.filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => Ok(dir),
        None => home.map(|h| h.join(DIR_NAME)).ok_or(StorageError::NoConfigDir),
    }
}

/// What a config file on disk turned out to be
enum Loaded {
    Missing,
    Valid(CoreConfig),
    Corrupt(serde_json::Error),
}

pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the default location
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(config_file()?))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Read the config, falling back to defaults when missing or corrupt
    pub async fn load(&self) -> Result<CoreConfig, StorageError> {
        match self.read().await? {
            Loaded::Missing => {
                debug!("No config at {}, using defaults", self.path.display());
                Ok(CoreConfig::default())
            }
            Loaded::Valid(config) if config.version > CONFIG_VERSION => {
                Err(StorageError::VersionTooNew {
                    found: config.version,
                    supported: CONFIG_VERSION,
                })
            }
            Loaded::Valid(config) => Ok(config),
            Loaded::Corrupt(e) => {
                warn!("Config at {} is unreadable: {}", self.path.display(), e);
                match self.quarantine().await {
                    Ok(moved) => warn!("Moved it to {}, using defaults", moved.display()),
                    Err(err) => warn!("Could not move the broken config aside: {}", err),
                }
                Ok(CoreConfig::default())
            }
        }
    }

    async fn read(&self) -> Result<Loaded, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
            Err(e) => return Err(e.into()),
        };
        Ok(match serde_json::from_str(&contents) {
            Ok(config) => Loaded::Valid(config),
            Err(e) => Loaded::Corrupt(e),
        })
    }

    /// Write the config atomically (sibling temp file, fsync, rename)
    pub async fn save(&self, config: &CoreConfig) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(config)?;

        let staging = self.sibling(&format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        let written = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            fs::rename(&staging, &self.path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        info!("Config saved to {}", self.path.display());
        Ok(())
    }

    /// Move the current file to a timestamped name next to it
    async fn quarantine(&self) -> Result<PathBuf, StorageError> {
        let target = self.sibling(&format!(
            "corrupt-{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::rename(&self.path, &target).await?;
        Ok(target)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| FILE_NAME.into());
        name.push(".");
        name.push(suffix);
        self.path.with_file_name(name)
    }
}
