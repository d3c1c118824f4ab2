//! Remote session metadata
//!
//! One-shot lookup of the remote hostname and OS id through exec channels
//! once the interactive shell is open. Failures are logged and replaced by
//! placeholders; they never affect the shell.
//!
//! Bastion gateways commonly refuse exec requests, so placeholders are the
//! normal result there.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info};

use super::types::SessionMetadata;
use crate::ssh::{SshError, Transport};

pub const UNKNOWN_HOSTNAME: &str = "unknown";
pub const DEFAULT_OS_ID: &str = "linux";

const HOSTNAME_CMD: &str = "hostname";

/// `/etc/os-release` when present, otherwise the kernel name
const OS_CMD: &str = "cat /etc/os-release 2>/dev/null || uname -s";

const TOTAL_TIMEOUT: Duration = Duration::from_secs(8);

/// Resolve hostname and OS id, never failing
pub async fn resolve_session_metadata(transport: &dyn Transport, tab_id: &str) -> SessionMetadata {
    match timeout(TOTAL_TIMEOUT, resolve_inner(transport, tab_id)).await {
        Ok(metadata) => metadata,
        Err(_) => {
            debug!("Metadata lookup timed out for tab {}", tab_id);
            placeholder()
        }
    }
}

fn placeholder() -> SessionMetadata {
    SessionMetadata {
        hostname: UNKNOWN_HOSTNAME.to_string(),
        os_id: DEFAULT_OS_ID.to_string(),
    }
}

async fn resolve_inner(transport: &dyn Transport, tab_id: &str) -> SessionMetadata {
    let hostname = match run(transport, HOSTNAME_CMD).await {
        Ok(out) => out
            .lines()
            .next()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(UNKNOWN_HOSTNAME)
            .to_string(),
        Err(e) => {
            debug!("hostname lookup failed for tab {}: {}", tab_id, e);
            UNKNOWN_HOSTNAME.to_string()
        }
    };

    let os_id = match run(transport, OS_CMD).await {
        Ok(out) => parse_os_id(&out),
        Err(e) => {
            debug!("OS lookup failed for tab {}: {}", tab_id, e);
            DEFAULT_OS_ID.to_string()
        }
    };

    info!("Tab {} is on {} ({})", tab_id, hostname, os_id);
    SessionMetadata { hostname, os_id }
}

async fn run(transport: &dyn Transport, command: &str) -> Result<String, SshError> {
    let output = transport.exec(command).await?;
    if !output.success() {
        return Err(SshError::CommandFailed(format!(
            "'{}' exited with {:?}",
            command, output.exit_code
        )));
    }
    Ok(output.stdout)
}

/// OS id from os-release content or a `uname -s` line
fn parse_os_id(output: &str) -> String {
    if let Some(id) = extract_os_release_field(output, "ID") {
        return id.to_lowercase();
    }
    let first = output.lines().next().unwrap_or_default();
    match classify_unix_os(first) {
        Some(os) => os,
        None => DEFAULT_OS_ID.to_string(),
    }
}

fn classify_unix_os(uname_s: &str) -> Option<String> {
    let s = uname_s.trim();
    let upper = s.to_uppercase();

    // Windows variant environments (Git Bash, MSYS, Cygwin)
    if upper.starts_with("MINGW") {
        return Some("windows_mingw".to_string());
    }
    if upper.starts_with("MSYS") {
        return Some("windows_msys".to_string());
    }
    if upper.starts_with("CYGWIN") {
        return Some("windows_cygwin".to_string());
    }

    match s {
        "" | "unknown" => None,
        "Darwin" => Some("macos".to_string()),
        other => Some(other.to_lowercase()),
    }
}

fn extract_os_release_field(content: &str, field: &str) -> Option<String> {
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(field) {
            if let Some(value) = rest.strip_prefix('=') {
                // Remove surrounding quotes if present
                let cleaned = value.trim().trim_matches('"').trim().to_string();
                if !cleaned.is_empty() {
                    return Some(cleaned);
                }
            }
        }
    }
    None
}
