//! SSH Configuration

use serde::{Deserialize, Serialize};

/// Protocol tag used in bastion-routed logins when none is configured
const DEFAULT_BASTION_PROTOCOL: &str = "SSH";

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address (the final target when routed through a bastion)
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username on the target host
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Terminal columns
    #[serde(default = "default_cols")]
    pub cols: u32,

    /// Terminal rows
    #[serde(default = "default_rows")]
    pub rows: u32,

    /// Access-control bastion the session is routed through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion: Option<BastionRoute>,

    /// Strict host key checking
    /// - true: reject connections to unknown hosts
    /// - false: trust on first use, still reject changed keys
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

/// Bastion hop for access-gateway style routing.
///
/// The bastion does not forward TCP; it accepts a single SSH login whose
/// username encodes the target: `target_user@target_host:PROTOCOL:bastion_user`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BastionRoute {
    /// Bastion address
    pub host: String,

    /// Bastion port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Account on the bastion itself
    pub username: String,

    /// Target protocol tag in the routed login
    #[serde(default = "default_bastion_protocol")]
    pub protocol: String,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication. An empty password means "ask in the terminal".
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// Keyboard-Interactive authentication (2FA/TOTP), answered in the terminal
    KeyboardInteractive,
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    /// Short tag identifying the credential context for transport sharing
    fn context(&self) -> String {
        match self {
            AuthMethod::Password { .. } => "password".to_string(),
            AuthMethod::Key { key_path, .. } => format!("key:{}", key_path),
            AuthMethod::KeyboardInteractive => "kbi".to_string(),
        }
    }
}

impl SshConfig {
    /// Host and port the TCP connection is actually opened to
    pub fn dial_target(&self) -> (&str, u16) {
        match &self.bastion {
            Some(bastion) => (bastion.host.as_str(), bastion.port),
            None => (self.host.as_str(), self.port),
        }
    }

    /// Username presented during SSH authentication
    pub fn login_username(&self) -> String {
        match &self.bastion {
            Some(bastion) => format!(
                "{}@{}:{}:{}",
                self.username, self.host, bastion.protocol, bastion.username
            ),
            None => self.username.clone(),
        }
    }

    pub fn is_bastion_routed(&self) -> bool {
        self.bastion.is_some()
    }

    /// Identity of the shared transport: dial endpoint + login + auth context
    pub fn cache_key(&self) -> String {
        let (host, port) = self.dial_target();
        format!(
            "{}@{}:{}#{}",
            self.login_username(),
            host,
            port,
            self.auth.context()
        )
    }

    /// Identity of the logical endpoint as the user sees it
    pub fn original_key(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Password supplied with the configuration, if any
    pub fn stored_password(&self) -> Option<&str> {
        match &self.auth {
            AuthMethod::Password { password } if !password.is_empty() => Some(password),
            _ => None,
        }
    }

    /// True when authentication cannot start without asking the user first
    pub fn needs_password_prompt(&self) -> bool {
        matches!(&self.auth, AuthMethod::Password { password } if password.is_empty())
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

fn default_bastion_protocol() -> String {
    DEFAULT_BASTION_PROTOCOL.to_string()
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthMethod::Password {
                password: String::new(),
            },
            timeout_secs: 30,
            cols: 80,
            rows: 24,
            bastion: None,
            strict_host_key_checking: false,
        }
    }
}
