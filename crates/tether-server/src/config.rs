//! Server configuration: environment variables + CLI overrides.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use tether_core::{TetherError, TetherResult};

/// Default history buffer capacity (1 MiB).
const DEFAULT_MAX_HISTORY_BYTES: usize = 1024 * 1024;

fn default_port() -> u16 {
    8080
}
fn default_ssh_port() -> u16 {
    22
}

/// SSH target the PTY bridge connects to.
#[derive(Debug, Clone)]
pub struct SshTargetConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Preferred over `password` when both are set.
    pub private_key_path: Option<PathBuf>,
    pub password: Option<String>,
}

/// Resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub bind_address: String,
    pub ssh: SshTargetConfig,
    pub max_history_bytes: usize,
    /// Shared controller secret. When unset, every controller attach is
    /// rejected.
    pub controller_token: Option<String>,
}

impl RelayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> TetherResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    fn from_lookup<F>(get: F) -> TetherResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse_or(get("PORT"), default_port(), "PORT")?;
        let bind_address = non_empty(get("BIND_ADDRESS")).unwrap_or_else(|| "0.0.0.0".to_string());

        let host = non_empty(get("SSH_HOST"))
            .ok_or_else(|| TetherError::Config("SSH_HOST is required".into()))?;
        let ssh_port = parse_or(get("SSH_PORT"), default_ssh_port(), "SSH_PORT")?;
        let username = non_empty(get("SSH_USERNAME"))
            .ok_or_else(|| TetherError::Config("SSH_USERNAME is required".into()))?;
        let private_key_path = non_empty(get("SSH_PRIVATE_KEY_PATH")).map(|s| expand_tilde(&s));
        let password = non_empty(get("SSH_PASSWORD"));
        if private_key_path.is_none() && password.is_none() {
            return Err(TetherError::Config(
                "either SSH_PRIVATE_KEY_PATH or SSH_PASSWORD must be set".into(),
            ));
        }

        let max_history_bytes = parse_or(
            get("MAX_HISTORY_BYTES"),
            DEFAULT_MAX_HISTORY_BYTES,
            "MAX_HISTORY_BYTES",
        )?;
        let controller_token = non_empty(get("TERMINAL_CONTROLLER_TOKEN"));

        Ok(Self {
            port,
            bind_address,
            ssh: SshTargetConfig {
                host,
                port: ssh_port,
                username,
                private_key_path,
                password,
            },
            max_history_bytes,
            controller_token,
        })
    }
}

/// Treat unset and empty variables the same.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn parse_or<T>(raw: Option<String>, default: T, key: &str) -> TetherResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match non_empty(raw) {
        Some(s) => s
            .parse()
            .map_err(|e| TetherError::Config(format!("invalid {key}: {e}"))),
        None => Ok(default),
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
