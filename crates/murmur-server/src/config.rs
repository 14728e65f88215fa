//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use murmur_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_OUTBOUND_BUFFER, MAX_MESSAGE_LEN, MIN_GROUP_INVITEES,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:5000`
    pub http_addr: SocketAddr,

    /// Path of the SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./murmur.db`
    pub database_path: PathBuf,

    /// Origins allowed by CORS. A single `*` allows any origin.
    /// Env: `CLIENT_URL` (comma-separated)
    /// Default: `http://localhost:5173`
    pub allowed_origins: Vec<String>,

    /// Capacity of each connection's outbound queue. Events beyond it are
    /// dropped for that connection.
    /// Env: `OUTBOUND_BUFFER`
    pub outbound_buffer: usize,

    /// Minimum number of invitees when creating a group.
    /// Env: `MIN_GROUP_INVITEES`
    pub min_group_invitees: usize,

    /// Maximum message body length in characters.
    /// Env: `MAX_MESSAGE_LEN`
    pub max_message_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./murmur.db"),
            allowed_origins: vec!["http://localhost:5173".to_string()],
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            min_group_invitees: MIN_GROUP_INVITEES,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(origins) = lookup("CLIENT_URL") {
            let parsed: Vec<String> = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.allowed_origins = parsed;
            }
        }

        if let Some(n) = parse_positive(&lookup, "OUTBOUND_BUFFER") {
            config.outbound_buffer = n;
        }

        if let Some(n) = lookup("MIN_GROUP_INVITEES").and_then(|v| v.parse::<usize>().ok()) {
            config.min_group_invitees = n;
        }

        if let Some(n) = parse_positive(&lookup, "MAX_MESSAGE_LEN") {
            config.max_message_len = n;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid positive integer, using default");
            None
        }
    }
}
