use std::path::PathBuf;

use deaddrop_shared::constants::{
    ACTIVE_SESSION_GRACE_SECS, DEFAULT_HTTP_PORT, DEFAULT_MAX_FILE_BYTES,
    UNUSED_SESSION_GRACE_SECS,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage_root: PathBuf,
    /// Per-session byte budget. `-1` means unlimited.
    pub max_session_storage_bytes: i64,
    /// Concurrent live session cap. `-1` means unlimited.
    pub max_active_sessions: i64,
    /// Origin/Referer prefixes accepted by the API access filter.
    /// Empty list disables the origin check.
    pub allowed_origins: Vec<String>,
    /// Public base used when constructing download URLs.
    pub base_url: String,
    pub max_file_bytes: u64,
    pub unused_session_grace_secs: u64,
    pub active_session_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_HTTP_PORT,
            storage_root: PathBuf::from("./storage"),
            max_session_storage_bytes: -1,
            max_active_sessions: -1,
            allowed_origins: Vec::new(),
            base_url: format!("http://localhost:{DEFAULT_HTTP_PORT}"),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            unused_session_grace_secs: UNUSED_SESSION_GRACE_SECS,
            active_session_grace_secs: ACTIVE_SESSION_GRACE_SECS,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PORT") {
            match val.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid PORT, using default"),
            }
        }

        if let Ok(path) = std::env::var("STORAGE_ROOT") {
            config.storage_root = PathBuf::from(path);
        }

        if let Ok(val) = std::env::var("MAX_SESSION_STORAGE_BYTES") {
            match val.parse::<i64>() {
                Ok(n) => config.max_session_storage_bytes = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid MAX_SESSION_STORAGE_BYTES, using default")
                }
            }
        }

        if let Ok(val) = std::env::var("MAX_ACTIVE_SESSIONS") {
            match val.parse::<i64>() {
                Ok(n) => config.max_active_sessions = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid MAX_ACTIVE_SESSIONS, using default")
                }
            }
        }

        if let Ok(val) = std::env::var("ALLOWED_ORIGINS") {
            config.allowed_origins = parse_origins(&val);
        }

        if let Ok(url) = std::env::var("BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }

        if let Ok(val) = std::env::var("MAX_FILE_BYTES") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.max_file_bytes = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_FILE_BYTES, using default"),
            }
        }

        if let Ok(val) = std::env::var("UNUSED_SESSION_GRACE_SECS") {
            match val.parse::<u64>() {
                Ok(n) => config.unused_session_grace_secs = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid UNUSED_SESSION_GRACE_SECS, using default")
                }
            }
        }

        if let Ok(val) = std::env::var("ACTIVE_SESSION_GRACE_SECS") {
            match val.parse::<u64>() {
                Ok(n) => config.active_session_grace_secs = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid ACTIVE_SESSION_GRACE_SECS, using default")
                }
            }
        }

        config
    }

    pub fn unlimited_storage(&self) -> bool {
        self.max_session_storage_bytes < 0
    }

    pub fn unlimited_sessions(&self) -> bool {
        self.max_active_sessions < 0
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
