use std::net::SocketAddr;
use std::path::PathBuf;

pub const SLACK_HOOK_URL: &str = "SLACK_HOOK_URL";
pub const WEBSITE_HOSTNAME: &str = "WEBSITE_HOSTNAME";
pub const BIND_ADDR: &str = "BIND_ADDR";
pub const DATA_DIR: &str = "DATA_DIR";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:7071";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} env variable not set")]
    Missing(&'static str),
    #[error("invalid {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Process configuration read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub slack_hook_url: Option<String>,
    pub host_name: Option<String>,
    pub bind_addr: SocketAddr,
    pub data_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let bind_raw = get(BIND_ADDR).unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw.parse().map_err(|_| ConfigError::Invalid {
            name: BIND_ADDR,
            value: bind_raw.clone(),
        })?;
        Ok(Self {
            slack_hook_url: get(SLACK_HOOK_URL),
            host_name: get(WEBSITE_HOSTNAME),
            bind_addr,
            data_dir: get(DATA_DIR).map(PathBuf::from),
        })
    }

    pub fn require_slack_hook(&self) -> Result<&str, ConfigError> {
        self.slack_hook_url.as_deref().ok_or(ConfigError::Missing(SLACK_HOOK_URL))
    }

    pub fn require_host_name(&self) -> Result<&str, ConfigError> {
        self.host_name.as_deref().ok_or(ConfigError::Missing(WEBSITE_HOSTNAME))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            slack_hook_url: None,
            host_name: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7071)),
            data_dir: None,
        }
    }
}
