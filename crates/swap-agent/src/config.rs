//! Agent configuration
//!
//! Defaults suit an agent attached to an application on device. Tests and
//! the CLI override them from TOML or the environment.

use crate::error::ConfigError;
use crate::logging::LogConfig;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Socket override
pub const ENV_SOCKET: &str = "SWAP_AGENT_SOCKET";
/// Connect timeout override, in milliseconds
pub const ENV_CONNECT_TIMEOUT_MS: &str = "SWAP_AGENT_CONNECT_TIMEOUT_MS";
/// Payload directory override; pins the payload to one directory
pub const ENV_PAYLOAD_DIR: &str = "SWAP_AGENT_PAYLOAD_DIR";

/// Per-application directory the payload is written under
const APP_PAYLOAD_SUBDIR: &str = ".studio";

/// Where the payload file lives
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadDir {
    /// `<root>/<package_name>/.studio`
    AppPrivate { root: PathBuf },
    /// One fixed directory regardless of package
    Fixed(PathBuf),
}

impl PayloadDir {
    /// Resolve the directory for `package_name`
    ///
    /// Returns `None` if the package name is not a single plain path
    /// component, since joining it could leave `root`.
    #[must_use]
    pub fn resolve(&self, package_name: &str) -> Option<PathBuf> {
        match self {
            Self::AppPrivate { root } => {
                let mut components = Path::new(package_name).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(name)), None) => {
                        Some(root.join(name).join(APP_PAYLOAD_SUBDIR))
                    }
                    _ => None,
                }
            }
            Self::Fixed(dir) => Some(dir.clone()),
        }
    }
}

impl Default for PayloadDir {
    fn default() -> Self {
        Self::AppPrivate {
            root: PathBuf::from("/data/data"),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Controller socket
    pub socket_path: PathBuf,
    /// Bound on the connect step, in milliseconds
    pub connect_timeout_ms: u64,
    /// Payload location
    pub payload_dir: PayloadDir,
    /// Logging setup
    pub log: LogConfig,
}

impl AgentConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With controller socket
    #[inline]
    #[must_use]
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// With connect timeout
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With payload location
    #[inline]
    #[must_use]
    pub fn with_payload_dir(mut self, dir: PayloadDir) -> Self {
        self.payload_dir = dir;
        self
    }

    /// Connect timeout as a duration
    #[inline]
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Parse a TOML document; missing keys take defaults
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] on malformed TOML and
    /// [`ConfigError::InvalidValue`] on out-of-range values
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`AgentConfig::from_toml_str`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `SWAP_AGENT_*` environment overrides
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidValue`] if an override cannot be parsed
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidValue`] if an override cannot be parsed
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup(ENV_SOCKET) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(timeout) = lookup(ENV_CONNECT_TIMEOUT_MS) {
            self.connect_timeout_ms =
                timeout
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: ENV_CONNECT_TIMEOUT_MS,
                        value: timeout.clone(),
                    })?;
        }
        if let Some(dir) = lookup(ENV_PAYLOAD_DIR) {
            self.payload_dir = PayloadDir::Fixed(PathBuf::from(dir));
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "connect_timeout_ms",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir().join("swap-agent.sock"),
            connect_timeout_ms: 1000,
            payload_dir: PayloadDir::default(),
            log: LogConfig::default(),
        }
    }
}
