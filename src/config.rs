use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::ControllerSettings;
use crate::launcher::LauncherSettings;

const DEFAULT_FALLBACK_COMMAND: &str = "sbx ssh {name}";

/// Client configuration, loaded from TOML.
///
/// ```toml
/// proxy_url = "wss://proxy.example.dev/terminal"
/// registry_url = "https://api.example.dev"
/// browser_url = "https://app.example.dev/sandboxes/{name}/terminal"
/// fallback_command = "sbx ssh {name}"
///
/// [reconnect]
/// base_delay_ms = 1000
/// max_attempts = 2
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket URL of the terminal proxy.
    pub proxy_url: Option<String>,
    /// Base URL of the sandbox registry API.
    pub registry_url: Option<String>,
    /// Operator bearer token. Prefer `SBXTERM_TOKEN` over storing it here.
    pub token: Option<String>,
    /// Browser terminal link shown when connecting keeps failing. `{name}`
    /// is replaced by the session name.
    pub browser_url: Option<String>,
    /// Out-of-band command shown when connecting keeps failing.
    #[serde(default = "default_fallback_command")]
    pub fallback_command: String,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    /// Failed attempts before giving up; also the escalation threshold.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub resize_debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// How long an unmatched open request waits. 0 waits forever.
    pub pending_ttl_secs: u64,
    pub registry_refresh_secs: u64,
}

fn default_fallback_command() -> String {
    DEFAULT_FALLBACK_COMMAND.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_url: None,
            registry_url: None,
            token: None,
            browser_url: None,
            fallback_command: default_fallback_command(),
            reconnect: ReconnectConfig::default(),
            terminal: TerminalConfig::default(),
            launcher: LauncherConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_attempts: 2,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            resize_debounce_ms: 150,
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: 120,
            registry_refresh_secs: 5,
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // The file may carry a token.
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load from `path`, or the default location when `path` is None.
    /// A missing file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        Ok(Self::load(&path)?.unwrap_or_default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.max_attempts must be at least 1".into(),
            ));
        }
        if self.launcher.registry_refresh_secs == 0 {
            return Err(ConfigError::Invalid(
                "launcher.registry_refresh_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_attempts: self.reconnect.max_attempts,
            resize_debounce: Duration::from_millis(self.terminal.resize_debounce_ms),
        }
    }

    pub fn launcher_settings(&self) -> LauncherSettings {
        LauncherSettings {
            pending_ttl: match self.launcher.pending_ttl_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            registry_refresh: Duration::from_secs(self.launcher.registry_refresh_secs),
        }
    }
}

/// `$XDG_CONFIG_HOME/sbxterm/config.toml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sbxterm").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn when a config file is world-readable, since it may hold a token.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain a token -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
