//! Configuration Vault – reads/writes `~/.rosdeck/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rosdeck_cockpit::BridgeSettings;
use url::Url;

/// Persisted bridge configuration stored in `~/.rosdeck/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// rosbridge server the bridge connects to.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// HTTP port for the dashboard API and viewer socket.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Age after which an unanswered dialog question is dropped.
    #[serde(default = "default_dialog_ttl_secs")]
    pub dialog_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_broker_url() -> String {
    "ws://localhost:9090".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_retry_interval_ms() -> u64 {
    3000
}
fn default_dialog_ttl_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_command_timeout_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            http_port: default_http_port(),
            retry_interval_ms: default_retry_interval_ms(),
            dialog_ttl_secs: default_dialog_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Config {
    /// Check that the broker URL is a `ws://` or `wss://` URL with a host.
    pub fn validate(&self) -> Result<(), String> {
        let url = Url::parse(&self.broker_url)
            .map_err(|e| format!("Invalid broker_url '{}': {}", self.broker_url, e))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(format!(
                "broker_url must use ws:// or wss://, got '{}'",
                url.scheme()
            ));
        }
        if url.host_str().is_none() {
            return Err(format!("broker_url '{}' has no host", self.broker_url));
        }
        Ok(())
    }

    /// Runtime settings for the bridge context.
    pub fn bridge_settings(&self) -> BridgeSettings {
        let mut settings = BridgeSettings::new(self.broker_url.clone());
        settings.retry_interval = Duration::from_millis(self.retry_interval_ms);
        settings.dialog_ttl = Duration::from_secs(self.dialog_ttl_secs);
        settings.sweep_interval = Duration::from_secs(self.sweep_interval_secs);
        settings.command_timeout = Duration::from_secs(self.command_timeout_secs);
        settings
    }
}

/// Return the path to `~/.rosdeck/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".rosdeck").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `ROSDECK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROSDECK_BROKER_URL` | `broker_url` |
/// | `ROSDECK_HTTP_PORT` | `http_port` |
/// | `ROSDECK_RETRY_INTERVAL_MS` | `retry_interval_ms` |
/// | `ROSDECK_DIALOG_TTL_SECS` | `dialog_ttl_secs` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ROSDECK_BROKER_URL") {
        cfg.broker_url = v;
    }
    if let Ok(v) = std::env::var("ROSDECK_HTTP_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.http_port = port;
    }
    if let Ok(v) = std::env::var("ROSDECK_RETRY_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.retry_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("ROSDECK_DIALOG_TTL_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.dialog_ttl_secs = secs;
    }
}

/// Save the config to disk, creating `~/.rosdeck/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
