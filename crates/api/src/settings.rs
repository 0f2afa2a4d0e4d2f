//! Process settings

use anyhow::{Context, Result};
use bridge::BridgeConfig;
use config::{Config, Environment, File};
use notifier::{FcmConfig, FcmTransport, PushTransport};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Settings file used when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "bridge.toml";
/// Environment variable naming the settings file
pub const CONFIG_ENV: &str = "BRIDGE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://bridge.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    pub enabled: bool,
    /// Overrides the default FCM endpoint
    pub endpoint: Option<String>,
    pub server_key: Option<String>,
}

impl PushSettings {
    /// Push transport, or `None` when push is disabled or has no key
    pub fn transport(&self, timeout: std::time::Duration) -> Result<Option<Arc<dyn PushTransport>>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(server_key) = self.server_key.as_deref().filter(|k| !k.is_empty()) else {
            warn!("Push enabled without a server key, notifications disabled");
            return Ok(None);
        };

        let mut config = FcmConfig::new(server_key);
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        config.timeout = timeout;
        let transport = FcmTransport::new(config).context("Failed to build push transport")?;
        Ok(Some(Arc::new(transport)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// All process settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bridge: BridgeConfig,
    pub database: DatabaseSettings,
    pub push: PushSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load defaults, then the settings file, then `BRIDGE__` environment overrides.
    ///
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path.to_path_buf()).required(true),
            None => File::from(PathBuf::from(DEFAULT_CONFIG_FILE)).required(false),
        };

        Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("BRIDGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load settings")?
            .try_deserialize()
            .context("Invalid settings")
    }
}

/// Settings path from `--config <path>` or `BRIDGE_CONFIG`
pub fn config_path(args: impl IntoIterator<Item = String>) -> Option<PathBuf> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var_os(CONFIG_ENV).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.bridge.refresh_interval_secs, 60);
        assert_eq!(settings.database.url, "sqlite://bridge.db");
        assert_eq!(settings.server.listen_addr, "0.0.0.0:8080");
        assert!(!settings.push.enabled);
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("bridge-settings-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[bridge]\nrefresh_interval_secs = 30\ndefault_deadband = 0.01\n\n[logging]\njson = true"
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.bridge.refresh_interval_secs, 30);
        assert_eq!(settings.bridge.default_deadband, 0.01);
        assert_eq!(settings.bridge.store_timeout_ms, 5_000);
        assert!(settings.logging.json);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        assert!(Settings::load(Some(Path::new("/nonexistent/bridge.toml"))).is_err());
    }

    #[test]
    fn test_config_path_from_args() {
        let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            config_path(args(&["bin", "--config", "a.toml"])),
            Some(PathBuf::from("a.toml"))
        );
        assert_eq!(config_path(args(&["bin", "--config=b.toml"])), Some(PathBuf::from("b.toml")));
    }

    #[test]
    fn test_push_disabled_without_key() {
        let push = PushSettings {
            enabled: true,
            endpoint: None,
            server_key: None,
        };
        assert!(push.transport(std::time::Duration::from_secs(1)).unwrap().is_none());
        assert!(PushSettings::default()
            .transport(std::time::Duration::from_secs(1))
            .unwrap()
            .is_none());
    }
}
