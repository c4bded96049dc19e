use crate::error::ConfigError;
use anyhow::{anyhow, Result};
use config::Config;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// Settings shared by the schema tool and the deployment bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VinowConfig {
    /// File the settings were read from
    pub config_file: String,

    /// Directory holding the database and media files
    pub data_dir: String,

    /// SQLite database file (default: `<data_dir>/vinow.sqlite3`)
    pub database_path: String,

    /// Application signing secret
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,

    /// Key granting the service role
    #[serde(skip_serializing)]
    pub service_key: Option<String>,

    /// Cache endpoint, probed before startup
    pub redis_url: Option<String>,

    /// Media root (default: `<data_dir>/media`)
    pub media_dir: String,

    /// `development` or `production`
    pub environment: String,

    pub host: String,
    pub port: u16,

    /// Worker processes in production mode
    pub workers: u32,

    pub log_level: String,

    /// ASGI application the server command launches
    pub app_module: String,
}

const EMPTY_CONFIG: &str = r#"### vinow configuration file
### every key can be overridden by a VINOW_<KEY> environment variable

### directory for the database and media files
# data_dir = "~/.vinow"
# database_path = "~/.vinow/vinow.sqlite3"
# media_dir = "~/.vinow/media"

### secrets (required)
# secret_key = ""
# service_key = ""

### cache endpoint
# redis_url = "redis://localhost:6379/0"

### server
# environment = "development"   # or "production"
# host = "0.0.0.0"
# port = 8000
# workers = 4
# log_level = "info"
# app_module = "app.main:app"
"#;

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";
const MIN_SECRET_LEN: usize = 20;
const ENVIRONMENTS: [&str; 2] = ["development", "production"];

impl Default for VinowConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());
        let data_dir = format!("{}/.vinow", home_dir);

        Self {
            config_file: Self::config_file_path(),
            database_path: format!("{}/vinow.sqlite3", data_dir),
            media_dir: format!("{}/media", data_dir),
            data_dir,
            secret_key: None,
            service_key: None,
            redis_url: Some(DEFAULT_REDIS_URL.to_string()),
            environment: "development".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            workers: 4,
            log_level: "info".to_string(),
            app_module: "app.main:app".to_string(),
        }
    }
}

/// How the application server is launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Single process with code reload
    Development,
    Production { workers: u32 },
}

impl VinowConfig {
    /// Function to create and initialize a new configuration
    pub fn new(path: &Option<String>) -> Result<VinowConfig> {
        // `.env` values become plain environment variables; a missing file is fine
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();

        // By default use $HOME/.vinow/vinow.toml as the configuration file path
        let home_dir = dirs::home_dir()
            .ok_or_else(|| anyhow!("Could not find home directory"))?
            .to_str()
            .ok_or_else(|| anyhow!("Could not convert home directory path to string"))?
            .to_owned();
        let vinow_dir = format!("{}/.vinow", home_dir);

        let config_path = match path {
            Some(p) => p.clone(),
            None => {
                std::fs::create_dir_all(vinow_dir.as_str())
                    .map_err(|e| anyhow!("Unable to create vinow directory: {}", e))?;
                format!("{}/vinow.toml", vinow_dir)
            }
        };
        if Path::new(config_path.as_str()).exists() {
            builder = builder.add_source(config::File::with_name(config_path.as_str()));
        } else {
            std::fs::write(config_path.as_str(), EMPTY_CONFIG)
                .map_err(|e| anyhow!("Unable to create config file {}: {}", config_path, e))?;
        }

        // E.g., `VINOW_ENVIRONMENT=production vinow-schema prepare`
        builder = builder.add_source(config::Environment::with_prefix("VINOW"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let map = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        let mut config = Self::from_map(&map)?;
        config.config_file = config_path;
        Ok(config)
    }

    /// Build a configuration from flat key/value pairs, filling defaults
    pub fn from_map(map: &HashMap<String, String>) -> std::result::Result<Self, ConfigError> {
        let defaults = Self::default();
        let value = |key: &str| {
            map.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let data_dir = value("data_dir")
            .map(|d| expand_home(&d))
            .unwrap_or(defaults.data_dir);
        let data_dir = data_dir.trim_end_matches('/').to_string();

        let database_path = value("database_path")
            .map(|p| expand_home(&p))
            .unwrap_or_else(|| format!("{}/vinow.sqlite3", data_dir));
        let media_dir = value("media_dir")
            .map(|p| expand_home(&p))
            .unwrap_or_else(|| format!("{}/media", data_dir));

        let port = match value("port") {
            Some(p) => p.parse().map_err(|_| ConfigError::Invalid {
                key: "port".to_string(),
                reason: format!("'{}' is not a valid port", p),
            })?,
            None => defaults.port,
        };
        let workers = match value("workers") {
            Some(w) => w.parse().map_err(|_| ConfigError::Invalid {
                key: "workers".to_string(),
                reason: format!("'{}' is not a number", w),
            })?,
            None => defaults.workers,
        };

        Ok(VinowConfig {
            config_file: defaults.config_file,
            data_dir,
            database_path,
            secret_key: value("secret_key"),
            service_key: value("service_key"),
            redis_url: match map.get("redis_url") {
                // An explicitly empty value disables the cache probe
                Some(url) if url.trim().is_empty() => None,
                _ => value("redis_url").or(defaults.redis_url),
            },
            media_dir,
            environment: value("environment")
                .map(|e| e.to_lowercase())
                .unwrap_or(defaults.environment),
            host: value("host").unwrap_or(defaults.host),
            port,
            workers,
            log_level: value("log_level").unwrap_or(defaults.log_level),
            app_module: value("app_module").unwrap_or(defaults.app_module),
        })
    }

    /// Check that every required value is present and usable
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.secret_key.is_none() {
            missing.push("secret_key".to_string());
        }
        if self.service_key.is_none() {
            missing.push("service_key".to_string());
        }
        if self.database_path.trim().is_empty() {
            missing.push("database_path".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        for (key, secret) in [
            ("secret_key", &self.secret_key),
            ("service_key", &self.service_key),
        ] {
            let Some(secret) = secret else { continue };
            let lowered = secret.to_lowercase();
            if lowered.starts_with("your-") || lowered.starts_with("change-this") {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "still set to the placeholder value".to_string(),
                });
            }
            if secret.chars().count() < MIN_SECRET_LEN {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: format!("must be at least {} characters", MIN_SECRET_LEN),
                });
            }
        }

        if !ENVIRONMENTS.contains(&self.environment.as_str()) {
            return Err(ConfigError::Invalid {
                key: "environment".to_string(),
                reason: format!(
                    "'{}' is not one of {}",
                    self.environment,
                    ENVIRONMENTS.join(", ")
                ),
            });
        }

        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "workers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    pub fn server_mode(&self) -> ServerMode {
        if self.environment == "production" {
            ServerMode::Production {
                workers: self.workers,
            }
        } else {
            ServerMode::Development
        }
    }

    /// The command line that starts the application server
    pub fn server_command(&self) -> String {
        match self.server_mode() {
            ServerMode::Development => format!(
                "uvicorn {} --host {} --port {} --reload",
                self.app_module, self.host, self.port
            ),
            ServerMode::Production { workers } => format!(
                "gunicorn {} --workers {} --worker-class uvicorn.workers.UvicornWorker --bind {}:{}",
                self.app_module, workers, self.host, self.port
            ),
        }
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        let secret = |s: &Option<String>| match s {
            Some(s) => mask_secret(s),
            None => "(not set)".to_string(),
        };

        [
            format!("Config File:        {}", self.config_file),
            format!("Data Directory:     {}", self.data_dir),
            format!("Database Path:      {}", self.database_path),
            format!("Media Directory:    {}", self.media_dir),
            format!("Environment:        {}", self.environment),
            format!("Server:             {}", self.server_command()),
            format!(
                "Cache URL:          {}",
                self.redis_url.as_deref().unwrap_or("(not set)")
            ),
            format!("Secret Key:         {}", secret(&self.secret_key)),
            format!("Service Key:        {}", secret(&self.service_key)),
            format!("Log Level:          {}", self.log_level),
        ]
        .join("\n")
    }

    /// Default config file path, used when `--config` is not given
    pub fn config_file_path() -> String {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| "~".to_string());
        format!("{}/.vinow/vinow.toml", home_dir)
    }
}

/// Keep the first and last few characters of a secret
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{}", home.to_string_lossy(), rest),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "s3cr3t-value-for-tests-0123456789";
    const SERVICE: &str = "service-role-key-for-tests-9876543210";

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn valid() -> VinowConfig {
        VinowConfig::from_map(&map(&[
            ("data_dir", "/srv/vinow/"),
            ("secret_key", SECRET),
            ("service_key", SERVICE),
        ]))
        .unwrap()
    }

    #[test]
    fn test_defaults_derive_from_data_dir() {
        let config = valid();
        assert_eq!(config.data_dir, "/srv/vinow");
        assert_eq!(config.database_path, "/srv/vinow/vinow.sqlite3");
        assert_eq!(config.media_dir, "/srv/vinow/media");
        assert_eq!(config.redis_url.as_deref(), Some(DEFAULT_REDIS_URL));
        assert_eq!(config.port, 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_values_are_listed_together() {
        let config = VinowConfig::from_map(&map(&[("data_dir", "/srv/vinow")])).unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::Missing(vec![
                "secret_key".to_string(),
                "service_key".to_string()
            ]))
        );
    }

    #[test]
    fn test_placeholder_and_short_secrets_rejected() {
        let mut config = valid();
        config.secret_key = Some("your-secret-key-change-in-production".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref key, .. }) if key == "secret_key"
        ));

        let mut config = valid();
        config.service_key = Some("short".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref key, .. }) if key == "service_key"
        ));
    }

    #[test]
    fn test_environment_and_workers_checked() {
        let mut config = valid();
        config.environment = "staging".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.workers = 0;
        assert!(config.validate().is_err());

        let err = VinowConfig::from_map(&map(&[("port", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "port"));
    }

    #[test]
    fn test_server_command() {
        let mut config = valid();
        assert_eq!(config.server_mode(), ServerMode::Development);
        assert_eq!(
            config.server_command(),
            "uvicorn app.main:app --host 0.0.0.0 --port 8000 --reload"
        );

        config.environment = "production".to_string();
        config.workers = 2;
        assert_eq!(config.server_mode(), ServerMode::Production { workers: 2 });
        assert!(config.server_command().starts_with("gunicorn app.main:app --workers 2"));
    }

    #[test]
    fn test_summary_masks_secrets() {
        let summary = valid().summary();
        assert!(!summary.contains(SECRET));
        assert!(!summary.contains(SERVICE));
        assert!(summary.contains("s3cr...6789"));
        assert_eq!(mask_secret("abc"), "***");
    }

    #[test]
    fn test_summary_names_the_file_that_was_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staging.toml");
        std::fs::write(&path, "data_dir = \"/srv/staging\"\n").unwrap();
        let path = path.to_str().unwrap().to_string();

        let config = VinowConfig::new(&Some(path.clone())).unwrap();
        assert_eq!(config.config_file, path);
        assert_eq!(config.data_dir, "/srv/staging");
        assert!(config.summary().contains(&format!("Config File:        {}", path)));
        assert!(!config.summary().contains(&VinowConfig::config_file_path()));
    }

    #[test]
    fn test_empty_redis_url_disables_cache_check() {
        let config = VinowConfig::from_map(&map(&[("redis_url", "")])).unwrap();
        assert!(config.redis_url.is_none());
    }
}
