//! Pre-start preparation for a deployment
//!
//! `prepare` runs everything that must succeed (or at least be attempted)
//! before the application server is launched: configuration validation, a
//! cache reachability probe, media directories and the full schema pass.
//! Launching the server itself is left to the caller; the report carries
//! the command line to run.

use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::config::VinowConfig;
use crate::database::{ApplyReport, DatabaseConn, SchemaManager, SchemaPlan, SchemaStatus};
use crate::error::SchemaError;

/// Sub-directories created under the media root
pub const MEDIA_SUBDIRS: [&str; 4] = ["uploads", "videos", "thumbnails", "temp"];

const DEFAULT_CACHE_PORT: u16 = 6379;
const CACHE_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Result of the cache reachability probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CacheProbe {
    Reachable { address: String },
    Unreachable { address: String, reason: String },
    NotConfigured,
}

impl std::fmt::Display for CacheProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheProbe::Reachable { address } => write!(f, "reachable at {}", address),
            CacheProbe::Unreachable { address, reason } => {
                write!(f, "unreachable at {} ({})", address, reason)
            }
            CacheProbe::NotConfigured => write!(f, "not configured"),
        }
    }
}

/// Everything `prepare` did
#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub cache: CacheProbe,
    pub media_dirs: Vec<String>,
    pub database_path: String,
    pub schema: ApplyReport,
    pub server_command: String,
}

/// Validate, probe, create directories and converge the schema
///
/// Configuration errors are returned as [`crate::error::ConfigError`] inside
/// the `anyhow` error so binaries can map them to their own exit code. An
/// unreachable cache only produces a warning.
pub fn prepare(config: &VinowConfig) -> Result<PrepareReport> {
    config.validate()?;
    info!("configuration valid ({} mode)", config.environment);

    let cache = match config.redis_url.as_deref() {
        Some(url) => probe_cache(url, CACHE_PROBE_TIMEOUT),
        None => CacheProbe::NotConfigured,
    };
    match &cache {
        CacheProbe::Unreachable { address, reason } => {
            warn!("cache at {} is unreachable, continuing: {}", address, reason)
        }
        other => info!("cache {}", other),
    }

    let media_dirs = ensure_media_dirs(&config.media_dir)?;

    if let Some(parent) = Path::new(&config.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let db = DatabaseConn::open_path(&config.database_path)?;
    let schema = SchemaManager::new(&db);
    if let SchemaStatus::Incompatible {
        database_version,
        required_version,
    } = schema.check_status()?
    {
        return Err(SchemaError::Incompatible {
            database_version,
            supported_version: required_version,
        }
        .into());
    }
    let report = schema.apply(&SchemaPlan::full())?;
    schema.verify()?.into_result()?;
    info!(
        "schema converged: {} migrations, {} policies",
        report.migrations.len(),
        report.policies
    );

    Ok(PrepareReport {
        cache,
        media_dirs,
        database_path: config.database_path.clone(),
        schema: report,
        server_command: config.server_command(),
    })
}

/// Try a TCP connection to the host and port named by a cache URL
pub fn probe_cache(redis_url: &str, timeout: Duration) -> CacheProbe {
    let parsed = match Url::parse(redis_url) {
        Ok(url) => url,
        Err(e) => {
            return CacheProbe::Unreachable {
                address: redis_url.to_string(),
                reason: format!("invalid URL: {}", e),
            }
        }
    };
    let Some(host) = parsed.host_str() else {
        return CacheProbe::Unreachable {
            address: redis_url.to_string(),
            reason: "URL has no host".to_string(),
        };
    };
    let port = parsed.port().unwrap_or(DEFAULT_CACHE_PORT);
    let address = format!("{}:{}", host, port);

    let resolved = (host, port)
        .to_socket_addrs()
        .map_err(|e| e.to_string())
        .and_then(|mut addrs| {
            addrs
                .next()
                .ok_or_else(|| "no addresses found".to_string())
        });
    let addr = match resolved {
        Ok(addr) => addr,
        Err(reason) => return CacheProbe::Unreachable { address, reason },
    };

    match TcpStream::connect_timeout(&addr, timeout) {
        Ok(_) => CacheProbe::Reachable { address },
        Err(e) => CacheProbe::Unreachable {
            address,
            reason: e.to_string(),
        },
    }
}

/// Create the media root and its standard sub-directories
pub fn ensure_media_dirs(media_dir: &str) -> Result<Vec<String>> {
    let root = media_dir.trim_end_matches('/');
    MEDIA_SUBDIRS
        .iter()
        .map(|sub| {
            let dir = format!("{}/{}", root, sub);
            std::fs::create_dir_all(&dir)
                .map_err(|e| anyhow!("Failed to create media directory '{}': {}", dir, e))?;
            Ok(dir)
        })
        .collect()
}
