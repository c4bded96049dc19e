//! Vinow database storage
//!
//! This module provides the persistent Vinow database and its repositories.
//! Tenant-owned data (profiles, preferences) is read through the select
//! policy views and written to the base tables, so every access is checked
//! against the principal the connection currently runs as.
//!
//! Analytics data (business metrics) is not tenant-owned; it is written by
//! backend jobs under the service principal.

mod metrics;
mod preferences;
mod profiles;

pub use metrics::{
    BreakdownPolicy, BusinessMetricsRepository, DailyMetrics, MetricsRecord, RevenueBreakdown,
};
pub use preferences::{PreferencesInput, UserPreferences, UserPreferencesRepository};
pub use profiles::{NewUserProfile, ProfileUpdate, UserProfile, UserProfileRepository};

use crate::database::core::{DatabaseConn, Principal, PrincipalGuard, SchemaManager, SchemaStatus};
use crate::error::SchemaError;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Default database file name inside the data directory
pub const DATABASE_FILE: &str = "vinow.sqlite3";

/// Main Vinow database (SQLite backend)
///
/// `VinowDatabase` provides a unified interface to all Vinow tables.
/// It handles:
/// - Schema convergence on open
/// - Switching the caller identity used by access policies
/// - Access to data repositories
pub struct VinowDatabase {
    db: DatabaseConn,
}

impl VinowDatabase {
    /// Open the Vinow database at the specified path
    ///
    /// A fresh, outdated or damaged schema is converged in place; existing
    /// rows are kept. A database written by a newer build is refused.
    pub fn open(path: &str) -> Result<Self> {
        let db = DatabaseConn::open_path(path)?;
        Self::converge(&db)?;
        Ok(Self { db })
    }

    /// Open the Vinow database from a data directory
    ///
    /// Creates the standard database file path: `{data_dir}/vinow.sqlite3`
    pub fn open_in_dir(data_dir: &str) -> Result<Self> {
        ensure_data_dir(data_dir)?;
        let path = format!("{}/{}", data_dir, DATABASE_FILE);
        Self::open(&path)
    }

    /// Create an in-memory Vinow database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let db = DatabaseConn::open_in_memory()?;
        SchemaManager::new(&db).initialize()?;
        Ok(Self { db })
    }

    fn converge(db: &DatabaseConn) -> Result<()> {
        let schema = SchemaManager::new(db);

        match schema.check_status()? {
            SchemaStatus::Current => {
                info!("Vinow database schema is current");
            }
            SchemaStatus::NotInitialized => {
                info!("Initializing Vinow database schema");
                schema.initialize()?;
            }
            SchemaStatus::NeedsMigration { from, to } => {
                info!("Vinow database needs migration from v{} to v{}", from, to);
                schema.initialize()?;
            }
            SchemaStatus::Corrupted => {
                warn!("Vinow database schema is incomplete, re-applying");
                schema.initialize()?;
            }
            SchemaStatus::Incompatible {
                database_version,
                required_version,
            } => {
                return Err(SchemaError::Incompatible {
                    database_version,
                    supported_version: required_version,
                }
                .into());
            }
        }

        Ok(())
    }

    /// Schema manager bound to this database
    pub fn schema(&self) -> SchemaManager<'_> {
        SchemaManager::new(&self.db)
    }

    /// Get a reference to the user profile repository
    pub fn profiles(&self) -> UserProfileRepository<'_> {
        UserProfileRepository::new(&self.db.conn)
    }

    /// Get a reference to the user preferences repository
    pub fn preferences(&self) -> UserPreferencesRepository<'_> {
        UserPreferencesRepository::new(&self.db.conn)
    }

    /// Get a reference to the business metrics repository
    pub fn metrics(&self) -> BusinessMetricsRepository<'_> {
        BusinessMetricsRepository::new(&self.db.conn)
    }

    /// Run subsequent calls as `principal` until the guard drops
    pub fn as_principal(&self, principal: Principal) -> PrincipalGuard {
        self.db.as_principal(principal)
    }

    /// Get the underlying database connection (for advanced queries)
    pub fn connection(&self) -> &rusqlite::Connection {
        &self.db.conn
    }

    /// Get metadata value from the database
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.schema().get_meta(key)?)
    }

    /// Set metadata value in the database
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.schema().set_meta(key, value)?)
    }
}

/// Ensure the data directory exists
pub fn ensure_data_dir(data_dir: &str) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| anyhow!("Failed to create data directory '{}': {}", data_dir, e))
}

/// Parse a timestamp written by the schema defaults
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite's `datetime('now')` format
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::SCHEMA_VERSION;

    #[test]
    fn test_open_in_memory() {
        let db = VinowDatabase::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let data_dir = data_dir.to_str().unwrap();

        {
            let db = VinowDatabase::open_in_dir(data_dir).unwrap();
            db.profiles()
                .create(&NewUserProfile::new("alice"))
                .unwrap();
        }

        let db = VinowDatabase::open_in_dir(data_dir).unwrap();
        assert_eq!(
            db.get_meta("schema_version").unwrap(),
            Some(SCHEMA_VERSION.to_string())
        );
        assert!(db.profiles().get("alice").unwrap().is_some());
    }

    #[test]
    fn test_outdated_schema_converges_without_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vinow.sqlite3");
        let path = path.to_str().unwrap();

        {
            let db = VinowDatabase::open(path).unwrap();
            db.profiles().create(&NewUserProfile::new("bob")).unwrap();
            db.set_meta("schema_version", "2").unwrap();
        }

        let db = VinowDatabase::open(path).unwrap();
        assert_eq!(db.schema().check_status().unwrap(), SchemaStatus::Current);
        assert_eq!(db.profiles().count().unwrap(), 1);
    }

    #[test]
    fn test_newer_schema_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vinow.sqlite3");
        let path = path.to_str().unwrap();

        {
            let db = VinowDatabase::open(path).unwrap();
            db.set_meta("schema_version", "999").unwrap();
        }

        let err = VinowDatabase::open(path).err().unwrap();
        let schema_err = err.downcast_ref::<SchemaError>().unwrap();
        assert!(matches!(
            schema_err,
            SchemaError::Incompatible {
                database_version: 999,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_datetime_formats() {
        let dt = parse_datetime("2024-01-08T10:15:30.123Z");
        assert_eq!(dt.timestamp_subsec_millis(), 123);
        let dt = parse_datetime("2024-01-08 10:15:30");
        assert_eq!(dt.to_rfc3339(), "2024-01-08T10:15:30+00:00");
    }
}
