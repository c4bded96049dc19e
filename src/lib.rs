#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! vinow-schema - tenant-isolated relational schema for the Vinow backend
//!
//! vinow-schema declares the Vinow data model (user profiles and activity,
//! content moderation, business analytics), applies it idempotently to an
//! SQLite database, and enforces per-user row ownership through named access
//! policies. It can be used as both a command-line tool and a library.
//!
//! # Feature Flags
//!
//! | Feature | Description | Key Dependencies |
//! |---------|-------------|------------------|
//! | (none)  | Library: schema, policies, repositories, bootstrap | `rusqlite`, `config` |
//! | `cli`   | The `vinow-schema` binary (default) | `clap`, `tabled`, `tracing-subscriber` |
//!
//! ```toml
//! # Library only
//! vinow-schema = { version = "0.3", default-features = false }
//! ```
//!
//! # Architecture
//!
//! - **[`database`]**: schema management and data access
//!   - `core`: connections, principals, policies, drift repair, migrations
//!   - `vinow`: the application database and its repositories
//! - **[`bootstrap`]**: pre-start checks and schema convergence for a deployment
//! - **[`config`]**: configuration loading and validation
//! - **[`error`]**: typed schema and configuration errors
//! - **[`output`]**: output formats for command reports
//!
//! # Quick Start
//!
//! ## Converging a database
//!
//! ```rust,ignore
//! use vinow_schema::database::{DatabaseConn, SchemaManager, SchemaPlan};
//!
//! let db = DatabaseConn::open_path("vinow.sqlite3")?;
//! let schema = SchemaManager::new(&db);
//!
//! // Safe to run any number of times
//! let report = schema.apply(&SchemaPlan::full())?;
//! println!("applied {} migrations", report.migrations.len());
//!
//! // Every tenant table carries exactly four canonical policies
//! schema.verify()?.into_result()?;
//! ```
//!
//! ## Tenant-scoped access
//!
//! ```rust,ignore
//! use vinow_schema::database::{NewUserProfile, Principal, VinowDatabase};
//!
//! let db = VinowDatabase::open_in_dir("~/.vinow")?;
//! let _alice = db.as_principal(Principal::user("alice"));
//!
//! db.profiles().create(&NewUserProfile::new("alice"))?;
//! assert!(db.profiles().get("bob")?.is_none());
//! ```
//!
//! ## Deployment preparation
//!
//! ```rust,ignore
//! use vinow_schema::{bootstrap, VinowConfig};
//!
//! let config = VinowConfig::new(&None)?;
//! let report = bootstrap::prepare(&config)?;
//! println!("start with: {}", report.server_command);
//! ```

pub mod bootstrap;
pub mod config;
pub mod database;
pub mod error;
pub mod output;

// =============================================================================
// Configuration
// =============================================================================

pub use config::{ServerMode, VinowConfig};

// =============================================================================
// Errors
// =============================================================================

pub use error::{ConfigError, SchemaError};

// =============================================================================
// Database Module - commonly used types
// =============================================================================

pub use database::VinowDatabase;

pub use database::{
    DatabaseConn, MigrationRunner, PolicyManager, Principal, SchemaManager, SchemaPlan,
    SchemaStatus, SCHEMA_VERSION,
};

// =============================================================================
// Bootstrap and output
// =============================================================================

pub use bootstrap::{prepare, CacheProbe, PrepareReport};
pub use output::OutputFormat;
