//! Database module
//!
//! This module provides all database functionality for vinow, organized into:
//!
//! - **core**: Schema infrastructure (connections, principals, access policies,
//!   drift repair, migrations, verification)
//! - **vinow**: The application database and its repositories
//!
//! # Architecture
//!
//! ```text
//! database/
//! ├── core/            # Foundation
//! │   ├── auth         # Principal and the auth_uid()/auth_role() SQL functions
//! │   ├── connection   # SQLite DatabaseConn wrapper
//! │   ├── policy       # Row-level access policies
//! │   ├── drift        # Misnamed table repair
//! │   ├── migration    # Steps, migrations and the runner
//! │   ├── plan         # The full and drift-fix plans
//! │   └── schema       # Table definitions, status and verification
//! │
//! └── vinow/           # Application storage
//!     ├── profiles     # user_profiles
//!     ├── preferences  # user_preferences
//!     └── metrics      # business_metrics
//! ```
//!
//! # Access Policies
//!
//! SQLite has no row-level security, so each tenant table gets four policy
//! objects: a `<table>_select_policy` view and insert/update/delete triggers.
//! They compare the owner column against `auth_uid()`, a function bound to
//! the principal the connection currently runs as. The service principal
//! bypasses all four.
//! The connection's authorizer keeps every other principal from reading a
//! tenant table except through its select view.
//!
//! # Usage
//!
//! ```rust,ignore
//! use vinow_schema::database::{Principal, VinowDatabase};
//!
//! // Open (and converge) the database
//! let db = VinowDatabase::open_in_dir("~/.vinow")?;
//!
//! // Act as a user; reads and writes are limited to their own rows
//! let _alice = db.as_principal(Principal::user("alice"));
//! let profile = db.profiles().get("alice")?;
//! ```
//!
//! Applying a plan directly:
//!
//! ```rust,ignore
//! use vinow_schema::database::{DatabaseConn, MigrationRunner, SchemaPlan};
//!
//! let db = DatabaseConn::open_path("vinow.sqlite3")?;
//! let report = MigrationRunner::new(&db).apply(&SchemaPlan::drift_fix())?;
//! ```

pub mod core;
pub mod vinow;

// Connection, identity and schema management
pub use core::{
    AuthContext, DatabaseConn, Principal, PrincipalGuard, SchemaDefinitions, SchemaManager,
    SchemaStatus, VerificationReport, SCHEMA_VERSION, TENANT_TABLES,
};

// Migrations
pub use core::{
    ApplyReport, LedgerEntry, Migration, MigrationRunner, PendingMigration, PendingReason,
    SchemaPlan, Step,
};

// Policies and drift
pub use core::{DriftOutcome, DriftRule, Policy, PolicyCommand, PolicyManager, PolicyRecord};

// Vinow database (main entry point)
pub use vinow::{ensure_data_dir, VinowDatabase, DATABASE_FILE};

// Repositories
pub use vinow::{
    BreakdownPolicy, BusinessMetricsRepository, DailyMetrics, MetricsRecord, NewUserProfile,
    PreferencesInput, ProfileUpdate, RevenueBreakdown, UserPreferences,
    UserPreferencesRepository, UserProfile, UserProfileRepository,
};
