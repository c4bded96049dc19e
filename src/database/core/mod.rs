//! Core database infrastructure
//!
//! This module provides the foundational database components:
//! - `DatabaseConn`: SQLite connection wrapper with the caller identity attached
//! - `Principal` / `AuthContext`: who the current statement runs as
//! - `PolicyManager`: row-level access policies
//! - `drift`: table-name drift repair
//! - `MigrationRunner` / `SchemaPlan`: versioned, idempotent migrations
//! - `SchemaManager`: status, verification and snapshots

mod auth;
mod connection;
pub mod drift;
mod migration;
mod plan;
mod policy;
mod schema;

pub use auth::{AuthContext, Principal, PrincipalGuard};
pub use connection::{
    column_exists, find_table_nocase, object_kind, quote_ident, table_exists, DatabaseConn,
};
pub use drift::{DriftOutcome, DriftRule, DRIFT_RULES};
pub use migration::{
    touch_trigger_name, ApplyReport, IndexDefinition, LedgerEntry, Migration, MigrationRunner,
    PendingMigration, PendingReason, SchemaPlan, Step, TableDefinition, TableRename,
};
pub use policy::{
    historical_names, Policy, PolicyAlias, PolicyCommand, PolicyManager, PolicyRecord,
    POLICY_ALIASES,
};
pub use schema::{
    read_meta, write_meta, SchemaDefinitions, SchemaManager, SchemaObject, SchemaSnapshot,
    SchemaStatus, VerificationReport, SCHEMA_VERSION, TENANT_TABLES,
};
