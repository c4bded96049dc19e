//! Database connection management
//!
//! This module provides the core database connection wrapper used throughout
//! the crate. Every connection carries its own [`AuthContext`], registered as
//! the `auth_uid()` / `auth_role()` SQL functions the access policies use.

use anyhow::{anyhow, Result};
use rusqlite::{Connection, OptionalExtension};
use std::time::Duration;

use super::auth::{AuthContext, Principal, PrincipalGuard};
use super::policy::guarded_tables;

/// How long a statement waits on a lock held by another initializing process
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Core database connection wrapper
///
/// `DatabaseConn` provides a thin wrapper around SQLite connections,
/// handling both file-based and in-memory databases with consistent
/// configuration and error handling.
pub struct DatabaseConn {
    pub conn: Connection,
    auth: AuthContext,
}

impl DatabaseConn {
    /// Open a database at the specified path
    ///
    /// If the path is `None`, an in-memory database is created. New
    /// connections start out with the service principal.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| anyhow!("Failed to open database at '{}': {}", p, e))?,
            None => Connection::open_in_memory()
                .map_err(|e| anyhow!("Failed to create in-memory database: {}", e))?,
        };

        let db = DatabaseConn {
            conn,
            auth: AuthContext::default(),
        };
        db.configure(path.is_some())?;
        Ok(db)
    }

    /// Open a database at the specified path (convenience method)
    pub fn open_path(path: &str) -> Result<Self> {
        Self::open(Some(path))
    }

    /// Create an in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::open(None)
    }

    fn configure(&self, on_disk: bool) -> Result<()> {
        // Set first so the journal switch waits out a concurrent opener
        self.conn
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| anyhow!("Failed to set busy timeout: {}", e))?;

        if on_disk {
            // WAL lets readers proceed while an initialization pass writes
            let _: String = self
                .conn
                .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
                .map_err(|e| anyhow!("Failed to set journal mode: {}", e))?;

            self.conn
                .execute("PRAGMA synchronous=NORMAL", [])
                .map_err(|e| anyhow!("Failed to set synchronous mode: {}", e))?;
        }

        self.conn
            .execute("PRAGMA foreign_keys=ON", [])
            .map_err(|e| anyhow!("Failed to enable foreign keys: {}", e))?;

        self.auth
            .register(&self.conn)
            .map_err(|e| anyhow!("Failed to register auth functions: {}", e))?;

        self.refresh_guards()
    }

    /// Reload the guarded tables from the policy catalog
    pub fn refresh_guards(&self) -> Result<()> {
        let tables = guarded_tables(&self.conn)
            .map_err(|e| anyhow!("Failed to load guarded tables: {}", e))?;
        self.auth.set_guarded(tables);
        Ok(())
    }

    /// The identity context bound to this connection
    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Execute subsequent statements as `principal` until the guard drops
    pub fn as_principal(&self, principal: Principal) -> PrincipalGuard {
        self.auth.enter(principal)
    }

    /// Execute a SQL statement
    pub fn execute(&self, sql: &str) -> Result<usize> {
        self.conn
            .execute(sql, [])
            .map_err(|e| anyhow!("Failed to execute SQL: {}", e))
    }

    /// Execute a SQL statement with parameters
    pub fn execute_with_params<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.conn
            .execute(sql, params)
            .map_err(|e| anyhow!("Failed to execute SQL with params: {}", e))
    }

    /// Begin an unchecked transaction
    pub fn transaction(&self) -> Result<rusqlite::Transaction<'_>> {
        self.conn
            .unchecked_transaction()
            .map_err(|e| anyhow!("Failed to begin transaction: {}", e))
    }

    /// Check if a table exists under exactly this name
    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        table_exists(&self.conn, table_name)
            .map_err(|e| anyhow!("Failed to check table existence: {}", e))
    }

    /// Get the row count for a table
    pub fn table_count(&self, table_name: &str) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM {}", quote_ident(table_name));
        let count: u64 = self
            .conn
            .query_row(&query, [], |row| row.get(0))
            .map_err(|e| anyhow!("Failed to get table count: {}", e))?;
        Ok(count)
    }
}

/// Whether a table exists under exactly this (case-sensitive) name
pub fn table_exists(conn: &Connection, table_name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Find a table whose name matches case-insensitively, returning its stored name
pub fn find_table_nocase(conn: &Connection, table_name: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE LIMIT 1",
        [table_name],
        |row| row.get(0),
    )
    .optional()
}

/// Whether `table` declares `column`
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Type of the schema object stored under `name` (table, view, trigger, index)
///
/// Object names are case-insensitive in SQLite, so the lookup is too.
pub fn object_kind(conn: &Connection, name: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT type FROM sqlite_master WHERE name = ?1 COLLATE NOCASE LIMIT 1",
        [name],
        |row| row.get(0),
    )
    .optional()
}

/// Quote an identifier for interpolation into DDL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
