//! Caller identity for policy evaluation
//!
//! Access policies compare an owner column against the identity of the
//! calling principal. The identity lives in an [`AuthContext`] shared with
//! the connection, and is exposed to SQL through two functions:
//!
//! - `auth_uid()`: the principal identifier, or NULL when anonymous
//! - `auth_role()`: `anon`, `authenticated` or `service`
//!
//! The `service` role bypasses every policy.
//!
//! Registration also installs an authorizer. For any principal other than
//! the service, top-level SQL may not read a guarded table directly: its
//! rows are reached through the policy view, and a top-level write may name
//! only owner columns (its `WHERE` filter and foreign-key parent checks).
//! Schema changes are denied to those principals as well, so every view and
//! trigger that reads a guarded table was installed by the service.

use rusqlite::functions::FunctionFlags;
use rusqlite::hooks::{AuthAction, AuthContext as Access, Authorization};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The identity a statement executes under
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Principal {
    /// No authenticated identity; every tenant policy denies
    Anonymous,
    /// An authenticated end user
    User(String),
    /// Trusted backend access (schema management, seeding, analytics jobs)
    #[default]
    Service,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Principal::User(id.into())
    }

    /// Role name as seen by `auth_role()`
    pub fn role(&self) -> &'static str {
        match self {
            Principal::Anonymous => "anon",
            Principal::User(_) => "authenticated",
            Principal::Service => "service",
        }
    }

    /// Identifier as seen by `auth_uid()`
    pub fn uid(&self) -> Option<&str> {
        match self {
            Principal::User(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::User(id) => write!(f, "user:{}", id),
            other => write!(f, "{}", other.role()),
        }
    }
}

/// Shared holder of the current principal for one connection
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    current: Arc<RwLock<Principal>>,
    /// Guarded table (lowercased) to its owner column
    guarded: Arc<RwLock<HashMap<String, String>>>,
}

impl AuthContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            current: Arc::new(RwLock::new(principal)),
            ..Default::default()
        }
    }

    pub fn current(&self) -> Principal {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap in a new principal, returning the previous one
    pub fn replace(&self, principal: Principal) -> Principal {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, principal)
    }

    /// Switch to `principal` until the returned guard is dropped
    pub fn enter(&self, principal: Principal) -> PrincipalGuard {
        let previous = self.replace(principal);
        PrincipalGuard {
            ctx: self.clone(),
            previous: Some(previous),
        }
    }

    /// Replace the set of guarded tables with `(table, owner_column)` pairs
    pub fn set_guarded<I>(&self, tables: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut guard = self.guarded.write().unwrap_or_else(|e| e.into_inner());
        *guard = tables
            .into_iter()
            .map(|(table, owner)| (table.to_ascii_lowercase(), owner))
            .collect();
    }

    /// Owner column of `table` if it is guarded
    pub fn guarded_owner(&self, table: &str) -> Option<String> {
        self.guarded
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&table.to_ascii_lowercase())
            .cloned()
    }

    fn is_service(&self) -> bool {
        matches!(
            *self.current.read().unwrap_or_else(|e| e.into_inner()),
            Principal::Service
        )
    }

    /// Decide one authorizer callback.
    ///
    /// `writing` records whether the statement being prepared is a write.
    /// SQLite reports a statement's `SELECT`, `DELETE` or `INSERT` action
    /// before resolving its column references, and an `UPDATE` before its
    /// `WHERE` clause. A subquery coded inside a write reports `SELECT` too,
    /// so multi-row and `INSERT ... SELECT` writes that check a guarded
    /// parent key need the service role.
    fn authorize(&self, access: &Access<'_>, writing: &mut bool) -> Authorization {
        let top_level = access.accessor.is_none();
        if top_level {
            match access.action {
                AuthAction::Select => *writing = false,
                AuthAction::Insert { .. }
                | AuthAction::Delete { .. }
                | AuthAction::Update { .. } => *writing = true,
                _ => {}
            }
        }

        if self.is_service() {
            return Authorization::Allow;
        }

        match access.action {
            AuthAction::Read {
                table_name,
                column_name,
            } if top_level => match self.guarded_owner(table_name) {
                None => Authorization::Allow,
                // Write filters and foreign-key parent checks name only owner columns
                Some(owner) if *writing && column_name.eq_ignore_ascii_case(&owner) => {
                    Authorization::Allow
                }
                Some(_) => Authorization::Deny,
            },
            AuthAction::CreateIndex { .. }
            | AuthAction::CreateTable { .. }
            | AuthAction::CreateTempIndex { .. }
            | AuthAction::CreateTempTable { .. }
            | AuthAction::CreateTempTrigger { .. }
            | AuthAction::CreateTempView { .. }
            | AuthAction::CreateTrigger { .. }
            | AuthAction::CreateView { .. }
            | AuthAction::CreateVtable { .. }
            | AuthAction::DropIndex { .. }
            | AuthAction::DropTable { .. }
            | AuthAction::DropTempIndex { .. }
            | AuthAction::DropTempTable { .. }
            | AuthAction::DropTempTrigger { .. }
            | AuthAction::DropTempView { .. }
            | AuthAction::DropTrigger { .. }
            | AuthAction::DropView { .. }
            | AuthAction::DropVtable { .. }
            | AuthAction::AlterTable { .. } => Authorization::Deny,
            _ => Authorization::Allow,
        }
    }

    /// Register `auth_uid()` and `auth_role()` on a connection.
    ///
    /// Both functions are non-deterministic (the principal changes between
    /// statements) and innocuous so they may appear in views and triggers.
    pub fn register(&self, conn: &Connection) -> rusqlite::Result<()> {
        let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS;

        let ctx = self.clone();
        conn.create_scalar_function("auth_uid", 0, flags, move |_| {
            Ok(ctx.current().uid().map(str::to_owned))
        })?;

        let ctx = self.clone();
        conn.create_scalar_function("auth_role", 0, flags, move |_| {
            Ok(ctx.current().role().to_string())
        })?;

        let ctx = self.clone();
        let mut writing = false;
        conn.authorizer(Some(move |access: Access<'_>| {
            ctx.authorize(&access, &mut writing)
        }));

        Ok(())
    }
}

/// Restores the previous principal when dropped
#[must_use = "the principal is reverted as soon as the guard is dropped"]
pub struct PrincipalGuard {
    ctx: AuthContext,
    previous: Option<Principal>,
}

impl PrincipalGuard {
    pub fn principal(&self) -> Principal {
        self.ctx.current()
    }
}

impl Drop for PrincipalGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.ctx.replace(previous);
        }
    }
}
