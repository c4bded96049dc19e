//! Versioned, idempotent schema migrations
//!
//! A [`SchemaPlan`] is an ordered list of [`Migration`]s, each a list of
//! declarative [`Step`]s. Every step is individually idempotent, so the
//! [`MigrationRunner`] re-runs all of them on every pass: the database
//! converges to the declared state whether it starts empty, partially
//! initialized or drifted.
//!
//! The `schema_migrations` ledger records when each migration first applied
//! and last converged, together with a checksum of its steps.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::auth::Principal;
use super::connection::{column_exists, quote_ident, table_exists, DatabaseConn};
use super::drift::{self, DriftOutcome, DriftRule};
use super::policy::PolicyManager;
use super::schema::{read_meta, write_meta, SchemaDefinitions, SCHEMA_VERSION};
use crate::error::{Result, SchemaError};

/// A guarded `CREATE TABLE IF NOT EXISTS` statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: &'static str,
    pub sql: &'static str,
}

/// An index on one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: &'static str,
    pub table: &'static str,
    pub columns: &'static str,
    pub unique: bool,
}

impl IndexDefinition {
    pub fn sql(&self) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            quote_ident(self.name),
            quote_ident(self.table),
            self.columns
        )
    }
}

/// One declarative schema operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Rename a drifted table to its canonical name
    RepairDrift(&'static DriftRule),
    /// Abort the pass if the table does not exist
    RequireTable(&'static str),
    CreateTable(&'static TableDefinition),
    CreateIndex(&'static IndexDefinition),
    /// Re-stamp `updated_at` on every update
    TouchTrigger { table: &'static str },
    /// Exactly four ownership policies keyed on `owner_column`
    TenantPolicies {
        table: &'static str,
        owner_column: &'static str,
    },
    /// Reject UPDATE and DELETE
    AppendOnly { table: &'static str },
    /// Insert-or-update seed row
    Seed {
        table: &'static str,
        sql: &'static str,
    },
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::RepairDrift(rule) => write!(f, "repair drift of {}", rule.canonical),
            Step::RequireTable(table) => write!(f, "require {}", table),
            Step::CreateTable(def) => write!(f, "create table {}", def.name),
            Step::CreateIndex(def) => write!(f, "create index {} on {}", def.name, def.table),
            Step::TouchTrigger { table } => write!(f, "touch trigger on {}", table),
            Step::TenantPolicies {
                table,
                owner_column,
            } => write!(f, "tenant policies on {} ({})", table, owner_column),
            Step::AppendOnly { table } => write!(f, "append-only {}", table),
            Step::Seed { table, .. } => write!(f, "seed {}", table),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub steps: Vec<Step>,
}

impl Migration {
    pub fn new(version: u32, name: &'static str, steps: Vec<Step>) -> Self {
        Self {
            version,
            name,
            steps,
        }
    }

    /// SHA-256 over the step list; changes whenever a step is edited
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(format!("{:?}", self.steps).as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// An ordered set of migrations applied as one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaPlan {
    pub name: &'static str,
    pub migrations: Vec<Migration>,
    /// Schema version recorded after the pass, if the plan defines one
    pub target_version: Option<u32>,
}

impl SchemaPlan {
    /// Every table the plan creates or requires
    pub fn tables(&self) -> Vec<&'static str> {
        let mut tables = Vec::new();
        for step in self.migrations.iter().flat_map(|m| m.steps.iter()) {
            let table = match step {
                Step::CreateTable(def) => def.name,
                Step::RequireTable(table) => *table,
                _ => continue,
            };
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        tables
    }

    /// Tables the plan puts under ownership policies, with their owner column
    pub fn tenant_tables(&self) -> Vec<(&'static str, &'static str)> {
        self.migrations
            .iter()
            .flat_map(|m| m.steps.iter())
            .filter_map(|step| match step {
                Step::TenantPolicies {
                    table,
                    owner_column,
                } => Some((*table, *owner_column)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRename {
    pub from: String,
    pub to: String,
}

/// What one pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub plan: String,
    pub migrations: Vec<String>,
    pub renames: Vec<TableRename>,
    pub policies: usize,
    pub schema_version: Option<u32>,
}

/// A row of the migration ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub version: u32,
    pub name: String,
    pub checksum: String,
    pub applied_at: String,
    pub converged_at: String,
}

/// Why a migration still needs to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PendingReason {
    NeverApplied,
    ChecksumChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub version: u32,
    pub name: String,
    pub reason: PendingReason,
}

/// Applies schema plans to one connection
pub struct MigrationRunner<'a> {
    db: &'a DatabaseConn,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(db: &'a DatabaseConn) -> Self {
        Self { db }
    }

    /// Create the meta, ledger and policy catalog tables
    pub fn ensure_ledger(&self) -> Result<()> {
        self.db.conn.execute_batch(SchemaDefinitions::META_TABLE)?;
        self.db
            .conn
            .execute_batch(SchemaDefinitions::MIGRATIONS_TABLE)?;
        self.db.conn.execute_batch(SchemaDefinitions::POLICIES_TABLE)?;
        Ok(())
    }

    /// Run every migration of `plan`, each in its own transaction.
    ///
    /// A database recorded at a newer schema version than this build
    /// supports is refused before anything is touched.
    pub fn apply(&self, plan: &SchemaPlan) -> Result<ApplyReport> {
        let _service = self.db.as_principal(Principal::Service);
        self.check_compatible()?;
        self.ensure_ledger()?;

        let outcome = self.converge(plan);
        // Tables whose policies committed are guarded even if a later migration failed
        if let Err(e) = self.db.refresh_guards() {
            warn!("failed to reload guarded tables: {}", e);
        }
        outcome
    }

    fn check_compatible(&self) -> Result<()> {
        let recorded = read_meta(&self.db.conn, "schema_version")?;
        match recorded.map(|v| v.parse::<u32>().unwrap_or(0)) {
            Some(version) if version > SCHEMA_VERSION => Err(SchemaError::Incompatible {
                database_version: version,
                supported_version: SCHEMA_VERSION,
            }),
            _ => Ok(()),
        }
    }

    fn converge(&self, plan: &SchemaPlan) -> Result<ApplyReport> {
        let mut report = ApplyReport {
            plan: plan.name.to_string(),
            ..Default::default()
        };

        for migration in &plan.migrations {
            info!(
                "applying migration {} ({})",
                migration.version, migration.name
            );
            let tx = self.db.conn.unchecked_transaction()?;

            for step in &migration.steps {
                debug!("v{}: {}", migration.version, step);
                run_step(&tx, step, &mut report).map_err(|e| SchemaError::Step {
                    version: migration.version,
                    migration: migration.name.to_string(),
                    step: step.to_string(),
                    source: Box::new(e),
                })?;
            }

            record_convergence(&tx, migration)?;
            tx.commit()?;
            report
                .migrations
                .push(format!("v{} {}", migration.version, migration.name));
        }

        if let Some(version) = plan.target_version {
            write_meta(&self.db.conn, "schema_version", &version.to_string())?;
            report.schema_version = Some(version);
        }

        info!(
            "plan '{}' converged: {} migrations, {} renames, {} policies",
            plan.name,
            report.migrations.len(),
            report.renames.len(),
            report.policies
        );
        Ok(report)
    }

    /// Migrations of `plan` the ledger has not seen, or has seen with other steps
    pub fn pending(&self, plan: &SchemaPlan) -> Result<Vec<PendingMigration>> {
        let ledger_exists = table_exists(&self.db.conn, "schema_migrations")?;
        let mut pending = Vec::new();

        for migration in &plan.migrations {
            let recorded: Option<String> = if ledger_exists {
                self.db
                    .conn
                    .query_row(
                        "SELECT checksum FROM schema_migrations WHERE version = ?1",
                        [migration.version],
                        |row| row.get(0),
                    )
                    .optional()?
            } else {
                None
            };

            let reason = match recorded {
                None => PendingReason::NeverApplied,
                Some(checksum) if checksum != migration.checksum() => {
                    PendingReason::ChecksumChanged
                }
                Some(_) => continue,
            };
            pending.push(PendingMigration {
                version: migration.version,
                name: migration.name.to_string(),
                reason,
            });
        }

        Ok(pending)
    }

    /// Ledger contents ordered by version
    pub fn applied(&self) -> Result<Vec<LedgerEntry>> {
        if !table_exists(&self.db.conn, "schema_migrations")? {
            return Ok(Vec::new());
        }
        let mut stmt = self.db.conn.prepare(
            "SELECT version, name, checksum, applied_at, converged_at
             FROM schema_migrations ORDER BY version",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LedgerEntry {
                version: row.get(0)?,
                name: row.get(1)?,
                checksum: row.get(2)?,
                applied_at: row.get(3)?,
                converged_at: row.get(4)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(SchemaError::from)
    }
}

fn run_step(conn: &Connection, step: &Step, report: &mut ApplyReport) -> Result<()> {
    match step {
        Step::RepairDrift(rule) => {
            if let DriftOutcome::Renamed { from } = drift::repair(conn, rule)? {
                report.renames.push(TableRename {
                    from,
                    to: rule.canonical.to_string(),
                });
            }
        }
        Step::RequireTable(table) => require_table(conn, table)?,
        Step::CreateTable(def) => conn.execute_batch(def.sql)?,
        Step::CreateIndex(def) => {
            require_table(conn, def.table)?;
            conn.execute(&def.sql(), [])?;
        }
        Step::TouchTrigger { table } => install_touch_trigger(conn, table)?,
        Step::TenantPolicies {
            table,
            owner_column,
        } => {
            let policies = PolicyManager::new(conn).apply_tenant_policies(table, owner_column)?;
            report.policies += policies.len();
        }
        Step::AppendOnly { table } => install_append_only(conn, table)?,
        Step::Seed { table, sql } => {
            require_table(conn, table)?;
            conn.execute(sql, [])?;
        }
    }
    Ok(())
}

fn require_table(conn: &Connection, table: &str) -> Result<()> {
    if table_exists(conn, table)? {
        Ok(())
    } else {
        Err(SchemaError::MissingTable {
            table: table.to_string(),
        })
    }
}

/// Name of the timestamp trigger attached to `table`
pub fn touch_trigger_name(table: &str) -> String {
    format!("{}_touch_updated_at", table)
}

/// Install the `updated_at` trigger, replacing any previous definition.
///
/// The new stamp is `max(now, previous + 1ms)`, so it advances even when two
/// updates land within the clock's resolution. Whatever the caller wrote to
/// `updated_at` is overwritten.
fn install_touch_trigger(conn: &Connection, table: &str) -> Result<()> {
    require_table(conn, table)?;
    if !column_exists(conn, table, "updated_at")? {
        return Err(SchemaError::Verification(vec![format!(
            "table {} has no updated_at column",
            table
        )]));
    }
    let name = quote_ident(&touch_trigger_name(table));
    let quoted = quote_ident(table);

    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS {name};
         CREATE TRIGGER {name} AFTER UPDATE ON {quoted} FOR EACH ROW
         BEGIN
             UPDATE {quoted}
             SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', max(
                 julianday('now'),
                 coalesce(julianday(OLD.updated_at), 0) + (1.0 / 86400000.0)
             ))
             WHERE rowid = NEW.rowid;
         END;"
    ))?;
    Ok(())
}

/// Install triggers rejecting UPDATE and DELETE on `table`
fn install_append_only(conn: &Connection, table: &str) -> Result<()> {
    require_table(conn, table)?;
    let quoted = quote_ident(table);

    for (suffix, event) in [("reject_update", "UPDATE"), ("reject_delete", "DELETE")] {
        let name = quote_ident(&format!("{}_{}", table, suffix));
        conn.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS {name};
             CREATE TRIGGER {name} BEFORE {event} ON {quoted} FOR EACH ROW
             BEGIN
                 SELECT RAISE(ABORT, '{table} is append-only');
             END;"
        ))?;
    }
    Ok(())
}

fn record_convergence(conn: &Connection, migration: &Migration) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, name, checksum)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(version) DO UPDATE SET
            name = excluded.name,
            checksum = excluded.checksum,
            converged_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        params![migration.version, migration.name, migration.checksum()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::drift::USER_PREFERENCES_DRIFT;

    static NOTES: TableDefinition = TableDefinition {
        name: "notes",
        sql: "CREATE TABLE IF NOT EXISTS notes (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                body TEXT,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
              )",
    };

    static NOTES_USER_IDX: IndexDefinition = IndexDefinition {
        name: "idx_notes_user_id",
        table: "notes",
        columns: "user_id",
        unique: false,
    };

    fn notes_plan() -> SchemaPlan {
        SchemaPlan {
            name: "notes",
            migrations: vec![Migration::new(
                1,
                "notes",
                vec![
                    Step::CreateTable(&NOTES),
                    Step::CreateIndex(&NOTES_USER_IDX),
                    Step::TouchTrigger { table: "notes" },
                    Step::TenantPolicies {
                        table: "notes",
                        owner_column: "user_id",
                    },
                ],
            )],
            target_version: Some(1),
        }
    }

    fn updated_at(db: &DatabaseConn) -> String {
        db.conn
            .query_row("SELECT updated_at FROM notes WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap()
    }

    #[test]
    fn test_index_sql() {
        assert_eq!(
            NOTES_USER_IDX.sql(),
            "CREATE INDEX IF NOT EXISTS \"idx_notes_user_id\" ON \"notes\" (user_id)"
        );
    }

    #[test]
    fn test_apply_twice_converges() {
        let db = DatabaseConn::open_in_memory().unwrap();
        let runner = MigrationRunner::new(&db);
        let plan = notes_plan();

        let first = runner.apply(&plan).unwrap();
        let second = runner.apply(&plan).unwrap();
        assert_eq!(first.policies, 4);
        assert_eq!(second.policies, 4);
        assert_eq!(runner.applied().unwrap().len(), 1);
        assert!(runner.pending(&plan).unwrap().is_empty());
    }

    #[test]
    fn test_pending_detects_changed_steps() {
        let db = DatabaseConn::open_in_memory().unwrap();
        let runner = MigrationRunner::new(&db);
        let plan = notes_plan();
        assert_eq!(
            runner.pending(&plan).unwrap()[0].reason,
            PendingReason::NeverApplied
        );

        runner.apply(&plan).unwrap();
        let mut edited = notes_plan();
        edited.migrations[0].steps.pop();
        assert_eq!(
            runner.pending(&edited).unwrap()[0].reason,
            PendingReason::ChecksumChanged
        );
    }

    #[test]
    fn test_updated_at_strictly_advances() {
        let db = DatabaseConn::open_in_memory().unwrap();
        MigrationRunner::new(&db).apply(&notes_plan()).unwrap();
        db.execute("INSERT INTO notes (id, user_id, body) VALUES (1, 'alice', 'a')")
            .unwrap();

        let mut previous = updated_at(&db);
        for i in 0..5 {
            db.execute_with_params("UPDATE notes SET body = ?1 WHERE id = 1", [i.to_string()])
                .unwrap();
            let current = updated_at(&db);
            assert!(current > previous, "{} <= {}", current, previous);
            previous = current;
        }

        // A caller-supplied stamp in the past is overwritten
        db.execute("UPDATE notes SET updated_at = '2000-01-01T00:00:00.000Z' WHERE id = 1")
            .unwrap();
        assert!(updated_at(&db) > previous);
    }

    #[test]
    fn test_require_missing_table_is_fatal() {
        let db = DatabaseConn::open_in_memory().unwrap();
        let plan = SchemaPlan {
            name: "drift_fix",
            migrations: vec![Migration::new(
                100,
                "prefs",
                vec![
                    Step::RepairDrift(&USER_PREFERENCES_DRIFT),
                    Step::RequireTable("user_preferences"),
                ],
            )],
            target_version: None,
        };

        let err = MigrationRunner::new(&db).apply(&plan).unwrap_err();
        assert_eq!(err.missing_table(), Some("user_preferences"));
        assert!(matches!(err, SchemaError::Step { version: 100, .. }));
    }

    #[test]
    fn test_append_only() {
        let db = DatabaseConn::open_in_memory().unwrap();
        db.execute("CREATE TABLE log (id INTEGER PRIMARY KEY, msg TEXT)")
            .unwrap();
        install_append_only(&db.conn, "log").unwrap();
        install_append_only(&db.conn, "log").unwrap();

        db.execute("INSERT INTO log (msg) VALUES ('first')").unwrap();
        assert!(db.execute("UPDATE log SET msg = 'changed'").is_err());
        assert!(db.execute("DELETE FROM log").is_err());
        assert_eq!(db.table_count("log").unwrap(), 1);
    }

    #[test]
    fn test_failed_migration_rolls_back() {
        static BROKEN: TableDefinition = TableDefinition {
            name: "broken",
            sql: "CREATE TABLE IF NOT EXISTS half_done (id INTEGER); CREATE TABLE oops (",
        };
        let db = DatabaseConn::open_in_memory().unwrap();
        let plan = SchemaPlan {
            name: "broken",
            migrations: vec![Migration::new(1, "broken", vec![Step::CreateTable(&BROKEN)])],
            target_version: Some(1),
        };

        assert!(MigrationRunner::new(&db).apply(&plan).is_err());
        assert!(!db.table_exists("half_done").unwrap());
        assert!(MigrationRunner::new(&db).applied().unwrap().is_empty());
    }
}
