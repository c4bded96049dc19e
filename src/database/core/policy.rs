//! Row-level access policies
//!
//! SQLite has no native row-level security, so each policy is compiled into
//! an engine-resident object carrying the policy's name:
//!
//! | command  | object                    | effect for a non-owner                 |
//! |----------|---------------------------|----------------------------------------|
//! | `select` | view over the table       | row is not visible                     |
//! | `insert` | `BEFORE INSERT` trigger   | statement aborts                       |
//! | `update` | `BEFORE UPDATE` trigger   | row is skipped; re-owning aborts       |
//! | `delete` | `BEFORE DELETE` trigger   | row is skipped                         |
//!
//! Every policy also has a row in the `schema_policies` catalog so its
//! predicate column can be inspected without parsing SQL.
//!
//! Policy creation uses replace semantics: the canonical name and every
//! known historical alias are dropped first, and dropping something that is
//! not there is a silent success.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::connection::{column_exists, object_kind, quote_ident, table_exists};
use super::drift::DRIFT_RULES;
use super::schema::SchemaDefinitions;
use crate::error::{is_missing_object, Result, SchemaError};

/// Operation a policy guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyCommand {
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    pub const ALL: [PolicyCommand; 4] = [
        PolicyCommand::Select,
        PolicyCommand::Insert,
        PolicyCommand::Update,
        PolicyCommand::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyCommand::Select => "select",
            PolicyCommand::Insert => "insert",
            PolicyCommand::Update => "update",
            PolicyCommand::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<PolicyCommand> {
        match s.to_lowercase().as_str() {
            "select" => Some(PolicyCommand::Select),
            "insert" => Some(PolicyCommand::Insert),
            "update" => Some(PolicyCommand::Update),
            "delete" => Some(PolicyCommand::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for PolicyCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An ownership policy: `owner_column = auth_uid()` for one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub table: String,
    pub name: String,
    pub command: PolicyCommand,
    pub owner_column: String,
}

impl Policy {
    /// The canonical policy for `command` on a tenant-owned table
    pub fn tenant(table: &str, command: PolicyCommand, owner_column: &str) -> Self {
        Self {
            table: table.to_string(),
            name: Self::canonical_name(table, command),
            command,
            owner_column: owner_column.to_string(),
        }
    }

    /// `<table>_<operation>_policy`
    pub fn canonical_name(table: &str, command: PolicyCommand) -> String {
        format!("{}_{}_policy", table, command.as_str())
    }

    /// Human-readable predicate stored in the catalog
    pub fn predicate(&self) -> String {
        format!("{} = auth_uid()", self.owner_column)
    }

    fn engine_sql(&self) -> String {
        let name = quote_ident(&self.name);
        let table = quote_ident(&self.table);
        let owner = quote_ident(&self.owner_column);
        let violation = format!(
            "new row violates row-level security policy for table {}",
            self.table.replace('\'', "")
        );

        match self.command {
            PolicyCommand::Select => format!(
                "CREATE VIEW {name} AS \
                 SELECT * FROM {table} \
                 WHERE auth_role() = 'service' OR {owner} = auth_uid()"
            ),
            PolicyCommand::Insert => format!(
                "CREATE TRIGGER {name} BEFORE INSERT ON {table} FOR EACH ROW \
                 WHEN auth_role() <> 'service' \
                      AND (auth_uid() IS NULL OR NEW.{owner} IS NOT auth_uid()) \
                 BEGIN \
                     SELECT RAISE(ABORT, '{violation}'); \
                 END"
            ),
            PolicyCommand::Update => format!(
                "CREATE TRIGGER {name} BEFORE UPDATE ON {table} FOR EACH ROW \
                 WHEN auth_role() <> 'service' \
                 BEGIN \
                     SELECT RAISE(IGNORE) WHERE OLD.{owner} IS NOT auth_uid(); \
                     SELECT RAISE(ABORT, '{violation}') WHERE NEW.{owner} IS NOT auth_uid(); \
                 END"
            ),
            PolicyCommand::Delete => format!(
                "CREATE TRIGGER {name} BEFORE DELETE ON {table} FOR EACH ROW \
                 WHEN auth_role() <> 'service' AND OLD.{owner} IS NOT auth_uid() \
                 BEGIN \
                     SELECT RAISE(IGNORE); \
                 END"
            ),
        }
    }
}

/// A row of the policy catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyRecord {
    pub table_name: String,
    pub policy_name: String,
    pub command: String,
    pub owner_column: String,
    pub predicate: String,
}

/// Tables with a catalogued select policy, with their owner column
pub fn guarded_tables(conn: &Connection) -> Result<Vec<(String, String)>> {
    if !table_exists(conn, "schema_policies")? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT table_name, owner_column FROM schema_policies WHERE command = 'select'",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(SchemaError::from)
}

/// Names a policy has carried in earlier schema scripts
pub struct PolicyAlias {
    pub table: &'static str,
    pub command: PolicyCommand,
    pub aliases: &'static [&'static str],
}

pub const POLICY_ALIASES: &[PolicyAlias] = &[
    PolicyAlias {
        table: "user_profiles",
        command: PolicyCommand::Select,
        aliases: &[
            "Users can view own profile",
            "Enable read access for own profile",
        ],
    },
    PolicyAlias {
        table: "user_profiles",
        command: PolicyCommand::Insert,
        aliases: &[
            "Users can insert own profile",
            "Enable insert for authenticated users only",
        ],
    },
    PolicyAlias {
        table: "user_profiles",
        command: PolicyCommand::Update,
        aliases: &["Users can update own profile"],
    },
    PolicyAlias {
        table: "user_profiles",
        command: PolicyCommand::Delete,
        aliases: &["Users can delete own profile"],
    },
    PolicyAlias {
        table: "user_preferences",
        command: PolicyCommand::Select,
        aliases: &["Users can view own preferences"],
    },
    PolicyAlias {
        table: "user_preferences",
        command: PolicyCommand::Insert,
        aliases: &["Users can insert own preferences"],
    },
    PolicyAlias {
        table: "user_preferences",
        command: PolicyCommand::Update,
        aliases: &["Users can update own preferences"],
    },
    PolicyAlias {
        table: "user_preferences",
        command: PolicyCommand::Delete,
        aliases: &["Users can delete own preferences"],
    },
];

/// Every historical name the policy for (`table`, `command`) may exist under.
///
/// Combines the static alias table, the prior `<table>_<operation>` naming
/// scheme, and canonical names built from drifted table names.
pub fn historical_names(table: &str, command: PolicyCommand) -> Vec<String> {
    let mut names: Vec<String> = POLICY_ALIASES
        .iter()
        .filter(|a| a.table == table && a.command == command)
        .flat_map(|a| a.aliases.iter().map(|s| s.to_string()))
        .collect();

    names.push(format!("{}_{}", table, command.as_str()));

    for rule in DRIFT_RULES.iter().filter(|r| r.canonical == table) {
        for alias in rule.aliases {
            names.push(Policy::canonical_name(alias, command));
            names.push(format!("{}_{}", alias, command.as_str()));
        }
    }

    names
}

/// Declares, replaces and removes access policies
pub struct PolicyManager<'a> {
    conn: &'a Connection,
}

impl<'a> PolicyManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create the policy catalog if absent
    pub fn ensure_catalog(&self) -> Result<()> {
        self.conn.execute(SchemaDefinitions::POLICIES_TABLE, [])?;
        Ok(())
    }

    /// Whether a policy of this name exists on `table`, in the catalog or as an
    /// engine object
    pub fn policy_exists(&self, table: &str, name: &str) -> Result<bool> {
        self.ensure_catalog()?;
        let in_catalog: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM schema_policies WHERE table_name = ?1 AND policy_name = ?2",
            params![table, name],
            |row| row.get(0),
        )?;
        Ok(in_catalog > 0 || self.engine_object_kind(table, name)?.is_some())
    }

    /// Drop a policy if it exists.
    ///
    /// Returns whether anything was removed. A policy that never existed is
    /// not an error.
    pub fn drop_policy(&self, table: &str, name: &str) -> Result<bool> {
        self.ensure_catalog()?;

        let removed_row = self.conn.execute(
            "DELETE FROM schema_policies WHERE table_name = ?1 AND policy_name = ?2",
            params![table, name],
        )? > 0;
        let removed_object = self.drop_engine_object(table, name)?;

        if removed_row || removed_object {
            debug!("dropped policy '{}' on {}", name, table);
        }
        Ok(removed_row || removed_object)
    }

    /// Create a policy with replace semantics
    pub fn create_policy(&self, policy: &Policy) -> Result<()> {
        self.ensure_catalog()?;
        if !table_exists(self.conn, &policy.table)? {
            return Err(SchemaError::MissingTable {
                table: policy.table.clone(),
            });
        }

        self.drop_policy(&policy.table, &policy.name)?;
        for alias in historical_names(&policy.table, policy.command) {
            if self.drop_policy(&policy.table, &alias)? {
                debug!("removed legacy policy '{}' on {}", alias, policy.table);
            }
        }

        self.conn.execute(&policy.engine_sql(), [])?;
        self.conn.execute(
            "INSERT INTO schema_policies (table_name, policy_name, command, owner_column, predicate)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(table_name, policy_name) DO UPDATE SET
                command = excluded.command,
                owner_column = excluded.owner_column,
                predicate = excluded.predicate",
            params![
                policy.table,
                policy.name,
                policy.command.as_str(),
                policy.owner_column,
                policy.predicate(),
            ],
        )?;
        Ok(())
    }

    /// Converge `table` to exactly the four canonical ownership policies
    pub fn apply_tenant_policies(&self, table: &str, owner_column: &str) -> Result<Vec<Policy>> {
        self.ensure_catalog()?;
        if !table_exists(self.conn, table)? {
            return Err(SchemaError::MissingTable {
                table: table.to_string(),
            });
        }
        if !column_exists(self.conn, table, owner_column)? {
            return Err(SchemaError::Verification(vec![format!(
                "table {} has no owner column '{}'",
                table, owner_column
            )]));
        }

        let policies: Vec<Policy> = PolicyCommand::ALL
            .iter()
            .map(|cmd| Policy::tenant(table, *cmd, owner_column))
            .collect();

        for policy in &policies {
            self.create_policy(policy)?;
        }

        // Anything else attached to the table is left over from older scripts
        let canonical: Vec<&str> = policies.iter().map(|p| p.name.as_str()).collect();
        for record in self.list_policies(Some(table))? {
            if !canonical.contains(&record.policy_name.as_str()) {
                warn!(
                    "removing unknown policy '{}' on {}",
                    record.policy_name, table
                );
                self.drop_policy(table, &record.policy_name)?;
            }
        }
        for trigger in self.policy_triggers(table)? {
            if !canonical.contains(&trigger.as_str()) {
                warn!("removing unknown policy trigger '{}' on {}", trigger, table);
                self.drop_policy(table, &trigger)?;
            }
        }

        Ok(policies)
    }

    /// List catalog entries, optionally restricted to one table
    pub fn list_policies(&self, table: Option<&str>) -> Result<Vec<PolicyRecord>> {
        self.ensure_catalog()?;
        let mut stmt = self.conn.prepare(
            "SELECT table_name, policy_name, command, owner_column, predicate
             FROM schema_policies
             WHERE ?1 IS NULL OR table_name = ?1
             ORDER BY table_name, policy_name",
        )?;

        let rows = stmt.query_map([table], |row| {
            Ok(PolicyRecord {
                table_name: row.get(0)?,
                policy_name: row.get(1)?,
                command: row.get(2)?,
                owner_column: row.get(3)?,
                predicate: row.get(4)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(SchemaError::from)
    }

    /// Kind of the engine object implementing a policy, if present
    pub fn engine_object_kind(&self, table: &str, name: &str) -> Result<Option<String>> {
        match object_kind(self.conn, name)?.as_deref() {
            Some("trigger") => {
                let attached: i64 = self.conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master
                     WHERE type = 'trigger' AND name = ?1 COLLATE NOCASE
                       AND tbl_name = ?2 COLLATE NOCASE",
                    params![name, table],
                    |row| row.get(0),
                )?;
                Ok((attached > 0).then(|| "trigger".to_string()))
            }
            Some("view") => Ok(Some("view".to_string())),
            // Absent, or a table/index that merely shares the name
            _ => Ok(None),
        }
    }

    fn drop_engine_object(&self, table: &str, name: &str) -> Result<bool> {
        let sql = match self.engine_object_kind(table, name)?.as_deref() {
            Some("trigger") => format!("DROP TRIGGER {}", quote_ident(name)),
            Some("view") => format!("DROP VIEW {}", quote_ident(name)),
            _ => return Ok(false),
        };

        match self.conn.execute(&sql, []) {
            Ok(_) => Ok(true),
            // Another initializer removed it between the check and the drop
            Err(e) if is_missing_object(&e) => {
                warn!("policy object '{}' disappeared before drop: {}", name, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn policy_triggers(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'trigger' AND tbl_name = ?1 AND name LIKE '%\\_policy' ESCAPE '\\'",
        )?;
        let rows = stmt.query_map([table], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<String>, _>>()
            .map_err(SchemaError::from)
    }
}
