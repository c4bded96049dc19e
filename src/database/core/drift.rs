//! Table-name drift repair
//!
//! Older deployments created some tables under misspelled, singular or
//! differently cased names. Each [`DriftRule`] names the canonical table and
//! the aliases it has been seen under; [`repair`] renames whatever is present
//! so later declarations find the canonical name. Indexes and triggers named
//! after the drifted table are dropped with the rename; the plan recreates
//! them under canonical names.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use super::connection::{find_table_nocase, quote_ident, table_exists};
use crate::error::Result;

/// A canonical table name and the drifted names it may exist under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftRule {
    pub canonical: &'static str,
    pub aliases: &'static [&'static str],
}

pub const USER_PROFILES_DRIFT: DriftRule = DriftRule {
    canonical: "user_profiles",
    aliases: &["user_profile", "userprofiles", "profiles"],
};

pub const USER_PREFERENCES_DRIFT: DriftRule = DriftRule {
    canonical: "user_preferences",
    aliases: &["user_prederences", "user_preference", "userpreferences"],
};

/// Every known drift, profiles first since preferences reference them
pub const DRIFT_RULES: &[DriftRule] = &[USER_PROFILES_DRIFT, USER_PREFERENCES_DRIFT];

/// Result of applying one drift rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftOutcome {
    /// The canonical table already exists under its exact name
    AlreadyCanonical,
    /// A drifted table was renamed to the canonical name
    Renamed { from: String },
    /// Neither the canonical table nor any alias exists
    Absent,
}

impl DriftOutcome {
    pub fn renamed_from(&self) -> Option<&str> {
        match self {
            DriftOutcome::Renamed { from } => Some(from),
            _ => None,
        }
    }
}

/// Bring one table to its canonical name.
///
/// Rows, indexes and triggers move with the table. When both the canonical
/// table and an alias exist, the alias is reported and left alone: merging
/// rows is not something a rename can decide.
pub fn repair(conn: &Connection, rule: &DriftRule) -> Result<DriftOutcome> {
    if table_exists(conn, rule.canonical)? {
        for alias in rule.aliases {
            if let Some(found) = find_table_nocase(conn, alias)? {
                warn!(
                    "both {} and drifted table {} exist; leaving {} untouched",
                    rule.canonical, found, found
                );
            }
        }
        return Ok(DriftOutcome::AlreadyCanonical);
    }

    let from = if let Some(variant) = find_table_nocase(conn, rule.canonical)? {
        // Names differ only in case, which SQLite treats as the same name
        let staging = format!("{}__drift_repair", rule.canonical);
        rename_table(conn, &variant, &staging)?;
        rename_table(conn, &staging, rule.canonical)?;
        variant
    } else {
        let mut found = None;
        for alias in rule.aliases {
            if let Some(name) = find_table_nocase(conn, alias)? {
                found = Some(name);
                break;
            }
        }
        match found {
            Some(name) => {
                rename_table(conn, &name, rule.canonical)?;
                name
            }
            None => return Ok(DriftOutcome::Absent),
        }
    };

    drop_derived_objects(conn, &from, rule.canonical)?;
    relabel_policies(conn, &from, rule.canonical)?;
    info!("renamed drifted table {} to {}", from, rule.canonical);
    Ok(DriftOutcome::Renamed { from })
}

fn rename_table(conn: &Connection, from: &str, to: &str) -> Result<()> {
    conn.execute(
        &format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(from),
            quote_ident(to)
        ),
        [],
    )?;
    Ok(())
}

/// Drop indexes and triggers on `table` whose names derive from `from`
/// (`idx_<from>_*` and `<from>_*`, compared case-insensitively)
fn drop_derived_objects(conn: &Connection, from: &str, table: &str) -> Result<Vec<String>> {
    let prefixes = [
        format!("idx_{}_", from.to_lowercase()),
        format!("{}_", from.to_lowercase()),
    ];

    let derived: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT type, name FROM sqlite_master
             WHERE type IN ('index', 'trigger')
               AND tbl_name = ?1 COLLATE NOCASE
               AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
        )?;
        let rows = stmt.query_map([table], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut dropped = Vec::new();
    for (kind, name) in derived {
        let lowered = name.to_lowercase();
        if !prefixes.iter().any(|p| lowered.starts_with(p.as_str())) {
            continue;
        }
        conn.execute(
            &format!("DROP {} IF EXISTS {}", kind.to_uppercase(), quote_ident(&name)),
            [],
        )?;
        debug!("dropped {} {} left from drifted table {}", kind, name, from);
        dropped.push(name);
    }
    Ok(dropped)
}

/// Point catalog rows recorded under the drifted name at the canonical table
fn relabel_policies(conn: &Connection, from: &str, to: &str) -> Result<()> {
    if !table_exists(conn, "schema_policies")? {
        return Ok(());
    }
    conn.execute(
        "UPDATE OR REPLACE schema_policies SET table_name = ?1 WHERE table_name = ?2 COLLATE NOCASE",
        [to, from],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<String>, _>>()
            .unwrap()
    }

    fn with_rows(name: &str, rows: usize) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            &format!("CREATE TABLE {} (user_id TEXT PRIMARY KEY, language TEXT)", name),
            [],
        )
        .unwrap();
        for i in 0..rows {
            conn.execute(
                &format!("INSERT INTO {} (user_id, language) VALUES (?1, 'vi')", name),
                [format!("u{}", i)],
            )
            .unwrap();
        }
        conn
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn test_misspelled_table_renamed() {
        let conn = with_rows("user_prederences", 3);
        let outcome = repair(&conn, &USER_PREFERENCES_DRIFT).unwrap();
        assert_eq!(outcome.renamed_from(), Some("user_prederences"));
        assert_eq!(tables(&conn), vec!["user_preferences"]);
        assert_eq!(count(&conn, "user_preferences"), 3);
    }

    #[test]
    fn test_repair_is_path_independent() {
        let starts = ["user_prederences", "user_preference", "User_Preferences", "user_preferences"];
        for start in starts {
            let conn = with_rows(start, 2);
            repair(&conn, &USER_PREFERENCES_DRIFT).unwrap();
            assert_eq!(tables(&conn), vec!["user_preferences"], "start: {}", start);
            assert_eq!(count(&conn, "user_preferences"), 2);

            // A second pass changes nothing
            let again = repair(&conn, &USER_PREFERENCES_DRIFT).unwrap();
            assert_eq!(again, DriftOutcome::AlreadyCanonical);
        }
    }

    #[test]
    fn test_objects_named_after_drifted_table_dropped() {
        let conn = with_rows("user_prederences", 1);
        conn.execute_batch(
            "CREATE INDEX idx_user_prederences_language ON user_prederences (language);
             CREATE INDEX idx_custom_language ON user_prederences (language);
             CREATE TRIGGER user_prederences_touch_updated_at AFTER UPDATE ON user_prederences
             BEGIN
                 UPDATE user_prederences SET language = NEW.language WHERE rowid = NEW.rowid;
             END;",
        )
        .unwrap();

        repair(&conn, &USER_PREFERENCES_DRIFT).unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type IN ('index', 'trigger') AND name NOT LIKE 'sqlite%'
                 ORDER BY name",
            )
            .unwrap();
        let names = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<String>, _>>()
            .unwrap();
        assert_eq!(names, vec!["idx_custom_language"]);
    }

    #[test]
    fn test_absent_is_noop() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(
            repair(&conn, &USER_PROFILES_DRIFT).unwrap(),
            DriftOutcome::Absent
        );
        assert!(tables(&conn).is_empty());
    }

    #[test]
    fn test_alias_left_alone_when_canonical_exists() {
        let conn = with_rows("user_preferences", 1);
        conn.execute("CREATE TABLE user_prederences (user_id TEXT)", [])
            .unwrap();
        assert_eq!(
            repair(&conn, &USER_PREFERENCES_DRIFT).unwrap(),
            DriftOutcome::AlreadyCanonical
        );
        assert_eq!(tables(&conn), vec!["user_prederences", "user_preferences"]);
    }

    #[test]
    fn test_catalog_rows_follow_rename() {
        let conn = with_rows("profiles", 1);
        conn.execute(
            "CREATE TABLE schema_policies (table_name TEXT, policy_name TEXT,
             PRIMARY KEY (table_name, policy_name))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO schema_policies VALUES ('profiles', 'profiles_select')",
            [],
        )
        .unwrap();

        repair(&conn, &USER_PROFILES_DRIFT).unwrap();
        let table: String = conn
            .query_row("SELECT table_name FROM schema_policies", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(table, "user_profiles");
    }
}
