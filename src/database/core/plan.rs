//! Predefined schema plans
//!
//! `full` is the complete Vinow schema; `drift_fix` is the standalone patch
//! older deployments run to repair the `user_preferences` table before its
//! policies are recreated.

use super::drift::{USER_PREFERENCES_DRIFT, USER_PROFILES_DRIFT};
use super::migration::{IndexDefinition, Migration, SchemaPlan, Step, TableDefinition};
use super::schema::{SchemaDefinitions as Defs, SCHEMA_VERSION};

fn indexes(defs: &'static [IndexDefinition]) -> impl Iterator<Item = Step> {
    defs.iter().map(Step::CreateIndex)
}

fn repair_drift() -> Migration {
    Migration::new(
        1,
        "repair_table_drift",
        vec![
            Step::RepairDrift(&USER_PROFILES_DRIFT),
            Step::RepairDrift(&USER_PREFERENCES_DRIFT),
        ],
    )
}

fn user_profiles() -> Migration {
    let mut steps = vec![
        Step::CreateTable(&Defs::USER_PROFILES),
        Step::CreateTable(&Defs::USER_PREFERENCES),
    ];
    steps.extend(indexes(Defs::USER_PROFILE_INDEXES));
    steps.extend(indexes(Defs::USER_PREFERENCES_INDEXES));
    steps.extend([
        Step::TouchTrigger {
            table: "user_profiles",
        },
        Step::TouchTrigger {
            table: "user_preferences",
        },
        Step::TenantPolicies {
            table: "user_profiles",
            owner_column: "id",
        },
        Step::TenantPolicies {
            table: "user_preferences",
            owner_column: "user_id",
        },
    ]);
    Migration::new(2, "user_profiles", steps)
}

fn user_activity() -> Migration {
    let tables: [&'static TableDefinition; 4] = [
        &Defs::USER_ADDRESSES,
        &Defs::USER_FAVORITES,
        &Defs::SEARCH_HISTORY,
        &Defs::BROWSING_HISTORY,
    ];
    let mut steps: Vec<Step> = tables.iter().map(|t| Step::CreateTable(*t)).collect();
    steps.extend(indexes(Defs::USER_ACTIVITY_INDEXES));
    steps.extend(tables.iter().map(|t| Step::TenantPolicies {
        table: t.name,
        owner_column: "user_id",
    }));
    Migration::new(3, "user_activity", steps)
}

fn content_moderation() -> Migration {
    let mut steps = vec![
        Step::CreateTable(&Defs::USERS),
        Step::CreateTable(&Defs::CONTENTS),
        Step::CreateTable(&Defs::CONTENT_INTERACTIONS),
        Step::CreateTable(&Defs::CONTENT_QUALITY_SCORES),
        Step::CreateTable(&Defs::MODERATION_QUEUE),
        Step::CreateTable(&Defs::MODERATION_RESULTS),
        Step::CreateTable(&Defs::TAGS),
        Step::CreateTable(&Defs::CONTENT_TAGS),
    ];
    steps.extend(indexes(Defs::CONTENT_INDEXES));
    for table in [
        "users",
        "contents",
        "content_quality_scores",
        "moderation_queue",
    ] {
        steps.push(Step::TouchTrigger { table });
    }
    steps.push(Step::AppendOnly {
        table: "moderation_results",
    });
    Migration::new(4, "content_moderation", steps)
}

fn business_metrics() -> Migration {
    let mut steps = vec![
        Step::CreateTable(&Defs::BUSINESS_METRICS),
        Step::CreateTable(&Defs::ALERTS),
        Step::CreateTable(&Defs::REVENUE_TRENDS),
        Step::CreateTable(&Defs::COMPETITOR_ANALYSIS),
        Step::CreateTable(&Defs::REVIEWS),
        Step::CreateTable(&Defs::REVIEW_KEYWORDS),
    ];
    steps.extend(indexes(Defs::BUSINESS_INDEXES));
    for table in [
        "business_metrics",
        "alerts",
        "revenue_trends",
        "competitor_analysis",
        "reviews",
    ] {
        steps.push(Step::TouchTrigger { table });
    }
    Migration::new(5, "business_metrics", steps)
}

fn seed_business_metrics() -> Migration {
    Migration::new(
        6,
        "seed_business_metrics",
        vec![Step::Seed {
            table: "business_metrics",
            sql: Defs::BUSINESS_METRICS_SEED,
        }],
    )
}

impl SchemaPlan {
    /// The complete schema: drift repair, the three table clusters and the seed row
    pub fn full() -> Self {
        SchemaPlan {
            name: "full",
            migrations: vec![
                repair_drift(),
                user_profiles(),
                user_activity(),
                content_moderation(),
                business_metrics(),
                seed_business_metrics(),
            ],
            target_version: Some(SCHEMA_VERSION),
        }
    }

    /// Repair the preferences table name, then recreate its policies,
    /// indexes and timestamp trigger.
    ///
    /// Fails with a missing-table error when no preferences table exists
    /// under any known name. Leaves the recorded schema version alone.
    pub fn drift_fix() -> Self {
        let mut steps = vec![
            Step::RequireTable("user_preferences"),
            Step::TenantPolicies {
                table: "user_preferences",
                owner_column: "user_id",
            },
        ];
        steps.extend(indexes(Defs::USER_PREFERENCES_INDEXES));
        steps.push(Step::TouchTrigger {
            table: "user_preferences",
        });

        SchemaPlan {
            name: "drift_fix",
            migrations: vec![
                repair_drift(),
                Migration::new(100, "user_preferences_policies", steps),
            ],
            target_version: None,
        }
    }

    /// Look up a predefined plan by name
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "full" => Some(Self::full()),
            "drift_fix" | "drift-fix" => Some(Self::drift_fix()),
            _ => None,
        }
    }

    /// Highest migration version in the plan
    pub fn latest_version(&self) -> u32 {
        self.migrations
            .iter()
            .map(|m| m.version)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::{DatabaseConn, MigrationRunner, SchemaManager, TENANT_TABLES};

    #[test]
    fn test_full_plan_shape() {
        let plan = SchemaPlan::full();
        assert_eq!(plan.latest_version(), SCHEMA_VERSION);
        assert_eq!(plan.target_version, Some(SCHEMA_VERSION));

        let versions: Vec<u32> = plan.migrations.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);

        let tenants = plan.tenant_tables();
        assert_eq!(tenants, TENANT_TABLES.to_vec());
        assert_eq!(plan.tables().len(), 20);
    }

    #[test]
    fn test_by_name() {
        assert_eq!(SchemaPlan::by_name("drift-fix"), Some(SchemaPlan::drift_fix()));
        assert_eq!(SchemaPlan::by_name("full").map(|p| p.name), Some("full"));
        assert!(SchemaPlan::by_name("nightly").is_none());
    }

    #[test]
    fn test_drift_fix_on_empty_database_is_fatal() {
        let db = DatabaseConn::open_in_memory().unwrap();
        let err = MigrationRunner::new(&db)
            .apply(&SchemaPlan::drift_fix())
            .unwrap_err();
        assert_eq!(err.missing_table(), Some("user_preferences"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_drift_fix_repairs_misspelled_preferences() {
        let db = DatabaseConn::open_in_memory().unwrap();
        db.conn
            .execute_batch(Defs::USER_PROFILES.sql)
            .unwrap();
        db.conn
            .execute_batch(
                &Defs::USER_PREFERENCES
                    .sql
                    .replace("user_preferences", "user_prederences"),
            )
            .unwrap();
        db.execute("INSERT INTO user_profiles (id) VALUES ('a'), ('b'), ('c')")
            .unwrap();
        db.execute("INSERT INTO user_prederences (user_id) VALUES ('a'), ('b'), ('c')")
            .unwrap();
        // A policy left behind under the old table name
        db.execute(
            "CREATE TRIGGER user_prederences_delete_policy BEFORE DELETE ON user_prederences
             BEGIN SELECT RAISE(IGNORE); END",
        )
        .unwrap();

        let report = MigrationRunner::new(&db)
            .apply(&SchemaPlan::drift_fix())
            .unwrap();

        assert_eq!(report.renames.len(), 1);
        assert!(!db.table_exists("user_prederences").unwrap());
        assert_eq!(db.table_count("user_preferences").unwrap(), 3);
        assert_eq!(report.policies, 4);

        let manager = SchemaManager::new(&db);
        let verification = manager.verify_plan(&SchemaPlan::drift_fix()).unwrap();
        assert!(verification.is_ok(), "{:?}", verification.problems);
        let snapshot = manager.snapshot().unwrap();
        let prefs_policies: Vec<&str> = snapshot
            .policies
            .iter()
            .filter(|p| p.table_name == "user_preferences")
            .map(|p| p.policy_name.as_str())
            .collect();
        assert_eq!(prefs_policies.len(), 4);
        assert!(snapshot
            .objects
            .iter()
            .any(|o| o.name == "idx_user_preferences_language"));
        assert!(!snapshot
            .objects
            .iter()
            .any(|o| o.name == "user_prederences_delete_policy"));
        assert!(manager.get_meta("schema_version").unwrap().is_none());
    }
}
