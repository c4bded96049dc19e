//! Database schema management
//!
//! This module holds the SQL for every table of the Vinow schema and the
//! [`SchemaManager`] that applies plans, reports status and verifies the
//! result. Table declarations are guarded (`IF NOT EXISTS`); everything
//! derived from them (indexes, triggers, policies) is converged by the
//! migration runner.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use super::connection::{column_exists, object_kind, quote_ident, table_exists, DatabaseConn};
use super::migration::{
    touch_trigger_name, ApplyReport, IndexDefinition, MigrationRunner, SchemaPlan,
    TableDefinition,
};
use super::policy::{Policy, PolicyCommand, PolicyManager, PolicyRecord};
use crate::error::{Result, SchemaError};

/// Current schema version
/// Increment this when adding a migration to the full plan
pub const SCHEMA_VERSION: u32 = 6;

/// Tenant-owned tables and the column holding the owning principal
pub const TENANT_TABLES: &[(&str, &str)] = &[
    ("user_profiles", "id"),
    ("user_preferences", "user_id"),
    ("user_addresses", "user_id"),
    ("user_favorites", "user_id"),
    ("search_history", "user_id"),
    ("browsing_history", "user_id"),
];

/// Schema definitions for all tables
pub struct SchemaDefinitions;

impl SchemaDefinitions {
    /// Key/value metadata (schema version and friends)
    pub const META_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
    "#;

    /// Migration ledger
    pub const MIGRATIONS_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            checksum TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            converged_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
    "#;

    /// Policy catalog, one row per named policy
    pub const POLICIES_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS schema_policies (
            table_name TEXT NOT NULL,
            policy_name TEXT NOT NULL,
            command TEXT NOT NULL CHECK (command IN ('select', 'insert', 'update', 'delete')),
            owner_column TEXT NOT NULL,
            predicate TEXT NOT NULL,
            PRIMARY KEY (table_name, policy_name)
        );
    "#;

    // ---------------------------------------------------------------------
    // User cluster
    // ---------------------------------------------------------------------

    pub const USER_PROFILES: TableDefinition = TableDefinition {
        name: "user_profiles",
        sql: r#"
        CREATE TABLE IF NOT EXISTS user_profiles (
            id TEXT PRIMARY KEY,
            username TEXT UNIQUE,
            full_name TEXT,
            avatar_url TEXT,
            phone TEXT UNIQUE,
            date_of_birth TEXT,
            gender TEXT CHECK (gender IS NULL OR gender IN ('male', 'female', 'other')),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const USER_PREFERENCES: TableDefinition = TableDefinition {
        name: "user_preferences",
        sql: r#"
        CREATE TABLE IF NOT EXISTS user_preferences (
            user_id TEXT PRIMARY KEY REFERENCES user_profiles(id) ON DELETE CASCADE,
            language TEXT NOT NULL DEFAULT 'vi',
            notification_enabled INTEGER NOT NULL DEFAULT 1 CHECK (notification_enabled IN (0, 1)),
            dietary_restrictions TEXT NOT NULL DEFAULT '[]' CHECK (json_valid(dietary_restrictions)),
            favorite_cuisines TEXT NOT NULL DEFAULT '[]' CHECK (json_valid(favorite_cuisines)),
            notification_settings TEXT NOT NULL DEFAULT '{}' CHECK (json_valid(notification_settings)),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const USER_ADDRESSES: TableDefinition = TableDefinition {
        name: "user_addresses",
        sql: r#"
        CREATE TABLE IF NOT EXISTS user_addresses (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            user_id TEXT NOT NULL REFERENCES user_profiles(id) ON DELETE CASCADE,
            label TEXT,
            recipient_name TEXT,
            phone TEXT,
            address_line1 TEXT NOT NULL,
            address_line2 TEXT,
            city TEXT,
            district TEXT,
            ward TEXT,
            is_default INTEGER NOT NULL DEFAULT 0 CHECK (is_default IN (0, 1)),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const USER_FAVORITES: TableDefinition = TableDefinition {
        name: "user_favorites",
        sql: r#"
        CREATE TABLE IF NOT EXISTS user_favorites (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            user_id TEXT NOT NULL REFERENCES user_profiles(id) ON DELETE CASCADE,
            merchant_id TEXT,
            product_id TEXT,
            favorite_type TEXT NOT NULL CHECK (favorite_type IN ('merchant', 'product')),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE (user_id, merchant_id, product_id)
        );
        "#,
    };

    pub const SEARCH_HISTORY: TableDefinition = TableDefinition {
        name: "search_history",
        sql: r#"
        CREATE TABLE IF NOT EXISTS search_history (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            user_id TEXT NOT NULL REFERENCES user_profiles(id) ON DELETE CASCADE,
            query_text TEXT NOT NULL,
            search_type TEXT,
            filters TEXT NOT NULL DEFAULT '{}' CHECK (json_valid(filters)),
            result_count INTEGER NOT NULL DEFAULT 0 CHECK (result_count >= 0),
            searched_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const BROWSING_HISTORY: TableDefinition = TableDefinition {
        name: "browsing_history",
        sql: r#"
        CREATE TABLE IF NOT EXISTS browsing_history (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            user_id TEXT NOT NULL REFERENCES user_profiles(id) ON DELETE CASCADE,
            merchant_id TEXT,
            product_id TEXT,
            viewed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            duration_seconds INTEGER NOT NULL DEFAULT 0 CHECK (duration_seconds >= 0)
        );
        "#,
    };

    pub const USER_PROFILE_INDEXES: &'static [IndexDefinition] = &[IndexDefinition {
        name: "idx_user_profiles_created_at",
        table: "user_profiles",
        columns: "created_at",
        unique: false,
    }];

    pub const USER_PREFERENCES_INDEXES: &'static [IndexDefinition] = &[IndexDefinition {
        name: "idx_user_preferences_language",
        table: "user_preferences",
        columns: "language",
        unique: false,
    }];

    pub const USER_ACTIVITY_INDEXES: &'static [IndexDefinition] = &[
        IndexDefinition {
            name: "idx_user_addresses_user_id",
            table: "user_addresses",
            columns: "user_id",
            unique: false,
        },
        IndexDefinition {
            name: "idx_user_favorites_user_id",
            table: "user_favorites",
            columns: "user_id",
            unique: false,
        },
        IndexDefinition {
            name: "idx_user_favorites_type",
            table: "user_favorites",
            columns: "favorite_type",
            unique: false,
        },
        IndexDefinition {
            name: "idx_search_history_user_id",
            table: "search_history",
            columns: "user_id, searched_at",
            unique: false,
        },
        IndexDefinition {
            name: "idx_browsing_history_user_id",
            table: "browsing_history",
            columns: "user_id, viewed_at",
            unique: false,
        },
    ];

    // ---------------------------------------------------------------------
    // Content and moderation cluster
    // ---------------------------------------------------------------------

    pub const USERS: TableDefinition = TableDefinition {
        name: "users",
        sql: r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            email TEXT NOT NULL UNIQUE,
            display_name TEXT,
            role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('user', 'creator', 'moderator', 'admin')),
            is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const CONTENTS: TableDefinition = TableDefinition {
        name: "contents",
        sql: r#"
        CREATE TABLE IF NOT EXISTS contents (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            author_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            body TEXT,
            content_type TEXT NOT NULL DEFAULT 'article' CHECK (content_type IN ('article', 'video', 'image')),
            status TEXT NOT NULL DEFAULT 'draft' CHECK (status IN ('draft', 'pending', 'approved', 'rejected')),
            view_count INTEGER NOT NULL DEFAULT 0 CHECK (view_count >= 0),
            like_count INTEGER NOT NULL DEFAULT 0 CHECK (like_count >= 0),
            comment_count INTEGER NOT NULL DEFAULT 0 CHECK (comment_count >= 0),
            published_at TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const CONTENT_INTERACTIONS: TableDefinition = TableDefinition {
        name: "content_interactions",
        sql: r#"
        CREATE TABLE IF NOT EXISTS content_interactions (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            content_id TEXT NOT NULL REFERENCES contents(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            interaction_type TEXT NOT NULL CHECK (interaction_type IN ('view', 'like', 'comment', 'share', 'report')),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const CONTENT_QUALITY_SCORES: TableDefinition = TableDefinition {
        name: "content_quality_scores",
        sql: r#"
        CREATE TABLE IF NOT EXISTS content_quality_scores (
            content_id TEXT PRIMARY KEY REFERENCES contents(id) ON DELETE CASCADE,
            quality_score REAL NOT NULL DEFAULT 0 CHECK (quality_score BETWEEN 0 AND 100),
            readability_score REAL CHECK (readability_score IS NULL OR readability_score BETWEEN 0 AND 100),
            engagement_score REAL CHECK (engagement_score IS NULL OR engagement_score BETWEEN 0 AND 100),
            calculated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const MODERATION_QUEUE: TableDefinition = TableDefinition {
        name: "moderation_queue",
        sql: r#"
        CREATE TABLE IF NOT EXISTS moderation_queue (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            content_id TEXT NOT NULL REFERENCES contents(id) ON DELETE CASCADE,
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'in_review', 'resolved')),
            priority INTEGER NOT NULL DEFAULT 0 CHECK (priority BETWEEN 0 AND 10),
            assigned_to TEXT REFERENCES users(id) ON DELETE SET NULL,
            reason TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const MODERATION_RESULTS: TableDefinition = TableDefinition {
        name: "moderation_results",
        sql: r#"
        CREATE TABLE IF NOT EXISTS moderation_results (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            content_id TEXT NOT NULL REFERENCES contents(id),
            queue_id TEXT REFERENCES moderation_queue(id),
            moderator_id TEXT REFERENCES users(id),
            decision TEXT NOT NULL CHECK (decision IN ('approved', 'rejected', 'escalated')),
            notes TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const TAGS: TableDefinition = TableDefinition {
        name: "tags",
        sql: r#"
        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const CONTENT_TAGS: TableDefinition = TableDefinition {
        name: "content_tags",
        sql: r#"
        CREATE TABLE IF NOT EXISTS content_tags (
            content_id TEXT NOT NULL REFERENCES contents(id) ON DELETE CASCADE,
            tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            PRIMARY KEY (content_id, tag_id)
        );
        "#,
    };

    pub const CONTENT_INDEXES: &'static [IndexDefinition] = &[
        IndexDefinition {
            name: "idx_contents_author_id",
            table: "contents",
            columns: "author_id",
            unique: false,
        },
        IndexDefinition {
            name: "idx_contents_status",
            table: "contents",
            columns: "status",
            unique: false,
        },
        IndexDefinition {
            name: "idx_contents_type",
            table: "contents",
            columns: "content_type",
            unique: false,
        },
        IndexDefinition {
            name: "idx_contents_created_at",
            table: "contents",
            columns: "created_at",
            unique: false,
        },
        IndexDefinition {
            name: "idx_content_interactions_content_id",
            table: "content_interactions",
            columns: "content_id",
            unique: false,
        },
        IndexDefinition {
            name: "idx_content_interactions_user_id",
            table: "content_interactions",
            columns: "user_id",
            unique: false,
        },
        IndexDefinition {
            name: "idx_content_interactions_type",
            table: "content_interactions",
            columns: "interaction_type",
            unique: false,
        },
        IndexDefinition {
            name: "idx_moderation_queue_content_id",
            table: "moderation_queue",
            columns: "content_id",
            unique: false,
        },
        IndexDefinition {
            name: "idx_moderation_queue_status_priority",
            table: "moderation_queue",
            columns: "status, priority DESC",
            unique: false,
        },
        IndexDefinition {
            name: "idx_moderation_queue_assigned_to",
            table: "moderation_queue",
            columns: "assigned_to",
            unique: false,
        },
        IndexDefinition {
            name: "idx_moderation_results_content_id",
            table: "moderation_results",
            columns: "content_id",
            unique: false,
        },
        IndexDefinition {
            name: "idx_moderation_results_moderator_id",
            table: "moderation_results",
            columns: "moderator_id",
            unique: false,
        },
        IndexDefinition {
            name: "idx_content_tags_tag_id",
            table: "content_tags",
            columns: "tag_id",
            unique: false,
        },
    ];

    // ---------------------------------------------------------------------
    // Business metrics cluster
    // ---------------------------------------------------------------------

    pub const BUSINESS_METRICS: TableDefinition = TableDefinition {
        name: "business_metrics",
        sql: r#"
        CREATE TABLE IF NOT EXISTS business_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            metric_date TEXT NOT NULL UNIQUE,
            customer_count INTEGER NOT NULL DEFAULT 0 CHECK (customer_count >= 0),
            order_count INTEGER NOT NULL DEFAULT 0 CHECK (order_count >= 0),
            revenue INTEGER NOT NULL DEFAULT 0 CHECK (revenue >= 0),
            avg_order_value REAL NOT NULL DEFAULT 0,
            rating REAL CHECK (rating IS NULL OR rating BETWEEN 0 AND 5),
            health_score INTEGER CHECK (health_score IS NULL OR health_score BETWEEN 0 AND 100),
            competitor_count INTEGER NOT NULL DEFAULT 0,
            rating_rank INTEGER,
            better_than_peers INTEGER CHECK (better_than_peers IS NULL OR better_than_peers BETWEEN 0 AND 100),
            morning_revenue INTEGER NOT NULL DEFAULT 0,
            lunch_revenue INTEGER NOT NULL DEFAULT 0,
            afternoon_revenue INTEGER NOT NULL DEFAULT 0,
            evening_revenue INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const ALERTS: TableDefinition = TableDefinition {
        name: "alerts",
        sql: r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            title TEXT NOT NULL,
            description TEXT,
            level TEXT NOT NULL DEFAULT 'info' CHECK (level IN ('info', 'warning', 'critical')),
            is_resolved INTEGER NOT NULL DEFAULT 0 CHECK (is_resolved IN (0, 1)),
            business_date TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const REVENUE_TRENDS: TableDefinition = TableDefinition {
        name: "revenue_trends",
        sql: r#"
        CREATE TABLE IF NOT EXISTS revenue_trends (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            business_date TEXT NOT NULL,
            period TEXT NOT NULL CHECK (period IN ('morning', 'lunch', 'afternoon', 'evening')),
            revenue INTEGER NOT NULL DEFAULT 0 CHECK (revenue >= 0),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE (business_date, period)
        );
        "#,
    };

    pub const COMPETITOR_ANALYSIS: TableDefinition = TableDefinition {
        name: "competitor_analysis",
        sql: r#"
        CREATE TABLE IF NOT EXISTS competitor_analysis (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            business_date TEXT NOT NULL UNIQUE,
            total_competitors INTEGER NOT NULL DEFAULT 0 CHECK (total_competitors >= 0),
            rating_rank INTEGER,
            price_level TEXT CHECK (price_level IS NULL OR price_level IN ('low', 'medium', 'medium_high', 'high')),
            customer_flow_rank INTEGER,
            promotion_intensity TEXT CHECK (promotion_intensity IS NULL OR promotion_intensity IN ('low', 'medium', 'high')),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const REVIEWS: TableDefinition = TableDefinition {
        name: "reviews",
        sql: r#"
        CREATE TABLE IF NOT EXISTS reviews (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            business_date TEXT NOT NULL,
            rating INTEGER NOT NULL CHECK (rating >= 1 AND rating <= 5),
            comment TEXT,
            is_responded INTEGER NOT NULL DEFAULT 0 CHECK (is_responded IN (0, 1)),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    };

    pub const REVIEW_KEYWORDS: TableDefinition = TableDefinition {
        name: "review_keywords",
        sql: r#"
        CREATE TABLE IF NOT EXISTS review_keywords (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            business_date TEXT NOT NULL,
            keyword TEXT NOT NULL,
            frequency INTEGER NOT NULL DEFAULT 0 CHECK (frequency >= 0),
            sentiment TEXT NOT NULL DEFAULT 'neutral' CHECK (sentiment IN ('positive', 'neutral', 'negative')),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE (business_date, keyword)
        );
        "#,
    };

    pub const BUSINESS_INDEXES: &'static [IndexDefinition] = &[
        IndexDefinition {
            name: "idx_alerts_business_date",
            table: "alerts",
            columns: "business_date",
            unique: false,
        },
        IndexDefinition {
            name: "idx_alerts_level_resolved",
            table: "alerts",
            columns: "level, is_resolved",
            unique: false,
        },
        IndexDefinition {
            name: "idx_reviews_business_date",
            table: "reviews",
            columns: "business_date",
            unique: false,
        },
        IndexDefinition {
            name: "idx_reviews_rating",
            table: "reviews",
            columns: "rating",
            unique: false,
        },
    ];

    /// Today's metrics row; re-running refreshes the derived average
    pub const BUSINESS_METRICS_SEED: &'static str = r#"
        INSERT INTO business_metrics (metric_date)
        VALUES (date('now'))
        ON CONFLICT (metric_date) DO UPDATE SET
            avg_order_value = CASE
                WHEN business_metrics.order_count > 0
                THEN CAST(business_metrics.revenue AS REAL) / business_metrics.order_count
                ELSE 0
            END
    "#;
}

/// Upsert one metadata value
pub fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        params![key, value],
    )?;
    Ok(())
}

/// Read one metadata value; `None` when the key or the meta table is absent
pub fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    if !table_exists(conn, "schema_meta")? {
        return Ok(None);
    }
    let value = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Status of the database schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SchemaStatus {
    /// Database is not initialized (fresh database)
    NotInitialized,

    /// Schema is current and valid
    Current,

    /// Schema needs migration from an older version
    NeedsMigration { from: u32, to: u32 },

    /// Database is from a newer version (incompatible)
    Incompatible {
        database_version: u32,
        required_version: u32,
    },

    /// Schema version is current but objects are missing or misnamed
    Corrupted,
}

impl std::fmt::Display for SchemaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaStatus::NotInitialized => write!(f, "not initialized"),
            SchemaStatus::Current => write!(f, "current (v{})", SCHEMA_VERSION),
            SchemaStatus::NeedsMigration { from, to } => {
                write!(f, "needs migration from v{} to v{}", from, to)
            }
            SchemaStatus::Incompatible {
                database_version,
                required_version,
            } => write!(
                f,
                "incompatible: database is v{}, this build supports v{}",
                database_version, required_version
            ),
            SchemaStatus::Corrupted => write!(f, "corrupted"),
        }
    }
}

/// Outcome of [`SchemaManager::verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub tables_checked: usize,
    pub policies_checked: usize,
    pub problems: Vec<String>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(SchemaError::Verification(self.problems))
        }
    }
}

/// One row of `sqlite_master`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaObject {
    pub kind: String,
    pub name: String,
    pub table: String,
    pub sql: Option<String>,
}

/// Sorted structural state of a database: every engine object plus the
/// policy catalog. Two databases with equal snapshots have the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaSnapshot {
    pub objects: Vec<SchemaObject>,
    pub policies: Vec<PolicyRecord>,
}

impl SchemaSnapshot {
    pub fn tables(&self) -> Vec<&str> {
        self.objects
            .iter()
            .filter(|o| o.kind == "table")
            .map(|o| o.name.as_str())
            .collect()
    }
}

/// Schema manager for the Vinow database
///
/// Handles plan application, version checking and verification.
pub struct SchemaManager<'a> {
    db: &'a DatabaseConn,
}

impl<'a> SchemaManager<'a> {
    /// Create a new schema manager for the given connection
    pub fn new(db: &'a DatabaseConn) -> Self {
        Self { db }
    }

    /// Converge the database to `plan`
    pub fn apply(&self, plan: &SchemaPlan) -> Result<ApplyReport> {
        MigrationRunner::new(self.db).apply(plan)
    }

    /// Converge the database to the full schema
    pub fn initialize(&self) -> Result<ApplyReport> {
        self.apply(&SchemaPlan::full())
    }

    /// Check the current schema status
    pub fn check_status(&self) -> Result<SchemaStatus> {
        let current_version = match self.schema_version()? {
            Some(version) => version,
            None => return Ok(SchemaStatus::NotInitialized),
        };

        if current_version == SCHEMA_VERSION {
            if self.verify()?.is_ok() {
                Ok(SchemaStatus::Current)
            } else {
                Ok(SchemaStatus::Corrupted)
            }
        } else if current_version < SCHEMA_VERSION {
            Ok(SchemaStatus::NeedsMigration {
                from: current_version,
                to: SCHEMA_VERSION,
            })
        } else {
            Ok(SchemaStatus::Incompatible {
                database_version: current_version,
                required_version: SCHEMA_VERSION,
            })
        }
    }

    /// Recorded schema version, `None` for a fresh database
    ///
    /// An unparseable value reads as version 0 so the full plan re-runs.
    pub fn schema_version(&self) -> Result<Option<u32>> {
        Ok(self
            .get_meta("schema_version")?
            .map(|v| v.parse().unwrap_or(0)))
    }

    /// Verify the database against the full plan
    pub fn verify(&self) -> Result<VerificationReport> {
        self.verify_plan(&SchemaPlan::full())
    }

    /// Verify tables, timestamp triggers and tenant policies declared by `plan`
    pub fn verify_plan(&self, plan: &SchemaPlan) -> Result<VerificationReport> {
        let conn = &self.db.conn;
        let mut report = VerificationReport::default();

        for table in plan.tables() {
            report.tables_checked += 1;
            if !table_exists(conn, table)? {
                report.problems.push(format!("missing table {}", table));
                continue;
            }
            if column_exists(conn, table, "updated_at")?
                && object_kind(conn, &touch_trigger_name(table))?.as_deref() != Some("trigger")
            {
                report
                    .problems
                    .push(format!("table {} has no updated_at trigger", table));
            }
        }

        let policies = PolicyManager::new(conn);
        for (table, owner_column) in plan.tenant_tables() {
            if !table_exists(conn, table)? {
                continue;
            }
            let records = policies.list_policies(Some(table))?;
            report.policies_checked += records.len();

            for command in PolicyCommand::ALL {
                let name = Policy::canonical_name(table, command);
                match records.iter().find(|r| r.policy_name == name) {
                    None => report.problems.push(format!("missing policy {}", name)),
                    Some(record) if record.owner_column != owner_column => {
                        report.problems.push(format!(
                            "policy {} checks {} instead of {}",
                            name, record.owner_column, owner_column
                        ))
                    }
                    Some(_) => {
                        if policies.engine_object_kind(table, &name)?.is_none() {
                            report
                                .problems
                                .push(format!("policy {} is catalogued but not installed", name));
                        }
                    }
                }
            }
            if records.len() > PolicyCommand::ALL.len() {
                report.problems.push(format!(
                    "table {} has {} policies, expected {}",
                    table,
                    records.len(),
                    PolicyCommand::ALL.len()
                ));
            }
        }

        debug!(
            "verified {} tables and {} policies: {} problems",
            report.tables_checked,
            report.policies_checked,
            report.problems.len()
        );
        Ok(report)
    }

    /// Capture the structural state of the database
    pub fn snapshot(&self) -> Result<SchemaSnapshot> {
        let mut stmt = self.db.conn.prepare(
            "SELECT type, name, tbl_name, sql FROM sqlite_master
             WHERE name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
             ORDER BY type, name",
        )?;
        let objects = stmt
            .query_map([], |row| {
                Ok(SchemaObject {
                    kind: row.get(0)?,
                    name: row.get(1)?,
                    table: row.get(2)?,
                    sql: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let policies = if table_exists(&self.db.conn, "schema_policies")? {
            PolicyManager::new(&self.db.conn).list_policies(None)?
        } else {
            Vec::new()
        };

        Ok(SchemaSnapshot { objects, policies })
    }

    /// Set a metadata value
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.db.conn.execute_batch(SchemaDefinitions::META_TABLE)?;
        write_meta(&self.db.conn, key, value)
    }

    /// Get a metadata value
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        read_meta(&self.db.conn, key)
    }

    /// Reset the database by dropping every view, trigger and table
    pub fn reset(&self) -> Result<()> {
        let conn = &self.db.conn;
        conn.execute("PRAGMA foreign_keys=OFF", [])?;

        let result = (|| -> Result<()> {
            for kind in ["view", "trigger", "table"] {
                let names: Vec<String> = {
                    let mut stmt = conn.prepare(
                        "SELECT name FROM sqlite_master
                         WHERE type = ?1 AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
                    )?;
                    let rows = stmt.query_map([kind], |row| row.get(0))?;
                    rows.collect::<std::result::Result<Vec<_>, _>>()?
                };
                for name in names {
                    // Dropping a table takes its triggers with it
                    conn.execute(
                        &format!("DROP {} IF EXISTS {}", kind.to_uppercase(), quote_ident(&name)),
                        [],
                    )?;
                }
            }
            Ok(())
        })();

        conn.execute("PRAGMA foreign_keys=ON", [])?;
        result?;
        info!("database schema reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::Principal;

    fn create_test_db() -> DatabaseConn {
        DatabaseConn::open_in_memory().unwrap()
    }

    #[test]
    fn test_schema_not_initialized() {
        let db = create_test_db();
        let manager = SchemaManager::new(&db);

        assert_eq!(
            manager.check_status().unwrap(),
            SchemaStatus::NotInitialized
        );
    }

    #[test]
    fn test_schema_initialize() {
        let db = create_test_db();
        let manager = SchemaManager::new(&db);

        let report = manager.initialize().unwrap();
        assert_eq!(report.schema_version, Some(SCHEMA_VERSION));
        assert_eq!(report.policies, TENANT_TABLES.len() * 4);
        assert_eq!(manager.check_status().unwrap(), SchemaStatus::Current);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let db = create_test_db();
        let manager = SchemaManager::new(&db);

        manager.initialize().unwrap();
        let first = manager.snapshot().unwrap();
        manager.initialize().unwrap();
        manager.initialize().unwrap();
        let again = manager.snapshot().unwrap();

        assert_eq!(first, again);
    }

    #[test]
    fn test_every_tenant_table_has_four_canonical_policies() {
        let db = create_test_db();
        let manager = SchemaManager::new(&db);
        manager.initialize().unwrap();

        let policies = PolicyManager::new(&db.conn);
        for &(table, owner_column) in TENANT_TABLES {
            let records = policies.list_policies(Some(table)).unwrap();
            assert_eq!(records.len(), 4, "table {}", table);
            for command in PolicyCommand::ALL {
                let name = format!("{}_{}_policy", table, command);
                let record = records
                    .iter()
                    .find(|r| r.policy_name == name)
                    .unwrap_or_else(|| panic!("missing {}", name));
                assert_eq!(record.owner_column, owner_column);
                assert_eq!(record.command, command.as_str());
            }
        }

        let report = manager.verify().unwrap();
        assert!(report.is_ok(), "{:?}", report.problems);
        assert_eq!(report.policies_checked, TENANT_TABLES.len() * 4);
    }

    #[test]
    fn test_verify_detects_dropped_policy() {
        let db = create_test_db();
        let manager = SchemaManager::new(&db);
        manager.initialize().unwrap();

        db.execute("DROP TRIGGER user_addresses_delete_policy").unwrap();
        let report = manager.verify().unwrap();
        assert_eq!(
            report.problems,
            vec!["policy user_addresses_delete_policy is catalogued but not installed"]
        );
        assert_eq!(manager.check_status().unwrap(), SchemaStatus::Corrupted);

        // Re-applying repairs it
        manager.initialize().unwrap();
        assert_eq!(manager.check_status().unwrap(), SchemaStatus::Current);
    }

    #[test]
    fn test_status_versions() {
        let db = create_test_db();
        let manager = SchemaManager::new(&db);
        manager.initialize().unwrap();

        manager.set_meta("schema_version", "3").unwrap();
        assert_eq!(
            manager.check_status().unwrap(),
            SchemaStatus::NeedsMigration {
                from: 3,
                to: SCHEMA_VERSION
            }
        );

        manager.set_meta("schema_version", "99").unwrap();
        assert_eq!(
            manager.check_status().unwrap(),
            SchemaStatus::Incompatible {
                database_version: 99,
                required_version: SCHEMA_VERSION
            }
        );
    }

    #[test]
    fn test_meta_operations() {
        let db = create_test_db();
        let manager = SchemaManager::new(&db);

        manager.initialize().unwrap();

        // Set and get a meta value
        manager.set_meta("test_key", "test_value").unwrap();
        let value = manager.get_meta("test_key").unwrap();
        assert_eq!(value, Some("test_value".to_string()));

        // Non-existent key
        let missing = manager.get_meta("nonexistent").unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_schema_reset() {
        let db = create_test_db();
        let manager = SchemaManager::new(&db);

        manager.initialize().unwrap();
        assert_eq!(manager.check_status().unwrap(), SchemaStatus::Current);

        manager.reset().unwrap();
        assert_eq!(
            manager.check_status().unwrap(),
            SchemaStatus::NotInitialized
        );
        assert!(manager.snapshot().unwrap().objects.is_empty());
    }

    #[test]
    fn test_check_constraints() {
        let db = create_test_db();
        SchemaManager::new(&db).initialize().unwrap();

        assert!(db
            .execute("INSERT INTO reviews (business_date, rating) VALUES ('2024-01-08', 6)")
            .is_err());
        assert!(db
            .execute("INSERT INTO reviews (business_date, rating) VALUES ('2024-01-08', 0)")
            .is_err());
        db.execute("INSERT INTO reviews (business_date, rating) VALUES ('2024-01-08', 5)")
            .unwrap();

        db.execute("INSERT INTO users (id, email) VALUES ('u1', 'a@example.com')")
            .unwrap();
        assert!(db
            .execute("INSERT INTO contents (author_id, title, status) VALUES ('u1', 't', 'published')")
            .is_err());
        assert!(db
            .execute("INSERT INTO contents (author_id, title, view_count) VALUES ('u1', 't', -1)")
            .is_err());
        db.execute("INSERT INTO contents (author_id, title, status) VALUES ('u1', 't', 'pending')")
            .unwrap();
    }

    #[test]
    fn test_moderation_results_append_only() {
        let db = create_test_db();
        SchemaManager::new(&db).initialize().unwrap();

        db.execute("INSERT INTO users (id, email) VALUES ('m1', 'mod@example.com')")
            .unwrap();
        db.execute("INSERT INTO contents (id, author_id, title) VALUES ('c1', 'm1', 't')")
            .unwrap();
        db.execute(
            "INSERT INTO moderation_results (content_id, moderator_id, decision)
             VALUES ('c1', 'm1', 'approved')",
        )
        .unwrap();

        assert!(db
            .execute("UPDATE moderation_results SET decision = 'rejected'")
            .is_err());
        assert!(db.execute("DELETE FROM moderation_results").is_err());
        assert_eq!(db.table_count("moderation_results").unwrap(), 1);
    }

    fn object_names(db: &DatabaseConn) -> Vec<(String, String)> {
        SchemaManager::new(db)
            .snapshot()
            .unwrap()
            .objects
            .into_iter()
            .map(|o| (o.kind, o.name))
            .collect()
    }

    #[test]
    fn test_drifted_start_converges_to_same_shape() {
        let fresh = create_test_db();
        SchemaManager::new(&fresh).initialize().unwrap();

        // An older script created the preferences table under a typo,
        // together with an index and timestamp trigger named after it
        let drifted = create_test_db();
        drifted
            .conn
            .execute_batch(SchemaDefinitions::USER_PROFILES.sql)
            .unwrap();
        drifted
            .conn
            .execute_batch(
                &SchemaDefinitions::USER_PREFERENCES
                    .sql
                    .replace("user_preferences", "user_prederences"),
            )
            .unwrap();
        drifted
            .conn
            .execute_batch(
                "CREATE INDEX idx_user_prederences_language ON user_prederences (language);
                 CREATE TRIGGER user_prederences_touch_updated_at AFTER UPDATE ON user_prederences
                 BEGIN
                     UPDATE user_prederences
                     SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                     WHERE rowid = NEW.rowid;
                 END;",
            )
            .unwrap();
        drifted
            .execute("INSERT INTO user_profiles (id) VALUES ('u1'), ('u2')")
            .unwrap();
        drifted
            .execute("INSERT INTO user_prederences (user_id, language) VALUES ('u1', 'en'), ('u2', 'vi')")
            .unwrap();

        let report = SchemaManager::new(&drifted).initialize().unwrap();
        SchemaManager::new(&drifted).initialize().unwrap();

        assert_eq!(report.renames.len(), 1);
        assert_eq!(report.renames[0].from, "user_prederences");
        assert_eq!(drifted.table_count("user_preferences").unwrap(), 2);
        assert_eq!(object_names(&fresh), object_names(&drifted));
    }

    #[test]
    fn test_select_policy_hides_rows_of_other_users() {
        let db = create_test_db();
        SchemaManager::new(&db).initialize().unwrap();
        db.execute("INSERT INTO user_profiles (id, phone) VALUES ('alice', '+84901')")
            .unwrap();

        let _bob = db.as_principal(Principal::user("bob"));
        let seen: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM user_profiles_select_policy", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_tenant_tables_unreadable_outside_policy_view() {
        let db = create_test_db();
        SchemaManager::new(&db).initialize().unwrap();
        db.execute("INSERT INTO user_profiles (id, phone) VALUES ('alice', '+84901'), ('bob', '+84902')")
            .unwrap();
        db.execute("INSERT INTO user_preferences (user_id) VALUES ('alice'), ('bob')")
            .unwrap();

        let bob = db.as_principal(Principal::user("bob"));
        for sql in [
            "SELECT COUNT(*) FROM user_profiles WHERE id = 'alice'",
            "SELECT COUNT(*) FROM user_profiles",
            "SELECT phone FROM user_profiles WHERE id = 'bob'",
            "SELECT language FROM user_preferences WHERE user_id = 'alice'",
        ] {
            let result = db
                .conn
                .query_row(sql, [], |row| row.get::<_, rusqlite::types::Value>(0));
            assert!(result.is_err(), "{} was readable", sql);
        }
        assert!(db
            .execute("CREATE VIEW every_profile AS SELECT * FROM user_profiles")
            .is_err());

        // Own rows stay reachable through the policy view and writable
        let visible: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM user_profiles_select_policy", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(visible, 1);
        let changed = db
            .execute_with_params(
                "UPDATE user_preferences SET language = 'en' WHERE user_id = ?1",
                ["bob"],
            )
            .unwrap();
        assert_eq!(changed, 1);
        drop(bob);

        assert_eq!(db.table_count("user_profiles").unwrap(), 2);
    }

    #[test]
    fn test_apply_refuses_newer_database() {
        let db = create_test_db();
        let manager = SchemaManager::new(&db);
        manager.initialize().unwrap();
        manager.set_meta("schema_version", "999").unwrap();

        for plan in [SchemaPlan::full(), SchemaPlan::drift_fix()] {
            let err = MigrationRunner::new(&db).apply(&plan).unwrap_err();
            assert!(
                matches!(
                    err,
                    SchemaError::Incompatible {
                        database_version: 999,
                        supported_version: SCHEMA_VERSION
                    }
                ),
                "{}",
                err
            );
        }
        assert_eq!(manager.get_meta("schema_version").unwrap().as_deref(), Some("999"));
    }

    #[test]
    fn test_concurrent_initialization_converges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vinow.sqlite3");
        let path = path.to_str().unwrap().to_string();

        let workers: Vec<_> = (0..6)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let db = DatabaseConn::open_path(&path).unwrap();
                    let manager = SchemaManager::new(&db);
                    for _ in 0..50 {
                        match manager.initialize() {
                            Ok(_) => return,
                            Err(e) if e.is_retryable() => {
                                std::thread::sleep(std::time::Duration::from_millis(20))
                            }
                            Err(e) => panic!("initialize failed: {}", e),
                        }
                    }
                    panic!("initialize kept losing the race");
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let db = DatabaseConn::open_path(&path).unwrap();
        let manager = SchemaManager::new(&db);
        assert_eq!(manager.check_status().unwrap(), SchemaStatus::Current);
        assert_eq!(manager.verify().unwrap().problems, Vec::<String>::new());
    }
}
