//! Daily business metrics repository
//!
//! One row per calendar date. Writing the same date again updates that row
//! in place (`ON CONFLICT (metric_date) DO UPDATE`), so history never holds
//! duplicates.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::parse_datetime;
use crate::database::core::SchemaDefinitions;

const METRICS_COLUMNS: &str = "metric_date, customer_count, order_count, revenue, rating, \
     health_score, competitor_count, rating_rank, better_than_peers, morning_revenue, \
     lunch_revenue, afternoon_revenue, evening_revenue, avg_order_value, created_at, updated_at";

/// Revenue split by trading period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueBreakdown {
    pub morning: i64,
    pub lunch: i64,
    pub afternoon: i64,
    pub evening: i64,
}

impl RevenueBreakdown {
    /// Sum of the four periods, saturating at `i64::MAX`
    pub fn total(&self) -> i64 {
        self.morning
            .saturating_add(self.lunch)
            .saturating_add(self.afternoon)
            .saturating_add(self.evening)
    }
}

/// Aggregates for one business date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetrics {
    pub metric_date: NaiveDate,
    pub customer_count: u32,
    pub order_count: u32,
    pub revenue: i64,
    pub rating: Option<f64>,
    pub health_score: Option<u32>,
    pub competitor_count: u32,
    pub rating_rank: Option<u32>,
    pub better_than_peers: Option<u32>,
    pub breakdown: RevenueBreakdown,
}

impl DailyMetrics {
    pub fn new(metric_date: NaiveDate) -> Self {
        Self {
            metric_date,
            customer_count: 0,
            order_count: 0,
            revenue: 0,
            rating: None,
            health_score: None,
            competitor_count: 0,
            rating_rank: None,
            better_than_peers: None,
            breakdown: RevenueBreakdown::default(),
        }
    }

    pub fn avg_order_value(&self) -> f64 {
        if self.order_count == 0 {
            0.0
        } else {
            self.revenue as f64 / self.order_count as f64
        }
    }
}

/// A stored metrics row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    pub metrics: DailyMetrics,
    pub avg_order_value: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How an upsert treats the per-period revenue columns of an existing row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakdownPolicy {
    /// Keep the breakdown written by the first insert for the date
    #[default]
    PreserveExisting,
    /// Replace the breakdown with the new values
    Overwrite,
}

/// Repository for daily business metrics
pub struct BusinessMetricsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> BusinessMetricsRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert the row for `metrics.metric_date`, or update the existing one
    pub fn upsert_daily(
        &self,
        metrics: &DailyMetrics,
        breakdown: BreakdownPolicy,
    ) -> Result<MetricsRecord> {
        let breakdown_updates = match breakdown {
            BreakdownPolicy::PreserveExisting => "",
            BreakdownPolicy::Overwrite => {
                ",
                morning_revenue = excluded.morning_revenue,
                lunch_revenue = excluded.lunch_revenue,
                afternoon_revenue = excluded.afternoon_revenue,
                evening_revenue = excluded.evening_revenue"
            }
        };

        let sql = format!(
            "INSERT INTO business_metrics (
                metric_date, customer_count, order_count, revenue, avg_order_value, rating,
                health_score, competitor_count, rating_rank, better_than_peers,
                morning_revenue, lunch_revenue, afternoon_revenue, evening_revenue
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT (metric_date) DO UPDATE SET
                customer_count = excluded.customer_count,
                order_count = excluded.order_count,
                revenue = excluded.revenue,
                avg_order_value = excluded.avg_order_value,
                rating = excluded.rating,
                health_score = excluded.health_score,
                competitor_count = excluded.competitor_count,
                rating_rank = excluded.rating_rank,
                better_than_peers = excluded.better_than_peers{}",
            breakdown_updates
        );

        let date = metrics.metric_date.format("%Y-%m-%d").to_string();
        self.conn
            .execute(
                &sql,
                params![
                    date,
                    metrics.customer_count,
                    metrics.order_count,
                    metrics.revenue,
                    metrics.avg_order_value(),
                    metrics.rating,
                    metrics.health_score,
                    metrics.competitor_count,
                    metrics.rating_rank,
                    metrics.better_than_peers,
                    metrics.breakdown.morning,
                    metrics.breakdown.lunch,
                    metrics.breakdown.afternoon,
                    metrics.breakdown.evening,
                ],
            )
            .map_err(|e| anyhow!("Failed to upsert metrics for {}: {}", date, e))?;
        debug!("upserted business metrics for {} ({:?})", date, breakdown);

        self.get(metrics.metric_date)?
            .ok_or_else(|| anyhow!("Metrics row for {} vanished after upsert", date))
    }

    pub fn get(&self, date: NaiveDate) -> Result<Option<MetricsRecord>> {
        let query = format!(
            "SELECT {} FROM business_metrics WHERE metric_date = ?1",
            METRICS_COLUMNS
        );
        self.conn
            .query_row(&query, [date.format("%Y-%m-%d").to_string()], Self::row_to_record)
            .optional()
            .map_err(|e| anyhow!("Failed to get metrics for {}: {}", date, e))
    }

    /// Rows with `from <= metric_date <= to`, oldest first
    pub fn range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<MetricsRecord>> {
        let query = format!(
            "SELECT {} FROM business_metrics
             WHERE metric_date BETWEEN ?1 AND ?2 ORDER BY metric_date",
            METRICS_COLUMNS
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            [
                from.format("%Y-%m-%d").to_string(),
                to.format("%Y-%m-%d").to_string(),
            ],
            Self::row_to_record,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("Failed to read metrics range: {}", e))
    }

    pub fn count(&self) -> Result<u64> {
        let count: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM business_metrics", [], |row| row.get(0))
            .map_err(|e| anyhow!("Failed to count metrics: {}", e))?;
        Ok(count)
    }

    /// Ensure a row for today exists and refresh its derived average
    pub fn seed_today(&self) -> Result<()> {
        self.conn
            .execute(SchemaDefinitions::BUSINESS_METRICS_SEED, [])
            .map_err(|e| anyhow!("Failed to seed today's metrics: {}", e))?;
        Ok(())
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MetricsRecord> {
        let date: String = row.get(0)?;
        let metric_date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let created_at: String = row.get(14)?;
        let updated_at: String = row.get(15)?;

        Ok(MetricsRecord {
            metrics: DailyMetrics {
                metric_date,
                customer_count: row.get(1)?,
                order_count: row.get(2)?,
                revenue: row.get(3)?,
                rating: row.get(4)?,
                health_score: row.get(5)?,
                competitor_count: row.get(6)?,
                rating_rank: row.get(7)?,
                better_than_peers: row.get(8)?,
                breakdown: RevenueBreakdown {
                    morning: row.get(9)?,
                    lunch: row.get(10)?,
                    afternoon: row.get(11)?,
                    evening: row.get(12)?,
                },
            },
            avg_order_value: row.get(13)?,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
        })
    }
}
