use clap::Args;
use serde::Serialize;
use tabled::Tabled;
use vinow_schema::database::{MigrationRunner, PendingReason, SchemaPlan};
use vinow_schema::{OutputFormat, SchemaError, VinowConfig};

use super::{open_database, print_json, print_table};

/// Arguments for the Apply command
#[derive(Args)]
pub struct ApplyArgs {
    /// Plan to apply: full or drift-fix
    #[clap(short, long, default_value = "full")]
    pub plan: String,

    /// Only list migrations that are new or changed since the last run
    #[clap(long)]
    pub dry_run: bool,
}

#[derive(Tabled, Serialize)]
struct MigrationRow {
    #[tabled(rename = "Version")]
    version: u32,
    #[tabled(rename = "Migration")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
}

pub fn run(config: &VinowConfig, args: ApplyArgs, output_format: OutputFormat) {
    let ApplyArgs { plan, dry_run } = args;

    let Some(plan) = SchemaPlan::by_name(&plan) else {
        eprintln!("ERROR: Unknown plan '{}'. Valid plans: full, drift-fix", plan);
        std::process::exit(1);
    };

    let db = open_database(config);
    let runner = MigrationRunner::new(&db);

    if dry_run {
        let pending = match runner.pending(&plan) {
            Ok(pending) => pending,
            Err(e) => {
                eprintln!("ERROR: Failed to read migration ledger: {}", e);
                std::process::exit(1);
            }
        };
        if print_json(&pending, output_format) {
            return;
        }
        if pending.is_empty() {
            println!("Plan '{}' has nothing new to apply", plan.name);
            return;
        }
        let rows = pending
            .into_iter()
            .map(|p| MigrationRow {
                version: p.version,
                name: p.name,
                state: match p.reason {
                    PendingReason::NeverApplied => "never applied".to_string(),
                    PendingReason::ChecksumChanged => "changed".to_string(),
                },
            })
            .collect::<Vec<_>>();
        print_table(rows, output_format);
        return;
    }

    match runner.apply(&plan) {
        Ok(report) => {
            if print_json(&report, output_format) {
                return;
            }
            for rename in &report.renames {
                println!("Renamed table {} -> {}", rename.from, rename.to);
            }
            let rows = plan
                .migrations
                .iter()
                .map(|m| MigrationRow {
                    version: m.version,
                    name: m.name.to_string(),
                    state: "converged".to_string(),
                })
                .collect::<Vec<_>>();
            print_table(rows, output_format);
            println!(
                "Plan '{}' applied: {} policies in place{}",
                report.plan,
                report.policies,
                report
                    .schema_version
                    .map(|v| format!(", schema v{}", v))
                    .unwrap_or_default()
            );
        }
        Err(e) => {
            report_failure(&e);
            std::process::exit(1);
        }
    }
}

fn report_failure(e: &SchemaError) {
    eprintln!("ERROR: {}", e);
    if let Some(table) = e.missing_table() {
        eprintln!(
            "Table '{}' must exist before this plan can run; apply the full plan first",
            table
        );
    } else if let SchemaError::Incompatible { .. } = e {
        eprintln!("Upgrade vinow-schema before applying plans to this database");
    } else if e.is_retryable() {
        eprintln!("The failure looks transient; every step is idempotent, so re-run the command");
    }
}
