use clap::Args;
use vinow_schema::database::{SchemaManager, SchemaPlan};
use vinow_schema::{OutputFormat, VinowConfig};

use super::{open_database, print_json};

/// Arguments for the Verify command
#[derive(Args)]
pub struct VerifyArgs {
    /// Plan whose tables and policies are checked: full or drift-fix
    #[clap(short, long, default_value = "full")]
    pub plan: String,
}

pub fn run(config: &VinowConfig, args: VerifyArgs, output_format: OutputFormat) {
    let Some(plan) = SchemaPlan::by_name(&args.plan) else {
        eprintln!(
            "ERROR: Unknown plan '{}'. Valid plans: full, drift-fix",
            args.plan
        );
        std::process::exit(1);
    };

    let db = open_database(config);
    let report = match SchemaManager::new(&db).verify_plan(&plan) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("ERROR: Verification could not run: {}", e);
            std::process::exit(1);
        }
    };

    if !print_json(&report, output_format) {
        println!(
            "Checked {} tables and {} policies against plan '{}'",
            report.tables_checked, report.policies_checked, plan.name
        );
        for problem in &report.problems {
            println!("  - {}", problem);
        }
        if report.is_ok() {
            println!("OK");
        }
    }

    if !report.is_ok() {
        std::process::exit(1);
    }
}
