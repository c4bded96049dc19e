use vinow_schema::bootstrap::{self, CacheProbe};
use vinow_schema::{ConfigError, OutputFormat, SchemaError, VinowConfig};

use super::print_json;

pub fn run(config: &VinowConfig, output_format: OutputFormat) {
    let report = match bootstrap::prepare(config) {
        Ok(report) => report,
        Err(e) => {
            if let Some(config_err) = e.downcast_ref::<ConfigError>() {
                eprintln!("ERROR: {}", config_err);
                eprintln!("Check {} or the VINOW_* environment", config.config_file);
            } else if let Some(schema_err) = e.downcast_ref::<SchemaError>() {
                eprintln!("ERROR: schema preparation failed: {}", schema_err);
            } else {
                eprintln!("ERROR: {}", e);
            }
            std::process::exit(1);
        }
    };

    if print_json(&report, output_format) {
        return;
    }

    match &report.cache {
        CacheProbe::Unreachable { .. } => println!("WARNING: cache {}", report.cache),
        other => println!("Cache:    {}", other),
    }
    println!("Media:    {}", report.media_dirs.join(", "));
    println!(
        "Database: {} ({} migrations, {} policies)",
        report.database_path,
        report.schema.migrations.len(),
        report.schema.policies
    );
    println!();
    println!("Ready. Start the server with:");
    println!("  {}", report.server_command);
}
