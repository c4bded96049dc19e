use serde::Serialize;
use std::path::Path;
use tabled::Tabled;
use vinow_schema::database::{LedgerEntry, MigrationRunner, SchemaManager};
use vinow_schema::{OutputFormat, SchemaStatus, VinowConfig, SCHEMA_VERSION};

use super::{open_database, print_json, print_table};

#[derive(Debug, Serialize)]
struct StatusInfo {
    database_path: String,
    exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<SchemaStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema_version: Option<u32>,
    supported_version: u32,
    ledger: Vec<LedgerEntry>,
}

#[derive(Tabled)]
struct LedgerRow {
    #[tabled(rename = "Version")]
    version: u32,
    #[tabled(rename = "Migration")]
    name: String,
    #[tabled(rename = "First Applied")]
    applied_at: String,
    #[tabled(rename = "Last Converged")]
    converged_at: String,
    #[tabled(rename = "Checksum")]
    checksum: String,
}

pub fn run(config: &VinowConfig, output_format: OutputFormat) {
    let path = &config.database_path;
    let exists = Path::new(path).exists();

    let mut info = StatusInfo {
        database_path: path.clone(),
        exists,
        size_bytes: std::fs::metadata(path).ok().map(|m| m.len()),
        status: None,
        schema_version: None,
        supported_version: SCHEMA_VERSION,
        ledger: Vec::new(),
    };

    // Opening would create the file, so a missing database is only reported
    if exists {
        let db = open_database(config);
        let manager = SchemaManager::new(&db);
        match manager.check_status() {
            Ok(status) => info.status = Some(status),
            Err(e) => {
                eprintln!("ERROR: Failed to check schema status: {}", e);
                std::process::exit(1);
            }
        }
        info.schema_version = manager.schema_version().ok().flatten();
        info.ledger = MigrationRunner::new(&db).applied().unwrap_or_default();
    }

    if print_json(&info, output_format) {
        return;
    }

    println!("Database:  {}", info.database_path);
    match info.size_bytes {
        Some(size) => println!("Size:      {} bytes", size),
        None => println!("Size:      not created"),
    }
    match &info.status {
        Some(status) => println!("Schema:    {}", status),
        None => println!("Schema:    not initialized"),
    }
    println!("Supported: v{}", info.supported_version);

    if !info.ledger.is_empty() {
        println!();
        let rows = info
            .ledger
            .into_iter()
            .map(|e| LedgerRow {
                version: e.version,
                name: e.name,
                applied_at: e.applied_at,
                converged_at: e.converged_at,
                checksum: e.checksum.chars().take(12).collect(),
            })
            .collect::<Vec<_>>();
        print_table(rows, output_format);
    }
}
