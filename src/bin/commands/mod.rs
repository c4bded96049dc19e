pub mod apply;
pub mod config;
pub mod policies;
pub mod prepare;
pub mod status;
pub mod verify;

use serde::Serialize;
use std::path::Path;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use vinow_schema::database::DatabaseConn;
use vinow_schema::{OutputFormat, VinowConfig};

/// Open the configured database file, creating its directory when needed
pub(crate) fn open_database(config: &VinowConfig) -> DatabaseConn {
    if let Some(parent) = Path::new(&config.database_path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!(
                "ERROR: Failed to create database directory '{}': {}",
                parent.display(),
                e
            );
            std::process::exit(1);
        }
    }
    match DatabaseConn::open_path(&config.database_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    }
}

/// Print `value` as JSON; returns false for the table formats
pub(crate) fn print_json<T: Serialize>(value: &T, output_format: OutputFormat) -> bool {
    match output_format.render_json(value) {
        Some(Ok(json)) => {
            println!("{}", json);
            true
        }
        Some(Err(e)) => {
            eprintln!("Error serializing output: {}", e);
            true
        }
        None => false,
    }
}

/// Print rows as a rounded or markdown table
pub(crate) fn print_table<T: Tabled>(rows: Vec<T>, output_format: OutputFormat) {
    let mut table = Table::new(rows);
    match output_format {
        OutputFormat::Markdown => table.with(Style::markdown()),
        _ => table.with(Style::rounded()),
    };
    println!("{}", table);
}
