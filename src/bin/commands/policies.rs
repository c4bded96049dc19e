use clap::Args;
use tabled::Tabled;
use vinow_schema::database::{PolicyManager, PolicyRecord};
use vinow_schema::{OutputFormat, VinowConfig};

use super::{open_database, print_json, print_table};

/// Arguments for the Policies command
#[derive(Args)]
pub struct PoliciesArgs {
    /// Only list policies of this table
    #[clap(short, long)]
    pub table: Option<String>,
}

#[derive(Tabled)]
struct PolicyRow {
    #[tabled(rename = "Table")]
    table: String,
    #[tabled(rename = "Policy")]
    name: String,
    #[tabled(rename = "Command")]
    command: String,
    #[tabled(rename = "Check")]
    predicate: String,
    #[tabled(rename = "Installed As")]
    installed: String,
}

pub fn run(config: &VinowConfig, args: PoliciesArgs, output_format: OutputFormat) {
    let db = open_database(config);
    let manager = PolicyManager::new(&db.conn);

    let records: Vec<PolicyRecord> = match manager
        .ensure_catalog()
        .and_then(|_| manager.list_policies(args.table.as_deref()))
    {
        Ok(records) => records,
        Err(e) => {
            eprintln!("ERROR: Failed to list policies: {}", e);
            std::process::exit(1);
        }
    };

    if print_json(&records, output_format) {
        return;
    }
    if records.is_empty() {
        println!("No policies found");
        return;
    }

    let rows = records
        .into_iter()
        .map(|r| PolicyRow {
            installed: manager
                .engine_object_kind(&r.table_name, &r.policy_name)
                .ok()
                .flatten()
                .unwrap_or_else(|| "MISSING".to_string()),
            table: r.table_name,
            name: r.policy_name,
            command: r.command,
            predicate: r.predicate,
        })
        .collect::<Vec<_>>();
    print_table(rows, output_format);
}
