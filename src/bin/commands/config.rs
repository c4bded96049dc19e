use serde::Serialize;
use std::path::Path;
use vinow_schema::config::mask_secret;
use vinow_schema::{OutputFormat, ServerMode, VinowConfig};

#[derive(Debug, Serialize)]
struct ConfigInfo<'a> {
    #[serde(flatten)]
    config: &'a VinowConfig,
    secret_key: Option<String>,
    service_key: Option<String>,
    database_exists: bool,
    server_mode: ServerMode,
    server_command: String,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    problem: Option<String>,
}

pub fn run(config: &VinowConfig, output_format: OutputFormat) {
    let validation = config.validate();

    let info = ConfigInfo {
        config,
        secret_key: config.secret_key.as_deref().map(mask_secret),
        service_key: config.service_key.as_deref().map(mask_secret),
        database_exists: Path::new(&config.database_path).exists(),
        server_mode: config.server_mode(),
        server_command: config.server_command(),
        valid: validation.is_ok(),
        problem: validation.as_ref().err().map(|e| e.to_string()),
    };

    match output_format.render_json(&info) {
        Some(Ok(json)) => println!("{}", json),
        Some(Err(e)) => eprintln!("Error serializing config info: {}", e),
        None => {
            println!("Vinow Configuration");
            println!("===================\n");
            println!("{}", config.summary());
            println!();
            match &info.problem {
                None => println!("Validation:         ok"),
                Some(problem) => println!("Validation:         {}", problem),
            }
        }
    }
}
