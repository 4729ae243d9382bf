//! Configuration view and validation commands: `lectern config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(
    config: &lectern::config::LecternConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    use lectern::config::LecternToml;

    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Lectern Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No lectern.toml found at {}", config_path.display());
                println!("Using defaults. Run 'lectern config init' to create one.");
            }
            println!();

            let toml = &config.toml;
            println!("[pipeline]");
            println!("  lease_timeout_secs = {}", toml.pipeline.lease_timeout_secs);
            println!("  max_plans = {}", toml.pipeline.max_plans);
            println!(
                "  generation_concurrency = {}",
                toml.pipeline.generation_concurrency
            );
            println!("  storage_concurrency = {}", toml.pipeline.storage_concurrency);
            println!("  segment_length_secs = {}", toml.pipeline.segment_length_secs);
            println!();
            println!("[context]");
            println!("  trailing_window_secs = {}", toml.context.trailing_window_secs);
            println!(
                "  recent_question_count = {}",
                toml.context.recent_question_count
            );
            println!();
            println!("[providers]");
            match &toml.providers.analysis_url {
                Some(url) => println!("  analysis_url = \"{}\"", url),
                None => println!("  analysis_url = (unset)"),
            }
            println!(
                "  request_timeout_secs = {}",
                toml.providers.request_timeout_secs
            );
            for (archetype, url) in &toml.providers.generator_urls {
                println!("  generator_urls.{} = \"{}\"", archetype, url);
            }
            println!();
            println!("[logging]");
            println!("  level = \"{}\"", toml.logging.level);
            println!("  json = {}", toml.logging.json);
            println!("  file = {}", toml.logging.file);
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  log_level = \"{}\"", config.log_level());
            println!("  json_logs = {}", config.json_logs());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No lectern.toml found. Using defaults.");
            }
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("lectern.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !config.data_dir.exists() {
                std::fs::create_dir_all(&config.data_dir)?;
            }
            LecternToml::default().save(&config_path)?;

            println!("Created lectern.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [pipeline] lease timeout, plan cap and concurrency");
            println!("  - [providers] analysis_url and generator_urls per archetype");
            println!("  - [logging] level, json and file output");
            println!();
        }
    }

    Ok(())
}
