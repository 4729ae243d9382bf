//! Project initialization command.

use anyhow::{Context, Result};

use lectern::config::{LecternConfig, LecternToml};
use lectern::store::DbHandle;

pub async fn cmd_init(config: &LecternConfig) -> Result<()> {
    let was_initialized = config.is_initialized();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    let config_file = config.config_file();
    if !config_file.exists() {
        LecternToml::default().save(&config_file)?;
    }
    // Opening runs the migrations.
    DbHandle::open(&config.db_path())?;

    if was_initialized {
        println!(
            "Lectern project already initialized at {}",
            config.data_dir.display()
        );
        println!("Database schema verified.");
        return Ok(());
    }

    println!("Initialized lectern project at {}", config.data_dir.display());
    println!();
    println!("Created:");
    println!("  .lectern/");
    println!("  ├── lectern.toml   # Pipeline, provider and logging settings");
    println!("  └── lectern.db     # Courses, segments, plans and dispatch queue");
    println!();
    println!("Next steps:");
    println!("  1. Set [providers] analysis_url and generator_urls in lectern.toml");
    println!("  2. Run `lectern ingest --title ... --video-ref ... --duration ...`");
    println!("  3. Run `lectern run <course-id>`");
    Ok(())
}
