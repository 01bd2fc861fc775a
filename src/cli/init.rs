//! Init command implementation

use anyhow::Result;
use std::path::Path;

use conductor::config::{Config, ProjectPaths};

/// Create the `.conductor/` directory layout and a default config file.
pub async fn init_command(work_dir: &Path, force: bool) -> Result<()> {
    let paths = ProjectPaths::new(work_dir);
    let config_path = paths.config_file();

    if config_path.exists() && !force {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            config_path.display()
        );
        return Ok(());
    }

    paths.ensure()?;
    Config::default().save(&config_path)?;
    println!("Initialized {}", paths.root().display());
    Ok(())
}
