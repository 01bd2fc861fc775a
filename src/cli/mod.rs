//! CLI command implementations

pub mod agent;
pub mod attach;
pub mod init;
pub mod status;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use conductor::agent::{AdapterRegistry, AgentController};
use conductor::config::{Config, ProjectPaths};

/// Load the project config and construct the orchestrator (running
/// recovery in the process).
pub fn open_controller(work_dir: &Path) -> Result<(Arc<AgentController>, Config)> {
    let paths = ProjectPaths::new(work_dir);
    let config = Config::load(&paths.config_file())?;
    let controller = AgentController::new(
        paths.state_file(),
        paths.logs_dir(),
        AdapterRegistry::with_defaults(),
        config.controller_options(),
    )?;
    Ok((controller, config))
}
