//! Agent lifecycle commands: spawn, logs, kill, send, archive, cleanup

use anyhow::Result;
use std::path::{Path, PathBuf};

use conductor::SpawnOptions;

use super::open_controller;

/// Spawn a new agent with the given prompt.
pub async fn spawn_command(
    work_dir: &Path,
    prompt: String,
    name: Option<String>,
    tool: Option<String>,
    dir: Option<PathBuf>,
) -> Result<()> {
    let (controller, _config) = open_controller(work_dir)?;

    let mut options = SpawnOptions::with_prompt(prompt);
    options.name = name;
    options.tool = tool;
    options.working_dir = Some(dir.unwrap_or_else(|| work_dir.to_path_buf()));

    let record = controller.spawn(options)?;
    println!("Spawned {} [{}]", record.id, record.status);
    if record.status == conductor::AgentStatus::Pending {
        println!("Queued behind the concurrency cap; it will start automatically.");
    }
    Ok(())
}

/// Print the last `lines` of an agent's output log.
pub async fn logs_command(work_dir: &Path, id: String, lines: usize) -> Result<()> {
    let (controller, _config) = open_controller(work_dir)?;
    let output = controller.get_output(&id, lines)?;
    if output.is_empty() {
        println!("No output recorded for {}", id);
        return Ok(());
    }
    for line in output {
        println!("{}", line);
    }
    Ok(())
}

/// Request agent termination.
pub async fn kill_command(work_dir: &Path, id: String, force: bool) -> Result<()> {
    let (controller, _config) = open_controller(work_dir)?;
    controller.kill(&id, force)?;
    println!("Kill signal sent to {}", id);
    Ok(())
}

/// Send input text to an agent waiting for it.
pub async fn send_command(work_dir: &Path, id: String, text: String) -> Result<()> {
    let (controller, _config) = open_controller(work_dir)?;
    controller.send_input(&id, &format!("{}\r", text))?;
    println!("Input sent to {}", id);
    Ok(())
}

/// Archive a terminal agent.
pub async fn archive_command(work_dir: &Path, id: String) -> Result<()> {
    let (controller, _config) = open_controller(work_dir)?;
    controller.archive(&id)?;
    println!("Archived {}", id);
    Ok(())
}

/// Remove expired terminal agents and their logs.
pub async fn cleanup_command(work_dir: &Path) -> Result<()> {
    let (controller, _config) = open_controller(work_dir)?;
    let removed = controller.cleanup()?;
    if removed.is_empty() {
        println!("Nothing to clean up.");
    } else {
        println!("Removed {} agent(s):", removed.len());
        for id in removed {
            println!("  {}", id);
        }
    }
    Ok(())
}
