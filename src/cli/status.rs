//! Status command implementation

use anyhow::Result;
use std::path::Path;

use conductor::AgentStatus;

use super::open_controller;

/// Show the status of all agents
pub async fn status_command(work_dir: &Path, filter: Option<String>) -> Result<()> {
    let (controller, _config) = open_controller(work_dir)?;
    let agents = controller.list_all();

    let filtered: Vec<_> = if let Some(status_filter) = filter {
        let target = match status_filter.to_lowercase().as_str() {
            "pending" => AgentStatus::Pending,
            "starting" => AgentStatus::Starting,
            "running" => AgentStatus::Running,
            "waiting_input" | "waiting" => AgentStatus::WaitingInput,
            "finished" => AgentStatus::Finished,
            "failed" => AgentStatus::Failed,
            _ => {
                eprintln!("Unknown status: {}", status_filter);
                return Ok(());
            }
        };
        agents.into_iter().filter(|a| a.status == target).collect()
    } else {
        agents
    };

    if filtered.is_empty() {
        println!("No agents found.");
        return Ok(());
    }

    println!("Agents ({}):\n", filtered.len());
    for agent in filtered {
        let name = agent.name.as_deref().unwrap_or("-");
        println!(
            "  {} {} [{}] {}",
            agent.status.icon(),
            agent.id,
            agent.status,
            name
        );
        println!("    {}", truncate(&agent.prompt, 80));
        if let Some(pid) = agent.pid {
            println!("    pid: {}", pid);
        }
        if agent.metrics.tool_calls > 0 {
            println!(
                "    tools: {} calls, {} file(s) modified",
                agent.metrics.tool_calls,
                agent.metrics.files_modified.len()
            );
        }
        if let Some(duration) = agent.metrics.duration_ms {
            println!("    duration: {:.1}s", duration as f64 / 1000.0);
        }
        if let Some(err) = &agent.error {
            println!("    Error: {}", err);
        }
        println!();
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}…", cut)
    }
}
