use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Orchestrate interactive AI coding agents in PTYs")]
#[command(version)]
struct Cli {
    /// Path to the project root (defaults to current directory)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a .conductor/ project directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Spawn a new agent with a task prompt
    Spawn {
        /// The task prompt
        prompt: String,

        /// Friendly name for the agent
        #[arg(long)]
        name: Option<String>,

        /// Tool adapter to use (defaults to the configured default)
        #[arg(long)]
        tool: Option<String>,

        /// Working directory for the agent process
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Show the status of all agents
    Status {
        /// Show only agents with this status
        #[arg(long)]
        filter: Option<String>,
    },

    /// Print an agent's output log
    Logs {
        /// Agent id
        id: String,

        /// Number of lines from the end
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },

    /// Attach this terminal to an agent's session
    Attach {
        /// Agent id
        id: String,

        /// Displace an existing attached client
        #[arg(long)]
        force: bool,
    },

    /// Terminate an agent
    Kill {
        /// Agent id
        id: String,

        /// Send SIGKILL instead of SIGTERM
        #[arg(long)]
        force: bool,
    },

    /// Send input text to an agent waiting for it
    Send {
        /// Agent id
        id: String,

        /// The text to send
        text: String,
    },

    /// Archive a finished or failed agent
    Archive {
        /// Agent id
        id: String,
    },

    /// Remove expired terminal agents and their logs
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let work_dir = cli.path.unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Init { force } => {
            cli::init::init_command(&work_dir, force).await?;
        }
        Commands::Spawn {
            prompt,
            name,
            tool,
            dir,
        } => {
            cli::agent::spawn_command(&work_dir, prompt, name, tool, dir).await?;
        }
        Commands::Status { filter } => {
            cli::status::status_command(&work_dir, filter).await?;
        }
        Commands::Logs { id, lines } => {
            cli::agent::logs_command(&work_dir, id, lines).await?;
        }
        Commands::Attach { id, force } => {
            cli::attach::attach_command(&work_dir, id, force).await?;
        }
        Commands::Kill { id, force } => {
            cli::agent::kill_command(&work_dir, id, force).await?;
        }
        Commands::Send { id, text } => {
            cli::agent::send_command(&work_dir, id, text).await?;
        }
        Commands::Archive { id } => {
            cli::agent::archive_command(&work_dir, id).await?;
        }
        Commands::Cleanup => {
            cli::agent::cleanup_command(&work_dir).await?;
        }
    }

    Ok(())
}
