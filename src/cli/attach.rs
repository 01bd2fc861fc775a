//! Attach command implementation

use anyhow::Result;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use conductor::attach::{AttachOptions, AttachSession, PrefixCommand};

use super::open_controller;

const CLIENT_ID: &str = "cli";

/// Attach the current terminal to an agent's PTY session.
pub async fn attach_command(work_dir: &Path, id: String, force: bool) -> Result<()> {
    let (controller, config) = open_controller(work_dir)?;
    let session = controller.attach(&id, CLIENT_ID, force)?;

    let attach = AttachSession::new(
        session.clone(),
        Box::new(std::io::stdout()),
        AttachOptions {
            prefix_key: config.attach.prefix_key.clone(),
            prefix_timeout_ms: config.attach.prefix_timeout_ms,
        },
    )?;

    let kill_controller = controller.clone();
    let kill_id = id.clone();
    attach.on_command(move |command| match command {
        PrefixCommand::KillAgent => {
            if let Err(err) = kill_controller.kill(&kill_id, false) {
                tracing::error!("Kill from attach failed: {:#}", err);
            }
        }
        PrefixCommand::NextAgent | PrefixCommand::PrevAgent => {
            tracing::debug!("Agent switching is not available from a single-agent attach");
        }
        _ => {}
    });

    println!(
        "Attaching to {} ({} d to detach, {} ? for help)",
        id, config.attach.prefix_key, config.attach.prefix_key
    );
    attach.attach()?;

    // Raw keystrokes flow from stdin into the prefix handler. The thread
    // parks on read() after detach; it dies with the process.
    {
        let attach = attach.clone();
        std::thread::spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if !attach.is_attached() {
                            break;
                        }
                        attach.feed_input(&buf[..n]);
                    }
                }
            }
        });
    }

    // Track the operator's terminal size while attached
    let mut last_size = crossterm::terminal::size().ok();
    while attach.is_attached() && session.is_running() {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(size) = crossterm::terminal::size() {
            if last_size != Some(size) {
                last_size = Some(size);
                attach.handle_resize(size.0, size.1);
            }
        }
    }

    attach.detach();
    controller.detach(&id, Some(CLIENT_ID))?;

    if !session.is_running() {
        println!("\r\nAgent {} exited.", id);
    } else {
        println!("\r\nDetached from {} (still running).", id);
    }
    Ok(())
}
