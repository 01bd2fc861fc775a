//! End-to-end orchestrator tests against real PTY-backed shell processes.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use conductor::agent::{
    AdapterRegistry, AgentController, CommandAdapter, ControllerOptions,
};
use conductor::{AgentEventKind, AgentStatus, SpawnOptions};

fn shell_adapter(name: &str, script: &str) -> Arc<CommandAdapter> {
    Arc::new(
        CommandAdapter::new(
            name,
            "/bin/sh",
            vec!["-c".to_string(), script.to_string()],
        )
        .without_prompt(),
    )
}

fn registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(shell_adapter("sleeper", "sleep 30"));
    registry.register(shell_adapter("echo", "echo ok"));
    registry.register(shell_adapter("instant", "exit 0"));
    registry.register(shell_adapter("failing", "exit 3"));
    registry.register(shell_adapter(
        "asker",
        "printf 'Continue? (y/n) '; read line; echo answered:$line",
    ));
    registry
}

fn controller_with_cap(dir: &TempDir, cap: usize) -> Arc<AgentController> {
    let options = ControllerOptions {
        max_concurrent: cap,
        default_tool: "sleeper".to_string(),
        detector_debounce_ms: 30,
        ..Default::default()
    };
    AgentController::new(
        dir.path().join("state").join("agents.json"),
        dir.path().join("logs"),
        registry(),
        options,
    )
    .unwrap()
}

fn spawn_tool(controller: &Arc<AgentController>, tool: &str) -> String {
    let mut options = SpawnOptions::with_prompt("task");
    options.tool = Some(tool.to_string());
    controller.spawn(options).unwrap().id
}

fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for {}", what);
}

fn paths(dir: &TempDir) -> (PathBuf, PathBuf) {
    (
        dir.path().join("state").join("agents.json"),
        dir.path().join("logs"),
    )
}

#[test]
fn admission_queues_beyond_cap_and_drains_on_terminal() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);

    let first = spawn_tool(&controller, "sleeper");
    let second = spawn_tool(&controller, "sleeper");
    let third = spawn_tool(&controller, "sleeper");

    assert!(controller.get_status(&first).unwrap().is_running());
    assert!(controller.get_status(&second).unwrap().is_running());
    assert_eq!(
        controller.get_status(&third).unwrap(),
        AgentStatus::Pending
    );

    // Freeing a slot starts the queued agent in the same reconciliation pass
    controller.kill(&first, true).unwrap();
    wait_for(
        || controller.get_status(&first).unwrap().is_terminal(),
        "killed agent to finalize",
    );
    wait_for(
        || controller.get_status(&third).unwrap().is_running(),
        "queued agent to start",
    );

    controller.kill(&second, true).unwrap();
    controller.kill(&third, true).unwrap();
}

#[test]
fn killed_queued_agent_is_not_resurrected_by_the_drain() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 1);

    let runner = spawn_tool(&controller, "sleeper");
    let queued = spawn_tool(&controller, "sleeper");
    assert_eq!(controller.get_status(&queued).unwrap(), AgentStatus::Pending);

    controller.kill(&queued, false).unwrap();
    assert_eq!(controller.get_status(&queued).unwrap(), AgentStatus::Failed);

    // The freed slot must not restart the killed agent or touch its record
    controller.kill(&runner, true).unwrap();
    wait_for(
        || controller.get_status(&runner).unwrap().is_terminal(),
        "runner to finalize",
    );
    std::thread::sleep(Duration::from_millis(200));

    let info = controller.get_info(&queued).unwrap();
    assert_eq!(info.status, AgentStatus::Failed);
    assert!(info.error.as_deref().unwrap().contains("Killed by operator"));
    assert!(info.pid.is_none());
}

#[test]
fn concurrent_spawns_never_exceed_the_cap() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let controller = controller.clone();
            std::thread::spawn(move || spawn_tool(&controller, "sleeper"))
        })
        .collect();
    let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let running = ids
        .iter()
        .filter(|id| controller.get_status(id).unwrap().is_running())
        .count();
    let pending = ids
        .iter()
        .filter(|id| controller.get_status(id).unwrap() == AgentStatus::Pending)
        .count();
    assert_eq!(running, 2);
    assert_eq!(pending, 4);

    for id in &ids {
        controller.kill(id, true).unwrap();
    }
}

#[test]
fn successful_agent_finishes_with_metrics() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);
    let id = spawn_tool(&controller, "echo");

    wait_for(
        || controller.get_status(&id).unwrap() == AgentStatus::Finished,
        "agent to finish",
    );

    let info = controller.get_info(&id).unwrap();
    assert_eq!(info.exit_code, Some(0));
    assert!(info.finished_at.is_some());
    assert!(info.metrics.duration_ms.is_some());
    assert!(info.error.is_none());
    assert!(info.pid.is_some());

    // Output was captured into the append-only log
    let output = controller.get_output(&id, 10).unwrap();
    assert!(output.iter().any(|l| l.contains("ok")));
}

#[test]
fn instantly_exiting_agent_still_finalizes_and_frees_its_slot() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 1);

    // The process can be gone before the exit wiring lands; the agent
    // must still reach a terminal state and hand its slot to the queue
    let first = spawn_tool(&controller, "instant");
    let second = spawn_tool(&controller, "instant");
    for id in [&first, &second] {
        wait_for(
            || controller.get_status(id).unwrap() == AgentStatus::Finished,
            "fast-exit agent to finalize",
        );
    }
}

#[test]
fn failing_agent_records_exit_code() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);
    let id = spawn_tool(&controller, "failing");

    wait_for(
        || controller.get_status(&id).unwrap() == AgentStatus::Failed,
        "agent to fail",
    );

    let info = controller.get_info(&id).unwrap();
    assert_eq!(info.exit_code, Some(3));
    assert!(info.error.as_deref().unwrap().contains("3"));
}

#[test]
fn unknown_tool_fails_the_agent() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);

    let mut options = SpawnOptions::with_prompt("task");
    options.tool = Some("missing-tool".to_string());
    let result = controller.spawn(options);
    assert!(result.is_err());

    // The record still exists and is failed with the error recorded
    let records = controller.list_all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, AgentStatus::Failed);
    assert!(records[0].error.as_deref().unwrap().contains("missing-tool"));
}

#[test]
fn detector_drives_waiting_input_and_send_input_resumes() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);
    let id = spawn_tool(&controller, "asker");

    wait_for(
        || controller.get_status(&id).unwrap() == AgentStatus::WaitingInput,
        "detector to flag waiting_input",
    );

    controller.send_input(&id, "y\r").unwrap();
    wait_for(
        || controller.get_status(&id).unwrap() == AgentStatus::Finished,
        "agent to finish after input",
    );

    let output = controller.get_output(&id, 20).unwrap();
    assert!(
        output.iter().any(|l| l.contains("answered:y")),
        "output was: {:?}",
        output
    );
}

#[test]
fn send_input_rejected_unless_waiting() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);
    let id = spawn_tool(&controller, "sleeper");

    let err = controller.send_input(&id, "hello\r").unwrap_err();
    assert!(err.to_string().contains("not waiting"));

    controller.kill(&id, true).unwrap();
}

#[test]
fn kill_is_a_noop_on_terminal_agents() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);
    let id = spawn_tool(&controller, "echo");

    wait_for(
        || controller.get_status(&id).unwrap().is_terminal(),
        "agent to finish",
    );
    controller.kill(&id, false).unwrap();
    assert_eq!(controller.get_status(&id).unwrap(), AgentStatus::Finished);
}

#[test]
fn exclusive_attach_arbitration() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);
    let id = spawn_tool(&controller, "sleeper");

    controller.attach(&id, "alice", false).unwrap();
    assert!(controller.is_attached(&id).unwrap());

    // Second client is refused without force
    let err = controller.attach(&id, "bob", false).unwrap_err();
    assert!(err.to_string().contains("already attached"));

    // Force displaces the prior client
    controller.attach(&id, "bob", true).unwrap();

    // Mismatched detach is ignored, matching detach clears
    controller.detach(&id, Some("alice")).unwrap();
    assert!(controller.is_attached(&id).unwrap());
    controller.detach(&id, Some("bob")).unwrap();
    assert!(!controller.is_attached(&id).unwrap());

    // Forced clear with no client id
    controller.attach(&id, "carol", false).unwrap();
    controller.detach(&id, None).unwrap();
    assert!(!controller.is_attached(&id).unwrap());

    controller.kill(&id, true).unwrap();
}

#[test]
fn event_stream_reports_lifecycle() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    controller.on_event(move |event| {
        if let AgentEventKind::StatusChange { from, to } = &event.kind {
            sink.lock().unwrap().push((*from, *to));
        }
    });

    let id = spawn_tool(&controller, "echo");
    wait_for(
        || controller.get_status(&id).unwrap() == AgentStatus::Finished,
        "agent to finish",
    );

    let transitions = seen.lock().unwrap().clone();
    assert_eq!(
        transitions,
        vec![
            (AgentStatus::Pending, AgentStatus::Starting),
            (AgentStatus::Starting, AgentStatus::Running),
            (AgentStatus::Running, AgentStatus::Finished),
        ]
    );
}

#[test]
fn state_survives_controller_restart() {
    let dir = TempDir::new().unwrap();
    let id = {
        let controller = controller_with_cap(&dir, 2);
        let id = spawn_tool(&controller, "echo");
        wait_for(
            || controller.get_status(&id).unwrap() == AgentStatus::Finished,
            "agent to finish",
        );
        controller.set_workspace_info(&id, "ws-1", "agent/task").unwrap();
        id
    };

    let (state_file, logs_dir) = paths(&dir);
    let reopened = AgentController::new(
        state_file,
        logs_dir,
        registry(),
        ControllerOptions {
            default_tool: "sleeper".to_string(),
            ..Default::default()
        },
    )
    .unwrap();

    let info = reopened.get_info(&id).unwrap();
    assert_eq!(info.status, AgentStatus::Finished);
    assert_eq!(info.exit_code, Some(0));
    assert_eq!(info.workspace_id, "ws-1");
    assert_eq!(info.branch, "agent/task");
}

#[test]
fn archive_hides_agents_from_listing() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);
    let id = spawn_tool(&controller, "echo");

    wait_for(
        || controller.get_status(&id).unwrap().is_terminal(),
        "agent to finish",
    );

    assert_eq!(controller.list_all().len(), 1);
    controller.archive(&id).unwrap();
    assert!(controller.list_all().is_empty());

    // The record itself is retained
    assert!(controller.get_info(&id).unwrap().archived);
}

#[test]
fn archive_refuses_running_agents() {
    let dir = TempDir::new().unwrap();
    let controller = controller_with_cap(&dir, 2);
    let id = spawn_tool(&controller, "sleeper");

    // Logged no-op: agent stays visible and unarchived
    controller.archive(&id).unwrap();
    assert!(!controller.get_info(&id).unwrap().archived);

    controller.kill(&id, true).unwrap();
}
