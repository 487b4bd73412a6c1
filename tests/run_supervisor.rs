//! Run supervisor against real child processes (shell scripts stand in for
//! the runtime and the interpreter).
#![cfg(unix)]

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tspmo_core::supervisor::FailureReason;
use tspmo_core::{OutputChannel, RunRequest, RunState, RunSupervisor};

use common::{run_config, write_script};

const DEADLINE: Duration = Duration::from_secs(10);

async fn run_script(dir: &Path, interpreter: &str) -> (RunState, Arc<OutputChannel>) {
    let supervisor = RunSupervisor::new(&run_config(dir));
    let interp = write_script(dir, "interp.sh", interpreter);
    let file = dir.join("main.pmo");
    std::fs::write(&file, "ts yap legit \"hi\" pmo\n").unwrap();

    let sink = Arc::new(OutputChannel::new("TSPMO Run"));
    let handle = supervisor.run(RunRequest::new(interp, file), sink.clone());
    let state = tokio::time::timeout(DEADLINE, handle.wait())
        .await
        .expect("run did not finish");
    (state, sink)
}

#[tokio::test]
async fn test_stdout_in_order_then_exit_line() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, sink) = run_script(
        tmp.path(),
        "i=1\nwhile [ $i -le 200 ]; do echo \"line $i\"; i=$((i+1)); done\n",
    )
    .await;

    assert_eq!(state, RunState::Exited(0));
    let lines = sink.lines();
    assert_eq!(lines.len(), 201);
    for (i, line) in lines[..200].iter().enumerate() {
        assert_eq!(line, &format!("line {}", i + 1));
    }
    assert_eq!(lines[200], "Process exited with code 0");
}

#[tokio::test]
async fn test_interpreter_receives_target_file() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, sink) = run_script(tmp.path(), "cat \"$1\"\n").await;

    assert_eq!(state, RunState::Exited(0));
    assert_eq!(
        sink.contents(),
        "ts yap legit \"hi\" pmo\nProcess exited with code 0\n"
    );
}

#[tokio::test]
async fn test_working_directory_is_file_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let (_, sink) = run_script(tmp.path(), "pwd -P\n").await;

    let expected = tmp.path().canonicalize().unwrap();
    assert_eq!(sink.lines()[0], expected.display().to_string());
}

#[tokio::test]
async fn test_nonzero_exit_and_stderr() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, sink) = run_script(tmp.path(), "echo 'Ts is not valid pmo' >&2\nexit 3\n").await;

    assert_eq!(state, RunState::Exited(3));
    assert_eq!(
        sink.lines(),
        vec!["Ts is not valid pmo".to_string(), "Process exited with code 3".to_string()]
    );
}

#[tokio::test]
async fn test_exit_line_starts_on_its_own_line() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, sink) = run_script(tmp.path(), "printf 'no newline'\n").await;

    assert_eq!(state, RunState::Exited(0));
    assert_eq!(sink.contents(), "no newline\nProcess exited with code 0\n");
}

#[tokio::test]
async fn test_silent_run_has_only_exit_line() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, sink) = run_script(tmp.path(), "exit 0\n").await;

    assert_eq!(state, RunState::Exited(0));
    assert_eq!(sink.contents(), "Process exited with code 0\n");
}

#[tokio::test]
async fn test_signal_death_maps_to_128_plus_signal() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, sink) = run_script(tmp.path(), "kill -9 $$\n").await;

    assert_eq!(state, RunState::Exited(137));
    assert!(sink.contents().ends_with("Process exited with code 137\n"));
}

#[tokio::test]
async fn test_missing_runtime_reports_spawn_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = run_config(tmp.path()).with_runtime("/nonexistent/python3");
    let supervisor = RunSupervisor::new(&cfg);
    let sink = Arc::new(OutputChannel::new("TSPMO Run"));

    let handle = supervisor.run(
        RunRequest::new(tmp.path().join("interp.sh"), tmp.path().join("main.pmo")),
        sink.clone(),
    );

    match handle.wait().await {
        RunState::Failed(FailureReason::Spawn(_)) => {}
        other => panic!("expected spawn failure, got {:?}", other),
    }
    let out = sink.contents();
    assert!(out.starts_with("Failed to start '/nonexistent/python3'"));
    assert!(!out.contains("Process exited"));
}

#[tokio::test]
async fn test_cancel_terminates_without_exit_line() {
    let tmp = tempfile::tempdir().unwrap();
    let supervisor = RunSupervisor::new(&run_config(tmp.path()));
    let interp = write_script(tmp.path(), "interp.sh", "echo started\nexec sleep 30\n");
    let sink = Arc::new(OutputChannel::new("TSPMO Run"));

    let handle = supervisor.run(RunRequest::new(interp, tmp.path().join("main.pmo")), sink.clone());
    assert!(handle.pid().is_some());
    assert_eq!(supervisor.active_runs(), 1);

    // let the child get going before pulling the plug
    let mut updates = sink.subscribe();
    if sink.contents().is_empty() {
        let _ = tokio::time::timeout(DEADLINE, updates.recv()).await;
    }

    assert!(supervisor.cancel(&handle));
    let state = tokio::time::timeout(DEADLINE, handle.wait())
        .await
        .expect("cancelled run did not finish");

    assert_eq!(state, RunState::Failed(FailureReason::Cancelled));
    assert_eq!(sink.contents(), "started\n");
    assert_eq!(supervisor.active_runs(), 0);
    assert!(!handle.cancel());
}

#[tokio::test]
async fn test_cancel_all_stops_concurrent_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let supervisor = RunSupervisor::new(&run_config(tmp.path()));
    let interp = write_script(tmp.path(), "interp.sh", "exec sleep 30\n");

    let handles: Vec<_> = (0..3)
        .map(|i| {
            supervisor.run(
                RunRequest::new(&interp, tmp.path().join(format!("f{}.pmo", i))),
                Arc::new(OutputChannel::new("TSPMO Run")),
            )
        })
        .collect();
    assert_eq!(supervisor.active_runs(), 3);

    assert_eq!(supervisor.cancel_all(), 3);
    for handle in &handles {
        let state = tokio::time::timeout(DEADLINE, handle.wait()).await.unwrap();
        assert_eq!(state, RunState::Failed(FailureReason::Cancelled));
    }
    assert_eq!(supervisor.active_runs(), 0);
}

#[tokio::test]
async fn test_cancel_after_exit_keeps_exit_state() {
    let tmp = tempfile::tempdir().unwrap();
    let supervisor = RunSupervisor::new(&run_config(tmp.path()));
    let interp = write_script(tmp.path(), "interp.sh", "echo done\n");
    let sink = Arc::new(OutputChannel::new("TSPMO Run"));

    let handle = supervisor.run(RunRequest::new(interp, tmp.path().join("main.pmo")), sink.clone());
    let state = tokio::time::timeout(DEADLINE, handle.wait()).await.unwrap();
    assert_eq!(state, RunState::Exited(0));

    assert!(!handle.cancel());
    assert!(!supervisor.cancel(&handle));
    assert_eq!(handle.wait().await, RunState::Exited(0));
    assert_eq!(sink.contents(), "done\nProcess exited with code 0\n");
}
