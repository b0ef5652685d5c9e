//! Operator lifecycle integration tests.
//!
//! Drive real child processes through start, stop, crash and reconfigure.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use warden::core::Collaborators;
use warden::domain::ProgramConfig;

use common::*;

fn config_blob(value: serde_json::Value) -> ProgramConfig {
    value.as_object().unwrap().clone()
}

#[tokio::test]
async fn test_short_program_exits_and_is_forgotten() {
    let fixture = Fixture::new();
    fixture.artifact("short", "1.0", SHORT);
    let operator = fixture.operator().await;
    let program = program(&operator, "short", "1.0");

    operator.start(&program).await.unwrap();

    assert!(
        wait_until(|| operator.reattach().items().unwrap().is_empty()).await,
        "clean exit should remove the record"
    );

    // Closed programs are not restarted
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(operator.reattach().items().unwrap().is_empty());
}

#[tokio::test]
async fn test_long_program_runs_until_stopped() {
    let fixture = Fixture::new();
    fixture.artifact("long", "1.0", LONG);
    let operator = fixture.operator().await;
    let program = program(&operator, "long", "1.0");

    operator.start(&program).await.unwrap();

    let items = operator.reattach().items().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].execution_context.id, "long--1.0");
    assert!(items[0].network_address.starts_with("127.0.0.1:"));
    let pid = items[0].pid;
    assert!(pid_alive(pid));

    // Installed into the versioned directory
    assert!(program.directory().join("long").exists());

    operator.stop(&program).await.unwrap();

    assert!(operator.reattach().items().unwrap().is_empty());
    assert!(wait_until(|| !pid_alive(pid)).await, "stopped pid must be gone");
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let fixture = Fixture::new();
    fixture.artifact("long", "1.0", LONG);
    let launcher = Arc::new(RecordingLauncher::new(fixture.config.process.clone()));
    let operator = fixture
        .operator_with(Collaborators::local(&fixture.config).with_launcher(launcher.clone()))
        .await;
    let program = program(&operator, "long", "1.0");

    operator.start(&program).await.unwrap();
    let first = recorded_pid(&operator, &program).unwrap();

    operator.start(&program).await.unwrap();
    let second = recorded_pid(&operator, &program).unwrap();

    assert_eq!(first, second);
    assert_eq!(launcher.started(), vec![first]);
    assert_eq!(operator.reattach().items().unwrap().len(), 1);

    operator.stop(&program).await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let fixture = Fixture::new();
    fixture.artifact("long", "1.0", LONG);
    let operator = fixture.operator().await;
    let program = program(&operator, "long", "1.0");

    // Never started
    operator.stop(&program).await.unwrap();

    operator.start(&program).await.unwrap();
    operator.stop(&program).await.unwrap();
    operator.stop(&program).await.unwrap();

    assert!(operator.reattach().items().unwrap().is_empty());
}

#[tokio::test]
async fn test_crash_restarts_with_new_pid() {
    let fixture = Fixture::new();
    fixture.artifact("crashy", "1.0", CRASHY);
    let operator = fixture.operator().await;
    let program = program(&operator, "crashy", "1.0");

    operator.start(&program).await.unwrap();
    let first = recorded_pid(&operator, &program).unwrap();

    let restarted = wait_until(|| {
        matches!(recorded_pid(&operator, &program), Some(pid) if pid != first)
    })
    .await;
    assert!(restarted, "crashed program should be restarted");
    assert_eq!(operator.reattach().items().unwrap().len(), 1);

    operator.stop(&program).await.unwrap();
    assert!(operator.reattach().items().unwrap().is_empty());
}

#[tokio::test]
async fn test_deliberate_stop_suppresses_restart() {
    let fixture = Fixture::new();
    fixture.artifact("crashy", "1.0", CRASHY);
    let launcher = Arc::new(RecordingLauncher::new(fixture.config.process.clone()));
    let operator = fixture
        .operator_with(Collaborators::local(&fixture.config).with_launcher(launcher.clone()))
        .await;
    let program = program(&operator, "crashy", "1.0");

    operator.start(&program).await.unwrap();
    operator.stop(&program).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert!(operator.reattach().items().unwrap().is_empty());
    assert_eq!(launcher.started().len(), 1, "no restart after a stop");
}

#[tokio::test]
async fn test_failed_start_rolls_back() {
    let fixture = Fixture::new();
    fixture.artifact("long", "1.0", LONG);
    fixture.spec("long", "1.0", r#"{"binary_path": "long", "configurable": "grpc"}"#);

    let launcher = Arc::new(RecordingLauncher::new(fixture.config.process.clone()));
    let operator = fixture
        .operator_with(
            Collaborators::local(&fixture.config)
                .with_launcher(launcher.clone())
                .with_connections(Arc::new(FailingProvider)),
        )
        .await;
    let program = program(&operator, "long", "1.0");

    let err = operator.start(&program).await.unwrap_err();
    assert!(format!("{:#}", err).contains("operation 'start'"));

    assert!(operator.reattach().items().unwrap().is_empty());
    assert!(!operator.clients().contains(program.id()));

    let started = launcher.started();
    assert_eq!(started.len(), 1);
    assert!(
        wait_until(|| !pid_alive(started[0])).await,
        "rolled back process must be killed"
    );

    // Rolled back, not crashed: nothing comes back
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(launcher.started().len(), 1);
}

#[tokio::test]
async fn test_spawn_failure_leaves_nothing_behind() {
    let fixture = Fixture::new();
    fixture.artifact("long", "1.0", LONG);
    fixture.spec(
        "long",
        "1.0",
        r#"{"binary_path": "missing", "configurable": "file"}"#,
    );

    let launcher = Arc::new(RecordingLauncher::new(fixture.config.process.clone()));
    let operator = fixture
        .operator_with(Collaborators::local(&fixture.config).with_launcher(launcher.clone()))
        .await;
    let program = operator.program(
        "long",
        "1.0",
        Default::default(),
        config_blob(json!({"level": "debug"})),
    );

    let err = operator.start(&program).await.unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("operation 'start'"));
    assert!(message.contains("Failed to spawn"));

    assert!(recorded_pid(&operator, &program).is_none());
    assert!(!operator.clients().contains(program.id()));
    assert!(!fixture.config.config_dir.join("long--1.0.yml").exists());
    assert!(launcher.started().is_empty(), "no process may be left running");
}

#[tokio::test]
async fn test_failed_stop_keeps_crash_handling() {
    let fixture = Fixture::new();
    fixture.artifact("long", "1.0", LONG);
    let launcher =
        Arc::new(RecordingLauncher::new(fixture.config.process.clone()).refusing_stops(1));
    let operator = fixture
        .operator_with(Collaborators::local(&fixture.config).with_launcher(launcher.clone()))
        .await;
    let program = program(&operator, "long", "1.0");

    operator.start(&program).await.unwrap();
    let first = recorded_pid(&operator, &program).unwrap();

    let err = operator.stop(&program).await.unwrap_err();
    assert!(format!("{:#}", err).contains("operation 'stop'"));
    assert_eq!(recorded_pid(&operator, &program), Some(first));
    assert!(pid_alive(first));

    // The process dies on its own after the refused stop
    std::process::Command::new("kill")
        .args(["-9", &first.to_string()])
        .status()
        .unwrap();

    let recovered = wait_until(|| {
        matches!(recorded_pid(&operator, &program), Some(pid) if pid != first && pid_alive(pid))
    })
    .await;
    assert!(recovered, "death after a failed stop must still be handled");

    operator.start(&program).await.unwrap();
    let current = recorded_pid(&operator, &program).unwrap();
    assert!(pid_alive(current));

    operator.stop(&program).await.unwrap();
    assert!(operator.reattach().items().unwrap().is_empty());
    assert!(wait_until(|| !pid_alive(current)).await);
}

#[tokio::test]
async fn test_config_push_retries_transient_failures() {
    let fixture = Fixture::new();
    fixture.artifact("long", "1.0", LONG);
    fixture.spec("long", "1.0", r#"{"binary_path": "long", "configurable": "grpc"}"#);

    let provider = RecordingProvider::failing_first(2);
    let operator = fixture
        .operator_with(
            Collaborators::local(&fixture.config).with_connections(Arc::new(provider.clone())),
        )
        .await;
    let program = operator.program(
        "long",
        "1.0",
        Default::default(),
        config_blob(json!({"output": {"level": "debug"}})),
    );

    operator.start(&program).await.unwrap();

    let pushes = provider.pushes();
    assert_eq!(pushes.len(), 1);
    assert!(pushes[0].contains("level: debug"));
    assert!(operator.clients().contains(program.id()));

    operator.stop(&program).await.unwrap();
    assert!(!operator.clients().contains(program.id()));
}

#[tokio::test]
async fn test_config_push_exhausts_attempts() {
    let fixture = Fixture::new();
    fixture.artifact("long", "1.0", LONG);
    fixture.spec("long", "1.0", r#"{"binary_path": "long", "configurable": "grpc"}"#);

    let provider = RecordingProvider::failing_first(10);
    let operator = fixture
        .operator_with(
            Collaborators::local(&fixture.config).with_connections(Arc::new(provider.clone())),
        )
        .await;
    let program = program(&operator, "long", "1.0");

    let err = operator.start(&program).await.unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("operation 'config'"));
    assert!(message.contains("3 attempts"));

    // Only Start rolls back; the process keeps running
    assert!(recorded_pid(&operator, &program).is_some());
    assert!(provider.pushes().is_empty());

    operator.stop(&program).await.unwrap();
}

#[tokio::test]
async fn test_config_push_without_transport_is_fatal() {
    let fixture = Fixture::new();
    fixture.artifact("long", "1.0", LONG);
    fixture.spec("long", "1.0", r#"{"binary_path": "long", "configurable": "grpc"}"#);
    let operator = fixture.operator().await;
    let program = program(&operator, "long", "1.0");

    let started = std::time::Instant::now();
    let err = operator.start(&program).await.unwrap_err();
    assert!(format!("{:#}", err).contains("no configuration transport"));
    assert!(started.elapsed() < Duration::from_secs(5), "fatal errors are not retried");

    operator.stop(&program).await.unwrap();
}

#[tokio::test]
async fn test_file_configured_program() {
    let fixture = Fixture::new();
    fixture.artifact("args", "1.0", ARGS);
    fixture.spec(
        "args",
        "1.0",
        r#"{"binary_path": "args", "args": ["-e", "-c", "stale.yml"], "configurable": "file"}"#,
    );
    let operator = fixture.operator().await;
    let program = operator.program(
        "args",
        "1.0",
        Default::default(),
        config_blob(json!({"level": "debug"})),
    );

    operator.start(&program).await.unwrap();
    let first = recorded_pid(&operator, &program).unwrap();

    let config_file = fixture.config.config_dir.join("args--1.0.yml");
    let args_file = program.directory().join("args.txt");
    assert!(wait_until(|| std::fs::read_to_string(&args_file)
        .map(|s| !s.is_empty())
        .unwrap_or(false))
    .await);

    let args = std::fs::read_to_string(&args_file).unwrap();
    assert_eq!(args.trim(), format!("-e -c {}", config_file.display()));
    assert!(std::fs::read_to_string(&config_file)
        .unwrap()
        .contains("level: debug"));

    // Pushing config to a file-configured program restarts it
    let updated = program.with_config(config_blob(json!({"level": "info"})));
    operator.push_config(&updated).await.unwrap();

    let second = recorded_pid(&operator, &program).unwrap();
    assert_ne!(first, second);
    assert!(std::fs::read_to_string(&config_file)
        .unwrap()
        .contains("level: info"));

    operator.stop(&program).await.unwrap();
    assert!(!config_file.exists());
}

#[tokio::test]
async fn test_leftovers_are_purged_on_startup() {
    let fixture = Fixture::new();
    fixture.artifact("long", "1.0", LONG);

    let first = fixture.operator().await;
    let program = program(&first, "long", "1.0");
    first.start(&program).await.unwrap();
    let pid = recorded_pid(&first, &program).unwrap();
    drop(first);

    let second = fixture.operator().await;
    assert!(second.reattach().items().unwrap().is_empty());
    assert!(wait_until(|| !pid_alive(pid)).await, "leftover must be killed");
}

#[tokio::test]
async fn test_missing_artifact_fails_fetch() {
    let fixture = Fixture::new();
    let operator = fixture.operator().await;
    let program = program(&operator, "ghost", "1.0");

    let err = operator.start(&program).await.unwrap_err();
    assert!(format!("{:#}", err).contains("operation 'fetch'"));
    assert!(operator.reattach().items().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut fixture = Fixture::new();
    fixture.config.topics.clear();

    let result = warden::Operator::new(
        fixture.config.clone(),
        Collaborators::local(&fixture.config),
    )
    .await;
    assert!(result.is_err());
}
