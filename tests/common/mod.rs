//! Shared fixtures for operator integration tests.
//!
//! Artifacts are `/bin/sh` scripts placed in a temporary artifact repository.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use warden::adapters::{LaunchRequest, OsLauncher, ProcessError, ProcessInfo, ProcessLauncher};
use warden::config::ProcessSettings;
use warden::core::{
    ClientError, Collaborators, ConfigClient, ConnectionProvider, Endpoint, Operator, RetryPolicy,
};
use warden::domain::{Program, ProgramConfig, Tags};
use warden::OperatorConfig;

/// Runs until stopped; records its pid in the working directory
pub const LONG: &str = "#!/bin/sh\necho $$ > pid\nexec sleep 300\n";

/// Exits cleanly right away
pub const SHORT: &str = "#!/bin/sh\nexit 0\n";

/// Crashes after a second
pub const CRASHY: &str = "#!/bin/sh\nsleep 1\nexit 3\n";

/// Records its arguments, then runs until stopped
pub const ARGS: &str = "#!/bin/sh\necho \"$@\" > args.txt\nexec sleep 300\n";

pub struct Fixture {
    pub temp: TempDir,
    pub config: OperatorConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = OperatorConfig::with_home(temp.path().join("home"));
        config.process = ProcessSettings {
            min_port: 43000,
            max_port: 43999,
            stop_timeout_ms: 2000,
        };
        config.retry = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            attempt_timeout_ms: 1000,
            ..Default::default()
        };

        Self { temp, config }
    }

    fn artifact_dir(&self, binary: &str, version: &str) -> PathBuf {
        self.config
            .download
            .source_uri
            .join(self.config.download.platform.artifact_name(binary, version))
    }

    /// Publish an executable script as `<binary>` version `version`
    pub fn artifact(&self, binary: &str, version: &str, script: &str) {
        let dir = self.artifact_dir(binary, version);
        std::fs::create_dir_all(&dir).unwrap();

        let path = dir.join(binary);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Ship a spec file with an artifact
    pub fn spec(&self, binary: &str, version: &str, json: &str) {
        let dir = self.artifact_dir(binary, version);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}.spec.json", binary)), json).unwrap();
    }

    pub async fn operator(&self) -> Operator {
        self.operator_with(Collaborators::local(&self.config)).await
    }

    pub async fn operator_with(&self, collaborators: Collaborators) -> Operator {
        Operator::new(self.config.clone(), collaborators)
            .await
            .unwrap()
    }
}

pub fn program(operator: &Operator, binary: &str, version: &str) -> Program {
    operator.program(binary, version, Tags::new(), ProgramConfig::new())
}

pub fn recorded_pid(operator: &Operator, program: &Program) -> Option<u32> {
    operator
        .reattach()
        .find(program.id())
        .unwrap()
        .map(|info| info.pid)
}

pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Poll `condition` for up to ten seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition()
}

/// Launcher that remembers every pid it spawned
pub struct RecordingLauncher {
    inner: OsLauncher,
    pub started: Mutex<Vec<u32>>,
    /// Stop requests to reject before delegating
    refusals: AtomicU32,
}

impl RecordingLauncher {
    pub fn new(settings: ProcessSettings) -> Self {
        Self {
            inner: OsLauncher::new(settings),
            started: Mutex::new(Vec::new()),
            refusals: AtomicU32::new(0),
        }
    }

    /// Reject the first `count` stop requests as if signalling were denied
    pub fn refusing_stops(self, count: u32) -> Self {
        self.refusals.store(count, Ordering::SeqCst);
        self
    }

    pub fn started(&self) -> Vec<u32> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for RecordingLauncher {
    async fn start(&self, request: LaunchRequest<'_>) -> Result<ProcessInfo, ProcessError> {
        let info = self.inner.start(request).await?;
        self.started.lock().unwrap().push(info.pid);
        Ok(info)
    }

    async fn stop(&self, pid: u32) -> Result<(), ProcessError> {
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProcessError::Signal {
                pid,
                reason: "Operation not permitted".to_string(),
            });
        }
        self.inner.stop(pid).await
    }

    async fn is_running(&self, pid: u32) -> bool {
        self.inner.is_running(pid).await
    }
}

/// Provider whose connections always fail
pub struct FailingProvider;

impl ConnectionProvider for FailingProvider {
    fn connect(
        &self,
        _program_id: &str,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn ConfigClient>, ClientError> {
        Err(ClientError::Connect {
            address: endpoint.address.clone(),
            reason: "connection refused".to_string(),
        })
    }
}

/// Provider recording every pushed configuration
#[derive(Clone, Default)]
pub struct RecordingProvider {
    pub pushes: Arc<Mutex<Vec<String>>>,
    pub connections: Arc<AtomicU32>,
    /// Transient failures to return before accepting pushes
    pub failures: Arc<AtomicU32>,
}

impl RecordingProvider {
    pub fn failing_first(failures: u32) -> Self {
        let provider = Self::default();
        provider.failures.store(failures, Ordering::SeqCst);
        provider
    }

    pub fn pushes(&self) -> Vec<String> {
        self.pushes.lock().unwrap().clone()
    }
}

struct RecordingClient {
    provider: RecordingProvider,
}

#[async_trait]
impl ConfigClient for RecordingClient {
    async fn config(&self, yaml: &str) -> Result<(), ClientError> {
        let failures = &self.provider.failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ClientError::Unavailable("not ready".to_string()));
        }

        self.provider.pushes.lock().unwrap().push(yaml.to_string());
        Ok(())
    }
}

impl ConnectionProvider for RecordingProvider {
    fn connect(
        &self,
        _program_id: &str,
        _endpoint: &Endpoint,
    ) -> Result<Arc<dyn ConfigClient>, ClientError> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingClient {
            provider: self.clone(),
        }))
    }
}
