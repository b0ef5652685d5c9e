//! OS process launching and termination.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::credentials::Credentials;
use crate::config::ProcessSettings;
use crate::domain::ProcessSpec;

/// Environment variable carrying the process's remote config address
pub const ENV_ADDRESS: &str = "WARDEN_ADDRESS";

/// Environment variable carrying the execution context id
pub const ENV_PROGRAM_ID: &str = "WARDEN_PROGRAM_ID";

/// Environment variable carrying the issued token
pub const ENV_TOKEN: &str = "WARDEN_TOKEN";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// ETXTBSY: a just-installed binary may still be open for writing elsewhere
const TEXT_FILE_BUSY: i32 = 26;
const SPAWN_ATTEMPTS: u32 = 5;

/// Process errors
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Process {0} not found")]
    NotFound(u32),

    #[error("Failed to spawn {path}: {error}")]
    Spawn {
        path: PathBuf,
        error: std::io::Error,
    },

    #[error("Spawned process exited before reporting a pid")]
    NoPid,

    #[error("No free port in range {min}-{max}")]
    NoPort { min: u16, max: u16 },

    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

/// Everything needed to spawn one process
pub struct LaunchRequest<'a> {
    pub program_id: &'a str,
    pub spec: &'a ProcessSpec,
    pub args: Vec<String>,
    pub working_dir: &'a Path,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub credentials: Option<&'a Credentials>,
}

/// A freshly spawned process
#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: u32,

    /// Remote configuration endpoint handed to the process
    pub address: String,

    /// Handle used by the watcher to observe the exit
    pub child: Child,
}

/// Spawns and kills processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn start(&self, request: LaunchRequest<'_>) -> Result<ProcessInfo, ProcessError>;

    /// Terminate a process; `NotFound` when it does not exist
    async fn stop(&self, pid: u32) -> Result<(), ProcessError>;

    async fn is_running(&self, pid: u32) -> bool;
}

/// Launcher backed by the host OS
pub struct OsLauncher {
    settings: ProcessSettings,
    next_port: Mutex<u16>,
}

impl OsLauncher {
    pub fn new(settings: ProcessSettings) -> Self {
        Self {
            next_port: Mutex::new(settings.min_port),
            settings,
        }
    }

    /// Allocate the next free loopback port, wrapping within the range
    fn allocate_port(&self) -> Result<u16, ProcessError> {
        let (min, max) = (self.settings.min_port, self.settings.max_port);
        let mut next = self
            .next_port
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let span = u32::from(max - min) + 1;
        for _ in 0..span {
            let candidate = *next;
            *next = if candidate >= max { min } else { candidate + 1 };

            if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
                return Ok(candidate);
            }
        }

        Err(ProcessError::NoPort { min, max })
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_running(pid).await {
                return true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        !self.is_running(pid).await
    }
}

#[async_trait]
impl ProcessLauncher for OsLauncher {
    async fn start(&self, request: LaunchRequest<'_>) -> Result<ProcessInfo, ProcessError> {
        let port = self.allocate_port()?;
        let address = format!("127.0.0.1:{}", port);

        let mut cmd = Command::new(&request.spec.binary_path);
        cmd.args(&request.args)
            .current_dir(request.working_dir)
            .env(ENV_ADDRESS, &address)
            .env(ENV_PROGRAM_ID, request.program_id)
            .stdin(Stdio::null());

        if let Some(credentials) = request.credentials {
            cmd.env(ENV_TOKEN, &credentials.token);
        }

        #[cfg(unix)]
        {
            if let Some(uid) = request.uid {
                cmd.uid(uid);
            }
            if let Some(gid) = request.gid {
                cmd.gid(gid);
            }
        }

        let mut attempt = 1;
        let mut child = loop {
            match cmd.spawn() {
                Ok(child) => break child,
                Err(error)
                    if error.raw_os_error() == Some(TEXT_FILE_BUSY) && attempt < SPAWN_ATTEMPTS =>
                {
                    debug!(attempt, "Binary busy, retrying spawn");
                    attempt += 1;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(error) => {
                    return Err(ProcessError::Spawn {
                        path: request.spec.binary_path.clone(),
                        error,
                    })
                }
            }
        };

        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                let _ = child.wait().await;
                return Err(ProcessError::NoPid);
            }
        };

        info!(
            program = request.program_id,
            pid,
            %address,
            binary = %request.spec.binary_path.display(),
            "Process spawned"
        );

        Ok(ProcessInfo {
            pid,
            address,
            child,
        })
    }

    async fn stop(&self, pid: u32) -> Result<(), ProcessError> {
        if !self.is_running(pid).await {
            return Err(ProcessError::NotFound(pid));
        }

        debug!(pid, "Sending termination signal");
        if let Err(e) = signal(pid, Signal::Terminate).await {
            if !self.is_running(pid).await {
                return Err(ProcessError::NotFound(pid));
            }
            return Err(e);
        }

        let grace = Duration::from_millis(self.settings.stop_timeout_ms);
        if self.wait_for_exit(pid, grace).await {
            return Ok(());
        }

        warn!(pid, "Process ignored termination, force killing");
        match signal(pid, Signal::Kill).await {
            Ok(()) => {}
            Err(_) if !self.is_running(pid).await => return Ok(()),
            Err(e) => return Err(e),
        }

        if self.wait_for_exit(pid, Duration::from_secs(2)).await {
            Ok(())
        } else {
            Err(ProcessError::Signal {
                pid,
                reason: "process still alive after SIGKILL".to_string(),
            })
        }
    }

    async fn is_running(&self, pid: u32) -> bool {
        process_exists(pid).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
async fn signal(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    let flag = match signal {
        Signal::Terminate => "-TERM",
        Signal::Kill => "-KILL",
    };

    let output = Command::new("kill")
        .arg(flag)
        .arg(pid.to_string())
        .output()
        .await
        .map_err(|e| ProcessError::Signal {
            pid,
            reason: e.to_string(),
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ProcessError::Signal {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(unix)]
async fn process_exists(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(windows)]
async fn signal(pid: u32, _signal: Signal) -> Result<(), ProcessError> {
    // Windows has no graceful equivalent; always force
    let output = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output()
        .await
        .map_err(|e| ProcessError::Signal {
            pid,
            reason: e.to_string(),
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ProcessError::Signal {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(windows)]
async fn process_exists(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .await
        .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}
