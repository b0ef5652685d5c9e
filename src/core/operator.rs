//! The operator: turns lifecycle events into operation flows.
//!
//! Flows for one program never overlap: every flow, and the handling of a
//! process exit, runs under that program's lock. Flows for different programs
//! run concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{
    CredentialIssuer, DirectoryInstaller, Downloader, EventBus, HandlerFuture, Installer,
    LocalDownloader, OsLauncher, ProcessError, ProcessLauncher, StateChangeHandler, TokenIssuer,
};
use crate::config::{MonitoringSettings, OperatorConfig};
use crate::domain::{
    sidecar_tags, Configurable, MonitoringOutput, Program, ProgramConfig, SidecarKind,
    StateChange, Step, Tags, STEP_REMOVE, STEP_RUN, STEP_START_SIDECAR, STEP_STOP_SIDECAR,
};

use super::clients::{ClientRegistry, ConnectionProvider, UnavailableProvider};
use super::operation::{
    ConfigOperation, FetchOperation, Flow, InstallOperation, OperationContext, RemoveOperation,
    StartOperation, StopOperation, VerifyOperation,
};
use super::rate_limit::RestartLimiter;
use super::reattach::ReattachCollection;
use super::watcher::{ExitReason, ProcessWatcher, WatchEvent};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler for one step kind
type StepHandler = for<'a> fn(&'a Operator, &'a Step) -> BoxFuture<'a, Result<()>>;

/// External systems the operator drives
#[derive(Clone)]
pub struct Collaborators {
    pub downloader: Arc<dyn Downloader>,
    pub installer: Arc<dyn Installer>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub credentials: Arc<dyn CredentialIssuer>,
    pub connections: Arc<dyn ConnectionProvider>,
}

impl Collaborators {
    /// Local artifact repository, OS processes, no configuration transport
    pub fn local(config: &OperatorConfig) -> Self {
        Self {
            downloader: Arc::new(LocalDownloader::new(config.download.clone())),
            installer: Arc::new(DirectoryInstaller::new(config.download.clone())),
            launcher: Arc::new(OsLauncher::new(config.process.clone())),
            credentials: Arc::new(TokenIssuer),
            connections: Arc::new(UnavailableProvider),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_connections(mut self, connections: Arc<dyn ConnectionProvider>) -> Self {
        self.connections = connections;
        self
    }
}

struct Inner {
    ctx: Arc<OperationContext>,
    handlers: HashMap<&'static str, StepHandler>,
    limiters: Mutex<HashMap<String, Arc<RestartLimiter>>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    monitoring: Mutex<MonitoringSettings>,
    /// Running sidecars keyed by the program they monitor
    sidecars: Mutex<HashMap<(String, SidecarKind), Program>>,
}

/// Lifecycle manager for child programs.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Operator {
    inner: Arc<Inner>,
}

impl Operator {
    /// Create an operator, purging processes left over by a previous run
    pub async fn new(config: OperatorConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate().context("Invalid operator configuration")?;

        let reattach = ReattachCollection::new(&config.reattach_path);
        let purged = purge_leftovers(&reattach, collaborators.launcher.as_ref()).await?;
        if purged > 0 {
            info!(purged, "Purged leftover processes");
        }

        let (watcher, events) = ProcessWatcher::new();
        let ctx = Arc::new(OperationContext {
            reattach,
            clients: ClientRegistry::new(collaborators.connections),
            watcher,
            downloader: collaborators.downloader,
            installer: collaborators.installer,
            launcher: collaborators.launcher,
            credentials: collaborators.credentials,
            config,
        });

        let inner = Arc::new(Inner {
            monitoring: Mutex::new(ctx.config.monitoring.clone()),
            ctx,
            handlers: handler_table(),
            limiters: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            sidecars: Mutex::new(HashMap::new()),
        });

        tokio::spawn(dispatch(Arc::downgrade(&inner), events));

        Ok(Self { inner })
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.inner.ctx.config
    }

    pub fn reattach(&self) -> &ReattachCollection {
        &self.inner.ctx.reattach
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.inner.ctx.clients
    }

    /// Monitoring settings currently in effect
    pub fn monitoring(&self) -> MonitoringSettings {
        lock_map(&self.inner.monitoring).clone()
    }

    /// Replace the monitoring settings; the next `start-sidecar` step applies
    /// them, stopping sidecars that are no longer wanted
    pub fn update_monitoring(&self, settings: MonitoringSettings) {
        info!(?settings, "Monitoring settings updated");
        *lock_map(&self.inner.monitoring) = settings;
    }

    /// Running sidecars of `monitored`
    pub fn sidecars_of(&self, monitored: &str) -> Vec<(SidecarKind, Program)> {
        let mut running: Vec<_> = self
            .sidecars()
            .iter()
            .filter(|((program, _), _)| program == monitored)
            .map(|((_, kind), sidecar)| (*kind, sidecar.clone()))
            .collect();
        running.sort_by_key(|(kind, _)| kind.binary());
        running
    }

    /// Build a program installed under the configured install path
    pub fn program(
        &self,
        binary_name: &str,
        version: &str,
        tags: Tags,
        config: ProgramConfig,
    ) -> Program {
        let settings = &self.inner.ctx.config;
        Program::from_parts(
            binary_name,
            version,
            tags,
            config,
            &settings.install_path,
            settings.download.platform.clone(),
        )
    }

    /// Whether a process is recorded for the program
    pub fn is_running(&self, program: &Program) -> Result<bool> {
        Ok(self.inner.ctx.reattach.contains(program.id())?)
    }

    /// Fetch, verify, install, start and configure a program
    #[instrument(skip(self, program), fields(program = %program))]
    pub async fn start(&self, program: &Program) -> Result<()> {
        let lock = self.program_lock(program.id());
        let _guard = lock.lock().await;
        self.start_locked(program).await
    }

    /// Stop a program; stopping a program that is not running succeeds
    #[instrument(skip(self, program), fields(program = %program))]
    pub async fn stop(&self, program: &Program) -> Result<()> {
        let lock = self.program_lock(program.id());
        let _guard = lock.lock().await;
        self.disable_limiter(program.id());
        self.run_flow(program, self.stop_flow(program)).await?;
        self.release_lock(program.id(), &lock);
        Ok(())
    }

    /// Apply the program's current configuration to its running process
    #[instrument(skip(self, program), fields(program = %program))]
    pub async fn push_config(&self, program: &Program) -> Result<()> {
        let lock = self.program_lock(program.id());
        let _guard = lock.lock().await;
        self.push_config_locked(program).await
    }

    /// Stop a program and drop it from management
    #[instrument(skip(self, program), fields(program = %program))]
    pub async fn remove(&self, program: &Program) -> Result<()> {
        let lock = self.program_lock(program.id());
        let _guard = lock.lock().await;
        self.disable_limiter(program.id());
        self.run_flow(program, self.remove_flow(program)).await?;
        self.release_lock(program.id(), &lock);
        Ok(())
    }

    /// Stop every recorded process
    pub async fn stop_all(&self) -> Result<usize> {
        let items = self.inner.ctx.reattach.items()?;
        let mut stopped = 0;

        for item in items {
            let context = item.execution_context;
            let program = self.program(
                &context.binary_name,
                &context.version,
                context.tags,
                ProgramConfig::new(),
            );
            match self.stop(&program).await {
                Ok(()) => stopped += 1,
                Err(e) => error!(program = %program, error = %format!("{:#}", e), "Failed to stop"),
            }
        }

        Ok(stopped)
    }

    /// Execute operations in order, skipping those whose check says no.
    ///
    /// The first failure aborts the flow.
    pub async fn run_flow(&self, program: &Program, flow: Flow) -> Result<()> {
        for operation in flow {
            let name = operation.name();

            let needed = operation
                .check()
                .await
                .with_context(|| format!("operation '{}' check failed for {}", name, program))?;
            if !needed {
                debug!(program = %program, operation = name, "Skipped");
                continue;
            }

            debug!(program = %program, operation = name, "Running");
            operation
                .run()
                .await
                .with_context(|| format!("operation '{}' failed for {}", name, program))?;
        }

        Ok(())
    }

    /// Dispatch each step of an envelope to the handler for its kind
    #[instrument(skip(self, envelope), fields(topic = %envelope.topic, steps = envelope.steps.len()))]
    pub async fn state_change_handler(&self, envelope: &StateChange) -> Result<()> {
        if !self.inner.ctx.config.topics.contains(&envelope.topic) {
            warn!("Envelope on unsubscribed topic ignored");
            return Ok(());
        }

        for step in &envelope.steps {
            let Some(handler) = self.inner.handlers.get(step.kind.as_str()) else {
                error!(
                    kind = %step.kind,
                    program = %step.program.cmd,
                    "Unknown step kind, dropping remaining steps"
                );
                break;
            };

            if let Err(e) = handler(self, step).await {
                error!(
                    kind = %step.kind,
                    program = %step.program.cmd,
                    error = %format!("{:#}", e),
                    "Step failed"
                );
            }
        }

        Ok(())
    }

    /// Register the state change handler for every configured topic
    pub async fn subscribe(&self, bus: &dyn EventBus) -> Result<()> {
        for topic in &self.inner.ctx.config.topics {
            let operator = self.clone();
            let handler: StateChangeHandler = Arc::new(move |envelope: StateChange| {
                let operator = operator.clone();
                Box::pin(async move { operator.state_change_handler(&envelope).await })
                    as HandlerFuture
            });
            bus.subscribe(topic, handler)
                .await
                .with_context(|| format!("Failed to subscribe to '{}'", topic))?;
        }
        Ok(())
    }

    async fn start_locked(&self, program: &Program) -> Result<()> {
        self.reset_limiter(program.id());
        self.run_flow(program, self.start_flow(program)).await
    }

    async fn push_config_locked(&self, program: &Program) -> Result<()> {
        let flow = self.push_config_flow(program)?;
        self.run_flow(program, flow).await
    }

    /// Start the program, or reconfigure it when it is already running
    async fn run_program(&self, program: &Program) -> Result<()> {
        let lock = self.program_lock(program.id());
        let _guard = lock.lock().await;

        if self.inner.ctx.reattach.contains(program.id())? {
            debug!(program = %program, "Already running, pushing configuration");
            self.push_config_locked(program).await
        } else {
            self.start_locked(program).await
        }
    }

    fn start_flow(&self, program: &Program) -> Flow {
        let ctx = &self.inner.ctx;
        vec![
            Box::new(FetchOperation::new(ctx.clone(), program.clone())),
            Box::new(VerifyOperation),
            Box::new(InstallOperation::new(ctx.clone(), program.clone())),
            Box::new(StartOperation::new(ctx.clone(), program.clone())),
            Box::new(ConfigOperation::new(ctx.clone(), program.clone())),
        ]
    }

    fn stop_flow(&self, program: &Program) -> Flow {
        vec![Box::new(StopOperation::new(
            self.inner.ctx.clone(),
            program.clone(),
        ))]
    }

    fn push_config_flow(&self, program: &Program) -> Result<Flow> {
        let ctx = &self.inner.ctx;
        let flow: Flow = match program.configurable()? {
            Configurable::File => vec![
                Box::new(StopOperation::new(ctx.clone(), program.clone())),
                Box::new(StartOperation::new(ctx.clone(), program.clone())),
            ],
            Configurable::Grpc => vec![Box::new(ConfigOperation::new(ctx.clone(), program.clone()))],
            Configurable::None => Vec::new(),
        };
        Ok(flow)
    }

    fn remove_flow(&self, program: &Program) -> Flow {
        vec![
            Box::new(StopOperation::new(self.inner.ctx.clone(), program.clone())),
            Box::new(RemoveOperation),
        ]
    }

    fn program_from_step(&self, step: &Step, tags: Tags) -> Result<Program> {
        Ok(self.program(&step.program.cmd, &step.version, tags, step.config()?))
    }

    async fn handle_run(&self, step: &Step) -> Result<()> {
        let program = self.program_from_step(step, Tags::new())?;
        self.run_program(&program).await
    }

    async fn handle_remove(&self, step: &Step) -> Result<()> {
        let program = self.program_from_step(step, Tags::new())?;
        self.remove(&program).await
    }

    /// Bring the sidecars of the step's program in line with the monitoring
    /// settings: run every wanted kind, stop the unwanted ones
    async fn handle_start_sidecar(&self, step: &Step) -> Result<()> {
        let monitored = step.program.cmd.as_str();
        let settings = self.monitoring();

        if !settings.enabled {
            if self.sidecars_of(monitored).is_empty() {
                debug!(monitored, "Monitoring disabled, no sidecar to stop");
                return Ok(());
            }
            info!(monitored, "Monitoring disabled, stopping sidecars");
            return self.stop_sidecars(monitored, &step.version).await;
        }

        let output = MonitoringOutput::from_config(&step.config()?)
            .with_context(|| format!("Invalid monitoring output for '{}'", monitored))?;
        let config = output.sidecar_config();

        let mut failures = Vec::new();
        for kind in SidecarKind::ALL {
            let result = if settings.watches(kind) {
                self.run_sidecar(monitored, kind, &step.version, config.clone())
                    .await
            } else {
                self.stop_tracked_sidecar(monitored, kind).await
            };
            if let Err(e) = result {
                failures.push(format!("{}: {:#}", kind, e));
            }
        }

        sidecar_result(monitored, failures)
    }

    async fn handle_stop_sidecar(&self, step: &Step) -> Result<()> {
        self.stop_sidecars(&step.program.cmd, &step.version).await
    }

    async fn run_sidecar(
        &self,
        monitored: &str,
        kind: SidecarKind,
        version: &str,
        config: ProgramConfig,
    ) -> Result<()> {
        let key = (monitored.to_string(), kind);
        let program = self.program(kind.binary(), version, sidecar_tags(monitored), config);

        // A sidecar of another version replaces the old one
        let previous = self.sidecars().get(&key).cloned();
        if let Some(previous) = previous.filter(|p| p.id() != program.id()) {
            self.stop(&previous).await?;
            self.sidecars().remove(&key);
        }

        self.run_program(&program).await?;
        self.sidecars().insert(key, program);
        Ok(())
    }

    async fn stop_tracked_sidecar(&self, monitored: &str, kind: SidecarKind) -> Result<()> {
        let key = (monitored.to_string(), kind);
        let tracked = self.sidecars().get(&key).cloned();
        let Some(program) = tracked else {
            return Ok(());
        };

        info!(monitored, %kind, sidecar = %program, "Sidecar no longer wanted, stopping");
        self.stop(&program).await?;
        self.sidecars().remove(&key);
        Ok(())
    }

    /// Stop every sidecar kind of `monitored`, tracked or not
    async fn stop_sidecars(&self, monitored: &str, version: &str) -> Result<()> {
        let mut failures = Vec::new();

        for kind in SidecarKind::ALL {
            let key = (monitored.to_string(), kind);
            let tracked = self.sidecars().get(&key).cloned();
            let program = match tracked {
                Some(program) => program,
                None => self.program(
                    kind.binary(),
                    version,
                    sidecar_tags(monitored),
                    ProgramConfig::new(),
                ),
            };

            match self.stop(&program).await {
                Ok(()) => {
                    self.sidecars().remove(&key);
                }
                Err(e) => failures.push(format!("{}: {:#}", kind, e)),
            }
        }

        sidecar_result(monitored, failures)
    }

    /// React to a watched process exiting
    async fn handle_exit(&self, event: WatchEvent) {
        let program = &event.program;
        let id = program.id().to_string();
        let lock = self.program_lock(&id);
        let guard = lock.lock().await;

        self.inner.ctx.clients.remove(&id);
        let recorded = match self.inner.ctx.reattach.remove_process(event.pid) {
            Ok(recorded) => recorded,
            Err(e) => {
                error!(program = %program, pid = event.pid, error = %e, "Failed to update reattach state");
                return;
            }
        };

        if event.reason == ExitReason::Closed {
            info!(program = %program, pid = event.pid, "Program exited, not restarting");
            self.disable_limiter(&id);
            self.release_lock(&id, &lock);
            return;
        }

        if !recorded {
            debug!(program = %program, pid = event.pid, "Exit of an unrecorded process ignored");
            self.release_lock(&id, &lock);
            return;
        }

        warn!(program = %program, pid = event.pid, code = ?event.code, "Program crashed");
        let limiter = self.limiter(&id);

        // Stop and start must not wait behind the restart budget
        drop(guard);
        if !limiter.acquire().await {
            info!(program = %program, "Restart cancelled");
            return;
        }

        let _guard = lock.lock().await;
        let flow: Flow = vec![Box::new(StartOperation::new(
            self.inner.ctx.clone(),
            program.clone(),
        ))];
        match self.run_flow(program, flow).await {
            Ok(()) => info!(program = %program, "Program restarted after crash"),
            Err(e) => error!(program = %program, error = %format!("{:#}", e), "Restart failed"),
        }
    }

    fn program_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        lock_map(&self.inner.locks)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Forget the lock of a program that is no longer running, unless another
    /// flow is holding or waiting for it
    fn release_lock(&self, id: &str, lock: &Arc<AsyncMutex<()>>) {
        let mut locks = lock_map(&self.inner.locks);
        // One reference in the map, one held by the caller
        if locks
            .get(id)
            .is_some_and(|held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) == 2)
        {
            locks.remove(id);
        }
    }

    fn limiter(&self, id: &str) -> Arc<RestartLimiter> {
        let restart = &self.inner.ctx.config.restart;
        lock_map(&self.inner.limiters)
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RestartLimiter::new(restart)))
            .clone()
    }

    /// Fresh restart budget; a pending crash restart is cancelled
    fn reset_limiter(&self, id: &str) {
        let fresh = Arc::new(RestartLimiter::new(&self.inner.ctx.config.restart));
        if let Some(old) = lock_map(&self.inner.limiters).insert(id.to_string(), fresh) {
            old.disable();
        }
    }

    fn disable_limiter(&self, id: &str) {
        if let Some(old) = lock_map(&self.inner.limiters).remove(id) {
            old.disable();
        }
    }

    fn sidecars(&self) -> MutexGuard<'_, HashMap<(String, SidecarKind), Program>> {
        lock_map(&self.inner.sidecars)
    }
}

fn lock_map<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn sidecar_result(monitored: &str, failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    anyhow::bail!(
        "Sidecars of '{}' failed: {}",
        monitored,
        failures.join("; ")
    )
}

fn handler_table() -> HashMap<&'static str, StepHandler> {
    let mut handlers: HashMap<&'static str, StepHandler> = HashMap::new();
    handlers.insert(STEP_RUN, run_step);
    handlers.insert(STEP_REMOVE, remove_step);
    handlers.insert(STEP_START_SIDECAR, start_sidecar_step);
    handlers.insert(STEP_STOP_SIDECAR, stop_sidecar_step);
    handlers
}

fn run_step<'a>(operator: &'a Operator, step: &'a Step) -> BoxFuture<'a, Result<()>> {
    Box::pin(operator.handle_run(step))
}

fn remove_step<'a>(operator: &'a Operator, step: &'a Step) -> BoxFuture<'a, Result<()>> {
    Box::pin(operator.handle_remove(step))
}

fn start_sidecar_step<'a>(operator: &'a Operator, step: &'a Step) -> BoxFuture<'a, Result<()>> {
    Box::pin(operator.handle_start_sidecar(step))
}

fn stop_sidecar_step<'a>(operator: &'a Operator, step: &'a Step) -> BoxFuture<'a, Result<()>> {
    Box::pin(operator.handle_stop_sidecar(step))
}

/// Forward watch events to exit handling until the operator is dropped
async fn dispatch(inner: Weak<Inner>, mut events: mpsc::Receiver<WatchEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let operator = Operator { inner };
        tokio::spawn(async move { operator.handle_exit(event).await });
    }
    debug!("Watch dispatch loop finished");
}

/// Kill and forget every recorded process
pub async fn purge_leftovers(
    reattach: &ReattachCollection,
    launcher: &dyn ProcessLauncher,
) -> Result<usize> {
    let items = reattach
        .items()
        .context("Failed to read reattach state")?;

    for item in &items {
        match launcher.stop(item.pid).await {
            Ok(()) | Err(ProcessError::NotFound(_)) => {}
            Err(e) => warn!(pid = item.pid, error = %e, "Failed to kill leftover process"),
        }
        reattach.remove_process(item.pid)?;
        info!(program = %item.execution_context, pid = item.pid, "Purged leftover process");
    }

    Ok(items.len())
}
