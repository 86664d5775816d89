//! Per-service lifecycle: checkout, build, launch, crash recovery and stop.
//!
//! # Locking
//!
//! Every public operation holds the service's async operation lock for its
//! whole duration, so Start/Stop/Update/Restart on one service never
//! interleave. Runtime fields sit behind a separate synchronous mutex that is
//! never held across an `.await`.
//!
//! # Exit handling
//!
//! Each launched process gets a monitor task that waits for exit and posts an
//! event tagged with the launch generation. A single event task per service
//! consumes those events under the operation lock and decides, with
//! [`decide_exit`], whether the exit was expected, final, or should trigger a
//! relaunch. Exits from superseded generations are ignored.

use crate::config::ServiceSpec;
use crate::error::{HotifyError, Result};
use crate::git::{combined_output, GitSource};
use crate::proxy::{route_id, ProxyPublisher};
use crate::service::{LogBuffer, ServiceInfo, ServiceStatus, ServiceSummary};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Tunables shared by every supervisor
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Time between SIGTERM and a forced kill
    pub stop_timeout: Duration,
    /// Captured output lines kept per service
    pub max_log_lines: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            max_log_lines: 1000,
        }
    }
}

/// What to do about a process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Stopped on purpose or superseded by a newer launch
    Expected,
    /// Restarts disabled; the service stays stopped
    Finalize,
    /// Restart budget exhausted; the service stays stopped
    GiveUp,
    /// Launch again and count a restart
    Relaunch,
}

/// Classify an exit of the process launched as `exited_generation`
pub fn decide_exit(
    status: ServiceStatus,
    current_generation: u64,
    exited_generation: u64,
    restarts: u32,
    spec: &ServiceSpec,
) -> ExitDecision {
    if status != ServiceStatus::Running || exited_generation != current_generation {
        return ExitDecision::Expected;
    }
    if !spec.restart {
        return ExitDecision::Finalize;
    }
    if restarts >= spec.max_restarts {
        return ExitDecision::GiveUp;
    }
    ExitDecision::Relaunch
}

#[derive(Debug)]
enum SupervisorEvent {
    Exited { generation: u64, code: Option<i32> },
}

/// Live process owned by a running service
struct ProcessHandle {
    pid: Option<u32>,
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: oneshot::Receiver<Option<i32>>,
}

impl ProcessHandle {
    /// True once the monitor has reported the exit
    fn has_exited(&mut self) -> bool {
        !matches!(self.exited.try_recv(), Err(TryRecvError::Empty))
    }

    /// SIGTERM, then kill once `grace` has elapsed
    async fn terminate(mut self, service: &str, grace: Duration) {
        if let Ok(code) = self.exited.try_recv() {
            debug!(service, generation = self.generation, ?code, "Process already exited");
            return;
        }

        self.signal_terminate(service);

        match tokio::time::timeout(grace, &mut self.exited).await {
            Ok(code) => {
                info!(service, code = ?code.ok().flatten(), "Service process exited gracefully");
            }
            Err(_) => {
                warn!(
                    service,
                    grace_period_secs = grace.as_secs_f64(),
                    "Grace period exceeded, sending SIGKILL"
                );
                #[cfg(unix)]
                {
                    if let Some(pid) = self.pid {
                        unsafe {
                            libc::kill(-(pid as i32), libc::SIGKILL);
                        }
                    }
                }
                if let Some(kill) = self.kill_tx.take() {
                    let _ = kill.send(());
                }
                let _ = (&mut self.exited).await;
            }
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self, service: &str) {
        if let Some(pid) = self.pid {
            info!(service, pid, "Sending SIGTERM to service");
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self, service: &str) {
        info!(service, "Killing service process");
        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(());
        }
    }
}

struct Runtime {
    status: ServiceStatus,
    restarts: u32,
    process: Option<ProcessHandle>,
    generation: u64,
    launches: u64,
    /// Set by shutdown; no process is launched afterwards
    shutting_down: bool,
}

/// Owns one service's runtime state and performs its operations.
///
/// Constructed behind an `Arc` because the exit event task holds a weak
/// reference back to it.
pub struct Supervisor {
    spec: ServiceSpec,
    working_dir: PathBuf,
    git: Arc<dyn GitSource>,
    proxy: Arc<dyn ProxyPublisher>,
    options: SupervisorOptions,
    ops: tokio::sync::Mutex<()>,
    runtime: Mutex<Runtime>,
    logs: Arc<LogBuffer>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Supervisor {
    /// Create a supervisor in `Uninitialized` state and start its event task.
    /// Must be called within a tokio runtime.
    pub fn new(
        spec: ServiceSpec,
        working_dir: PathBuf,
        git: Arc<dyn GitSource>,
        proxy: Arc<dyn ProxyPublisher>,
        options: SupervisorOptions,
    ) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            spec,
            working_dir,
            git,
            proxy,
            options,
            ops: tokio::sync::Mutex::new(()),
            runtime: Mutex::new(Runtime {
                status: ServiceStatus::Uninitialized,
                restarts: 0,
                process: None,
                generation: 0,
                launches: 0,
                shutting_down: false,
            }),
            logs: Arc::new(LogBuffer::new(options.max_log_lines)),
            events,
        });

        tokio::spawn(run_events(Arc::downgrade(&supervisor), rx));
        supervisor
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn status(&self) -> ServiceStatus {
        self.runtime.lock().status
    }

    pub fn restarts(&self) -> u32 {
        self.runtime.lock().restarts
    }

    /// Total number of process launches, including restarts
    pub fn launches(&self) -> u64 {
        self.runtime.lock().launches
    }

    pub fn pid(&self) -> Option<u32> {
        self.runtime.lock().process.as_ref().and_then(|p| p.pid)
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lines()
    }

    /// Retained output plus the count of lines produced so far
    pub fn log_snapshot(&self) -> (Vec<String>, u64) {
        self.logs.snapshot()
    }

    pub fn summary(&self) -> ServiceSummary {
        let runtime = self.runtime.lock();
        ServiceSummary {
            name: self.spec.name.clone(),
            status: runtime.status,
            restarts: runtime.restarts,
        }
    }

    pub fn info(&self) -> ServiceInfo {
        let (status, restarts, pid) = {
            let runtime = self.runtime.lock();
            (
                runtime.status,
                runtime.restarts,
                runtime.process.as_ref().and_then(|p| p.pid),
            )
        };
        ServiceInfo {
            name: self.spec.name.clone(),
            status,
            restarts,
            path: self.working_dir.display().to_string(),
            pid,
            config: self.spec.redacted(),
            logs: self.logs.lines(),
        }
    }

    /// Clone the repository, or pull if a checkout already exists
    pub async fn init(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.init_locked().await
    }

    /// Run the build command in the checkout
    pub async fn build(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.ensure_active()?;
        self.build_locked().await
    }

    pub async fn start(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.start_locked().await
    }

    /// Idempotent; always leaves the service without a process
    pub async fn stop(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.stop_locked().await
    }

    pub async fn restart(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.ensure_active()?;
        self.stop_locked().await?;
        self.start_locked().await
    }

    /// Stop, fetch latest source, build and start again.
    /// A failed build leaves the service stopped.
    pub async fn update(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.ensure_active()?;
        info!(service = %self.spec.name, "Updating service");
        self.stop_locked().await?;
        self.init_locked().await?;
        self.build_locked().await?;
        self.start_locked().await
    }

    /// Init, build and start as one exclusive step
    pub async fn provision(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.init_locked().await?;
        self.build_locked().await?;
        self.start_locked().await
    }

    /// Stop and mark removed. No operation succeeds afterwards.
    pub async fn retire(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        let result = self.stop_locked().await;
        self.runtime.lock().status = ServiceStatus::Removed;
        info!(service = %self.spec.name, "Service removed");
        result
    }

    /// Stop for good as the daemon exits. Operations still waiting for the
    /// lock fail afterwards instead of launching again.
    pub async fn shutdown(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.runtime.lock().shutting_down = true;
        self.stop_locked().await
    }

    fn ensure_active(&self) -> Result<()> {
        let runtime = self.runtime.lock();
        if runtime.status == ServiceStatus::Removed {
            return Err(HotifyError::Removed(self.spec.name.clone()));
        }
        if runtime.shutting_down {
            return Err(HotifyError::ShuttingDown(self.spec.name.clone()));
        }
        Ok(())
    }

    /// Drop the handle of a process that exited while its exit event is
    /// still queued, so the next launch supersedes that event.
    fn reap_exited(&self) -> bool {
        let mut runtime = self.runtime.lock();
        let exited = runtime
            .process
            .as_mut()
            .map_or(true, |process| process.has_exited());
        if exited {
            runtime.status = ServiceStatus::Stopped;
            runtime.process = None;
        }
        exited
    }

    async fn init_locked(&self) -> Result<()> {
        self.ensure_active()?;

        let exists = tokio::fs::try_exists(&self.working_dir)
            .await
            .unwrap_or(false);

        if exists {
            self.git.pull(&self.working_dir).await?;
        } else {
            tokio::fs::create_dir_all(&self.working_dir).await?;
            if let Err(e) = self.git.clone_repo(&self.spec.repo, &self.working_dir).await {
                // A leftover empty directory would make the next attempt pull
                if let Err(rm) = tokio::fs::remove_dir_all(&self.working_dir).await {
                    warn!(service = %self.spec.name, error = %rm, "Failed to clean up checkout");
                }
                return Err(e);
            }
        }

        let mut runtime = self.runtime.lock();
        if runtime.status == ServiceStatus::Uninitialized {
            runtime.status = ServiceStatus::Stopped;
        }
        info!(service = %self.spec.name, "Service source ready");
        Ok(())
    }

    async fn build_locked(&self) -> Result<()> {
        let build = self.spec.build.trim();
        if build.is_empty() {
            debug!(service = %self.spec.name, "No build command");
            return Ok(());
        }

        info!(service = %self.spec.name, command = %build, "Building service");
        let output = Command::new("sh")
            .arg("-c")
            .arg(build)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| HotifyError::Process {
                command: build.to_string(),
                source,
            })?;

        if !output.status.success() {
            let output_text = combined_output(&output);
            error!(service = %self.spec.name, status = %output.status, "Build failed");
            return Err(HotifyError::Build {
                status: output.status.to_string(),
                output: output_text,
            });
        }

        info!(service = %self.spec.name, "Build finished");
        Ok(())
    }

    async fn start_locked(&self) -> Result<()> {
        self.ensure_active()?;

        let mut stale = false;
        if self.status() == ServiceStatus::Running {
            if !self.reap_exited() {
                debug!(service = %self.spec.name, "Service already running");
                return Ok(());
            }
            debug!(service = %self.spec.name, "Process exited before its exit was handled");
            stale = true;
        }

        let published = self.publish_route().await?;

        if let Err(e) = self.launch() {
            error!(service = %self.spec.name, error = %e, "Failed to launch service");
            if published || stale {
                if let Err(route_err) = self.withdraw_route().await {
                    warn!(service = %self.spec.name, error = %route_err, "Failed to withdraw route");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn stop_locked(&self) -> Result<()> {
        let handle = {
            let mut runtime = self.runtime.lock();
            if runtime.status == ServiceStatus::Running {
                runtime.status = ServiceStatus::Stopped;
            }
            runtime.process.take()
        };

        if handle.is_some() {
            info!(service = %self.spec.name, "Stopping service");
        }

        let route = self.withdraw_route().await;

        if let Some(handle) = handle {
            handle
                .terminate(&self.spec.name, self.options.stop_timeout)
                .await;
        }

        route
    }

    /// Spawn the exec command and its monitor. Returns once spawned.
    fn launch(&self) -> Result<()> {
        if self.runtime.lock().shutting_down {
            return Err(HotifyError::ShuttingDown(self.spec.name.clone()));
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.spec.exec)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so stop reaches the shell's children too
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| HotifyError::Process {
            command: self.spec.exec.clone(),
            source,
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            self.capture(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.capture(stderr);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();

        let generation = {
            let mut runtime = self.runtime.lock();
            runtime.generation += 1;
            runtime.launches += 1;
            runtime.status = ServiceStatus::Running;
            runtime.process = Some(ProcessHandle {
                pid,
                generation: runtime.generation,
                kill_tx: Some(kill_tx),
                exited: exited_rx,
            });
            runtime.generation
        };

        info!(service = %self.spec.name, pid = ?pid, generation, "Service process spawned");

        tokio::spawn(monitor(
            child,
            self.spec.name.clone(),
            generation,
            kill_rx,
            exited_tx,
            self.events.clone(),
        ));
        Ok(())
    }

    fn capture<R>(&self, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logs = Arc::clone(&self.logs);
        let service = self.spec.name.clone();
        tokio::spawn(async move {
            let mut segments = BufReader::new(stream).split(b'\n');
            loop {
                match segments.next_segment().await {
                    Ok(Some(segment)) => {
                        let line = String::from_utf8_lossy(&segment);
                        let line = line.trim_end_matches('\r');
                        debug!(service = %service, "{}", line);
                        logs.push(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(service = %service, error = %e, "Output stream closed");
                        break;
                    }
                }
            }
        });
    }

    /// Publish the proxy route if configured and absent.
    /// Returns whether this call added it.
    async fn publish_route(&self) -> Result<bool> {
        let Some(rule) = &self.spec.proxy else {
            return Ok(false);
        };
        let id = route_id(&rule.match_rule);
        if self.proxy.route_exists(&id).await {
            return Ok(false);
        }
        self.proxy
            .add_route(&id, &rule.match_rule, &rule.upstream)
            .await?;
        info!(service = %self.spec.name, route = %id, match_rule = %rule.match_rule, "Route published");
        Ok(true)
    }

    async fn withdraw_route(&self) -> Result<()> {
        let Some(rule) = &self.spec.proxy else {
            return Ok(());
        };
        let id = route_id(&rule.match_rule);
        if !self.proxy.route_exists(&id).await {
            return Ok(());
        }
        self.proxy.delete_route(&id).await?;
        info!(service = %self.spec.name, route = %id, "Route withdrawn");
        Ok(())
    }

    async fn handle_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Exited { generation, code } => self.on_exit(generation, code).await,
        }
    }

    async fn on_exit(&self, generation: u64, code: Option<i32>) {
        let _ops = self.ops.lock().await;

        let (decision, restarts) = {
            let runtime = self.runtime.lock();
            (
                decide_exit(
                    runtime.status,
                    runtime.generation,
                    generation,
                    runtime.restarts,
                    &self.spec,
                ),
                runtime.restarts,
            )
        };

        match decision {
            ExitDecision::Expected => {
                debug!(service = %self.spec.name, generation, ?code, "Expected exit");
            }
            ExitDecision::Finalize => {
                info!(service = %self.spec.name, ?code, "Service exited");
                self.finalize_stopped().await;
            }
            ExitDecision::GiveUp => {
                error!(
                    service = %self.spec.name,
                    ?code,
                    restarts,
                    "Service keeps crashing, max restarts reached"
                );
                self.finalize_stopped().await;
            }
            ExitDecision::Relaunch => {
                let restarts = {
                    let mut runtime = self.runtime.lock();
                    runtime.restarts += 1;
                    runtime.restarts
                };
                warn!(service = %self.spec.name, ?code, restarts, "Service crashed, restarting");
                if let Err(e) = self.launch() {
                    error!(service = %self.spec.name, error = %e, "Failed to restart service");
                    self.finalize_stopped().await;
                }
            }
        }
    }

    async fn finalize_stopped(&self) {
        {
            let mut runtime = self.runtime.lock();
            runtime.status = ServiceStatus::Stopped;
            runtime.process = None;
        }
        if let Err(e) = self.withdraw_route().await {
            warn!(service = %self.spec.name, error = %e, "Failed to withdraw route");
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.spec.name)
            .field("status", &self.status())
            .finish()
    }
}

async fn run_events(
    supervisor: Weak<Supervisor>,
    mut rx: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        supervisor.handle_event(event).await;
    }
}

/// Wait for the child to exit, or kill it on request, then report
async fn monitor(
    mut child: Child,
    service: String,
    generation: u64,
    mut kill_rx: oneshot::Receiver<()>,
    exited_tx: oneshot::Sender<Option<i32>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = &mut kill_rx => None,
    };

    let status = match waited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                warn!(service = %service, error = %e, "Failed to kill service process");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => {
            debug!(service = %service, generation, %status, "Service process exited");
            status.code()
        }
        Err(e) => {
            warn!(service = %service, error = %e, "Error waiting for service process");
            None
        }
    };

    let _ = exited_tx.send(code);
    let _ = events.send(SupervisorEvent::Exited { generation, code });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyRule;
    use crate::proxy::RouteTable;
    use async_trait::async_trait;
    use std::time::Instant;

    /// Git stand-in that leaves the (already created) directory as is
    struct NoopGit;

    #[async_trait]
    impl GitSource for NoopGit {
        async fn clone_repo(&self, _url: &str, _dest: &Path) -> Result<()> {
            Ok(())
        }

        async fn pull(&self, _dest: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn spec(exec: &str) -> ServiceSpec {
        ServiceSpec {
            name: "app".to_string(),
            repo: "https://example.com/app.git".to_string(),
            exec: exec.to_string(),
            ..Default::default()
        }
    }

    fn supervisor(
        dir: &Path,
        spec: ServiceSpec,
        proxy: Arc<RouteTable>,
        stop_timeout: Duration,
    ) -> Arc<Supervisor> {
        Supervisor::new(
            spec,
            dir.join("app"),
            Arc::new(NoopGit),
            proxy,
            SupervisorOptions {
                stop_timeout,
                max_log_lines: 100,
            },
        )
    }

    async fn wait_for_status(sup: &Supervisor, status: ServiceStatus) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while sup.status() != status {
            assert!(Instant::now() < deadline, "timed out waiting for {:?}", status);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_decide_exit() {
        let mut spec = spec("true");
        spec.restart = true;
        spec.max_restarts = 2;

        assert_eq!(
            decide_exit(ServiceStatus::Stopped, 1, 1, 0, &spec),
            ExitDecision::Expected
        );
        assert_eq!(
            decide_exit(ServiceStatus::Running, 2, 1, 0, &spec),
            ExitDecision::Expected
        );
        assert_eq!(
            decide_exit(ServiceStatus::Running, 1, 1, 0, &spec),
            ExitDecision::Relaunch
        );
        assert_eq!(
            decide_exit(ServiceStatus::Running, 3, 3, 2, &spec),
            ExitDecision::GiveUp
        );

        spec.restart = false;
        assert_eq!(
            decide_exit(ServiceStatus::Running, 1, 1, 0, &spec),
            ExitDecision::Finalize
        );
        assert_eq!(
            decide_exit(ServiceStatus::Removed, 1, 1, 0, &spec),
            ExitDecision::Expected
        );
    }

    #[tokio::test]
    async fn test_provision_runs_build_and_starts() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec("sleep 30");
        spec.build = "echo built > marker".to_string();
        let sup = supervisor(dir.path(), spec, Arc::new(RouteTable::new()), Duration::from_secs(2));

        assert_eq!(sup.status(), ServiceStatus::Uninitialized);
        sup.provision().await.unwrap();
        assert_eq!(sup.status(), ServiceStatus::Running);
        assert!(sup.pid().is_some());
        assert!(dir.path().join("app/marker").exists());

        sup.stop().await.unwrap();
        assert_eq!(sup.status(), ServiceStatus::Stopped);
        assert!(sup.pid().is_none());
    }

    #[tokio::test]
    async fn test_build_failure_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec("sleep 30");
        spec.build = "echo compiling; echo broken >&2; exit 3".to_string();
        let sup = supervisor(dir.path(), spec, Arc::new(RouteTable::new()), Duration::from_secs(1));

        let err = sup.provision().await.unwrap_err();
        match err {
            HotifyError::Build { output, .. } => {
                assert!(output.contains("compiling"));
                assert!(output.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sup.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            spec("sleep 30"),
            Arc::new(RouteTable::new()),
            Duration::from_secs(2),
        );
        sup.provision().await.unwrap();

        sup.stop().await.unwrap();
        sup.stop().await.unwrap();
        assert_eq!(sup.status(), ServiceStatus::Stopped);
        assert!(sup.pid().is_none());
        assert_eq!(sup.launches(), 1);
    }

    #[tokio::test]
    async fn test_exit_without_restart_stops_once() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            spec("exit 1"),
            Arc::new(RouteTable::new()),
            Duration::from_secs(1),
        );
        sup.provision().await.unwrap();

        wait_for_status(&sup, ServiceStatus::Stopped).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sup.launches(), 1);
        assert_eq!(sup.restarts(), 0);
        assert!(sup.pid().is_none());
    }

    #[tokio::test]
    async fn test_crash_loop_gives_up_after_max_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec("echo crashing; exit 1");
        spec.restart = true;
        spec.max_restarts = 2;
        let sup = supervisor(dir.path(), spec, Arc::new(RouteTable::new()), Duration::from_secs(1));
        sup.provision().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while sup.launches() < 3 || sup.status() != ServiceStatus::Stopped {
            assert!(Instant::now() < deadline, "crash loop did not settle");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(sup.launches(), 3);
        assert_eq!(sup.restarts(), 2);
        assert_eq!(sup.status(), ServiceStatus::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_process_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            spec("trap '' TERM; while true; do sleep 1; done"),
            Arc::new(RouteTable::new()),
            Duration::from_millis(500),
        );
        sup.provision().await.unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        sup.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(sup.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_route_follows_running_state() {
        let dir = tempfile::tempdir().unwrap();
        let routes = Arc::new(RouteTable::new());
        let mut spec = spec("sleep 30");
        spec.proxy = Some(ProxyRule {
            match_rule: "app.example.com".to_string(),
            upstream: "localhost:8080".to_string(),
        });
        let sup = supervisor(dir.path(), spec, Arc::clone(&routes), Duration::from_secs(2));
        let id = route_id("app.example.com");

        sup.provision().await.unwrap();
        assert_eq!(routes.get(&id).unwrap().upstream, "localhost:8080");

        sup.stop().await.unwrap();
        assert!(routes.get(&id).is_none());

        sup.start().await.unwrap();
        assert!(routes.get(&id).is_some());

        sup.retire().await.unwrap();
        assert!(routes.is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure_withdraws_route() {
        let dir = tempfile::tempdir().unwrap();
        let routes = Arc::new(RouteTable::new());
        let mut spec = spec("sleep 30");
        spec.proxy = Some(ProxyRule {
            match_rule: "app.example.com".to_string(),
            upstream: "localhost:8080".to_string(),
        });
        // Working directory is never created, so spawning fails
        let sup = supervisor(dir.path(), spec, Arc::clone(&routes), Duration::from_secs(1));

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, HotifyError::Process { .. }));
        assert!(routes.is_empty());
        assert_ne!(sup.status(), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_output_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            spec("echo hello; echo oops >&2; sleep 30"),
            Arc::new(RouteTable::new()),
            Duration::from_secs(2),
        );
        sup.provision().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sup.logs().len() < 2 {
            assert!(Instant::now() < deadline, "output not captured");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let logs = sup.logs();
        assert!(logs.contains(&"hello".to_string()));
        assert!(logs.contains(&"oops".to_string()));

        let info = sup.info();
        assert_eq!(info.status, ServiceStatus::Running);
        assert!(info.path.ends_with("app"));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_removed_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            spec("sleep 30"),
            Arc::new(RouteTable::new()),
            Duration::from_secs(1),
        );
        sup.provision().await.unwrap();
        sup.retire().await.unwrap();

        assert_eq!(sup.status(), ServiceStatus::Removed);
        assert!(matches!(sup.start().await, Err(HotifyError::Removed(_))));
        assert!(matches!(sup.update().await, Err(HotifyError::Removed(_))));
        assert!(sup.stop().await.is_ok());
        assert_eq!(sup.status(), ServiceStatus::Removed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_blocks_queued_update() {
        let dir = tempfile::tempdir().unwrap();
        let routes = Arc::new(RouteTable::new());
        let mut spec = spec("trap '' TERM; while true; do sleep 1; done");
        spec.proxy = Some(ProxyRule {
            match_rule: "app.example.com".to_string(),
            upstream: "localhost:8080".to_string(),
        });
        let sup = supervisor(dir.path(), spec, Arc::clone(&routes), Duration::from_millis(800));
        sup.provision().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let shutdown = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        // queued behind shutdown on the operation lock
        let update = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.update().await }
        });

        shutdown.await.unwrap().unwrap();
        let err = update.await.unwrap().unwrap_err();
        assert!(matches!(err, HotifyError::ShuttingDown(_)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sup.status(), ServiceStatus::Stopped);
        assert!(sup.pid().is_none());
        assert_eq!(sup.launches(), 1);
        assert!(routes.is_empty());

        assert!(matches!(sup.start().await, Err(HotifyError::ShuttingDown(_))));
        assert!(matches!(sup.restart().await, Err(HotifyError::ShuttingDown(_))));
        assert!(routes.is_empty());
    }

    #[tokio::test]
    async fn test_start_relaunches_when_exit_is_still_queued() {
        let dir = tempfile::tempdir().unwrap();
        // first run exits at once, later runs stay up
        let sup = supervisor(
            dir.path(),
            spec("if [ -f started ]; then sleep 30; else touch started; fi"),
            Arc::new(RouteTable::new()),
            Duration::from_secs(2),
        );
        sup.init().await.unwrap();

        {
            // holding the lock keeps the exit event from being handled
            let _ops = sup.ops.lock().await;
            sup.start_locked().await.unwrap();

            let deadline = Instant::now() + Duration::from_secs(5);
            while !dir.path().join("app/started").exists() {
                assert!(Instant::now() < deadline, "first run never started");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(sup.status(), ServiceStatus::Running);

            sup.start_locked().await.unwrap();
            assert_eq!(sup.launches(), 2);
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sup.status(), ServiceStatus::Running);
        assert!(sup.pid().is_some());
        assert_eq!(sup.restarts(), 0);

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_debug_shows_name_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            spec("true"),
            Arc::new(RouteTable::new()),
            Duration::from_secs(1),
        );
        let debug = format!("{:?}", sup);
        assert!(debug.contains("\"app\""));
        assert!(debug.contains("Uninitialized"));
    }

    #[tokio::test]
    async fn test_update_relaunches() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            spec("sleep 30"),
            Arc::new(RouteTable::new()),
            Duration::from_secs(2),
        );
        sup.provision().await.unwrap();
        let first = sup.pid();

        sup.update().await.unwrap();
        assert_eq!(sup.status(), ServiceStatus::Running);
        assert_eq!(sup.launches(), 2);
        assert_ne!(sup.pid(), first);
        // the old process's exit is not counted as a crash
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sup.restarts(), 0);
        assert_eq!(sup.status(), ServiceStatus::Running);

        sup.stop().await.unwrap();
    }
}
