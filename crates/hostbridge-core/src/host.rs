//! Launching the hosted runtime and supervising it until it ends.
//!
//! An `ExecutionHost` owns at most one live `RuntimeProcessHandle`. `start`
//! checks its preconditions before any state is entered, moves the handle through
//! `starting` while the backend checks native libraries and the entry point, and
//! hands the running process to a supervisor thread. The supervisor forwards
//! lifecycle signals, enforces the termination grace period, releases the
//! bridges and only then publishes `exited` or `crashed`.

use crate::crash::CrashReport;
use crate::lifecycle::{validate_transition, RuntimeState};
use crate::provision::ProvisioningManager;
use crate::CoreError;
use crossbeam_channel::{Receiver, Sender};
use hostbridge_runtime::{
    Bridges, HostedContext, HostedProcess, LaunchSpec, LifecycleSignal, LogTail, RuntimeBackend,
    RuntimeError, Termination,
};
use hostbridge_schema::{SessionConfig, Version};
use hostbridge_store::BundleRecord;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long `terminate` waits past the grace period for the forced kill to land.
const KILL_MARGIN: Duration = Duration::from_secs(2);
/// How long `start` waits for the render thread to build the surface context.
const SURFACE_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub bundle_id: String,
    /// `None` accepts whichever version is installed.
    pub version: Option<Version>,
    /// Appended to the bundle's own arguments.
    pub extra_args: Vec<String>,
}

impl LaunchRequest {
    pub fn new(bundle_id: &str, version: Option<Version>) -> Self {
        Self {
            bundle_id: bundle_id.to_owned(),
            version,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    pub crash_log_lines: usize,
    pub termination_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            crash_log_lines: 200,
            termination_grace: Duration::from_secs(3),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl HostConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            crash_log_lines: config.crash_log_lines,
            termination_grace: config.termination_grace(),
            ..Self::default()
        }
    }
}

enum Control {
    Exit { grace: Duration },
}

struct HandleState {
    state: RuntimeState,
    termination: Option<Termination>,
    crash: Option<CrashReport>,
}

/// Observable lifecycle of one hosted runtime.
pub struct RuntimeProcessHandle {
    bundle_id: String,
    version: String,
    grace: Duration,
    inner: Mutex<HandleState>,
    changed: Condvar,
    subscribers: Mutex<Vec<Sender<RuntimeState>>>,
    control: Sender<Control>,
}

impl std::fmt::Debug for RuntimeProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeProcessHandle")
            .field("bundle_id", &self.bundle_id)
            .field("version", &self.version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RuntimeProcessHandle {
    fn new(bundle: &BundleRecord, grace: Duration, control: Sender<Control>) -> Self {
        Self {
            bundle_id: bundle.id.to_string(),
            version: bundle.version.to_string(),
            grace,
            inner: Mutex::new(HandleState {
                state: RuntimeState::NotStarted,
                termination: None,
                crash: None,
            }),
            changed: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
            control,
        }
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn state(&self) -> RuntimeState {
        lock(&self.inner).state
    }

    /// How the runtime ended, once it has.
    pub fn termination(&self) -> Option<Termination> {
        lock(&self.inner).termination.clone()
    }

    pub fn crash_report(&self) -> Option<CrashReport> {
        lock(&self.inner).crash.clone()
    }

    /// Transitions made from now on, in order.
    pub fn events(&self) -> Receiver<RuntimeState> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let state = lock(&self.inner);
        if state.state.is_terminal() {
            let _ = tx.send(state.state);
        } else {
            lock(&self.subscribers).push(tx);
        }
        rx
    }

    /// Block until the runtime is `exited` or `crashed`, or `timeout` elapses.
    pub fn wait_terminal(&self, timeout: Duration) -> Option<RuntimeState> {
        let guard = lock(&self.inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| !s.state.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        guard.state.is_terminal().then_some(guard.state)
    }

    /// Ask the runtime to exit; it is force-terminated after the session's grace period.
    pub fn request_exit(&self) {
        self.send_exit(self.grace);
    }

    /// Ask the runtime to exit, force-terminate it after `grace`, and wait for the
    /// terminal state.
    pub fn terminate(&self, grace: Duration) -> RuntimeState {
        if self.state().is_terminal() {
            return self.state();
        }
        self.send_exit(grace);
        self.wait_terminal(grace + KILL_MARGIN)
            .unwrap_or_else(|| self.state())
    }

    fn send_exit(&self, grace: Duration) {
        if self.control.send(Control::Exit { grace }).is_err() {
            debug!("{}: no supervisor to receive the exit request", self.bundle_id);
        }
    }

    fn transition(&self, to: RuntimeState) -> Result<(), CoreError> {
        self.finish(to, None, None)
    }

    /// Move to `to`, recording how the runtime ended when it did.
    fn finish(
        &self,
        to: RuntimeState,
        termination: Option<Termination>,
        crash: Option<CrashReport>,
    ) -> Result<(), CoreError> {
        let mut state = lock(&self.inner);
        validate_transition(state.state, to)?;
        info!("{}@{}: {} -> {to}", self.bundle_id, self.version, state.state);
        state.state = to;
        if termination.is_some() {
            state.termination = termination;
        }
        if crash.is_some() {
            state.crash = crash;
        }
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(to).is_ok());
        if to.is_terminal() {
            subscribers.clear();
        }
        drop(subscribers);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }
}

/// Launches hosted runtimes against installed bundles, one at a time.
pub struct ExecutionHost {
    provisioning: Arc<ProvisioningManager>,
    backend: Box<dyn RuntimeBackend>,
    config: HostConfig,
    crash_dir: Option<PathBuf>,
    current: Mutex<Option<Arc<RuntimeProcessHandle>>>,
}

impl ExecutionHost {
    pub fn new(
        provisioning: Arc<ProvisioningManager>,
        backend: Box<dyn RuntimeBackend>,
        config: HostConfig,
    ) -> Self {
        Self {
            provisioning,
            backend,
            config,
            crash_dir: None,
            current: Mutex::new(None),
        }
    }

    /// Also write every crash report as JSON into `dir`.
    #[must_use]
    pub fn with_crash_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.crash_dir = Some(dir.into());
        self
    }

    pub fn provisioning(&self) -> &ProvisioningManager {
        &self.provisioning
    }

    pub fn current(&self) -> Option<Arc<RuntimeProcessHandle>> {
        lock(&self.current).clone()
    }

    /// Launch the hosted runtime for `request` with `bridges` attached.
    ///
    /// Rejected without entering any state when a runtime is still live, when no
    /// usable surface context exists, or when the requested bundle is not installed. Native
    /// library and entry point problems move the new handle from `starting` to
    /// `crashed` and return `CoreError::Incompatible`. The bridges are released on
    /// every failure path.
    pub fn start(
        &self,
        request: &LaunchRequest,
        mut bridges: Bridges,
    ) -> Result<Arc<RuntimeProcessHandle>, CoreError> {
        let mut current = lock(&self.current);
        if let Some(ref live) = *current {
            if !live.state().is_terminal() {
                bridges.release();
                return Err(CoreError::AlreadyRunning(live.bundle_id.clone()));
            }
        }
        if !bridges.graphics.surface_ready(SURFACE_WAIT) {
            bridges.release();
            return Err(CoreError::NoSurface);
        }
        let bundle = match self
            .provisioning
            .require_installed(&request.bundle_id, request.version.as_ref())
        {
            Ok(bundle) => bundle,
            Err(e) => {
                bridges.release();
                return Err(e.into());
            }
        };

        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let handle = Arc::new(RuntimeProcessHandle::new(
            &bundle,
            self.config.termination_grace,
            control_tx,
        ));
        *current = Some(Arc::clone(&handle));
        handle.transition(RuntimeState::Starting)?;

        let spec = launch_spec(&bundle, request);
        if let Err(e) = self.backend.check(&spec) {
            return Err(self.fail_start(&handle, &mut bridges, e, Vec::new()));
        }

        let (lifecycle_tx, lifecycle_rx) = crossbeam_channel::unbounded();
        let log = LogTail::new(self.config.crash_log_lines);
        let ctx = HostedContext::new(Arc::new(bridges.boundary(lifecycle_tx)), log.clone());
        let process = match self.backend.spawn(&spec, ctx) {
            Ok(process) => process,
            Err(e) => return Err(self.fail_start(&handle, &mut bridges, e, log.lines())),
        };
        handle.transition(RuntimeState::Running)?;

        let supervisor = Supervisor {
            handle: Arc::clone(&handle),
            process,
            bridges,
            lifecycle: lifecycle_rx,
            control: control_rx,
            log,
            poll: self.config.poll_interval,
            crash_dir: self.crash_dir.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("supervise-{}", handle.bundle_id))
            .spawn(move || supervisor.run());
        if let Err(e) = spawned {
            // The supervisor, and with it the process and bridges, is gone.
            handle.finish(RuntimeState::Crashed, None, None)?;
            return Err(e.into());
        }
        Ok(handle)
    }

    fn fail_start(
        &self,
        handle: &RuntimeProcessHandle,
        bridges: &mut Bridges,
        error: RuntimeError,
        log_tail: Vec<String>,
    ) -> CoreError {
        let error = CoreError::from(error);
        warn!("{}@{} failed to start: {error}", handle.bundle_id, handle.version);
        bridges.release();
        let report = CrashReport::new(
            &handle.bundle_id,
            &handle.version,
            error.to_string(),
            None,
            log_tail,
        );
        save_report(self.crash_dir.as_deref(), &report);
        if let Err(e) = handle.finish(RuntimeState::Crashed, None, Some(report)) {
            warn!("{e}");
        }
        error
    }

    /// Host backgrounded or terminating: stop the current runtime, if live, and
    /// return its final state.
    pub fn shutdown(&self, grace: Duration) -> Option<RuntimeState> {
        let handle = self.current()?;
        if handle.state().is_terminal() {
            return Some(handle.state());
        }
        info!("shutting down hosted runtime {}", handle.bundle_id);
        Some(handle.terminate(grace))
    }
}

fn launch_spec(bundle: &BundleRecord, request: &LaunchRequest) -> LaunchSpec {
    let mut args = bundle.args.clone();
    args.extend(request.extra_args.iter().cloned());
    LaunchSpec {
        bundle_id: bundle.id.to_string(),
        version: bundle.version.to_string(),
        bundle_root: bundle.install_path.clone().unwrap_or_default(),
        entry_point: bundle.entry_point.clone(),
        args,
        libraries: bundle.libraries.clone(),
    }
}

fn save_report(dir: Option<&Path>, report: &CrashReport) {
    let Some(dir) = dir else { return };
    match report.save(dir) {
        Ok(path) => info!("crash report written to {}", path.display()),
        Err(e) => warn!("failed to write crash report: {e}"),
    }
}

struct Supervisor {
    handle: Arc<RuntimeProcessHandle>,
    process: Box<dyn HostedProcess>,
    bridges: Bridges,
    lifecycle: Receiver<LifecycleSignal>,
    control: Receiver<Control>,
    log: LogTail,
    poll: Duration,
    crash_dir: Option<PathBuf>,
}

impl Supervisor {
    fn run(mut self) {
        let id = self.handle.bundle_id.clone();
        let mut host_requested = false;
        let mut hosted_quit = false;
        let mut deadline: Option<Instant> = None;

        let ended = loop {
            hosted_quit |= self.drain_signals(&id);

            while let Ok(Control::Exit { grace }) = self.control.try_recv() {
                if !host_requested {
                    host_requested = true;
                    debug!("{id}: exit requested by host, grace {grace:?}");
                    if let Err(e) = self.process.request_exit() {
                        warn!("{id}: exit request failed: {e}");
                    }
                }
                let at = Instant::now() + grace;
                deadline = Some(deadline.map_or(at, |d| d.min(at)));
            }

            match self.process.try_wait() {
                Ok(Some(termination)) => break Ok(termination),
                Ok(None) => {}
                Err(e) => break Err(e),
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("{id}: no exit within the grace period, force-terminating");
                if let Err(e) = self.process.kill() {
                    warn!("{id}: force-termination failed: {e}");
                }
                deadline = None;
            }
            std::thread::sleep(self.poll);
        };
        hosted_quit |= self.drain_signals(&id);

        let (clean, identity, termination) = match ended {
            Ok(t) => {
                let clean = t.is_clean()
                    || host_requested
                    || (hosted_quit && matches!(t, Termination::Exited { .. }));
                (clean, t.to_string(), Some(t))
            }
            Err(e) => (false, format!("supervision failed: {e}"), None),
        };

        // Bridges go before the terminal state becomes visible.
        self.bridges.release();

        let report = if clean {
            None
        } else {
            let report = CrashReport::new(
                &id,
                &self.handle.version,
                identity,
                termination.clone(),
                self.log.lines(),
            );
            save_report(self.crash_dir.as_deref(), &report);
            Some(report)
        };
        let state = if clean {
            RuntimeState::Exited
        } else {
            RuntimeState::Crashed
        };
        if let Err(e) = self.handle.finish(state, termination, report) {
            warn!("{id}: {e}");
        }
    }

    /// Log pending lifecycle signals. Returns whether the hosted side asked to quit.
    fn drain_signals(&self, id: &str) -> bool {
        let mut quit = false;
        while let Ok(signal) = self.lifecycle.try_recv() {
            match signal {
                LifecycleSignal::Ready => debug!("{id}: hosted runtime ready"),
                LifecycleSignal::ExitRequested => {
                    info!("{id}: hosted runtime requested exit");
                    quit = true;
                }
                LifecycleSignal::Message { text } => info!("{id}: {text}"),
            }
        }
        quit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_spec_appends_request_args() {
        let entry = hostbridge_schema::ManifestEntry {
            id: "jre".into(),
            version: "17.0.8".parse().unwrap(),
            url: "file:///jre.tar".to_owned(),
            checksum: "a".repeat(64).parse().unwrap(),
            size: 1,
            format: None,
            tree_checksum: None,
            libraries: vec!["lib/libjvm.so".to_owned()],
            entry_point: Some("bin/java".to_owned()),
            args: vec!["-jar".to_owned(), "game.jar".to_owned()],
        };
        let mut bundle =
            BundleRecord::from_entry(&entry, hostbridge_store::BundleStatus::Installed);
        bundle.install_path = Some(PathBuf::from("/store/bundles/jre/17.0.8"));
        let mut request = LaunchRequest::new("jre", None);
        request.extra_args.push("--fullscreen".to_owned());

        let spec = launch_spec(&bundle, &request);
        assert_eq!(spec.bundle_root, PathBuf::from("/store/bundles/jre/17.0.8"));
        assert_eq!(spec.args, vec!["-jar", "game.jar", "--fullscreen"]);
        assert_eq!(spec.entry_point.as_deref(), Some("bin/java"));
    }

    #[test]
    fn handle_broadcasts_transitions() {
        let entry = hostbridge_schema::ManifestEntry {
            id: "jre".into(),
            version: "17.0.8".parse().unwrap(),
            url: "file:///jre.tar".to_owned(),
            checksum: "a".repeat(64).parse().unwrap(),
            size: 1,
            format: None,
            tree_checksum: None,
            libraries: vec![],
            entry_point: None,
            args: vec![],
        };
        let bundle = BundleRecord::from_entry(&entry, hostbridge_store::BundleStatus::Installed);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let handle = RuntimeProcessHandle::new(&bundle, Duration::from_secs(1), tx);
        let events = handle.events();

        handle.transition(RuntimeState::Starting).unwrap();
        handle.transition(RuntimeState::Running).unwrap();
        assert!(handle.transition(RuntimeState::Starting).is_err());
        handle
            .finish(
                RuntimeState::Exited,
                Some(Termination::Exited { code: 0 }),
                None,
            )
            .unwrap();

        let seen: Vec<_> = events.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                RuntimeState::Starting,
                RuntimeState::Running,
                RuntimeState::Exited
            ]
        );
        assert_eq!(
            handle.wait_terminal(Duration::ZERO),
            Some(RuntimeState::Exited)
        );
        assert_eq!(handle.termination(), Some(Termination::Exited { code: 0 }));
        assert_eq!(handle.events().try_recv().unwrap(), RuntimeState::Exited);
    }

    #[test]
    fn handle_debug_shows_bundle_and_state() {
        let entry = hostbridge_schema::ManifestEntry {
            id: "jre".into(),
            version: "17.0.8".parse().unwrap(),
            url: "file:///jre.tar".to_owned(),
            checksum: "b".repeat(64).parse().unwrap(),
            size: 1,
            format: None,
            tree_checksum: None,
            libraries: vec![],
            entry_point: None,
            args: vec![],
        };
        let bundle = BundleRecord::from_entry(&entry, hostbridge_store::BundleStatus::Installed);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let handle = RuntimeProcessHandle::new(&bundle, Duration::from_secs(1), tx);
        let shown = format!("{handle:?}");
        assert!(shown.contains("jre"));
        assert!(shown.contains("NotStarted"));
    }
}
