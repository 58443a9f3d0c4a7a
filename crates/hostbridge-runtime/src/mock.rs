use crate::backend::{HostedContext, HostedProcess, LaunchSpec, RuntimeBackend, Termination};
use crate::boundary::LifecycleSignal;
use crate::RuntimeError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Behaviour of the processes a `MockBackend` spawns.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// How a process ends on its own.
    pub outcome: Termination,
    /// `None` runs until an exit request.
    pub run_for: Option<Duration>,
    pub honor_exit_request: bool,
    pub log_lines: Vec<String>,
    /// Makes `check` fail with this reason.
    pub incompatible: Option<String>,
    pub spawn_error: Option<String>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            outcome: Termination::Exited { code: 0 },
            run_for: None,
            honor_exit_request: true,
            log_lines: Vec::new(),
            incompatible: None,
            spawn_error: None,
        }
    }
}

pub struct MockBackend {
    script: Mutex<MockScript>,
    spawns: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::with_script(MockScript::default())
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: MockScript) -> Self {
        Self {
            script: Mutex::new(script),
            spawns: AtomicUsize::new(0),
        }
    }

    pub fn set_script(&self, script: MockScript) {
        if let Ok(mut s) = self.script.lock() {
            *s = script;
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    fn script(&self) -> Result<MockScript, RuntimeError> {
        self.script
            .lock()
            .map(|s| s.clone())
            .map_err(|e| RuntimeError::SpawnFailed(format!("mutex poisoned: {e}")))
    }
}

impl RuntimeBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn check(&self, _spec: &LaunchSpec) -> Result<(), RuntimeError> {
        match self.script()?.incompatible {
            Some(reason) => Err(RuntimeError::Incompatible(reason)),
            None => Ok(()),
        }
    }

    fn spawn(
        &self,
        _spec: &LaunchSpec,
        ctx: HostedContext,
    ) -> Result<Box<dyn HostedProcess>, RuntimeError> {
        let script = self.script()?;
        if let Some(reason) = script.spawn_error {
            return Err(RuntimeError::SpawnFailed(reason));
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);
        for line in &script.log_lines {
            ctx.log.push(line.clone());
        }
        ctx.boundary.report_lifecycle_event(LifecycleSignal::Ready);
        Ok(Box::new(MockProcess {
            started: Instant::now(),
            script,
            ctx,
            done: None,
        }))
    }
}

struct MockProcess {
    started: Instant,
    script: MockScript,
    ctx: HostedContext,
    done: Option<Termination>,
}

impl HostedProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(0)
    }

    fn try_wait(&mut self) -> Result<Option<Termination>, RuntimeError> {
        if self.done.is_none() {
            if self.ctx.exit_requested() && self.script.honor_exit_request {
                self.done = Some(Termination::Exited { code: 0 });
            } else if self
                .script
                .run_for
                .is_some_and(|d| self.started.elapsed() >= d)
            {
                self.done = Some(self.script.outcome.clone());
            }
        }
        Ok(self.done.clone())
    }

    fn request_exit(&mut self) -> Result<(), RuntimeError> {
        self.ctx.exit_flag().store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&mut self) -> Result<(), RuntimeError> {
        if self.done.is_none() {
            self.done = Some(Termination::Killed);
        }
        Ok(())
    }
}
