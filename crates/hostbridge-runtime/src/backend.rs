use crate::boundary::Boundary;
use crate::logtail::LogTail;
use crate::prereq::{check_bundle, format_problems, host_abi};
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything a backend needs to start the hosted runtime of one bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchSpec {
    pub bundle_id: String,
    pub version: String,
    pub bundle_root: PathBuf,
    /// Relative to `bundle_root`.
    pub entry_point: Option<String>,
    pub args: Vec<String>,
    /// Native shared libraries relative to `bundle_root`.
    pub libraries: Vec<String>,
}

impl LaunchSpec {
    /// Directories holding the declared libraries, for the loader search path.
    pub fn library_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .libraries
            .iter()
            .filter_map(|lib| self.bundle_root.join(lib).parent().map(PathBuf::from))
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }
}

/// How a hosted runtime ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    Exited { code: i32 },
    Signaled { signal: i32 },
    Panicked { message: String },
    /// Force-terminated by the host after the grace period.
    Killed,
}

impl Termination {
    pub fn is_clean(&self) -> bool {
        matches!(self, Termination::Exited { code: 0 })
    }
}

fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGTERM => "SIGTERM",
        _ => "signal",
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited { code } => write!(f, "exit code {code}"),
            Termination::Signaled { signal } => write!(f, "{} ({signal})", signal_name(*signal)),
            Termination::Panicked { message } => write!(f, "uncaught panic: {message}"),
            Termination::Killed => write!(f, "force-terminated"),
        }
    }
}

/// What a hosted program sees: its boundary, its log, and whether the host wants it to stop.
#[derive(Clone)]
pub struct HostedContext {
    pub boundary: Arc<Boundary>,
    pub log: LogTail,
    exit_requested: Arc<AtomicBool>,
}

impl HostedContext {
    pub fn new(boundary: Arc<Boundary>, log: LogTail) -> Self {
        Self {
            boundary,
            log,
            exit_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit_requested)
    }
}

/// A running hosted runtime, owned by exactly one supervisor.
pub trait HostedProcess: Send {
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Non-blocking. `Some` once the runtime has terminated.
    fn try_wait(&mut self) -> Result<Option<Termination>, RuntimeError>;

    /// Ask the runtime to shut down. It may ignore the request.
    fn request_exit(&mut self) -> Result<(), RuntimeError>;

    fn kill(&mut self) -> Result<(), RuntimeError>;
}

pub trait RuntimeBackend: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Verify the bundle can run on this host before anything is started.
    fn check(&self, spec: &LaunchSpec) -> Result<(), RuntimeError> {
        let problems = check_bundle(
            &spec.bundle_root,
            &spec.libraries,
            spec.entry_point.as_deref(),
            host_abi(),
        );
        if problems.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::Incompatible(format_problems(&problems)))
        }
    }

    fn spawn(
        &self,
        spec: &LaunchSpec,
        ctx: HostedContext,
    ) -> Result<Box<dyn HostedProcess>, RuntimeError>;
}

pub fn select_backend(name: &str) -> Result<Box<dyn RuntimeBackend>, RuntimeError> {
    match name {
        "process" => Ok(Box::new(crate::process::ProcessBackend::new())),
        "mock" => Ok(Box::new(crate::mock::MockBackend::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
