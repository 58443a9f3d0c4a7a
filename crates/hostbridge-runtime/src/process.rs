use crate::backend::{HostedContext, HostedProcess, LaunchSpec, RuntimeBackend, Termination};
use crate::RuntimeError;
use std::ffi::OsString;
use std::process::{Child, Command, Stdio};

/// Runs the bundle's entry point as a child process.
///
/// The child inherits a loader search path covering the bundle's declared
/// library directories. Its stdout and stderr feed the log tail. Frames, input and
/// audio do not cross a process boundary; an out-of-process runtime renders
/// through its own window and the bridges stay idle.
#[derive(Debug, Default)]
pub struct ProcessBackend;

impl ProcessBackend {
    pub fn new() -> Self {
        Self
    }
}

fn loader_path(spec: &LaunchSpec) -> OsString {
    let mut paths: Vec<std::path::PathBuf> = spec.library_dirs();
    if let Some(existing) = std::env::var_os("LD_LIBRARY_PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths).unwrap_or_default()
}

impl RuntimeBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn available(&self) -> bool {
        true
    }

    fn spawn(
        &self,
        spec: &LaunchSpec,
        ctx: HostedContext,
    ) -> Result<Box<dyn HostedProcess>, RuntimeError> {
        let entry = spec.entry_point.as_deref().ok_or_else(|| {
            RuntimeError::SpawnFailed(format!(
                "bundle '{}' declares no entry point",
                spec.bundle_id
            ))
        })?;
        let program = spec.bundle_root.join(entry);
        tracing::debug!("spawning {} {:?}", program.display(), spec.args);

        let mut child = Command::new(&program)
            .args(&spec.args)
            .current_dir(&spec.bundle_root)
            .env("LD_LIBRARY_PATH", loader_path(spec))
            .env("HOSTBRIDGE_BUNDLE", &spec.bundle_id)
            .env("HOSTBRIDGE_BUNDLE_VERSION", &spec.version)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::SpawnFailed(format!("{}: {e}", program.display())))?;

        if let Some(out) = child.stdout.take() {
            ctx.log.capture(out, "");
        }
        if let Some(err) = child.stderr.take() {
            ctx.log.capture(err, "[stderr] ");
        }
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[allow(unsafe_code)]
fn send_sigterm(pid: u32) -> Result<(), RuntimeError> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| RuntimeError::SpawnFailed(format!("pid {pid} out of range")))?;
    // SAFETY: kill() has no memory effects; pid belongs to a child we have not reaped.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(RuntimeError::Io(std::io::Error::last_os_error()))
    }
}

impl HostedProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_wait(&mut self) -> Result<Option<Termination>, RuntimeError> {
        use std::os::unix::process::ExitStatusExt;
        let Some(status) = self.child.try_wait()? else {
            return Ok(None);
        };
        if let Some(code) = status.code() {
            return Ok(Some(Termination::Exited { code }));
        }
        Ok(Some(match status.signal() {
            Some(signal) => Termination::Signaled { signal },
            None => Termination::Exited { code: -1 },
        }))
    }

    fn request_exit(&mut self) -> Result<(), RuntimeError> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        send_sigterm(self.child.id())
    }

    fn kill(&mut self) -> Result<(), RuntimeError> {
        match self.child.kill() {
            Ok(()) => {
                let _ = self.child.wait();
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
