use crate::backend::{HostedContext, HostedProcess, LaunchSpec, RuntimeBackend, Termination};
use crate::RuntimeError;
use crossbeam_channel::{Receiver, TryRecvError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Entry point of an in-process hosted runtime. The return value is its exit code.
pub type HostedProgram = Arc<dyn Fn(HostedContext) -> i32 + Send + Sync>;

/// Runs the hosted runtime on a dedicated thread of this process.
///
/// An uncaught panic is reported as a crash. A thread cannot be killed, so
/// force-termination abandons it after raising the exit flag.
pub struct ThreadBackend {
    program: HostedProgram,
}

impl ThreadBackend {
    pub fn new(program: impl Fn(HostedContext) -> i32 + Send + Sync + 'static) -> Self {
        Self {
            program: Arc::new(program),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl RuntimeBackend for ThreadBackend {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn available(&self) -> bool {
        true
    }

    fn spawn(
        &self,
        spec: &LaunchSpec,
        ctx: HostedContext,
    ) -> Result<Box<dyn HostedProcess>, RuntimeError> {
        let exit = ctx.exit_flag();
        let program = Arc::clone(&self.program);
        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::Builder::new()
            .name(format!("hosted-{}", spec.bundle_id))
            .spawn(move || {
                let termination = match catch_unwind(AssertUnwindSafe(|| program(ctx))) {
                    Ok(code) => Termination::Exited { code },
                    Err(payload) => Termination::Panicked {
                        message: panic_message(payload.as_ref()),
                    },
                };
                let _ = tx.send(termination);
            })
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
        Ok(Box::new(ThreadProcess {
            rx,
            exit,
            done: None,
        }))
    }
}

struct ThreadProcess {
    rx: Receiver<Termination>,
    exit: Arc<AtomicBool>,
    done: Option<Termination>,
}

impl HostedProcess for ThreadProcess {
    fn try_wait(&mut self) -> Result<Option<Termination>, RuntimeError> {
        if self.done.is_none() {
            self.done = match self.rx.try_recv() {
                Ok(t) => Some(t),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Termination::Panicked {
                    message: "hosted thread ended without a result".to_owned(),
                }),
            };
        }
        Ok(self.done.clone())
    }

    fn request_exit(&mut self) -> Result<(), RuntimeError> {
        self.exit.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&mut self) -> Result<(), RuntimeError> {
        self.exit.store(true, Ordering::SeqCst);
        if self.done.is_none() {
            tracing::warn!("abandoning hosted thread that ignored the exit request");
            self.done = Some(Termination::Killed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logtail::LogTail;
    use crate::testing::detached_boundary;
    use std::time::{Duration, Instant};

    fn spec() -> LaunchSpec {
        LaunchSpec {
            bundle_id: "game".to_owned(),
            version: "1.0.0".to_owned(),
            bundle_root: std::env::temp_dir(),
            entry_point: None,
            args: vec![],
            libraries: vec![],
        }
    }

    fn ctx() -> HostedContext {
        HostedContext::new(Arc::new(detached_boundary()), LogTail::new(8))
    }

    fn wait(p: &mut dyn HostedProcess) -> Termination {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(t) = p.try_wait().unwrap() {
                return t;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn return_value_is_exit_code() {
        let backend = ThreadBackend::new(|ctx| {
            ctx.log.push("hello from the hosted side");
            7
        });
        let mut p = backend.spawn(&spec(), ctx()).unwrap();
        assert_eq!(wait(p.as_mut()), Termination::Exited { code: 7 });
    }

    #[test]
    fn panic_is_a_crash() {
        let backend = ThreadBackend::new(|_| panic!("NullPointerException in render loop"));
        let mut p = backend.spawn(&spec(), ctx()).unwrap();
        match wait(p.as_mut()) {
            Termination::Panicked { message } => assert!(message.contains("NullPointerException")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exit_request_is_observable() {
        let backend = ThreadBackend::new(|ctx| {
            while !ctx.exit_requested() {
                std::thread::sleep(Duration::from_millis(2));
            }
            0
        });
        let mut p = backend.spawn(&spec(), ctx()).unwrap();
        assert!(p.try_wait().unwrap().is_none());
        p.request_exit().unwrap();
        assert!(wait(p.as_mut()).is_clean());
    }

    #[test]
    fn kill_abandons_stuck_thread() {
        let backend = ThreadBackend::new(|_| {
            std::thread::sleep(Duration::from_millis(300));
            0
        });
        let mut p = backend.spawn(&spec(), ctx()).unwrap();
        p.kill().unwrap();
        assert_eq!(p.try_wait().unwrap(), Some(Termination::Killed));
    }
}
