use crate::CoreError;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Advisory file lock shared between processes using the same storage root.
///
/// The store-wide lock is taken shared by provisioning and exclusively by
/// recovery and garbage collection; per-identifier install locks are always
/// exclusive.
pub struct StoreLock {
    lock_file: File,
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl StoreLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Ok(Self { lock_file: file })
    }

    pub fn acquire_shared(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_shared()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

struct Flight<T> {
    tag: String,
    result: Mutex<Option<T>>,
    done: Condvar,
}

impl<T: Clone> Flight<T> {
    fn finish(&self, value: T) {
        if let Ok(mut slot) = self.result.lock() {
            if slot.is_none() {
                *slot = Some(value);
            }
        }
        self.done.notify_all();
    }

    fn wait(&self) -> Option<T> {
        let guard = self.result.lock().ok()?;
        let guard = self.done.wait_while(guard, |r| r.is_none()).ok()?;
        guard.clone()
    }
}

/// In-process table of in-flight operations keyed by identifier.
///
/// The first caller for a key runs the work; callers arriving while it runs
/// wait for its result instead of repeating it. A waiter whose `tag` differs
/// from the running flight's waits for it to finish and then runs its own.
pub struct SingleFlight<T> {
    flights: Mutex<HashMap<String, Arc<Flight<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

/// Publishes `abandoned` to waiters if the leader unwinds before finishing.
struct LeaderGuard<'a, T: Clone> {
    table: &'a SingleFlight<T>,
    key: &'a str,
    flight: Arc<Flight<T>>,
    abandoned: Option<T>,
}

impl<T: Clone> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if let Ok(mut flights) = self.table.flights.lock() {
            flights.remove(self.key);
        }
        if let Some(value) = self.abandoned.take() {
            self.flight.finish(value);
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless an identical flight is already running.
    ///
    /// Returns the result and whether it was joined from another caller.
    pub fn run(&self, key: &str, tag: &str, abandoned: T, work: impl FnOnce() -> T) -> (T, bool) {
        loop {
            let (flight, leader) = {
                let Ok(mut flights) = self.flights.lock() else {
                    return (abandoned, false);
                };
                match flights.get(key) {
                    Some(f) => (Arc::clone(f), false),
                    None => {
                        let f = Arc::new(Flight {
                            tag: tag.to_owned(),
                            result: Mutex::new(None),
                            done: Condvar::new(),
                        });
                        flights.insert(key.to_owned(), Arc::clone(&f));
                        (f, true)
                    }
                }
            };

            if leader {
                let mut guard = LeaderGuard {
                    table: self,
                    key,
                    flight: Arc::clone(&flight),
                    abandoned: Some(abandoned),
                };
                let value = work();
                guard.abandoned = None;
                drop(guard);
                flight.finish(value.clone());
                return (value, false);
            }

            let joined = flight.wait();
            if flight.tag == tag {
                if let Some(value) = joined {
                    return (value, true);
                }
            }
            // Different request for the same key: take the lead next round.
            tracing::debug!("in-flight work for '{key}' finished, retrying as leader");
        }
    }

    pub fn in_flight(&self) -> usize {
        self.flights.lock().map(|f| f.len()).unwrap_or(0)
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, cancelling current operation...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
