use crate::{ArchiveSource, FetchError, SourceStream};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory archive source for tests.
///
/// Serves blobs by reference, counts `open` calls, can ignore range requests,
/// can delay every open, and can make the next stream fail after N bytes.
pub struct MemorySource {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    ranges: bool,
    delay: Option<Duration>,
    fail_after: Mutex<Option<usize>>,
    opens: AtomicUsize,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            ranges: true,
            delay: None,
            fail_after: Mutex::new(None),
            opens: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_blob(self, reference: &str, data: Vec<u8>) -> Self {
        self.insert(reference, data);
        self
    }

    #[must_use]
    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, reference: &str, data: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(reference.to_owned(), data);
        }
    }

    /// The next opened stream fails with an I/O error after `bytes` bytes.
    pub fn fail_next_after(&self, bytes: usize) {
        if let Ok(mut f) = self.fail_after.lock() {
            *f = Some(bytes);
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

struct FailingReader {
    inner: Cursor<Vec<u8>>,
    remaining: usize,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by mock source",
            ));
        }
        let cap = buf.len().min(self.remaining);
        let n = self.inner.read(&mut buf[..cap])?;
        self.remaining -= n;
        Ok(n)
    }
}

impl ArchiveSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, reference: &str, offset: u64) -> Result<SourceStream, FetchError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let data = self
            .blobs
            .lock()
            .map_err(|e| FetchError::Network(format!("lock poisoned: {e}")))?
            .get(reference)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(reference.to_owned()))?;
        let total = data.len() as u64;
        let resumed = self.ranges && offset > 0 && offset < total;
        let body = if resumed {
            let start = usize::try_from(offset).unwrap_or(data.len());
            data[start..].to_vec()
        } else {
            data
        };
        let fail_after = self
            .fail_after
            .lock()
            .map_err(|e| FetchError::Network(format!("lock poisoned: {e}")))?
            .take();
        let reader: Box<dyn Read> = match fail_after {
            Some(remaining) => Box::new(FailingReader {
                inner: Cursor::new(body),
                remaining,
            }),
            None => Box::new(Cursor::new(body)),
        };
        Ok(SourceStream {
            reader,
            total_len: Some(total),
            resumed,
        })
    }
}
