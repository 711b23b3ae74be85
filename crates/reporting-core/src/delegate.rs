//! Persistence capability.

use crate::error::ReportingResult;
use parking_lot::Mutex;

/// Host-provided storage for the serialized cache.
///
/// The blob is opaque to the delegate. Failures are non-fatal to the
/// caller: a failed load starts the cache empty and a failed store leaves
/// the in-memory state authoritative until the next attempt.
pub trait ReportingDelegate: Send + Sync {
    /// Returns the last persisted blob, or `None` if nothing was stored.
    fn load_persisted_state(&self) -> ReportingResult<Option<Vec<u8>>>;

    /// Replaces the persisted blob.
    fn persist_state(&self, blob: Vec<u8>) -> ReportingResult<()>;
}

/// A delegate that stores nothing.
#[derive(Debug, Default)]
pub struct NullDelegate;

impl ReportingDelegate for NullDelegate {
    fn load_persisted_state(&self) -> ReportingResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn persist_state(&self, _blob: Vec<u8>) -> ReportingResult<()> {
        Ok(())
    }
}

/// A delegate that keeps the blob in RAM.
#[derive(Debug, Default)]
pub struct InMemoryDelegate {
    inner: Mutex<InMemoryInner>,
}

#[derive(Debug, Default)]
struct InMemoryInner {
    blob: Option<Vec<u8>>,
    persist_count: usize,
}

impl InMemoryDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// A delegate that starts out holding `blob`.
    pub fn with_state(blob: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(InMemoryInner {
                blob: Some(blob),
                persist_count: 0,
            }),
        }
    }

    /// The currently stored blob.
    pub fn stored(&self) -> Option<Vec<u8>> {
        self.inner.lock().blob.clone()
    }

    /// Number of successful `persist_state` calls.
    pub fn persist_count(&self) -> usize {
        self.inner.lock().persist_count
    }
}

impl ReportingDelegate for InMemoryDelegate {
    fn load_persisted_state(&self) -> ReportingResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().blob.clone())
    }

    fn persist_state(&self, blob: Vec<u8>) -> ReportingResult<()> {
        let mut inner = self.inner.lock();
        inner.blob = Some(blob);
        inner.persist_count += 1;
        Ok(())
    }
}
