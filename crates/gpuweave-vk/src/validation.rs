use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{GpuError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

struct Inner {
    suppressed: AtomicUsize,
    first_error: Mutex<Option<String>>,
    tx: Sender<Diagnostic>,
    rx: Receiver<Diagnostic>,
}

/// Receives driver diagnostics (validation layer messages).
///
/// Cloning is cheap; all clones share one channel and one suppression count.
#[derive(Clone)]
pub struct ValidationCollector {
    inner: Arc<Inner>,
}

/// While alive, every diagnostic reported to the collector is dropped.
#[must_use = "suppression ends when the scope is dropped"]
pub struct SuppressionScope {
    inner: Arc<Inner>,
}

impl ValidationCollector {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            inner: Arc::new(Inner {
                suppressed: AtomicUsize::new(0),
                first_error: Mutex::new(None),
                tx,
                rx,
            }),
        }
    }

    /// Record a diagnostic. Returns false when a suppression scope swallowed it.
    pub fn report(&self, severity: Severity, message: impl Into<String>) -> bool {
        let message = message.into();
        if self.is_suppressed() {
            debug!(?severity, %message, "suppressed driver diagnostic");
            return false;
        }
        match severity {
            Severity::Error => {
                error!(%message, "validation error");
                let mut first = self.inner.first_error.lock();
                if first.is_none() {
                    *first = Some(message.clone());
                }
            }
            Severity::Warning => warn!(%message, "validation warning"),
            Severity::Info => info!(%message, "driver message"),
        }
        // The collector holds the receiver, so the channel never disconnects.
        let _ = self.inner.tx.send(Diagnostic { severity, message });
        true
    }

    pub fn suppress(&self) -> SuppressionScope {
        self.inner.suppressed.fetch_add(1, Ordering::AcqRel);
        SuppressionScope {
            inner: self.inner.clone(),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.inner.suppressed.load(Ordering::Acquire) > 0
    }

    /// First error reported since the last call, if any.
    pub fn take_error(&self) -> Option<String> {
        self.inner.first_error.lock().take()
    }

    /// Turn a captured error into a `GpuError::Validation`.
    pub fn check(&self) -> Result<()> {
        match self.take_error() {
            Some(message) => Err(GpuError::Validation(message)),
            None => Ok(()),
        }
    }

    /// Every diagnostic received so far, oldest first.
    pub fn drain(&self) -> Vec<Diagnostic> {
        self.inner.rx.try_iter().collect()
    }
}

impl Default for ValidationCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ValidationCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationCollector")
            .field("suppressed", &self.inner.suppressed.load(Ordering::Relaxed))
            .field("queued", &self.inner.rx.len())
            .finish()
    }
}

impl Drop for SuppressionScope {
    fn drop(&mut self) {
        self.inner.suppressed.fetch_sub(1, Ordering::AcqRel);
    }
}
