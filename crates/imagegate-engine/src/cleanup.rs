use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

type DisposeFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CleanupId(u64);

impl fmt::Display for CleanupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cleanup-{}", self.0)
    }
}

struct CleanupEntry {
    id: CleanupId,
    label: String,
    dispose: DisposeFn,
}

/// Result of disposing a batch of entries. Failures are collected, never
/// short-circuited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub disposed: usize,
    pub failures: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Process-wide list of pending disposals.
///
/// Registration and flushing may happen from different threads (the workflow
/// and a signal handler); the list is guarded by a mutex that is never held
/// while a dispose callback runs. Each entry runs at most once: it is removed
/// from the list before it is invoked.
#[derive(Default)]
pub struct CleanupRegistry {
    entries: Mutex<Vec<CleanupEntry>>,
    next_id: AtomicU64,
    registered: AtomicU64,
    disposed: AtomicU64,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, label: impl Into<String>, dispose: F) -> CleanupId
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let id = CleanupId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock_entries().push(CleanupEntry {
            id,
            label: label.into(),
            dispose: Box::new(dispose),
        });
        self.registered.fetch_add(1, Ordering::SeqCst);
        id
    }

    /// Disposes one entry now. Unknown or already-disposed ids are a no-op.
    pub fn dispose(&self, id: CleanupId) -> FlushReport {
        let entry = {
            let mut entries = self.lock_entries();
            entries
                .iter()
                .position(|entry| entry.id == id)
                .map(|index| entries.remove(index))
        };
        self.run(entry.into_iter().collect())
    }

    /// Disposes every pending entry and leaves the registry empty. A second
    /// flush finds nothing to do.
    pub fn flush(&self) -> FlushReport {
        let entries = std::mem::take(&mut *self.lock_entries());
        self.run(entries)
    }

    pub fn pending(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn registered_count(&self) -> u64 {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn disposed_count(&self) -> u64 {
        self.disposed.load(Ordering::SeqCst)
    }

    fn run(&self, entries: Vec<CleanupEntry>) -> FlushReport {
        let mut report = FlushReport::default();
        for entry in entries {
            let CleanupEntry { id, label, dispose } = entry;
            let outcome = panic::catch_unwind(AssertUnwindSafe(dispose));
            self.disposed.fetch_add(1, Ordering::SeqCst);
            report.disposed += 1;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => report.failures.push(format!("{label} ({id}): {err:#}")),
                Err(_) => report.failures.push(format!("{label} ({id}): dispose panicked")),
            }
        }
        report
    }

    // A poisoned list is still structurally valid; keep draining it.
    fn lock_entries(&self) -> MutexGuard<'_, Vec<CleanupEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
