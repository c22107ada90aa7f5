use crate::{config::CacheStrategy, status::StatusHandle};

/// Strategy applying to one tracking operation: the configured one, or the panic strategy while
/// the SDK is in panic mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActiveStrategy {
    /// Every operation is a no-op.
    Panic,
    Cache(CacheStrategy),
}

impl ActiveStrategy {
    pub fn resolve(configured: CacheStrategy, status: &StatusHandle) -> ActiveStrategy {
        if status.is_panic() {
            ActiveStrategy::Panic
        } else {
            ActiveStrategy::Cache(configured)
        }
    }

    pub fn is_panic(self) -> bool {
        self == ActiveStrategy::Panic
    }

    /// Hits are sent on their own as soon as they are added.
    pub fn sends_immediately(self) -> bool {
        self == ActiveStrategy::Cache(CacheStrategy::NoBatching)
    }

    /// Hits are persisted as soon as they are queued.
    pub fn caches_on_enqueue(self) -> bool {
        self == ActiveStrategy::Cache(CacheStrategy::ContinuousCaching)
    }

    /// The queue is persisted as a whole after each flush.
    pub fn persists_snapshot(self) -> bool {
        self == ActiveStrategy::Cache(CacheStrategy::PeriodicCaching)
    }
}
