use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::hit::Hit;

/// Ordered queue of hits waiting for a confirmed delivery.
///
/// Safe under many producers. Hits leave the queue only through [`HitQueue::poll`] and are put
/// back at the front with [`HitQueue::requeue`] when a send fails.
///
/// The queue has no size cap and keeps growing while the collection endpoint is unreachable.
/// The pool size configured in [`TrackingConfig`](crate::TrackingConfig) only triggers an early
/// flush and sizes batches.
#[derive(Debug, Default)]
pub(crate) struct HitQueue {
    hits: Mutex<VecDeque<Hit>>,
}

impl HitQueue {
    pub fn new() -> HitQueue {
        HitQueue::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Hit>> {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a hit. Returns the queue length after the push.
    pub fn push(&self, hit: Hit) -> usize {
        let mut hits = self.lock();
        hits.push_back(hit);
        hits.len()
    }

    /// Take up to `max` hits from the front of the queue.
    pub fn poll(&self, max: usize) -> Vec<Hit> {
        let mut hits = self.lock();
        let n = max.min(hits.len());
        hits.drain(..n).collect()
    }

    /// Put hits back at the front, keeping their order.
    pub fn requeue(&self, batch: Vec<Hit>) {
        let mut hits = self.lock();
        for hit in batch.into_iter().rev() {
            hits.push_front(hit);
        }
    }

    /// Remove hits matching `predicate`. Returns the removed hits.
    pub fn remove_where(&self, predicate: impl Fn(&Hit) -> bool) -> Vec<Hit> {
        let mut hits = self.lock();
        let (removed, kept) = hits.drain(..).partition(|hit| predicate(hit));
        *hits = kept;
        Vec::from(removed)
    }

    pub fn snapshot(&self) -> Vec<Hit> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
