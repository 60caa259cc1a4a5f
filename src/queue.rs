//! Shared work queue drained by the transfer workers.
//!
//! `take` is the hand-off point: an item it returns belongs to exactly one
//! caller. An empty queue returns `None` at once; workers treat that as the
//! signal to send their end marker.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::reconcile::WorkItem;

#[derive(Clone, Default)]
pub struct WorkQueue {
    inner: Arc<Mutex<VecDeque<WorkItem>>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop whatever is queued and enqueue `items` instead.
    pub fn replace(&self, items: Vec<WorkItem>) {
        let mut q = self.inner.lock();
        q.clear();
        q.extend(items);
    }

    pub fn take(&self) -> Option<WorkItem> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
