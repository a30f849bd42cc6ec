//! Name → queue lookup, passed around explicitly instead of living in a
//! global.
//!
//! Processes typically build one registry at start-up, open every queue they
//! need through it, and hand it (or individual queue handles) to the
//! components that publish or consume. Handles are cheap clones sharing one
//! mapping, so "get by name" never maps a segment twice.

use crate::error::IccError;
use crate::multi_writer::{AdmissionPolicy, MultiWriterQueue};
use crate::shm_layout::HeaderError;
use parking_lot::Mutex;
use std::collections::HashMap;
use strata_shm::SegmentSpec;
use tracing::debug;

#[derive(Default)]
pub struct QueueRegistry {
    queues: Mutex<HashMap<String, MultiWriterQueue>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the queue registered as `name`, if any.
    pub fn get(&self, name: &str) -> Option<MultiWriterQueue> {
        self.queues.lock().get(name).cloned()
    }

    /// Registers `queue` under `name`, returning whatever it replaced.
    pub fn insert(&self, name: impl Into<String>, queue: MultiWriterQueue) -> Option<MultiWriterQueue> {
        self.queues.lock().insert(name.into(), queue)
    }

    /// Unregisters `name`. Handles already given out keep working.
    pub fn remove(&self, name: &str) -> Option<MultiWriterQueue> {
        self.queues.lock().remove(name)
    }

    /// Returns the queue registered as `spec.name`, opening the shared
    /// segment on first use.
    ///
    /// # Errors
    /// - `name` is registered with a different capacity
    /// - Opening the segment fails (see [`MultiWriterQueue::open`])
    pub fn get_or_open_shared(
        &self,
        spec: &SegmentSpec,
        capacity: usize,
        policy: AdmissionPolicy,
    ) -> Result<MultiWriterQueue, IccError> {
        self.get_or_insert_with(&spec.name, capacity, || {
            MultiWriterQueue::open(spec, capacity, policy)
        })
    }

    /// Returns the queue registered as `name`, allocating a process-local
    /// one on first use.
    ///
    /// # Errors
    /// `name` is registered with a different capacity, or the allocation
    /// fails.
    pub fn get_or_create_heap(
        &self,
        name: &str,
        capacity: usize,
        policy: AdmissionPolicy,
    ) -> Result<MultiWriterQueue, IccError> {
        self.get_or_insert_with(name, capacity, || MultiWriterQueue::heap(capacity, policy))
    }

    fn get_or_insert_with(
        &self,
        name: &str,
        capacity: usize,
        make: impl FnOnce() -> Result<MultiWriterQueue, IccError>,
    ) -> Result<MultiWriterQueue, IccError> {
        let mut queues = self.queues.lock();
        if let Some(existing) = queues.get(name) {
            if existing.capacity() != capacity {
                return Err(HeaderError::CapacityMismatch {
                    expected: capacity as u64,
                    found: existing.capacity() as u64,
                }
                .into());
            }
            return Ok(existing.clone());
        }
        let queue = make()?;
        debug!(name, capacity, "registered queue");
        queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}
