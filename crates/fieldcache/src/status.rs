//! Status collectors for bulk operations.
//!
//! A caller creates a queue, hands its [`StatusHandle`] to operations that
//! can partially fail, then drains the collected [`ErrorRecord`]s one at a
//! time. Queues are bounded: once full, new records are counted as
//! overflowed and dropped, so the oldest failures are kept.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CacheError, Result};
use crate::types::{EntityRef, FieldId, SampleStatus};

/// Handle to one status queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusHandle(Uuid);

impl StatusHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for StatusHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One per-item failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The entity the failure applies to.
    pub entity: EntityRef,
    /// The field, if the failure is field specific.
    pub field: Option<FieldId>,
    /// Wire return code.
    pub code: i32,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorRecord {
    /// Builds a record from an error.
    #[must_use]
    pub fn from_error(entity: EntityRef, field: Option<FieldId>, error: &CacheError) -> Self {
        Self {
            entity,
            field,
            code: error.code(),
            message: error.to_string(),
        }
    }

    /// Builds a record from a degraded sample status.
    #[must_use]
    pub fn from_status(entity: EntityRef, field: Option<FieldId>, status: SampleStatus) -> Self {
        Self {
            entity,
            field,
            code: status.code(),
            message: status.to_string(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.field {
            Some(field) => write!(f, "{}/{}: {} ({})", self.entity, field, self.message, self.code),
            None => write!(f, "{}: {} ({})", self.entity, self.message, self.code),
        }
    }
}

#[derive(Debug)]
struct StatusQueue {
    records: VecDeque<ErrorRecord>,
    overflowed: u64,
}

/// All live status queues.
#[derive(Debug)]
pub struct StatusRegistry {
    capacity: usize,
    queues: Mutex<HashMap<StatusHandle, StatusQueue>>,
}

impl StatusRegistry {
    /// Creates a registry whose queues hold at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a new, empty queue.
    pub fn create(&self) -> StatusHandle {
        let handle = StatusHandle::new();
        self.queues.lock().insert(
            handle,
            StatusQueue {
                records: VecDeque::new(),
                overflowed: 0,
            },
        );
        debug!(status = %handle, "created status queue");
        handle
    }

    fn with_queue<T>(&self, handle: StatusHandle, f: impl FnOnce(&mut StatusQueue) -> T) -> Result<T> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(&handle).ok_or_else(|| CacheError::NotFound {
            what: "status queue",
            id: handle.to_string(),
        })?;
        Ok(f(queue))
    }

    /// Appends a record.
    ///
    /// Returns `false` if the queue was full and the record was dropped.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` if the handle is not live.
    pub fn push(&self, handle: StatusHandle, record: ErrorRecord) -> Result<bool> {
        let capacity = self.capacity;
        let stored = self.with_queue(handle, |queue| {
            if queue.records.len() >= capacity {
                queue.overflowed += 1;
                false
            } else {
                queue.records.push_back(record);
                true
            }
        })?;
        if !stored {
            warn!(status = %handle, capacity, "status queue full, dropping record");
        }
        Ok(stored)
    }

    /// Removes and returns the oldest record.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::EmptyQueue` when drained and
    /// `CacheError::NotFound` if the handle is not live.
    pub fn pop(&self, handle: StatusHandle) -> Result<ErrorRecord> {
        self.with_queue(handle, |queue| queue.records.pop_front())?
            .ok_or(CacheError::EmptyQueue)
    }

    /// Number of queued records.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` if the handle is not live.
    pub fn len(&self, handle: StatusHandle) -> Result<usize> {
        self.with_queue(handle, |queue| queue.records.len())
    }

    /// Number of records dropped because the queue was full.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` if the handle is not live.
    pub fn overflowed(&self, handle: StatusHandle) -> Result<u64> {
        self.with_queue(handle, |queue| queue.overflowed)
    }

    /// Drops every queued record and resets the overflow count.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` if the handle is not live.
    pub fn clear(&self, handle: StatusHandle) -> Result<()> {
        self.with_queue(handle, |queue| {
            queue.records.clear();
            queue.overflowed = 0;
        })
    }

    /// Destroys a queue.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` if the handle is not live.
    pub fn destroy(&self, handle: StatusHandle) -> Result<()> {
        self.queues
            .lock()
            .remove(&handle)
            .map(|_| debug!(status = %handle, "destroyed status queue"))
            .ok_or_else(|| CacheError::NotFound {
                what: "status queue",
                id: handle.to_string(),
            })
    }

    /// Number of live queues.
    #[must_use]
    pub fn live_queues(&self) -> usize {
        self.queues.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32) -> ErrorRecord {
        ErrorRecord::from_status(EntityRef::gpu(id), Some(FieldId(150)), SampleStatus::NotSupported)
    }

    #[test]
    fn pop_is_fifo() {
        let registry = StatusRegistry::new(8);
        let handle = registry.create();
        registry.push(handle, record(0)).unwrap();
        registry.push(handle, record(1)).unwrap();

        assert_eq!(registry.len(handle).unwrap(), 2);
        assert_eq!(registry.pop(handle).unwrap().entity, EntityRef::gpu(0));
        assert_eq!(registry.pop(handle).unwrap().entity, EntityRef::gpu(1));
        assert_eq!(registry.pop(handle), Err(CacheError::EmptyQueue));
    }

    #[test]
    fn full_queue_keeps_oldest() {
        let registry = StatusRegistry::new(2);
        let handle = registry.create();
        assert!(registry.push(handle, record(0)).unwrap());
        assert!(registry.push(handle, record(1)).unwrap());
        assert!(!registry.push(handle, record(2)).unwrap());

        assert_eq!(registry.overflowed(handle).unwrap(), 1);
        assert_eq!(registry.pop(handle).unwrap().entity, EntityRef::gpu(0));
    }

    #[test]
    fn clear_resets_queue() {
        let registry = StatusRegistry::new(1);
        let handle = registry.create();
        registry.push(handle, record(0)).unwrap();
        registry.push(handle, record(1)).unwrap();
        registry.clear(handle).unwrap();

        assert_eq!(registry.len(handle).unwrap(), 0);
        assert_eq!(registry.overflowed(handle).unwrap(), 0);
    }

    #[test]
    fn queues_are_independent() {
        let registry = StatusRegistry::new(4);
        let a = registry.create();
        let b = registry.create();
        registry.push(a, record(0)).unwrap();
        assert_eq!(registry.len(b).unwrap(), 0);
        assert_eq!(registry.live_queues(), 2);
    }

    #[test]
    fn destroyed_handle_is_not_found() {
        let registry = StatusRegistry::new(4);
        let handle = registry.create();
        registry.destroy(handle).unwrap();

        assert!(matches!(registry.pop(handle), Err(CacheError::NotFound { .. })));
        assert!(matches!(registry.destroy(handle), Err(CacheError::NotFound { .. })));
        assert_eq!(registry.live_queues(), 0);
    }

    #[test]
    fn record_from_error_carries_code() {
        let err = CacheError::UnknownField { field_id: 7 };
        let rec = ErrorRecord::from_error(EntityRef::gpu(1), Some(FieldId(7)), &err);
        assert_eq!(rec.code, -13);
        assert_eq!(rec.to_string(), "gpu:1/7: unknown field id: 7 (-13)");
    }
}
