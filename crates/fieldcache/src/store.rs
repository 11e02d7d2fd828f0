//! Per-key time-series storage with count and age retention.
//!
//! This module provides the [`TimeSeriesStore`], which keeps one ordered
//! series of [`Sample`]s per watched [`FieldKey`].
//!
//! Locking:
//! - the key map is behind a `RwLock` and only write-locked when keys are
//!   registered or dropped;
//! - each series has its own `Mutex`, so writers for different keys never
//!   block each other;
//! - retained samples live in an `Arc<VecDeque<_>>` that writers update
//!   with [`Arc::make_mut`]. Readers clone the `Arc` and iterate a
//!   snapshot that no later append or eviction can change;
//! - a batch gate (`RwLock<()>`) is held shared by `record` and eviction
//!   and exclusively by [`TimeSeriesStore::bulk_latest`], so no trim runs
//!   in the middle of a batch read.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::sentinel;
use crate::types::{FieldKey, Sample, SampleStatus, SampleValue, MAX_BLOB_LENGTH, MAX_STR_LENGTH};
use crate::watch::WatchPolicy;

/// What happened to a recorded sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The sample was appended.
    Appended,
    /// The sample was older than the newest retained one and was dropped.
    OutOfOrder,
    /// No watch covers the key; the sample was dropped.
    Unwatched,
}

#[derive(Debug)]
struct Series {
    policy: WatchPolicy,
    samples: Arc<VecDeque<Sample>>,
    /// Timestamp of the newest sample ever appended, survives eviction.
    last_timestamp: Option<i64>,
}

impl Series {
    fn new(policy: WatchPolicy) -> Self {
        Self {
            policy,
            samples: Arc::new(VecDeque::new()),
            last_timestamp: None,
        }
    }

    /// Applies count and age bounds, always keeping the newest sample.
    fn evict(&mut self, now: i64) -> usize {
        let max_samples = self.policy.max_keep_samples();
        let cutoff = self.policy.max_keep_age_micros().map(|age| now.saturating_sub(age));

        let over_count = self.samples.len().saturating_sub(max_samples);
        let expired = cutoff.map_or(0, |cutoff| {
            self.samples
                .iter()
                .take(self.samples.len().saturating_sub(1))
                .take_while(|s| s.timestamp < cutoff)
                .count()
        });
        let drop = over_count.max(expired);
        if drop > 0 {
            Arc::make_mut(&mut self.samples).drain(..drop);
        }
        drop
    }
}

/// A restartable, ascending iterator over samples newer than a cursor.
///
/// Iterates a snapshot taken when it was created. Clone it before
/// consuming to replay the same samples.
#[derive(Debug, Clone)]
pub struct Since {
    snapshot: Arc<VecDeque<Sample>>,
    start: usize,
    pos: usize,
    origin: i64,
    cursor: i64,
}

impl Since {
    fn new(snapshot: Arc<VecDeque<Sample>>, since: i64) -> Self {
        let start = snapshot.partition_point(|s| s.timestamp <= since);
        Self {
            snapshot,
            start,
            pos: start,
            origin: since,
            cursor: since,
        }
    }

    pub(crate) fn empty(since: i64) -> Self {
        Self::new(Arc::new(VecDeque::new()), since)
    }

    /// The cursor to pass to the next poll: the timestamp of the last
    /// sample yielded so far, or the original cursor if none was.
    #[must_use]
    pub const fn next_cursor(&self) -> i64 {
        self.cursor
    }

    /// Number of samples not yet yielded.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.snapshot.len() - self.pos
    }

    /// Rewinds to the first sample after the original cursor.
    pub fn restart(&mut self) {
        self.pos = self.start;
        self.cursor = self.origin;
    }
}

impl Iterator for Since {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        let sample = self.snapshot.get(self.pos)?.clone();
        self.pos += 1;
        self.cursor = sample.timestamp;
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

impl ExactSizeIterator for Since {}

/// Thread-safe storage for all watched keys.
#[derive(Debug, Default)]
pub struct TimeSeriesStore {
    series: RwLock<HashMap<FieldKey, Arc<Mutex<Series>>>>,
    batch_gate: RwLock<()>,
}

impl TimeSeriesStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: FieldKey) -> Option<Arc<Mutex<Series>>> {
        self.series.read().get(&key).cloned()
    }

    /// Registers a key or updates its retention policy.
    ///
    /// Tighter bounds take effect immediately.
    pub fn set_policy(&self, key: FieldKey, policy: WatchPolicy, now: i64) {
        let _gate = self.batch_gate.read();
        if let Some(series) = self.get(key) {
            let mut series = series.lock();
            series.policy = policy;
            series.evict(now);
            return;
        }
        self.series
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Series::new(policy))));
    }

    /// Drops a key and all of its samples.
    ///
    /// Returns `true` if the key was registered.
    pub fn remove(&self, key: FieldKey) -> bool {
        let _gate = self.batch_gate.read();
        self.series.write().remove(&key).is_some()
    }

    /// Returns `true` if the key is registered.
    #[must_use]
    pub fn is_watched(&self, key: FieldKey) -> bool {
        self.series.read().contains_key(&key)
    }

    /// Appends a sample and applies the key's retention policy.
    ///
    /// Samples older than the newest recorded one are dropped. Samples for
    /// unregistered keys are dropped.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` if an `Ok` sample has no value or a
    /// value inside a sentinel band, or a string/blob exceeds its limit.
    pub fn record(&self, key: FieldKey, sample: Sample, now: i64) -> Result<RecordOutcome> {
        validate(&sample)?;

        let _gate = self.batch_gate.read();
        let Some(series) = self.get(key) else {
            debug!(key = %key, "dropping sample for unwatched key");
            return Ok(RecordOutcome::Unwatched);
        };

        let mut series = series.lock();
        if series.last_timestamp.is_some_and(|last| sample.timestamp < last) {
            warn!(
                key = %key,
                timestamp = sample.timestamp,
                last = series.last_timestamp,
                "dropping out-of-order sample"
            );
            return Ok(RecordOutcome::OutOfOrder);
        }

        series.last_timestamp = Some(sample.timestamp);
        Arc::make_mut(&mut series.samples).push_back(sample);
        let evicted = series.evict(now);

        debug!(key = %key, retained = series.samples.len(), evicted, "recorded sample");
        Ok(RecordOutcome::Appended)
    }

    /// Returns the newest sample of a key.
    ///
    /// Unregistered keys read as `Unwatched`, empty series as `NoData` and
    /// a newest sample older than the key's stale threshold keeps its value
    /// but reads as `Stale`. Synthesized samples are stamped with `now`.
    #[must_use]
    pub fn latest(&self, key: FieldKey, now: i64) -> Sample {
        self.get(key).map_or_else(
            || Sample::sentinel(now, SampleStatus::Unwatched),
            |series| latest_of(&series.lock(), now),
        )
    }

    /// Returns the newest sample of every key, aligned with `keys`.
    ///
    /// No record or eviction runs while the batch is read.
    #[must_use]
    pub fn bulk_latest(&self, keys: &[FieldKey], now: i64) -> Vec<Sample> {
        let _gate = self.batch_gate.write();
        let map = self.series.read();
        keys.iter()
            .map(|key| {
                map.get(key).map_or_else(
                    || Sample::sentinel(now, SampleStatus::Unwatched),
                    |series| latest_of(&series.lock(), now),
                )
            })
            .collect()
    }

    /// Returns the samples newer than `since`, ascending.
    ///
    /// An unregistered key yields nothing.
    #[must_use]
    pub fn since(&self, key: FieldKey, since: i64) -> Since {
        self.get(key).map_or_else(
            || Since::empty(since),
            |series| Since::new(Arc::clone(&series.lock().samples), since),
        )
    }

    /// Returns a snapshot of every retained sample of a key.
    #[must_use]
    pub fn snapshot(&self, key: FieldKey) -> Option<Vec<Sample>> {
        self.get(key)
            .map(|series| series.lock().samples.iter().cloned().collect())
    }

    /// Applies age bounds to every key, including idle ones.
    ///
    /// Returns the number of samples evicted.
    pub fn evict_expired(&self, now: i64) -> usize {
        let _gate = self.batch_gate.read();
        let all: Vec<_> = self.series.read().values().cloned().collect();
        let evicted = all.iter().map(|series| series.lock().evict(now)).sum();
        if evicted > 0 {
            debug!(evicted, "evicted expired samples");
        }
        evicted
    }

    /// Number of retained samples for a key.
    #[must_use]
    pub fn sample_count(&self, key: FieldKey) -> usize {
        self.get(key).map_or(0, |series| series.lock().samples.len())
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.series.read().len()
    }

    /// Returns `true` if no key is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.series.read().is_empty()
    }
}

fn latest_of(series: &Series, now: i64) -> Sample {
    let Some(newest) = series.samples.back() else {
        return Sample::sentinel(now, SampleStatus::NoData);
    };
    let sample = newest.clone();
    if sample.status.is_ok() && now.saturating_sub(sample.timestamp) > series.policy.stale_after_micros() {
        return sample.with_status(SampleStatus::Stale);
    }
    sample
}

fn validate(sample: &Sample) -> Result<()> {
    if !sample.status.is_ok() {
        return Ok(());
    }
    let Some(value) = &sample.value else {
        return Err(CacheError::bad_param("ok sample must carry a value"));
    };
    if sentinel::collides(value) {
        return Err(CacheError::bad_param(format!(
            "value {value} falls inside a reserved sentinel band"
        )));
    }
    match value {
        SampleValue::String(s) if s.len() >= MAX_STR_LENGTH => Err(CacheError::bad_param(format!(
            "string of {} bytes exceeds {}",
            s.len(),
            MAX_STR_LENGTH - 1
        ))),
        SampleValue::Blob(b) if b.len() > MAX_BLOB_LENGTH => Err(CacheError::bad_param(format!(
            "blob of {} bytes exceeds {MAX_BLOB_LENGTH}",
            b.len()
        ))),
        _ => Ok(()),
    }
}
