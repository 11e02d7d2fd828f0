//! Sampling scheduler.
//!
//! The cache never reads hardware. A [`SamplingDriver`] asks a
//! [`SampleSource`] for fresh values of every watched key whose update
//! period has elapsed and records them.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::FieldCache;
use crate::registry::FieldDescriptor;
use crate::store::RecordOutcome;
use crate::types::{FieldKey, Sample};

/// Produces samples for watched keys.
pub trait SampleSource: Send + Sync {
    /// Reads one value. Sources that cannot read a key return a sample
    /// with a degraded status instead of failing.
    fn sample(&self, key: FieldKey, descriptor: &FieldDescriptor, now: i64) -> Sample;
}

/// Counts from one [`SamplingDriver::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Keys that were due.
    pub due: usize,
    /// Samples appended.
    pub recorded: usize,
    /// Samples dropped or rejected.
    pub dropped: usize,
}

/// Drives a [`SampleSource`] on each key's effective update period.
pub struct SamplingDriver<S> {
    cache: Arc<FieldCache>,
    source: S,
    next_due: HashMap<FieldKey, i64>,
}

impl<S: SampleSource> SamplingDriver<S> {
    /// Creates a driver feeding `cache` from `source`.
    pub fn new(cache: Arc<FieldCache>, source: S) -> Self {
        Self {
            cache,
            source,
            next_due: HashMap::new(),
        }
    }

    /// Samples and records every key that is due at `now`.
    ///
    /// Newly watched keys are due immediately. Keys no longer watched are
    /// forgotten.
    pub fn tick(&mut self, now: i64) -> TickReport {
        let watched = self.cache.watched_keys();
        self.next_due
            .retain(|key, _| watched.binary_search_by_key(key, |(k, _)| *k).is_ok());

        let mut report = TickReport::default();
        for (key, policy) in watched {
            let due = self.next_due.get(&key).copied().unwrap_or(now);
            if now < due {
                continue;
            }
            report.due += 1;
            self.next_due.insert(key, now + policy.update_freq_micros());

            let Ok(descriptor) = self.cache.registry().describe(key.field) else {
                continue;
            };
            let sample = self.source.sample(key, descriptor, now);
            match self.cache.record_at(key, sample, now) {
                Ok(RecordOutcome::Appended) => report.recorded += 1,
                Ok(_) => report.dropped += 1,
                Err(err) => {
                    warn!(key = %key, error = %err, "source produced an unrecordable sample");
                    report.dropped += 1;
                }
            }
        }

        if report.due > 0 {
            debug!(due = report.due, recorded = report.recorded, "sampling tick");
        }
        report
    }

    /// Earliest time any tracked key is due, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<i64> {
        self.next_due.values().copied().min()
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<FieldCache> {
        &self.cache
    }
}
