//! Watch bindings and effective per-key policies.
//!
//! A watch binds an entity group and a field group to a [`WatchPolicy`].
//! Every (entity, field) pair in the cross product is installed as a
//! reference on its [`FieldKey`]. When several bindings cover the same key
//! the effective policy is the merge of all of them, so no watcher can
//! shorten another watcher's retention.
//!
//! Pairs whose field does not apply to the entity kind are never installed
//! in the store, but the table remembers which bindings asked for them so
//! reads can answer `NotSupported` instead of `Unwatched`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::group::{FieldGroupId, GroupHandle};
use crate::types::FieldKey;

/// Sampling and retention policy for a set of keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchPolicy {
    update_freq_micros: i64,
    max_keep_age_micros: Option<i64>,
    max_keep_samples: usize,
}

impl WatchPolicy {
    /// Validates and builds a policy.
    ///
    /// `max_keep_age_secs` of 0 means no age bound. Any positive age keeps
    /// at least one microsecond.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` for a non-positive frequency, a
    /// negative or non-finite age, or fewer than one retained sample.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Checked ranges above each cast
    pub fn new(update_freq_micros: i64, max_keep_age_secs: f64, max_keep_samples: i64) -> Result<Self> {
        if update_freq_micros <= 0 {
            return Err(CacheError::bad_param(format!(
                "update frequency must be positive, got {update_freq_micros}us"
            )));
        }
        if !max_keep_age_secs.is_finite() || max_keep_age_secs < 0.0 {
            return Err(CacheError::bad_param(format!(
                "max keep age must be a non-negative number of seconds, got {max_keep_age_secs}"
            )));
        }
        if max_keep_samples < 1 {
            return Err(CacheError::bad_param(format!(
                "max keep samples must be at least 1, got {max_keep_samples}"
            )));
        }

        let max_keep_age_micros = (max_keep_age_secs > 0.0)
            .then(|| ((max_keep_age_secs * 1_000_000.0).min(i64::MAX as f64) as i64).max(1));
        Ok(Self {
            update_freq_micros,
            max_keep_age_micros,
            max_keep_samples: usize::try_from(max_keep_samples).unwrap_or(usize::MAX),
        })
    }

    /// Sampling interval in microseconds.
    #[must_use]
    pub const fn update_freq_micros(&self) -> i64 {
        self.update_freq_micros
    }

    /// Age bound in microseconds, `None` when unbounded.
    #[must_use]
    pub const fn max_keep_age_micros(&self) -> Option<i64> {
        self.max_keep_age_micros
    }

    /// Count bound.
    #[must_use]
    pub const fn max_keep_samples(&self) -> usize {
        self.max_keep_samples
    }

    /// Age after which the newest sample of a key counts as stale:
    /// three update periods, but never less than one second.
    #[must_use]
    pub const fn stale_after_micros(&self) -> i64 {
        let three = self.update_freq_micros.saturating_mul(3);
        if three > 1_000_000 { three } else { 1_000_000 }
    }

    /// Merges two policies covering the same key.
    ///
    /// The faster frequency and the larger sample count win. The age bound
    /// is the larger of two finite bounds and unbounded if either side is.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let max_keep_age_micros = match (self.max_keep_age_micros, other.max_keep_age_micros) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        Self {
            update_freq_micros: self.update_freq_micros.min(other.update_freq_micros),
            max_keep_age_micros,
            max_keep_samples: self.max_keep_samples.max(other.max_keep_samples),
        }
    }
}

/// The identity of one watch: an entity group bound to a field group.
pub type BindingKey = (GroupHandle, FieldGroupId);

/// A registered watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSpec {
    /// The entity group.
    pub group: GroupHandle,
    /// The field group.
    pub field_group: FieldGroupId,
    /// The requested policy.
    pub policy: WatchPolicy,
    /// Number of keys the binding installed.
    pub keys: usize,
}

/// Store-side effects of a watch table mutation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchChange {
    /// Keys whose effective policy is new or changed.
    pub updated: Vec<(FieldKey, WatchPolicy)>,
    /// Keys no binding covers any more.
    pub released: Vec<FieldKey>,
}

#[derive(Debug, Clone)]
struct Binding {
    policy: WatchPolicy,
    keys: Vec<FieldKey>,
    unsupported: Vec<FieldKey>,
}

/// Registered bindings and per-key references.
///
/// Not synchronized; the owner serializes mutation.
#[derive(Debug, Default)]
pub struct WatchTable {
    bindings: BTreeMap<BindingKey, Binding>,
    refs: HashMap<FieldKey, BTreeMap<BindingKey, WatchPolicy>>,
    unsupported: HashMap<FieldKey, BTreeSet<BindingKey>>,
}

impl WatchTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a binding over `keys`, replacing any previous binding for
    /// the same pair. `unsupported` lists the pairs the binding asked for
    /// that cannot be sampled; they are covered but never reach the store.
    pub fn install(
        &mut self,
        binding: BindingKey,
        policy: WatchPolicy,
        keys: Vec<FieldKey>,
        unsupported: Vec<FieldKey>,
    ) -> WatchChange {
        let previous = self.bindings.remove(&binding);
        if let Some(old) = &previous {
            self.uncover(binding, &old.unsupported);
        }
        for key in &unsupported {
            self.unsupported.entry(*key).or_default().insert(binding);
        }

        for key in &keys {
            self.refs.entry(*key).or_default().insert(binding, policy);
        }

        let mut touched: Vec<FieldKey> = keys.clone();
        if let Some(old) = previous {
            for key in old.keys {
                if !keys.contains(&key) {
                    if let Some(entry) = self.refs.get_mut(&key) {
                        entry.remove(&binding);
                    }
                    touched.push(key);
                }
            }
        }

        self.bindings.insert(binding, Binding { policy, keys, unsupported });
        self.settle(touched)
    }

    /// Removes a binding.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotWatched` if the pair was never installed.
    pub fn remove(&mut self, binding: BindingKey) -> Result<WatchChange> {
        let removed = self
            .bindings
            .remove(&binding)
            .ok_or_else(|| CacheError::NotWatched {
                group: binding.0.to_string(),
                field_group: binding.1.0,
            })?;

        for key in &removed.keys {
            if let Some(entry) = self.refs.get_mut(key) {
                entry.remove(&binding);
            }
        }
        self.uncover(binding, &removed.unsupported);
        Ok(self.settle(removed.keys))
    }

    fn uncover(&mut self, binding: BindingKey, keys: &[FieldKey]) {
        for key in keys {
            if let Some(entry) = self.unsupported.get_mut(key) {
                entry.remove(&binding);
                if entry.is_empty() {
                    self.unsupported.remove(key);
                }
            }
        }
    }

    fn settle(&mut self, touched: Vec<FieldKey>) -> WatchChange {
        let mut change = WatchChange::default();
        for key in touched {
            match self.effective(key) {
                Some(policy) => change.updated.push((key, policy)),
                None => {
                    self.refs.remove(&key);
                    change.released.push(key);
                }
            }
        }
        change
    }

    /// Returns the merged policy of every binding covering the key.
    #[must_use]
    pub fn effective(&self, key: FieldKey) -> Option<WatchPolicy> {
        self.refs
            .get(&key)?
            .values()
            .copied()
            .reduce(|a, b| a.merge(&b))
    }

    /// Returns `true` if some binding asked for the key but its field does
    /// not apply to the entity.
    #[must_use]
    pub fn covers_unsupported(&self, key: FieldKey) -> bool {
        self.unsupported.contains_key(&key)
    }

    /// Number of bindings covering the key.
    #[must_use]
    pub fn ref_count(&self, key: FieldKey) -> usize {
        self.refs.get(&key).map_or(0, BTreeMap::len)
    }

    /// Number of bindings on an entity group.
    #[must_use]
    pub fn references_group(&self, group: GroupHandle) -> usize {
        self.bindings.keys().filter(|(g, _)| *g == group).count()
    }

    /// Number of bindings on a field group.
    #[must_use]
    pub fn references_field_group(&self, field_group: FieldGroupId) -> usize {
        self.bindings.keys().filter(|(_, f)| *f == field_group).count()
    }

    /// Returns `true` if the pair is installed.
    #[must_use]
    pub fn contains(&self, binding: BindingKey) -> bool {
        self.bindings.contains_key(&binding)
    }

    /// Lists installed bindings.
    #[must_use]
    pub fn specs(&self) -> Vec<WatchSpec> {
        self.bindings
            .iter()
            .map(|((group, field_group), b)| WatchSpec {
                group: *group,
                field_group: *field_group,
                policy: b.policy,
                keys: b.keys.len(),
            })
            .collect()
    }

    /// Returns every watched key with its effective policy.
    #[must_use]
    pub fn watched_keys(&self) -> Vec<(FieldKey, WatchPolicy)> {
        let mut keys: Vec<_> = self
            .refs
            .keys()
            .filter_map(|key| self.effective(*key).map(|p| (*key, p)))
            .collect();
        keys.sort_by_key(|(key, _)| *key);
        keys
    }
}
