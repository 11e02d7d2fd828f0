//! The [`FieldCache`] facade.
//!
//! Composes the registry, group directory, watch table, time-series store,
//! status collector and violation policies behind one thread-safe handle. Watch installation
//! and removal, and group destruction, are serialized by the watch table
//! lock so the store always agrees with the set of installed bindings.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::access::{AccessPolicy, AllowAll};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::group::{
    FieldGroupId, FieldGroupInfo, GroupDirectory, GroupHandle, GroupId, GroupInfo, GroupType,
};
use crate::inventory::{Inventory, StaticInventory};
use crate::policy::{PolicyConditionParams, PolicyHandle, PolicyInfo, PolicyRegistry, PolicyViolation};
use crate::registry::FieldRegistry;
use crate::status::{ErrorRecord, StatusHandle, StatusRegistry};
use crate::store::{RecordOutcome, Since, TimeSeriesStore};
use crate::summary::{self, FieldSummary, FieldSummaryRequest};
use crate::types::{now_micros, EntityRef, FieldId, FieldKey, Sample, SampleStatus};
use crate::watch::{WatchChange, WatchPolicy, WatchSpec, WatchTable};

/// Latest values of one entity, in field group order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityValues {
    /// The entity.
    pub entity: EntityRef,
    /// One sample per field.
    pub values: Vec<(FieldId, Sample)>,
}

/// New samples of one key since a cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySamples {
    /// The key.
    pub key: FieldKey,
    /// Samples in ascending timestamp order.
    pub samples: Vec<Sample>,
}

/// Result of a group-wide `since` poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSamples {
    /// Keys with at least one new sample, in member-major order.
    pub entries: Vec<KeySamples>,
    /// Cursor for the next poll: the newest timestamp delivered, or the
    /// request cursor if nothing was.
    pub next_cursor: i64,
}

/// Counts from a [`FieldCache::record_batch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Samples appended.
    pub appended: usize,
    /// Samples dropped as out of order.
    pub out_of_order: usize,
    /// Samples dropped because nothing watches the key.
    pub unwatched: usize,
    /// Samples rejected with an error.
    pub failed: usize,
}

/// Builder for [`FieldCache`].
#[derive(Debug, Default)]
pub struct FieldCacheBuilder {
    config: CacheConfig,
    registry: Option<Arc<FieldRegistry>>,
    inventory: Option<Arc<dyn Inventory>>,
    access: Option<Arc<dyn AccessPolicy>>,
}

impl FieldCacheBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the field registry. Defaults to [`FieldRegistry::with_defaults`].
    #[must_use]
    pub fn registry(mut self, registry: Arc<FieldRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the device inventory. Defaults to an empty [`StaticInventory`].
    #[must_use]
    pub fn inventory(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Sets the access policy. Defaults to [`AllowAll`].
    #[must_use]
    pub fn access(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = Some(access);
        self
    }

    /// Builds the cache.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Config` if the configuration is invalid.
    pub fn build(self) -> Result<FieldCache> {
        self.config.validate()?;
        let default_policy = self.config.watch_defaults.policy()?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(FieldRegistry::with_defaults()));
        let inventory = self
            .inventory
            .unwrap_or_else(|| Arc::new(StaticInventory::new()));
        let access = self.access.unwrap_or_else(|| Arc::new(AllowAll));

        Ok(FieldCache {
            groups: GroupDirectory::new(&self.config.limits, Arc::clone(&inventory), Arc::clone(&registry)),
            status: StatusRegistry::new(self.config.status.queue_capacity),
            policies: PolicyRegistry::new(self.config.status.queue_capacity),
            watches: Mutex::new(WatchTable::new()),
            store: TimeSeriesStore::new(),
            default_policy,
            config: self.config,
            registry,
            access,
        })
    }
}

/// Field-value watch and retention cache.
#[derive(Debug)]
pub struct FieldCache {
    config: CacheConfig,
    default_policy: WatchPolicy,
    registry: Arc<FieldRegistry>,
    access: Arc<dyn AccessPolicy>,
    groups: GroupDirectory,
    watches: Mutex<WatchTable>,
    store: TimeSeriesStore,
    status: StatusRegistry,
    policies: PolicyRegistry,
}

impl FieldCache {
    /// Starts building a cache.
    #[must_use]
    pub fn builder() -> FieldCacheBuilder {
        FieldCacheBuilder::default()
    }

    /// The configuration the cache was built with.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The field registry.
    #[must_use]
    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    /// The policy configured under `[watch_defaults]`.
    #[must_use]
    pub const fn default_policy(&self) -> WatchPolicy {
        self.default_policy
    }

    // Entity groups

    /// Creates an entity group seeded according to `group_type`.
    ///
    /// # Errors
    ///
    /// See [`GroupDirectory::create_group`].
    pub fn create_group(&self, name: &str, group_type: GroupType) -> Result<GroupId> {
        self.groups.create_group(name, group_type)
    }

    /// Creates an entity group with explicit members.
    ///
    /// # Errors
    ///
    /// See [`GroupDirectory::create_group_with_members`].
    pub fn create_group_with_members(&self, name: &str, members: &[EntityRef]) -> Result<GroupId> {
        self.groups.create_group_with_members(name, members)
    }

    /// Destroys an entity group that no watch references.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InUse` if a watch references the group and
    /// `CacheError::BadParam` if it does not exist.
    pub fn destroy_group(&self, id: GroupId) -> Result<()> {
        let watches = self.watches.lock();
        let refs = watches.references_group(GroupHandle::Explicit(id));
        if refs > 0 {
            return Err(CacheError::InUse {
                what: format!("entity group {id}"),
                watches: refs,
            });
        }
        self.groups.destroy_group(id)
    }

    /// Adds an entity to a group. Existing watches keep their snapshot.
    ///
    /// # Errors
    ///
    /// See [`GroupDirectory::add_entity`].
    pub fn add_entity(&self, id: GroupId, entity: EntityRef) -> Result<()> {
        self.groups.add_entity(id, entity)
    }

    /// Removes an entity from a group. Existing watches keep their snapshot.
    ///
    /// # Errors
    ///
    /// See [`GroupDirectory::remove_entity`].
    pub fn remove_entity(&self, id: GroupId, entity: EntityRef) -> Result<()> {
        self.groups.remove_entity(id, entity)
    }

    /// Resolves a group to its current members.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` for an unknown explicit group.
    pub fn group_members(&self, handle: GroupHandle) -> Result<Vec<EntityRef>> {
        self.groups.resolve_members(handle)
    }

    /// Lists explicit entity groups.
    #[must_use]
    pub fn list_groups(&self) -> Vec<GroupId> {
        self.groups.list_groups()
    }

    /// Returns name and members of a group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` for an unknown explicit group.
    pub fn group_info(&self, handle: GroupHandle) -> Result<GroupInfo> {
        self.groups.group_info(handle)
    }

    // Field groups

    /// Creates a field group.
    ///
    /// # Errors
    ///
    /// See [`GroupDirectory::create_field_group`].
    pub fn create_field_group(&self, name: &str, fields: &[FieldId]) -> Result<FieldGroupId> {
        self.groups.create_field_group(name, fields)
    }

    /// Destroys a field group that no watch references.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InUse` if a watch references the field group
    /// and `CacheError::BadParam` if it does not exist.
    pub fn destroy_field_group(&self, id: FieldGroupId) -> Result<()> {
        let watches = self.watches.lock();
        let refs = watches.references_field_group(id);
        if refs > 0 {
            return Err(CacheError::InUse {
                what: format!("field group {id}"),
                watches: refs,
            });
        }
        self.groups.destroy_field_group(id)
    }

    /// Adds a field to a field group.
    ///
    /// # Errors
    ///
    /// See [`GroupDirectory::add_field`].
    pub fn add_field(&self, id: FieldGroupId, field: FieldId) -> Result<()> {
        self.groups.add_field(id, field)
    }

    /// Removes a field from a field group.
    ///
    /// # Errors
    ///
    /// See [`GroupDirectory::remove_field`].
    pub fn remove_field(&self, id: FieldGroupId, field: FieldId) -> Result<()> {
        self.groups.remove_field(id, field)
    }

    /// Returns the fields of a field group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` if the field group does not exist.
    pub fn field_group_fields(&self, id: FieldGroupId) -> Result<Vec<FieldId>> {
        self.groups.field_group_fields(id)
    }

    /// Lists field groups.
    #[must_use]
    pub fn list_field_groups(&self) -> Vec<FieldGroupId> {
        self.groups.list_field_groups()
    }

    /// Returns name and fields of a field group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` if the field group does not exist.
    pub fn field_group_info(&self, id: FieldGroupId) -> Result<FieldGroupInfo> {
        self.groups.field_group_info(id)
    }

    // Watches

    /// Watches every (entity, field) pair of a group and field group.
    ///
    /// Pairs whose field does not apply to the entity kind are not sampled
    /// and read back as `NotSupported` until unwatched. If `status` is given
    /// each one is also reported there. Watching the
    /// same pair again replaces its binding and re-snapshots membership.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` for an unknown group or field group,
    /// `CacheError::GroupIsEmpty` if either group has no members and
    /// `CacheError::NotFound` for a dead status handle.
    pub fn watch(
        &self,
        handle: GroupHandle,
        field_group: FieldGroupId,
        policy: WatchPolicy,
        status: Option<StatusHandle>,
    ) -> Result<WatchSpec> {
        self.check_status(status)?;

        // Reserved groups enumerate the inventory; do that before locking.
        let live = match handle {
            GroupHandle::AllOfKind(_) => Some(self.groups.resolve_members(handle)?),
            GroupHandle::Explicit(_) => None,
        };

        let mut watches = self.watches.lock();
        let entities = match live {
            Some(entities) => entities,
            None => self.groups.resolve_members(handle)?,
        };
        let fields = self.groups.field_group_fields(field_group)?;
        if entities.is_empty() {
            return Err(CacheError::GroupIsEmpty {
                group: handle.to_string(),
            });
        }
        if fields.is_empty() {
            return Err(CacheError::GroupIsEmpty {
                group: format!("field group {field_group}"),
            });
        }

        let mut keys = Vec::with_capacity(entities.len() * fields.len());
        let mut unsupported = Vec::new();
        for entity in &entities {
            for field in &fields {
                let descriptor = self.registry.describe(*field)?;
                if descriptor.supports(entity.group) {
                    keys.push(FieldKey::new(*entity, *field));
                } else {
                    debug!(entity = %entity, field_id = field.0, "skipping unsupported pair");
                    unsupported.push(FieldKey::new(*entity, *field));
                    self.report(
                        status,
                        ErrorRecord::from_status(*entity, Some(*field), SampleStatus::NotSupported),
                    );
                }
            }
        }

        let installed = keys.len();
        let change = watches.install((handle, field_group), policy, keys, unsupported);
        self.apply(change);
        drop(watches);

        info!(
            group = %handle,
            field_group = %field_group,
            keys = installed,
            update_freq_micros = policy.update_freq_micros(),
            max_keep_samples = policy.max_keep_samples(),
            "installed watch"
        );
        Ok(WatchSpec {
            group: handle,
            field_group,
            policy,
            keys: installed,
        })
    }

    /// Removes a watch. Keys no other watch covers are dropped with their
    /// samples.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotWatched` if the pair was never watched.
    pub fn unwatch(&self, handle: GroupHandle, field_group: FieldGroupId) -> Result<()> {
        let mut watches = self.watches.lock();
        let change = watches.remove((handle, field_group))?;
        let released = change.released.len();
        self.apply(change);
        drop(watches);

        info!(group = %handle, field_group = %field_group, released, "removed watch");
        Ok(())
    }

    fn apply(&self, change: WatchChange) {
        let now = now_micros();
        for (key, policy) in change.updated {
            self.store.set_policy(key, policy, now);
        }
        for key in change.released {
            self.store.remove(key);
        }
    }

    /// Lists installed watches.
    #[must_use]
    pub fn watches(&self) -> Vec<WatchSpec> {
        self.watches.lock().specs()
    }

    /// Every watched key with its effective policy.
    #[must_use]
    pub fn watched_keys(&self) -> Vec<(FieldKey, WatchPolicy)> {
        self.watches.lock().watched_keys()
    }

    /// The effective policy of a key, if watched.
    #[must_use]
    pub fn effective_policy(&self, key: FieldKey) -> Option<WatchPolicy> {
        self.watches.lock().effective(key)
    }

    // Recording

    /// Records a sample stamped by its producer.
    ///
    /// # Errors
    ///
    /// See [`FieldCache::record_at`].
    pub fn record(&self, key: FieldKey, sample: Sample) -> Result<RecordOutcome> {
        self.record_at(key, sample, now_micros())
    }

    /// Records a sample, evaluating age bounds against `now`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::UnknownField` for an unregistered field and
    /// `CacheError::BadParam` if the value type does not match the field or
    /// the value is not recordable.
    pub fn record_at(&self, key: FieldKey, sample: Sample, now: i64) -> Result<RecordOutcome> {
        let descriptor = self.registry.describe(key.field)?;
        if let Some(value) = &sample.value {
            if value.field_type() != descriptor.field_type {
                return Err(CacheError::bad_param(format!(
                    "field {} expects {:?}, got {:?}",
                    key.field,
                    descriptor.field_type,
                    value.field_type()
                )));
            }
        }
        if self.policies.is_empty() {
            return self.store.record(key, sample, now);
        }
        let checked = sample.clone();
        let outcome = self.store.record(key, sample, now)?;
        if outcome == RecordOutcome::Appended {
            self.policies.observe(key, &checked);
        }
        Ok(outcome)
    }

    /// Records many samples, collecting per-item failures in `status`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` only if `status` is not a live
    /// handle; per-sample problems never fail the batch.
    pub fn record_batch(
        &self,
        samples: impl IntoIterator<Item = (FieldKey, Sample)>,
        status: Option<StatusHandle>,
    ) -> Result<BatchReport> {
        self.check_status(status)?;
        let now = now_micros();
        let mut report = BatchReport::default();

        for (key, sample) in samples {
            match self.record_at(key, sample, now) {
                Ok(RecordOutcome::Appended) => report.appended += 1,
                Ok(RecordOutcome::OutOfOrder) => report.out_of_order += 1,
                Ok(RecordOutcome::Unwatched) => {
                    report.unwatched += 1;
                    self.report(
                        status,
                        ErrorRecord::from_status(key.entity, Some(key.field), SampleStatus::Unwatched),
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    self.report(status, ErrorRecord::from_error(key.entity, Some(key.field), &err));
                }
            }
        }

        debug!(
            appended = report.appended,
            unwatched = report.unwatched,
            failed = report.failed,
            "recorded batch"
        );
        Ok(report)
    }

    /// Applies age bounds to every key, including idle ones.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(now_micros())
    }

    /// Applies age bounds relative to `now`.
    pub fn evict_expired_at(&self, now: i64) -> usize {
        self.store.evict_expired(now)
    }

    // Queries

    /// Returns the newest sample of a key or a status sentinel.
    #[must_use]
    pub fn latest(&self, key: FieldKey) -> Sample {
        self.latest_at(key, now_micros())
    }

    /// Returns the newest sample of a key, judging staleness against `now`.
    ///
    /// Status precedence: `Unwatched`, `NotSupported`, `NotPermissioned`,
    /// `NoData`.
    #[must_use]
    pub fn latest_at(&self, key: FieldKey, now: i64) -> Sample {
        if !self.store.is_watched(key) {
            return Sample::sentinel(now, self.unwatched_status(key));
        }
        if let Some(status) = self.blocked(key) {
            return Sample::sentinel(now, status);
        }
        self.store.latest(key, now)
    }

    /// Returns the newest sample of every key, aligned with `keys`.
    ///
    /// The batch is read without any eviction running in between.
    #[must_use]
    pub fn latest_many(&self, keys: &[FieldKey]) -> Vec<Sample> {
        self.latest_many_at(keys, now_micros())
    }

    /// [`FieldCache::latest_many`] judged against `now`.
    #[must_use]
    pub fn latest_many_at(&self, keys: &[FieldKey], now: i64) -> Vec<Sample> {
        let samples = self.store.bulk_latest(keys, now);
        // Store locks are released here; the watch table is locked only if
        // some key is missing from the store.
        let mut watches = None;
        samples
            .into_iter()
            .zip(keys)
            .map(|(sample, key)| {
                if sample.status == SampleStatus::Unwatched {
                    let table = watches.get_or_insert_with(|| self.watches.lock());
                    if table.covers_unsupported(*key) {
                        return Sample::sentinel(now, SampleStatus::NotSupported);
                    }
                    return sample;
                }
                match self.blocked(*key) {
                    Some(status) => Sample::sentinel(now, status),
                    None => sample,
                }
            })
            .collect()
    }

    /// Returns the latest value of every field on every member of a group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` for an unknown group or field group.
    pub fn latest_for_group(&self, handle: GroupHandle, field_group: FieldGroupId) -> Result<Vec<EntityValues>> {
        let entities = self.groups.resolve_members(handle)?;
        let fields = self.groups.field_group_fields(field_group)?;
        let keys: Vec<FieldKey> = entities
            .iter()
            .flat_map(|e| fields.iter().map(|f| FieldKey::new(*e, *f)))
            .collect();

        let mut samples = self.latest_many(&keys).into_iter();
        Ok(entities
            .into_iter()
            .map(|entity| EntityValues {
                entity,
                values: fields.iter().copied().zip(samples.by_ref()).collect(),
            })
            .collect())
    }

    /// Returns the samples of a key newer than `cursor`.
    ///
    /// Unwatched, unsupported and denied keys yield nothing.
    #[must_use]
    pub fn since(&self, key: FieldKey, cursor: i64) -> Since {
        if self.blocked(key).is_some() {
            return Since::empty(cursor);
        }
        self.store.since(key, cursor)
    }

    /// Returns every new sample of a group and field group since `cursor`.
    ///
    /// One cursor covers all keys; a producer that stamps a key with a time
    /// older than the returned cursor will not be seen by the next poll.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` for an unknown group or field group.
    pub fn values_since(&self, handle: GroupHandle, field_group: FieldGroupId, cursor: i64) -> Result<GroupSamples> {
        let entities = self.groups.resolve_members(handle)?;
        let fields = self.groups.field_group_fields(field_group)?;

        let mut next_cursor = cursor;
        let mut entries = Vec::new();
        for entity in entities {
            for field in &fields {
                let key = FieldKey::new(entity, *field);
                let samples: Vec<Sample> = self.since(key, cursor).collect();
                if let Some(last) = samples.last() {
                    next_cursor = next_cursor.max(last.timestamp);
                    entries.push(KeySamples { key, samples });
                }
            }
        }
        Ok(GroupSamples { entries, next_cursor })
    }

    /// Computes aggregates over a window of one key.
    ///
    /// A key that cannot be read yields a summary whose status says why and
    /// whose values are all `NoData`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::VersionMismatch` or `CacheError::BadParam` for a
    /// malformed request, `CacheError::UnknownField` for an unregistered
    /// field and `CacheError::FieldUnsupportedByApi` when the field does not
    /// support a requested kind.
    pub fn summarize(&self, request: &FieldSummaryRequest) -> Result<FieldSummary> {
        request.validate()?;
        let descriptor = self.registry.describe(request.key.field)?;
        if !descriptor.field_type.is_numeric() {
            return Err(CacheError::FieldUnsupportedByApi {
                field_id: descriptor.id.0,
                reason: format!("{:?} fields cannot be summarized", descriptor.field_type),
            });
        }
        if !descriptor.summaries.contains_all(request.mask) {
            return Err(CacheError::FieldUnsupportedByApi {
                field_id: descriptor.id.0,
                reason: format!("summary mask {:#x} not supported", request.mask.bits()),
            });
        }

        if !self.store.is_watched(request.key) {
            return Ok(FieldSummary::unavailable(request, self.unwatched_status(request.key)));
        }
        if let Some(status) = self.blocked(request.key) {
            return Ok(FieldSummary::unavailable(request, status));
        }

        let samples = self.store.snapshot(request.key).unwrap_or_default();
        Ok(summary::summarize(request, descriptor.field_type, &samples))
    }

    /// Status of a key the store does not hold.
    fn unwatched_status(&self, key: FieldKey) -> SampleStatus {
        if self.watches.lock().covers_unsupported(key) {
            SampleStatus::NotSupported
        } else {
            SampleStatus::Unwatched
        }
    }

    /// Why a key cannot be read, ignoring whether it is watched.
    fn blocked(&self, key: FieldKey) -> Option<SampleStatus> {
        let supported = self
            .registry
            .describe(key.field)
            .is_ok_and(|d| d.supports(key.entity.group));
        if !supported {
            return Some(SampleStatus::NotSupported);
        }
        if !self.access.permits(key) {
            return Some(SampleStatus::NotPermissioned);
        }
        None
    }

    // Status collectors

    /// Creates a status queue.
    pub fn create_status(&self) -> StatusHandle {
        self.status.create()
    }

    /// Pops the oldest record from a status queue.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::EmptyQueue` when drained and
    /// `CacheError::NotFound` for a dead handle.
    pub fn pop_status(&self, handle: StatusHandle) -> Result<ErrorRecord> {
        self.status.pop(handle)
    }

    /// Number of queued records.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` for a dead handle.
    pub fn status_len(&self, handle: StatusHandle) -> Result<usize> {
        self.status.len(handle)
    }

    /// Number of records dropped because the queue was full.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` for a dead handle.
    pub fn status_overflowed(&self, handle: StatusHandle) -> Result<u64> {
        self.status.overflowed(handle)
    }

    /// Empties a status queue.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` for a dead handle.
    pub fn clear_status(&self, handle: StatusHandle) -> Result<()> {
        self.status.clear(handle)
    }

    /// Destroys a status queue.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` for a dead handle.
    pub fn destroy_status(&self, handle: StatusHandle) -> Result<()> {
        self.status.destroy(handle)
    }

    // Violation policies

    /// Sets a violation policy on a group's current members.
    ///
    /// Members are snapshotted now; set the policy again to pick up
    /// inventory changes. Conditions are checked against recorded samples,
    /// so the fields named by [`PolicyConditionParams::fields`] must be
    /// watched on the same entities.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` for an unknown group or parameters
    /// with no condition enabled, and `CacheError::GroupIsEmpty` if the
    /// group has no members.
    pub fn set_violation_policy(&self, handle: GroupHandle, params: PolicyConditionParams) -> Result<PolicyHandle> {
        params.validate()?;
        let members = self.groups.resolve_members(handle)?;
        if members.is_empty() {
            return Err(CacheError::GroupIsEmpty {
                group: handle.to_string(),
            });
        }
        let count = members.len();
        let policy = self.policies.set(handle, params, members)?;
        info!(
            policy = %policy,
            group = %handle,
            members = count,
            conditions = params.conditions().count(),
            "set violation policy"
        );
        Ok(policy)
    }

    /// Removes a violation policy and its queued violations.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` for a dead handle.
    pub fn clear_violation_policy(&self, policy: PolicyHandle) -> Result<()> {
        self.policies.clear(policy)?;
        info!(policy = %policy, "cleared violation policy");
        Ok(())
    }

    /// Pops the oldest violation of a policy.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::EmptyQueue` when drained and
    /// `CacheError::NotFound` for a dead handle.
    pub fn pop_violation(&self, policy: PolicyHandle) -> Result<PolicyViolation> {
        self.policies.pop(policy)
    }

    /// Number of queued violations.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` for a dead handle.
    pub fn violation_count(&self, policy: PolicyHandle) -> Result<usize> {
        self.policies.len(policy)
    }

    /// Number of violations dropped because the queue was full.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` for a dead handle.
    pub fn violations_overflowed(&self, policy: PolicyHandle) -> Result<u64> {
        self.policies.overflowed(policy)
    }

    /// Lists registered violation policies.
    #[must_use]
    pub fn violation_policies(&self) -> Vec<PolicyInfo> {
        self.policies.list()
    }

    fn check_status(&self, status: Option<StatusHandle>) -> Result<()> {
        match status {
            Some(handle) => self.status.len(handle).map(|_| ()),
            None => Ok(()),
        }
    }

    fn report(&self, status: Option<StatusHandle>, record: ErrorRecord) {
        if let Some(handle) = status {
            // The handle was checked at the start of the operation; a queue
            // destroyed since then just loses the record.
            let _ = self.status.push(handle, record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::DenyList;
    use crate::group::ReservedGroup;
    use crate::registry::field_ids;
    use crate::summary::{SummaryKind, SummaryValue};

    const SEC: i64 = 1_000_000;

    fn cache() -> (FieldCache, Arc<StaticInventory>) {
        let inventory = Arc::new(StaticInventory::with_devices(2, 1));
        let cache = FieldCache::builder()
            .inventory(inventory.clone())
            .build()
            .unwrap();
        (cache, inventory)
    }

    fn policy(samples: i64) -> WatchPolicy {
        WatchPolicy::new(SEC, 0.0, samples).unwrap()
    }

    fn temp(gpu: u32) -> FieldKey {
        FieldKey::new(EntityRef::gpu(gpu), field_ids::GPU_TEMP)
    }

    fn watch_temps(cache: &FieldCache, samples: i64) -> (GroupId, FieldGroupId) {
        let group = cache.create_group("gpus", GroupType::DefaultGpus).unwrap();
        let fields = cache.create_field_group("temps", &[field_ids::GPU_TEMP]).unwrap();
        cache.watch(group.into(), fields, policy(samples), None).unwrap();
        (group, fields)
    }

    mod watch_tests {
        use super::*;

        #[test]
        fn never_watched_key_is_unwatched() {
            let (cache, _) = cache();
            assert_eq!(cache.latest(temp(0)).status, SampleStatus::Unwatched);
        }

        #[test]
        fn watched_key_without_samples_is_no_data() {
            let (cache, _) = cache();
            watch_temps(&cache, 1);
            assert_eq!(cache.latest(temp(0)).status, SampleStatus::NoData);
        }

        #[test]
        fn unwatch_drops_series() {
            let (cache, _) = cache();
            let (group, fields) = watch_temps(&cache, 10);
            let now = now_micros();
            cache.record_at(temp(0), Sample::int64(now, 50), now).unwrap();

            cache.unwatch(group.into(), fields).unwrap();
            assert_eq!(cache.latest(temp(0)).status, SampleStatus::Unwatched);
            assert_eq!(
                cache.record(temp(0), Sample::int64(now + 1, 51)).unwrap(),
                RecordOutcome::Unwatched
            );
            assert!(matches!(
                cache.unwatch(group.into(), fields),
                Err(CacheError::NotWatched { .. })
            ));
        }

        #[test]
        fn overlapping_watches_keep_loosest_retention() {
            let (cache, _) = cache();
            let (_, fields) = watch_temps(&cache, 10);
            let all = GroupHandle::AllOfKind(ReservedGroup::AllGpus);
            cache.watch(all, fields, policy(20), None).unwrap();

            assert_eq!(cache.effective_policy(temp(0)).unwrap().max_keep_samples(), 20);
            cache.unwatch(all, fields).unwrap();
            assert_eq!(cache.effective_policy(temp(0)).unwrap().max_keep_samples(), 10);
        }

        #[test]
        fn unsupported_pairs_are_skipped_and_reported() {
            let (cache, _) = cache();
            let status = cache.create_status();
            let fields = cache.create_field_group("temps", &[field_ids::GPU_TEMP]).unwrap();
            let spec = cache
                .watch(ReservedGroup::AllEntities.into(), fields, policy(1), Some(status))
                .unwrap();

            assert_eq!(spec.keys, 2);
            let record = cache.pop_status(status).unwrap();
            assert_eq!(record.entity, EntityRef::switch(0));
            assert_eq!(record.code, SampleStatus::NotSupported.code());
            assert_eq!(cache.pop_status(status), Err(CacheError::EmptyQueue));

            let switch_temp = FieldKey::new(EntityRef::switch(0), field_ids::GPU_TEMP);
            assert_eq!(cache.latest(switch_temp).status, SampleStatus::NotSupported);
            assert_eq!(
                cache.latest_many(&[temp(0), switch_temp])[1].status,
                SampleStatus::NotSupported
            );
            assert_eq!(cache.since(switch_temp, 0).count(), 0);
            assert!(!cache.watched_keys().iter().any(|(key, _)| *key == switch_temp));
        }

        #[test]
        fn unwatch_releases_unsupported_pairs() {
            let (cache, _) = cache();
            let fields = cache.create_field_group("temps", &[field_ids::GPU_TEMP]).unwrap();
            let all = GroupHandle::AllOfKind(ReservedGroup::AllEntities);
            cache.watch(all, fields, policy(1), None).unwrap();
            let switch_temp = FieldKey::new(EntityRef::switch(0), field_ids::GPU_TEMP);

            let summary = cache
                .summarize(&FieldSummaryRequest::new(switch_temp, SummaryKind::Max.into()))
                .unwrap();
            assert_eq!(summary.status, SampleStatus::NotSupported);

            cache.unwatch(all, fields).unwrap();
            assert_eq!(cache.latest(switch_temp).status, SampleStatus::Unwatched);
            assert_eq!(cache.latest_many(&[switch_temp])[0].status, SampleStatus::Unwatched);
        }

        #[test]
        fn empty_group_cannot_be_watched() {
            let (cache, _) = cache();
            let group = cache.create_group("empty", GroupType::Empty).unwrap();
            let fields = cache.create_field_group("temps", &[field_ids::GPU_TEMP]).unwrap();
            assert!(matches!(
                cache.watch(group.into(), fields, policy(1), None),
                Err(CacheError::GroupIsEmpty { .. })
            ));
        }

        #[test]
        fn dead_status_handle_fails_before_installing() {
            let (cache, _) = cache();
            let status = cache.create_status();
            cache.destroy_status(status).unwrap();
            let fields = cache.create_field_group("temps", &[field_ids::GPU_TEMP]).unwrap();
            assert!(matches!(
                cache.watch(ReservedGroup::AllGpus.into(), fields, policy(1), Some(status)),
                Err(CacheError::NotFound { .. })
            ));
            assert!(cache.watches().is_empty());
        }
    }

    mod policy_tests {
        use super::*;
        use crate::policy::{PolicyCondition, ViolationData};

        fn thermal(threshold: u32) -> PolicyConditionParams {
            PolicyConditionParams {
                thermal_enabled: true,
                thermal_threshold: threshold,
                ..PolicyConditionParams::default()
            }
        }

        #[test]
        fn recorded_samples_raise_violations() {
            let (cache, _) = cache();
            let (group, _) = watch_temps(&cache, 10);
            let policy = cache.set_violation_policy(group.into(), thermal(80)).unwrap();
            let now = now_micros();
            cache.record_at(temp(0), Sample::int64(now, 79), now).unwrap();
            cache.record_at(temp(1), Sample::int64(now, 92), now).unwrap();

            let violation = cache.pop_violation(policy).unwrap();
            assert_eq!(violation.entity, EntityRef::gpu(1));
            assert_eq!(violation.condition(), PolicyCondition::Thermal);
            assert_eq!(violation.data, ViolationData::Thermal { temperature: 92 });
            assert_eq!(cache.pop_violation(policy), Err(CacheError::EmptyQueue));
        }

        #[test]
        fn dropped_samples_are_not_checked() {
            let (cache, _) = cache();
            let policy = cache
                .set_violation_policy(ReservedGroup::AllGpus.into(), thermal(80))
                .unwrap();
            let now = now_micros();
            assert_eq!(
                cache.record_at(temp(0), Sample::int64(now, 95), now).unwrap(),
                RecordOutcome::Unwatched
            );

            watch_temps(&cache, 10);
            cache.record_at(temp(0), Sample::int64(now, 95), now).unwrap();
            cache.record_at(temp(0), Sample::int64(now - 5, 99), now).unwrap();
            assert_eq!(cache.violation_count(policy).unwrap(), 1);
        }

        #[test]
        fn invalid_policies_are_rejected() {
            let (cache, _) = cache();
            assert!(matches!(
                cache.set_violation_policy(ReservedGroup::AllGpus.into(), PolicyConditionParams::default()),
                Err(CacheError::BadParam { .. })
            ));
            let empty = cache.create_group("empty", GroupType::Empty).unwrap();
            assert!(matches!(
                cache.set_violation_policy(empty.into(), thermal(80)),
                Err(CacheError::GroupIsEmpty { .. })
            ));
            assert!(cache.violation_policies().is_empty());
        }

        #[test]
        fn cleared_policy_stops_collecting() {
            let (cache, _) = cache();
            let (group, _) = watch_temps(&cache, 10);
            let policy = cache.set_violation_policy(group.into(), thermal(50)).unwrap();
            assert_eq!(cache.violation_policies().len(), 1);

            cache.clear_violation_policy(policy).unwrap();
            let now = now_micros();
            cache.record_at(temp(0), Sample::int64(now, 90), now).unwrap();
            assert!(matches!(cache.pop_violation(policy), Err(CacheError::NotFound { .. })));
            assert!(matches!(cache.violations_overflowed(policy), Err(CacheError::NotFound { .. })));
        }
    }

    mod destroy_tests {
        use super::*;

        #[test]
        fn destroying_watched_groups_fails_in_use() {
            let (cache, _) = cache();
            let (group, fields) = watch_temps(&cache, 1);

            let err = cache.destroy_group(group).unwrap_err();
            assert!(matches!(err, CacheError::InUse { watches: 1, .. }));
            let err = cache.destroy_field_group(fields).unwrap_err();
            assert!(matches!(err, CacheError::InUse { watches: 1, .. }));

            cache.unwatch(group.into(), fields).unwrap();
            cache.destroy_group(group).unwrap();
            cache.destroy_field_group(fields).unwrap();
        }

        #[test]
        fn field_group_watched_through_reserved_group_is_in_use() {
            let (cache, _) = cache();
            let fields = cache.create_field_group("temps", &[field_ids::GPU_TEMP]).unwrap();
            cache.watch(ReservedGroup::AllGpus.into(), fields, policy(1), None).unwrap();
            assert!(matches!(
                cache.destroy_field_group(fields),
                Err(CacheError::InUse { .. })
            ));
        }
    }

    mod query_tests {
        use super::*;

        #[test]
        fn record_rejects_wrong_type() {
            let (cache, _) = cache();
            watch_temps(&cache, 1);
            let err = cache.record(temp(0), Sample::float64(1, 1.0)).unwrap_err();
            assert!(matches!(err, CacheError::BadParam { .. }));
            assert!(matches!(
                cache.record(FieldKey::new(EntityRef::gpu(0), FieldId(9999)), Sample::int64(1, 1)),
                Err(CacheError::UnknownField { .. })
            ));
        }

        #[test]
        fn denied_key_reads_not_permissioned() {
            let inventory = Arc::new(StaticInventory::with_devices(1, 0));
            let cache = FieldCache::builder()
                .inventory(inventory)
                .access(Arc::new(DenyList::new().deny_key(temp(0))))
                .build()
                .unwrap();
            watch_temps(&cache, 1);
            let now = now_micros();
            cache.record_at(temp(0), Sample::int64(now, 70), now).unwrap();

            assert_eq!(cache.latest_at(temp(0), now).status, SampleStatus::NotPermissioned);
            assert_eq!(cache.since(temp(0), 0).count(), 0);
            let summary = cache
                .summarize(&FieldSummaryRequest::new(temp(0), SummaryKind::Max.into()))
                .unwrap();
            assert_eq!(summary.status, SampleStatus::NotPermissioned);
        }

        #[test]
        fn latest_for_group_is_member_major() {
            let (cache, _) = cache();
            let group = cache.create_group("gpus", GroupType::DefaultGpus).unwrap();
            let fields = cache
                .create_field_group("f", &[field_ids::GPU_TEMP, field_ids::FB_USED])
                .unwrap();
            cache.watch(group.into(), fields, policy(1), None).unwrap();
            let now = now_micros();
            let used = FieldKey::new(EntityRef::gpu(1), field_ids::FB_USED);
            cache.record_at(used, Sample::int64(now, 1024), now).unwrap();

            let values = cache.latest_for_group(group.into(), fields).unwrap();
            assert_eq!(values.len(), 2);
            assert_eq!(values[1].entity, EntityRef::gpu(1));
            assert_eq!(values[1].values[0].0, field_ids::GPU_TEMP);
            assert_eq!(values[1].values[0].1.status, SampleStatus::NoData);
            assert_eq!(values[1].values[1].1.value, Some(crate::types::SampleValue::Int64(1024)));
        }

        #[test]
        fn values_since_advances_cursor() {
            let (cache, _) = cache();
            let (group, fields) = watch_temps(&cache, 10);
            let base = now_micros();
            cache.record_at(temp(0), Sample::int64(base, 1), base).unwrap();
            cache.record_at(temp(1), Sample::int64(base + 5, 2), base + 5).unwrap();

            let first = cache.values_since(group.into(), fields, 0).unwrap();
            assert_eq!(first.entries.len(), 2);
            assert_eq!(first.next_cursor, base + 5);

            cache.record_at(temp(0), Sample::int64(base + 10, 3), base + 10).unwrap();
            let second = cache.values_since(group.into(), fields, first.next_cursor).unwrap();
            assert_eq!(second.entries.len(), 1);
            assert_eq!(second.entries[0].key, temp(0));
            assert_eq!(second.next_cursor, base + 10);
        }

        #[test]
        fn summarize_two_points() {
            let (cache, _) = cache();
            watch_temps(&cache, 10);
            let base = now_micros();
            cache.record_at(temp(0), Sample::int64(base, 10), base).unwrap();
            cache
                .record_at(temp(0), Sample::int64(base + 10 * SEC, 20), base + 10 * SEC)
                .unwrap();

            let request = FieldSummaryRequest::new(
                temp(0),
                SummaryKind::Min | SummaryKind::Max | SummaryKind::Avg | SummaryKind::Diff,
            );
            let summary = cache.summarize(&request).unwrap();
            assert_eq!(summary.get(SummaryKind::Min), Some(SummaryValue::Int64(10)));
            assert_eq!(summary.get(SummaryKind::Max), Some(SummaryValue::Int64(20)));
            assert_eq!(summary.get(SummaryKind::Avg), Some(SummaryValue::Int64(15)));
            assert_eq!(summary.get(SummaryKind::Diff), Some(SummaryValue::Int64(10)));
        }

        #[test]
        fn summarize_string_field_fails() {
            let (cache, _) = cache();
            let key = FieldKey::new(EntityRef::gpu(0), field_ids::DEV_UUID);
            let err = cache
                .summarize(&FieldSummaryRequest::new(key, SummaryKind::Count.into()))
                .unwrap_err();
            assert!(matches!(err, CacheError::FieldUnsupportedByApi { .. }));
        }

        #[test]
        fn summarize_unwatched_key_is_empty() {
            let (cache, _) = cache();
            let summary = cache
                .summarize(&FieldSummaryRequest::new(temp(0), SummaryKind::Count.into()))
                .unwrap();
            assert_eq!(summary.status, SampleStatus::Unwatched);
            assert_eq!(summary.get(SummaryKind::Count), Some(SummaryValue::NoData));
        }

        #[test]
        fn record_batch_reports_failures() {
            let (cache, _) = cache();
            watch_temps(&cache, 10);
            let status = cache.create_status();
            let now = now_micros();
            let unwatched = FieldKey::new(EntityRef::gpu(0), field_ids::FB_FREE);

            let report = cache
                .record_batch(
                    vec![
                        (temp(0), Sample::int64(now, 40)),
                        (temp(1), Sample::float64(now, 1.0)),
                        (unwatched, Sample::int64(now, 1)),
                        (temp(0), Sample::int64(now - 10, 41)),
                    ],
                    Some(status),
                )
                .unwrap();

            assert_eq!(
                report,
                BatchReport {
                    appended: 1,
                    out_of_order: 1,
                    unwatched: 1,
                    failed: 1,
                }
            );
            assert_eq!(cache.status_len(status).unwrap(), 2);
            assert_eq!(cache.pop_status(status).unwrap().code, -1);
            assert_eq!(cache.pop_status(status).unwrap().code, SampleStatus::Unwatched.code());
        }
    }
}
