//! Violation policies on entity groups.
//!
//! A policy checks every sample the cache records for the members of a
//! group and queues a [`PolicyViolation`] when a configured condition is
//! met. Threshold conditions (thermal, power, retired pages) fire once when
//! the value rises above the threshold and re-arm when it falls back.
//! Counter conditions (double-bit ECC, PCIe replay) fire whenever the
//! counter rises; the first sample after the policy is set is the baseline.
//!
//! Only recorded samples are checked, so the fields a policy depends on
//! (see [`PolicyCondition::fields`]) must be watched for it to fire.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CacheError, Result};
use crate::group::GroupHandle;
use crate::registry::field_ids;
use crate::types::{EntityRef, FieldId, FieldKey, Sample, SampleValue};

/// Handle to one registered policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyHandle(Uuid);

impl fmt::Display for PolicyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A condition a policy can watch for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCondition {
    /// Double-bit ECC errors occurred.
    DoubleBitEcc,
    /// The PCIe replay counter moved.
    PcieReplay,
    /// Too many pages were retired.
    MaxRetiredPages,
    /// Temperature above the limit.
    Thermal,
    /// Power draw above the limit.
    Power,
}

impl PolicyCondition {
    /// Every condition.
    pub const ALL: [Self; 5] = [
        Self::DoubleBitEcc,
        Self::PcieReplay,
        Self::MaxRetiredPages,
        Self::Thermal,
        Self::Power,
    ];

    /// Fields whose samples the condition is evaluated on.
    #[must_use]
    pub const fn fields(self) -> &'static [FieldId] {
        match self {
            Self::DoubleBitEcc => &[field_ids::ECC_DBE_VOL_TOTAL],
            Self::PcieReplay => &[field_ids::PCIE_REPLAY_COUNTER],
            Self::MaxRetiredPages => &[field_ids::RETIRED_SBE, field_ids::RETIRED_DBE],
            Self::Thermal => &[field_ids::GPU_TEMP],
            Self::Power => &[field_ids::POWER_USAGE],
        }
    }

    /// Human-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DoubleBitEcc => "double-bit ECC error",
            Self::PcieReplay => "PCIe replay",
            Self::MaxRetiredPages => "max retired pages",
            Self::Thermal => "thermal limit",
            Self::Power => "power limit",
        }
    }
}

impl fmt::Display for PolicyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which conditions a policy checks, and their thresholds.
///
/// Thresholds of disabled conditions are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConditionParams {
    /// Check for double-bit ECC errors.
    pub dbe_enabled: bool,
    /// Check for PCIe replays.
    pub pcie_enabled: bool,
    /// Check the retired page count.
    pub max_retired_pages_enabled: bool,
    /// Retired pages (single plus double bit) allowed before a violation.
    pub max_retired_pages_threshold: u32,
    /// Check the GPU temperature.
    pub thermal_enabled: bool,
    /// Highest allowed temperature in degrees Celsius.
    pub thermal_threshold: u32,
    /// Check the power draw.
    pub power_enabled: bool,
    /// Highest allowed power draw in watts.
    pub power_threshold: u32,
}

impl Default for PolicyConditionParams {
    fn default() -> Self {
        Self {
            dbe_enabled: false,
            pcie_enabled: false,
            max_retired_pages_enabled: false,
            max_retired_pages_threshold: 10,
            thermal_enabled: false,
            thermal_threshold: 100,
            power_enabled: false,
            power_threshold: 250,
        }
    }
}

impl PolicyConditionParams {
    /// Returns `true` if the condition is enabled.
    #[must_use]
    pub const fn enabled(&self, condition: PolicyCondition) -> bool {
        match condition {
            PolicyCondition::DoubleBitEcc => self.dbe_enabled,
            PolicyCondition::PcieReplay => self.pcie_enabled,
            PolicyCondition::MaxRetiredPages => self.max_retired_pages_enabled,
            PolicyCondition::Thermal => self.thermal_enabled,
            PolicyCondition::Power => self.power_enabled,
        }
    }

    /// Enabled conditions, in [`PolicyCondition::ALL`] order.
    pub fn conditions(&self) -> impl Iterator<Item = PolicyCondition> + '_ {
        PolicyCondition::ALL.into_iter().filter(|c| self.enabled(*c))
    }

    /// Fields that must be watched for every enabled condition to be checked.
    #[must_use]
    pub fn fields(&self) -> Vec<FieldId> {
        self.conditions().flat_map(|c| c.fields().iter().copied()).collect()
    }

    /// Validates the parameters.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` if no condition is enabled.
    pub fn validate(&self) -> Result<()> {
        if self.conditions().next().is_none() {
            return Err(CacheError::bad_param("at least one policy condition must be enabled"));
        }
        Ok(())
    }
}

/// What a violation observed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "condition")]
pub enum ViolationData {
    /// New double-bit ECC errors since the previous reading.
    DoubleBitEcc {
        /// Errors added.
        errors: i64,
    },
    /// New PCIe replays since the previous reading.
    PcieReplay {
        /// Replays added.
        replays: i64,
    },
    /// Retired pages over the threshold.
    MaxRetiredPages {
        /// Pages retired for single-bit errors.
        sbe_pages: i64,
        /// Pages retired for double-bit errors.
        dbe_pages: i64,
    },
    /// Temperature over the threshold.
    Thermal {
        /// Degrees Celsius.
        temperature: i64,
    },
    /// Power draw over the threshold.
    Power {
        /// Watts.
        watts: f64,
    },
}

impl ViolationData {
    /// The condition that fired.
    #[must_use]
    pub const fn condition(&self) -> PolicyCondition {
        match self {
            Self::DoubleBitEcc { .. } => PolicyCondition::DoubleBitEcc,
            Self::PcieReplay { .. } => PolicyCondition::PcieReplay,
            Self::MaxRetiredPages { .. } => PolicyCondition::MaxRetiredPages,
            Self::Thermal { .. } => PolicyCondition::Thermal,
            Self::Power { .. } => PolicyCondition::Power,
        }
    }
}

/// One policy violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolation {
    /// The entity that violated the policy.
    pub entity: EntityRef,
    /// Timestamp of the sample that triggered it, in microseconds.
    pub timestamp: i64,
    /// What was observed.
    pub data: ViolationData,
}

impl PolicyViolation {
    /// The condition that fired.
    #[must_use]
    pub const fn condition(&self) -> PolicyCondition {
        self.data.condition()
    }
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.entity, self.timestamp, self.condition())
    }
}

/// A registered policy as listed by [`PolicyRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyInfo {
    /// The policy handle.
    pub handle: PolicyHandle,
    /// The group it was set on.
    pub group: GroupHandle,
    /// Its conditions.
    pub params: PolicyConditionParams,
    /// Members snapshotted when it was set.
    pub members: usize,
}

// Per-entity evaluation state.
#[derive(Debug, Default)]
struct Track {
    dbe: Option<i64>,
    pcie: Option<i64>,
    retired_sbe: Option<i64>,
    retired_dbe: Option<i64>,
    over_pages: bool,
    over_thermal: bool,
    over_power: bool,
}

impl Track {
    fn evaluate(&mut self, params: &PolicyConditionParams, field: FieldId, sample: &Sample) -> Option<ViolationData> {
        let int = sample.value.as_ref().and_then(SampleValue::as_i64);
        match field {
            field_ids::GPU_TEMP if params.thermal_enabled => {
                let temperature = int?;
                crossed(&mut self.over_thermal, temperature > i64::from(params.thermal_threshold))
                    .then_some(ViolationData::Thermal { temperature })
            }
            field_ids::POWER_USAGE if params.power_enabled => {
                let watts = sample.numeric()?;
                crossed(&mut self.over_power, watts > f64::from(params.power_threshold))
                    .then_some(ViolationData::Power { watts })
            }
            field_ids::ECC_DBE_VOL_TOTAL if params.dbe_enabled => {
                rise(&mut self.dbe, int?).map(|errors| ViolationData::DoubleBitEcc { errors })
            }
            field_ids::PCIE_REPLAY_COUNTER if params.pcie_enabled => {
                rise(&mut self.pcie, int?).map(|replays| ViolationData::PcieReplay { replays })
            }
            field_ids::RETIRED_SBE | field_ids::RETIRED_DBE if params.max_retired_pages_enabled => {
                let pages = int?;
                if field == field_ids::RETIRED_SBE {
                    self.retired_sbe = Some(pages);
                } else {
                    self.retired_dbe = Some(pages);
                }
                let sbe_pages = self.retired_sbe.unwrap_or(0);
                let dbe_pages = self.retired_dbe.unwrap_or(0);
                let total = sbe_pages.saturating_add(dbe_pages);
                crossed(&mut self.over_pages, total > i64::from(params.max_retired_pages_threshold))
                    .then_some(ViolationData::MaxRetiredPages { sbe_pages, dbe_pages })
            }
            _ => None,
        }
    }
}

// Fires on the transition into the over-threshold state.
fn crossed(over: &mut bool, now_over: bool) -> bool {
    let fire = now_over && !*over;
    *over = now_over;
    fire
}

// Increase over the previous reading; a drop is a counter reset and only
// moves the baseline.
fn rise(last: &mut Option<i64>, value: i64) -> Option<i64> {
    let previous = last.replace(value)?;
    (value > previous).then(|| value.saturating_sub(previous))
}

fn is_policy_field(field: FieldId) -> bool {
    matches!(
        field,
        field_ids::GPU_TEMP
            | field_ids::POWER_USAGE
            | field_ids::ECC_DBE_VOL_TOTAL
            | field_ids::PCIE_REPLAY_COUNTER
            | field_ids::RETIRED_SBE
            | field_ids::RETIRED_DBE
    )
}

#[derive(Debug, Default)]
struct PolicyState {
    violations: VecDeque<PolicyViolation>,
    overflowed: u64,
    tracks: HashMap<EntityRef, Track>,
}

#[derive(Debug)]
struct Policy {
    group: GroupHandle,
    params: PolicyConditionParams,
    members: HashSet<EntityRef>,
    state: Mutex<PolicyState>,
}

/// All registered policies and their violation queues.
///
/// Each queue holds at most `capacity` violations; once full, new ones are
/// counted as overflowed and dropped.
#[derive(Debug)]
pub struct PolicyRegistry {
    capacity: usize,
    policies: RwLock<HashMap<PolicyHandle, Arc<Policy>>>,
}

impl PolicyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a policy over a snapshot of the group's members.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` if no condition is enabled.
    pub fn set(&self, group: GroupHandle, params: PolicyConditionParams, members: Vec<EntityRef>) -> Result<PolicyHandle> {
        params.validate()?;
        let handle = PolicyHandle(Uuid::new_v4());
        let policy = Policy {
            group,
            params,
            members: members.into_iter().collect(),
            state: Mutex::new(PolicyState::default()),
        };
        self.policies.write().insert(handle, Arc::new(policy));
        debug!(policy = %handle, group = %group, "registered policy");
        Ok(handle)
    }

    /// Removes a policy and drops its queued violations.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` if the handle is not live.
    pub fn clear(&self, handle: PolicyHandle) -> Result<()> {
        self.policies
            .write()
            .remove(&handle)
            .map(|_| debug!(policy = %handle, "cleared policy"))
            .ok_or_else(|| not_found(handle))
    }

    /// Checks a recorded sample against every policy covering its entity.
    ///
    /// Returns the number of violations queued.
    pub fn observe(&self, key: FieldKey, sample: &Sample) -> usize {
        if !sample.status.is_ok() || !is_policy_field(key.field) {
            return 0;
        }
        let policies = self.policies.read();
        let mut queued = 0;
        for (handle, policy) in policies.iter() {
            if !policy.members.contains(&key.entity) {
                continue;
            }
            let mut state = policy.state.lock();
            let track = state.tracks.entry(key.entity).or_default();
            let Some(data) = track.evaluate(&policy.params, key.field, sample) else {
                continue;
            };

            warn!(
                policy = %handle,
                entity = %key.entity,
                condition = %data.condition(),
                timestamp = sample.timestamp,
                "policy violation"
            );
            if state.violations.len() >= self.capacity {
                state.overflowed += 1;
                warn!(policy = %handle, capacity = self.capacity, "violation queue full, dropping violation");
                continue;
            }
            state.violations.push_back(PolicyViolation {
                entity: key.entity,
                timestamp: sample.timestamp,
                data,
            });
            queued += 1;
        }
        queued
    }

    fn with_state<T>(&self, handle: PolicyHandle, f: impl FnOnce(&mut PolicyState) -> T) -> Result<T> {
        let policies = self.policies.read();
        let policy = policies.get(&handle).ok_or_else(|| not_found(handle))?;
        let mut state = policy.state.lock();
        Ok(f(&mut state))
    }

    /// Removes and returns the oldest violation.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::EmptyQueue` when drained and
    /// `CacheError::NotFound` if the handle is not live.
    pub fn pop(&self, handle: PolicyHandle) -> Result<PolicyViolation> {
        self.with_state(handle, |state| state.violations.pop_front())?
            .ok_or(CacheError::EmptyQueue)
    }

    /// Number of queued violations.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` if the handle is not live.
    pub fn len(&self, handle: PolicyHandle) -> Result<usize> {
        self.with_state(handle, |state| state.violations.len())
    }

    /// Number of violations dropped because the queue was full.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NotFound` if the handle is not live.
    pub fn overflowed(&self, handle: PolicyHandle) -> Result<u64> {
        self.with_state(handle, |state| state.overflowed)
    }

    /// Lists registered policies.
    #[must_use]
    pub fn list(&self) -> Vec<PolicyInfo> {
        self.policies
            .read()
            .iter()
            .map(|(handle, policy)| PolicyInfo {
                handle: *handle,
                group: policy.group,
                params: policy.params,
                members: policy.members.len(),
            })
            .collect()
    }

    /// Returns `true` if no policy is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }
}

fn not_found(handle: PolicyHandle) -> CacheError {
    CacheError::NotFound {
        what: "policy",
        id: handle.to_string(),
    }
}
