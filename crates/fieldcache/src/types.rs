//! Core types for the field cache.
//!
//! This module provides the fundamental types used throughout the crate:
//! - [`EntityGroup`] / [`EntityRef`]: addressable hardware units
//! - [`FieldId`] / [`FieldKey`]: the address of one metric stream
//! - [`Sample`]: a timestamped value tagged with a [`SampleStatus`]
//! - [`make_version`]: versioned request struct encoding

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum length of a string sample, including the terminator on the wire.
pub const MAX_STR_LENGTH: usize = 256;

/// Maximum length of a blob sample.
pub const MAX_BLOB_LENGTH: usize = 4096;

/// Encodes a versioned struct tag as `size | version << 24`.
#[must_use]
pub const fn make_version(size: u32, version: u32) -> u32 {
    size | (version << 24)
}

/// Returns the current wall-clock time in microseconds since the Unix epoch.
#[must_use]
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// The kind of an addressable entity.
///
/// Discriminants match the host-engine entity group identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityGroup {
    /// Not associated with any entity (global fields).
    None = 0,
    /// A physical GPU.
    Gpu = 1,
    /// A virtual GPU.
    VGpu = 2,
    /// A switch.
    Switch = 3,
    /// A GPU instance.
    GpuInstance = 4,
    /// A compute instance inside a GPU instance.
    ComputeInstance = 5,
    /// A link.
    Link = 6,
    /// A CPU socket.
    Cpu = 7,
    /// A CPU core.
    CpuCore = 8,
}

impl EntityGroup {
    /// All entity group kinds in discriminant order.
    pub const ALL: [Self; 9] = [
        Self::None,
        Self::Gpu,
        Self::VGpu,
        Self::Switch,
        Self::GpuInstance,
        Self::ComputeInstance,
        Self::Link,
        Self::Cpu,
        Self::CpuCore,
    ];

    /// Returns the wire identifier of this entity group.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Looks up an entity group by its wire identifier.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.as_u32() == value)
    }

    /// Returns a short lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gpu => "gpu",
            Self::VGpu => "vgpu",
            Self::Switch => "switch",
            Self::GpuInstance => "gpu_instance",
            Self::ComputeInstance => "compute_instance",
            Self::Link => "link",
            Self::Cpu => "cpu",
            Self::CpuCore => "cpu_core",
        }
    }
}

impl fmt::Display for EntityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an entity within its entity group.
pub type EntityId = u32;

/// An (entity group, entity id) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// The entity's kind.
    pub group: EntityGroup,
    /// The entity's ordinal within its kind.
    pub id: EntityId,
}

impl EntityRef {
    /// Creates a new entity reference.
    #[must_use]
    pub const fn new(group: EntityGroup, id: EntityId) -> Self {
        Self { group, id }
    }

    /// Shorthand for a GPU entity.
    #[must_use]
    pub const fn gpu(id: EntityId) -> Self {
        Self::new(EntityGroup::Gpu, id)
    }

    /// Shorthand for a switch entity.
    #[must_use]
    pub const fn switch(id: EntityId) -> Self {
        Self::new(EntityGroup::Switch, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.id)
    }
}

/// Numeric identifier of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldId(pub u16);

impl FieldId {
    /// Returns the raw identifier.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for FieldId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// The unique address of a metric stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey {
    /// The entity being measured.
    pub entity: EntityRef,
    /// The field being measured.
    pub field: FieldId,
}

impl FieldKey {
    /// Creates a new field key.
    #[must_use]
    pub const fn new(entity: EntityRef, field: FieldId) -> Self {
        Self { entity, field }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.field)
    }
}

/// The value type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Signed 64-bit integer.
    Int64,
    /// 64-bit floating point.
    Float64,
    /// Text of at most [`MAX_STR_LENGTH`] - 1 bytes.
    String,
    /// Binary blob of at most [`MAX_BLOB_LENGTH`] bytes.
    Blob,
}

impl FieldType {
    /// Returns `true` for `Int64` and `Float64`.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Int64 | Self::Float64)
    }

    /// Returns the wire type tag (`'i'`, `'d'`, `'s'`, `'b'`).
    #[must_use]
    pub const fn wire_tag(self) -> u8 {
        match self {
            Self::Int64 => b'i',
            Self::Float64 => b'd',
            Self::String => b's',
            Self::Blob => b'b',
        }
    }
}

/// The status attached to a sample.
///
/// Anything other than `Ok` marks a synthesized or degraded sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    /// The sample carries real data.
    Ok,
    /// The key is watched but no data has been recorded.
    NoData,
    /// The newest data is older than its update schedule allows.
    Stale,
    /// The field does not apply to this entity.
    NotSupported,
    /// The caller is not allowed to read this field.
    NotPermissioned,
    /// No watch currently covers the key.
    Unwatched,
}

impl SampleStatus {
    /// Returns the host-engine wire status code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::NotSupported => -6,
            Self::NoData => -14,
            Self::Stale => -15,
            Self::Unwatched => -16,
            Self::NotPermissioned => -17,
        }
    }

    /// Returns `true` if this is [`SampleStatus::Ok`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::NoData => "no_data",
            Self::Stale => "stale",
            Self::NotSupported => "not_supported",
            Self::NotPermissioned => "not_permissioned",
            Self::Unwatched => "unwatched",
        };
        f.write_str(s)
    }
}

/// A typed sample value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SampleValue {
    /// Integer value.
    Int64(i64),
    /// Floating point value.
    Float64(f64),
    /// Text value.
    String(String),
    /// Binary value.
    Blob(Vec<u8>),
}

impl SampleValue {
    /// Returns the field type this value belongs to.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        match self {
            Self::Int64(_) => FieldType::Int64,
            Self::Float64(_) => FieldType::Float64,
            Self::String(_) => FieldType::String,
            Self::Blob(_) => FieldType::Blob,
        }
    }

    /// Returns the value as `f64` if it is numeric.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            Self::String(_) | Self::Blob(_) => None,
        }
    }

    /// Returns the value as `i64` if it is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v:.3}"),
            Self::String(s) => f.write_str(s),
            Self::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// A single timestamped observation of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp in microseconds since the Unix epoch.
    pub timestamp: i64,
    /// Whether the sample carries real data.
    pub status: SampleStatus,
    /// The value, absent for synthesized sentinel samples.
    pub value: Option<SampleValue>,
}

impl Sample {
    /// Creates an `Ok` sample.
    #[must_use]
    pub const fn new(timestamp: i64, value: SampleValue) -> Self {
        Self {
            timestamp,
            status: SampleStatus::Ok,
            value: Some(value),
        }
    }

    /// Creates an `Ok` integer sample.
    #[must_use]
    pub const fn int64(timestamp: i64, value: i64) -> Self {
        Self::new(timestamp, SampleValue::Int64(value))
    }

    /// Creates an `Ok` floating point sample.
    #[must_use]
    pub const fn float64(timestamp: i64, value: f64) -> Self {
        Self::new(timestamp, SampleValue::Float64(value))
    }

    /// Creates an `Ok` string sample.
    #[must_use]
    pub fn string(timestamp: i64, value: impl Into<String>) -> Self {
        Self::new(timestamp, SampleValue::String(value.into()))
    }

    /// Creates a valueless sample carrying only a status.
    #[must_use]
    pub const fn sentinel(timestamp: i64, status: SampleStatus) -> Self {
        Self {
            timestamp,
            status,
            value: None,
        }
    }

    /// Creates an `Ok` sample stamped with the current time.
    #[must_use]
    pub fn now(value: SampleValue) -> Self {
        Self::new(now_micros(), value)
    }

    /// Returns the numeric value of an `Ok` sample.
    #[must_use]
    pub fn numeric(&self) -> Option<f64> {
        if !self.status.is_ok() {
            return None;
        }
        self.value.as_ref().and_then(SampleValue::as_f64)
    }

    /// Returns a copy of this sample with a different status.
    #[must_use]
    pub fn with_status(mut self, status: SampleStatus) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod entity_tests {
        use super::*;

        #[test]
        fn entity_group_wire_ids_roundtrip() {
            for group in EntityGroup::ALL {
                assert_eq!(EntityGroup::from_u32(group.as_u32()), Some(group));
            }
            assert_eq!(EntityGroup::from_u32(99), None);
        }

        #[test]
        fn entity_group_discriminants() {
            assert_eq!(EntityGroup::Gpu.as_u32(), 1);
            assert_eq!(EntityGroup::Switch.as_u32(), 3);
            assert_eq!(EntityGroup::CpuCore.as_u32(), 8);
        }

        #[test]
        fn entity_ref_display() {
            assert_eq!(EntityRef::gpu(3).to_string(), "gpu:3");
            assert_eq!(EntityRef::switch(0).to_string(), "switch:0");
        }

        #[test]
        fn field_key_display_and_ordering() {
            let a = FieldKey::new(EntityRef::gpu(0), FieldId(150));
            let b = FieldKey::new(EntityRef::gpu(1), FieldId(100));
            assert_eq!(a.to_string(), "gpu:0/150");
            assert!(a < b);
        }
    }

    mod sample_tests {
        use super::*;

        #[test]
        fn ok_sample_exposes_numeric_value() {
            let sample = Sample::int64(10, 42);
            assert_eq!(sample.numeric(), Some(42.0));
            assert!(sample.status.is_ok());
        }

        #[test]
        fn sentinel_sample_has_no_value() {
            let sample = Sample::sentinel(10, SampleStatus::NoData);
            assert_eq!(sample.value, None);
            assert_eq!(sample.numeric(), None);
        }

        #[test]
        fn non_ok_sample_is_not_numeric() {
            let sample = Sample::float64(5, 1.5).with_status(SampleStatus::Stale);
            assert_eq!(sample.numeric(), None);
        }

        #[test]
        fn string_sample_is_not_numeric() {
            let sample = Sample::string(5, "GPU-abc");
            assert_eq!(sample.numeric(), None);
            assert_eq!(
                sample.value.map(|v| v.field_type()),
                Some(FieldType::String)
            );
        }

        #[test]
        fn sample_now_returns_reasonable_timestamp() {
            let before = now_micros();
            let sample = Sample::now(SampleValue::Int64(1));
            let after = now_micros();
            assert!(sample.timestamp >= before);
            assert!(sample.timestamp <= after);
        }

        #[test]
        fn sample_serialization_roundtrip() {
            let original = Sample::float64(5000, 123.5);
            let json = serde_json::to_string(&original).unwrap();
            let parsed: Sample = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, original);
        }

        #[test]
        fn status_codes_match_wire_contract() {
            assert_eq!(SampleStatus::Ok.code(), 0);
            assert_eq!(SampleStatus::NoData.code(), -14);
            assert_eq!(SampleStatus::Stale.code(), -15);
            assert_eq!(SampleStatus::Unwatched.code(), -16);
            assert_eq!(SampleStatus::NotPermissioned.code(), -17);
        }
    }

    #[test]
    fn make_version_packs_size_and_version() {
        assert_eq!(make_version(64, 1), 0x0100_0040);
        assert_eq!(make_version(64, 2) >> 24, 2);
        assert_eq!(make_version(64, 2) & 0x00ff_ffff, 64);
    }

    #[test]
    fn value_display() {
        assert_eq!(SampleValue::Float64(1.23456).to_string(), "1.235");
        assert_eq!(SampleValue::Int64(7).to_string(), "7");
        assert_eq!(SampleValue::Blob(vec![0; 4]).to_string(), "<4 bytes>");
    }
}
