//! Reserved sentinel bands for wire-compatible value encoding.
//!
//! Inside the crate every sample carries an explicit [`SampleStatus`]. Wire
//! formats that only have room for a bare value instead reserve a band at
//! the top of each numeric range (and a `<<<...>>>` marker family for
//! strings). Any value inside a band is a status marker, never data, so the
//! store refuses to record `Ok` samples whose value falls into one.

use crate::types::{Sample, SampleStatus, SampleValue};

/// Start of the reserved 32-bit integer band.
pub const INT32_BLANK: i32 = 0x7fff_fff0;
/// Start of the reserved 64-bit integer band.
pub const INT64_BLANK: i64 = 0x7fff_ffff_ffff_fff0;
/// Start of the reserved floating point band (2^47).
pub const FP64_BLANK: f64 = 140_737_488_355_328.0;

/// String marker for a blank value.
pub const STR_BLANK: &str = "<<<NULL>>>";
/// String marker for a value that was not found.
pub const STR_NOT_FOUND: &str = "<<<NOT_FOUND>>>";
/// String marker for an unsupported field.
pub const STR_NOT_SUPPORTED: &str = "<<<NOT_SUPPORTED>>>";
/// String marker for a field the caller may not read.
pub const STR_NOT_PERMISSIONED: &str = "<<<NOT_PERM>>>";

/// A reserved marker value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sentinel {
    /// No value is available.
    Blank,
    /// The value was not found because nothing watches it.
    NotFound,
    /// The field does not apply to the entity.
    NotSupported,
    /// The caller is not permitted to read the field.
    NotPermissioned,
}

impl Sentinel {
    /// Returns the sentinel for a degraded status, or `None` for statuses
    /// that still carry a real value (`Ok`, `Stale`).
    #[must_use]
    pub const fn for_status(status: SampleStatus) -> Option<Self> {
        match status {
            SampleStatus::Ok | SampleStatus::Stale => None,
            SampleStatus::NoData => Some(Self::Blank),
            SampleStatus::Unwatched => Some(Self::NotFound),
            SampleStatus::NotSupported => Some(Self::NotSupported),
            SampleStatus::NotPermissioned => Some(Self::NotPermissioned),
        }
    }

    /// Returns the status this sentinel stands for.
    #[must_use]
    pub const fn status(self) -> SampleStatus {
        match self {
            Self::Blank => SampleStatus::NoData,
            Self::NotFound => SampleStatus::Unwatched,
            Self::NotSupported => SampleStatus::NotSupported,
            Self::NotPermissioned => SampleStatus::NotPermissioned,
        }
    }

    const fn offset(self) -> u8 {
        match self {
            Self::Blank => 0,
            Self::NotFound => 1,
            Self::NotSupported => 2,
            Self::NotPermissioned => 3,
        }
    }

    const fn from_offset(offset: i64) -> Self {
        match offset {
            1 => Self::NotFound,
            2 => Self::NotSupported,
            3 => Self::NotPermissioned,
            _ => Self::Blank,
        }
    }

    /// The 32-bit integer encoding.
    #[must_use]
    pub const fn int32(self) -> i32 {
        INT32_BLANK + self.offset() as i32
    }

    /// The 64-bit integer encoding.
    #[must_use]
    pub const fn int64(self) -> i64 {
        INT64_BLANK + self.offset() as i64
    }

    /// The floating point encoding.
    #[must_use]
    pub fn fp64(self) -> f64 {
        FP64_BLANK + f64::from(self.offset())
    }

    /// The string encoding.
    #[must_use]
    pub const fn str(self) -> &'static str {
        match self {
            Self::Blank => STR_BLANK,
            Self::NotFound => STR_NOT_FOUND,
            Self::NotSupported => STR_NOT_SUPPORTED,
            Self::NotPermissioned => STR_NOT_PERMISSIONED,
        }
    }
}

/// Decodes a 32-bit integer, returning the sentinel if it is in the band.
#[must_use]
pub fn decode_i32(value: i32) -> Option<Sentinel> {
    (value >= INT32_BLANK).then(|| Sentinel::from_offset(i64::from(value - INT32_BLANK)))
}

/// Decodes a 64-bit integer, returning the sentinel if it is in the band.
#[must_use]
pub fn decode_i64(value: i64) -> Option<Sentinel> {
    (value >= INT64_BLANK).then(|| Sentinel::from_offset(value - INT64_BLANK))
}

/// Decodes a float, returning the sentinel if it is in the band.
#[must_use]
pub fn decode_f64(value: f64) -> Option<Sentinel> {
    if value < FP64_BLANK {
        return None;
    }
    let offset = (value - FP64_BLANK).round();
    Some(if offset.is_finite() {
        Sentinel::from_offset(offset as i64)
    } else {
        Sentinel::Blank
    })
}

/// Decodes a string, returning the sentinel if it is a `<<<...>>>` marker.
#[must_use]
pub fn decode_str(value: &str) -> Option<Sentinel> {
    if !is_blank_str(value) {
        return None;
    }
    Some(match value {
        STR_NOT_FOUND => Sentinel::NotFound,
        STR_NOT_SUPPORTED => Sentinel::NotSupported,
        STR_NOT_PERMISSIONED => Sentinel::NotPermissioned,
        _ => Sentinel::Blank,
    })
}

/// Returns `true` if the string is any `<<<...>>>` marker.
#[must_use]
pub fn is_blank_str(value: &str) -> bool {
    value.starts_with("<<<") && value.contains(">>>")
}

/// Returns `true` if a value would be read back as a sentinel on the wire.
#[must_use]
pub fn collides(value: &SampleValue) -> bool {
    match value {
        SampleValue::Int64(v) => decode_i64(*v).is_some(),
        SampleValue::Float64(v) => v.is_nan() || decode_f64(*v).is_some(),
        SampleValue::String(s) => is_blank_str(s),
        SampleValue::Blob(_) => false,
    }
}

/// Encodes a sample as a bare 64-bit integer.
///
/// Degraded samples and non-integer values encode as their sentinel.
#[must_use]
pub fn encode_i64(sample: &Sample) -> i64 {
    match (Sentinel::for_status(sample.status), &sample.value) {
        (None, Some(SampleValue::Int64(v))) => *v,
        (Some(s), _) => s.int64(),
        (None, _) => Sentinel::Blank.int64(),
    }
}

/// Encodes a sample as a bare float.
#[must_use]
pub fn encode_f64(sample: &Sample) -> f64 {
    match (Sentinel::for_status(sample.status), &sample.value) {
        (None, Some(SampleValue::Float64(v))) => *v,
        (Some(s), _) => s.fp64(),
        (None, _) => Sentinel::Blank.fp64(),
    }
}

/// Encodes a sample as a bare string.
#[must_use]
pub fn encode_str(sample: &Sample) -> String {
    match (Sentinel::for_status(sample.status), &sample.value) {
        (None, Some(SampleValue::String(v))) => v.clone(),
        (Some(s), _) => s.str().to_string(),
        (None, _) => STR_BLANK.to_string(),
    }
}
