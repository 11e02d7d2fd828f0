//! Windowed aggregates over a single field stream.
//!
//! A [`FieldSummaryRequest`] names one [`FieldKey`], a [`SummaryMask`] of
//! requested kinds and a `[start, end]` window in microseconds (0 on either
//! side means unbounded). Only `Ok` samples contribute.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::types::{make_version, FieldKey, FieldType, Sample, SampleStatus};

/// One aggregate kind. Discriminants are the wire bitmask values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    /// Minimum value.
    Min = 0x1,
    /// Maximum value.
    Max = 0x2,
    /// Arithmetic mean.
    Avg = 0x4,
    /// Plain sum.
    Sum = 0x8,
    /// Number of samples.
    Count = 0x10,
    /// Trapezoidal time integral, in value-seconds.
    Integral = 0x20,
    /// Last value minus first value.
    Diff = 0x40,
}

impl SummaryKind {
    /// All kinds in bit order.
    pub const ALL: [Self; 7] = [
        Self::Min,
        Self::Max,
        Self::Avg,
        Self::Sum,
        Self::Count,
        Self::Integral,
        Self::Diff,
    ];

    /// Returns the bitmask value.
    #[must_use]
    pub const fn bit(self) -> u32 {
        self as u32
    }

    /// Returns a short lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Integral => "integral",
            Self::Diff => "diff",
        }
    }
}

impl fmt::Display for SummaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of [`SummaryKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SummaryMask(u32);

impl SummaryMask {
    /// The empty set.
    pub const NONE: Self = Self(0);
    /// Every kind.
    pub const ALL: Self = Self(0x7f);

    /// Builds a mask from raw wire bits.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` if unknown bits are set.
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL.0 != 0 {
            return Err(CacheError::bad_param(format!(
                "unknown summary bits {:#x}",
                bits & !Self::ALL.0
            )));
        }
        Ok(Self(bits))
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if the kind is in the set.
    #[must_use]
    pub const fn contains(self, kind: SummaryKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Returns `true` if every kind in `other` is in the set.
    #[must_use]
    pub const fn contains_all(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the set with `kind` added.
    #[must_use]
    pub const fn with(self, kind: SummaryKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// Returns `true` if no kind is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the set in bit order.
    pub fn kinds(self) -> impl Iterator<Item = SummaryKind> {
        SummaryKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl From<SummaryKind> for SummaryMask {
    fn from(kind: SummaryKind) -> Self {
        Self(kind.bit())
    }
}

impl BitOr for SummaryKind {
    type Output = SummaryMask;

    fn bitor(self, rhs: Self) -> SummaryMask {
        SummaryMask(self.bit() | rhs.bit())
    }
}

impl BitOr<SummaryKind> for SummaryMask {
    type Output = Self;

    fn bitor(self, rhs: SummaryKind) -> Self {
        self.with(rhs)
    }
}

impl BitOr for SummaryMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Version tag of the first [`FieldSummaryRequest`] layout.
#[allow(clippy::cast_possible_truncation)] // The struct is a few dozen bytes
pub const FIELD_SUMMARY_REQUEST_VERSION1: u32 =
    make_version(std::mem::size_of::<FieldSummaryRequest>() as u32, 1);

/// A versioned summary request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSummaryRequest {
    /// Must be [`FIELD_SUMMARY_REQUEST_VERSION1`].
    pub version: u32,
    /// The stream to summarize.
    pub key: FieldKey,
    /// Requested kinds.
    pub mask: SummaryMask,
    /// Window start in microseconds, 0 for unbounded.
    pub start: i64,
    /// Window end in microseconds, 0 for unbounded.
    pub end: i64,
}

impl FieldSummaryRequest {
    /// Creates an unbounded request at the current version.
    #[must_use]
    pub const fn new(key: FieldKey, mask: SummaryMask) -> Self {
        Self {
            version: FIELD_SUMMARY_REQUEST_VERSION1,
            key,
            mask,
            start: 0,
            end: 0,
        }
    }

    /// Restricts the request to `[start, end]`.
    #[must_use]
    pub const fn window(mut self, start: i64, end: i64) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Checks version, mask and window.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::VersionMismatch` for an unknown version and
    /// `CacheError::BadParam` for an empty mask, a negative bound or an
    /// inverted window.
    pub fn validate(&self) -> Result<()> {
        if self.version != FIELD_SUMMARY_REQUEST_VERSION1 {
            return Err(CacheError::VersionMismatch {
                expected: FIELD_SUMMARY_REQUEST_VERSION1,
                actual: self.version,
            });
        }
        if self.mask.is_empty() {
            return Err(CacheError::bad_param("no summary kinds requested"));
        }
        if self.start < 0 || self.end < 0 {
            return Err(CacheError::bad_param("window bounds must not be negative"));
        }
        if self.start != 0 && self.end != 0 && self.start > self.end {
            return Err(CacheError::bad_param(format!(
                "window start {} is after end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// Returns `true` if the timestamp is inside the window.
    #[must_use]
    pub const fn contains(&self, timestamp: i64) -> bool {
        (self.start == 0 || timestamp >= self.start) && (self.end == 0 || timestamp <= self.end)
    }
}

/// One computed aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SummaryValue {
    /// Integer result.
    Int64(i64),
    /// Floating point result.
    Float64(f64),
    /// Not enough samples in the window.
    NoData,
}

impl SummaryValue {
    /// Returns the value as `f64`, if any.
    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(v as f64),
            Self::Float64(v) => Some(v),
            Self::NoData => None,
        }
    }

    /// Returns `true` for [`SummaryValue::NoData`].
    #[must_use]
    pub const fn is_no_data(self) -> bool {
        matches!(self, Self::NoData)
    }
}

impl fmt::Display for SummaryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v:.3}"),
            Self::NoData => f.write_str("-"),
        }
    }
}

/// The result of a summary request, in bit order of the requested kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSummary {
    /// The summarized stream.
    pub key: FieldKey,
    /// `Ok`, or why the stream could not be read.
    pub status: SampleStatus,
    /// Number of `Ok` samples inside the window.
    pub sample_count: usize,
    /// One entry per requested kind.
    pub values: Vec<(SummaryKind, SummaryValue)>,
}

impl FieldSummary {
    /// A summary of an unreadable stream: every requested kind is `NoData`.
    #[must_use]
    pub fn unavailable(request: &FieldSummaryRequest, status: SampleStatus) -> Self {
        Self {
            key: request.key,
            status,
            sample_count: 0,
            values: request.mask.kinds().map(|k| (k, SummaryValue::NoData)).collect(),
        }
    }

    /// Returns the value computed for `kind`, if it was requested.
    #[must_use]
    pub fn get(&self, kind: SummaryKind) -> Option<SummaryValue> {
        self.values
            .iter()
            .find_map(|(k, v)| (*k == kind).then_some(*v))
    }
}

/// Computes the requested aggregates over `samples`.
///
/// `samples` must be in ascending timestamp order. Samples outside the
/// window or with a non-`Ok` status are skipped.
#[must_use]
pub fn summarize(
    request: &FieldSummaryRequest,
    field_type: FieldType,
    samples: &[Sample],
) -> FieldSummary {
    let points: Vec<(i64, f64, Option<i64>)> = samples
        .iter()
        .filter(|s| request.contains(s.timestamp))
        .filter_map(|s| {
            let value = s.numeric()?;
            let int = s.value.as_ref().and_then(|v| v.as_i64());
            Some((s.timestamp, value, int))
        })
        .collect();

    let integer = field_type == FieldType::Int64;
    let values = request
        .mask
        .kinds()
        .map(|kind| (kind, aggregate(kind, &points, integer)))
        .collect();

    FieldSummary {
        key: request.key,
        status: SampleStatus::Ok,
        sample_count: points.len(),
        values,
    }
}

#[allow(clippy::cast_possible_truncation)] // Results are rounded into the field's own integer range
fn aggregate(kind: SummaryKind, points: &[(i64, f64, Option<i64>)], integer: bool) -> SummaryValue {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return SummaryValue::NoData;
    };

    if kind == SummaryKind::Count {
        return SummaryValue::Int64(points.len() as i64);
    }

    if integer {
        let ints = points.iter().map(|(_, v, i)| i.unwrap_or(*v as i64));
        let sum: i128 = ints.clone().map(i128::from).sum();
        let clamp = |v: i128| v.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
        return match kind {
            SummaryKind::Min => ints.min().map_or(SummaryValue::NoData, SummaryValue::Int64),
            SummaryKind::Max => ints.max().map_or(SummaryValue::NoData, SummaryValue::Int64),
            SummaryKind::Sum => SummaryValue::Int64(clamp(sum)),
            SummaryKind::Avg => SummaryValue::Int64(clamp(sum / points.len() as i128)),
            SummaryKind::Diff => {
                let first = i128::from(first.2.unwrap_or(first.1 as i64));
                let last = i128::from(last.2.unwrap_or(last.1 as i64));
                SummaryValue::Int64(clamp(last - first))
            }
            SummaryKind::Integral => {
                integral(points).map_or(SummaryValue::NoData, |v| SummaryValue::Int64(v.round() as i64))
            }
            SummaryKind::Count => SummaryValue::Int64(points.len() as i64),
        };
    }

    let values = points.iter().map(|(_, v, _)| *v);
    match kind {
        SummaryKind::Min => SummaryValue::Float64(values.fold(f64::INFINITY, f64::min)),
        SummaryKind::Max => SummaryValue::Float64(values.fold(f64::NEG_INFINITY, f64::max)),
        SummaryKind::Sum => SummaryValue::Float64(values.sum()),
        SummaryKind::Avg => SummaryValue::Float64(values.sum::<f64>() / points.len() as f64),
        SummaryKind::Diff => SummaryValue::Float64(last.1 - first.1),
        SummaryKind::Integral => integral(points).map_or(SummaryValue::NoData, SummaryValue::Float64),
        SummaryKind::Count => SummaryValue::Int64(points.len() as i64),
    }
}

/// Trapezoidal integral in value-seconds; needs at least two points.
fn integral(points: &[(i64, f64, Option<i64>)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let total = points
        .windows(2)
        .map(|w| {
            let dt_secs = (i128::from(w[1].0) - i128::from(w[0].0)) as f64 / 1_000_000.0;
            (w[0].1 + w[1].1) / 2.0 * dt_secs
        })
        .sum();
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityRef, FieldId};

    fn key() -> FieldKey {
        FieldKey::new(EntityRef::gpu(0), FieldId(150))
    }

    fn ints(points: &[(i64, i64)]) -> Vec<Sample> {
        points.iter().map(|(t, v)| Sample::int64(*t, *v)).collect()
    }

    mod mask_tests {
        use super::*;

        #[test]
        fn mask_bits_match_wire_values() {
            assert_eq!(SummaryKind::Min.bit(), 0x1);
            assert_eq!(SummaryKind::Diff.bit(), 0x40);
            assert_eq!(SummaryMask::ALL.bits(), 0x7f);
        }

        #[test]
        fn mask_iterates_in_bit_order() {
            let mask = SummaryKind::Diff | SummaryKind::Min;
            let kinds: Vec<_> = (mask | SummaryKind::Avg).kinds().collect();
            assert_eq!(kinds, vec![SummaryKind::Min, SummaryKind::Avg, SummaryKind::Diff]);
        }

        #[test]
        fn mask_rejects_unknown_bits() {
            assert!(SummaryMask::from_bits(0x80).is_err());
            assert_eq!(SummaryMask::from_bits(0x3).map(SummaryMask::bits), Ok(0x3));
        }

        #[test]
        fn contains_all() {
            let mask = SummaryKind::Min | SummaryKind::Max;
            assert!(SummaryMask::ALL.contains_all(mask));
            assert!(!mask.contains_all(SummaryMask::ALL));
        }
    }

    mod request_tests {
        use super::*;

        #[test]
        fn current_version_validates() {
            let req = FieldSummaryRequest::new(key(), SummaryKind::Min.into());
            assert!(req.validate().is_ok());
            assert_eq!(FIELD_SUMMARY_REQUEST_VERSION1 >> 24, 1);
        }

        #[test]
        fn wrong_version_is_rejected() {
            let mut req = FieldSummaryRequest::new(key(), SummaryKind::Min.into());
            req.version = make_version(16, 2);
            assert!(matches!(
                req.validate(),
                Err(CacheError::VersionMismatch { .. })
            ));
        }

        #[test]
        fn empty_mask_is_rejected() {
            let req = FieldSummaryRequest::new(key(), SummaryMask::NONE);
            assert!(matches!(req.validate(), Err(CacheError::BadParam { .. })));
        }

        #[test]
        fn inverted_window_is_rejected() {
            let req = FieldSummaryRequest::new(key(), SummaryMask::ALL).window(20, 10);
            assert!(matches!(req.validate(), Err(CacheError::BadParam { .. })));
        }

        #[test]
        fn zero_bounds_are_open() {
            let req = FieldSummaryRequest::new(key(), SummaryMask::ALL).window(0, 100);
            assert!(req.contains(-5));
            assert!(req.contains(100));
            assert!(!req.contains(101));
        }
    }

    mod compute_tests {
        use super::*;

        #[test]
        fn two_point_window() {
            let samples = ints(&[(0, 10), (10_000_000, 20)]);
            let req = FieldSummaryRequest::new(
                key(),
                SummaryKind::Min | SummaryKind::Max | SummaryKind::Avg | SummaryKind::Diff,
            );
            let summary = summarize(&req, FieldType::Int64, &samples);
            assert_eq!(summary.get(SummaryKind::Min), Some(SummaryValue::Int64(10)));
            assert_eq!(summary.get(SummaryKind::Max), Some(SummaryValue::Int64(20)));
            assert_eq!(summary.get(SummaryKind::Avg), Some(SummaryValue::Int64(15)));
            assert_eq!(summary.get(SummaryKind::Diff), Some(SummaryValue::Int64(10)));
            assert_eq!(summary.get(SummaryKind::Sum), None);
        }

        #[test]
        fn integral_is_trapezoidal_in_seconds() {
            let samples = ints(&[(0, 10), (10_000_000, 20)]);
            let req = FieldSummaryRequest::new(key(), SummaryKind::Integral.into());
            let summary = summarize(&req, FieldType::Int64, &samples);
            assert_eq!(summary.get(SummaryKind::Integral), Some(SummaryValue::Int64(150)));
        }

        #[test]
        fn integral_spans_full_timestamp_range() {
            let samples = vec![Sample::float64(i64::MIN, 1.0), Sample::float64(i64::MAX, 3.0)];
            let req = FieldSummaryRequest::new(key(), SummaryKind::Integral.into());
            let summary = summarize(&req, FieldType::Float64, &samples);
            let Some(SummaryValue::Float64(value)) = summary.get(SummaryKind::Integral) else {
                panic!("integral missing");
            };
            let expected = 2.0 * 2f64.powi(64) / 1_000_000.0;
            assert!((value - expected).abs() / expected < 1e-12, "{value}");
        }

        #[test]
        fn integral_needs_two_samples() {
            let samples = ints(&[(0, 10)]);
            let req = FieldSummaryRequest::new(key(), SummaryKind::Integral | SummaryKind::Count);
            let summary = summarize(&req, FieldType::Int64, &samples);
            assert_eq!(summary.get(SummaryKind::Integral), Some(SummaryValue::NoData));
            assert_eq!(summary.get(SummaryKind::Count), Some(SummaryValue::Int64(1)));
        }

        #[test]
        fn empty_window_reports_no_data_for_every_kind() {
            let samples = ints(&[(0, 10), (10, 20)]);
            let req = FieldSummaryRequest::new(key(), SummaryMask::ALL).window(100, 200);
            let summary = summarize(&req, FieldType::Int64, &samples);
            assert_eq!(summary.sample_count, 0);
            assert_eq!(summary.values.len(), 7);
            assert!(summary.values.iter().all(|(_, v)| v.is_no_data()));
        }

        #[test]
        fn non_ok_samples_are_skipped() {
            let mut samples = ints(&[(0, 10), (5, 1000)]);
            samples[1] = samples[1].clone().with_status(SampleStatus::Stale);
            samples.push(Sample::sentinel(6, SampleStatus::NotSupported));
            let req = FieldSummaryRequest::new(key(), SummaryKind::Max | SummaryKind::Count);
            let summary = summarize(&req, FieldType::Int64, &samples);
            assert_eq!(summary.get(SummaryKind::Max), Some(SummaryValue::Int64(10)));
            assert_eq!(summary.get(SummaryKind::Count), Some(SummaryValue::Int64(1)));
        }

        #[test]
        fn int_average_truncates() {
            let samples = ints(&[(1, 1), (2, 2)]);
            let req = FieldSummaryRequest::new(key(), SummaryKind::Avg.into());
            let summary = summarize(&req, FieldType::Int64, &samples);
            assert_eq!(summary.get(SummaryKind::Avg), Some(SummaryValue::Int64(1)));
        }

        #[test]
        fn float_fields_report_floats() {
            let samples = vec![Sample::float64(0, 1.5), Sample::float64(2_000_000, 2.5)];
            let req = FieldSummaryRequest::new(key(), SummaryMask::ALL);
            let summary = summarize(&req, FieldType::Float64, &samples);
            assert_eq!(summary.get(SummaryKind::Sum), Some(SummaryValue::Float64(4.0)));
            assert_eq!(summary.get(SummaryKind::Avg), Some(SummaryValue::Float64(2.0)));
            assert_eq!(summary.get(SummaryKind::Integral), Some(SummaryValue::Float64(4.0)));
            assert_eq!(summary.get(SummaryKind::Count), Some(SummaryValue::Int64(2)));
        }

        #[test]
        fn unavailable_summary_reports_status() {
            let req = FieldSummaryRequest::new(key(), SummaryKind::Min | SummaryKind::Count);
            let summary = FieldSummary::unavailable(&req, SampleStatus::Unwatched);
            assert_eq!(summary.status, SampleStatus::Unwatched);
            assert_eq!(summary.get(SummaryKind::Count), Some(SummaryValue::NoData));
        }

        #[test]
        fn window_bounds_are_inclusive() {
            let samples = ints(&[(10, 1), (20, 2), (30, 3)]);
            let req = FieldSummaryRequest::new(key(), SummaryKind::Sum.into()).window(10, 20);
            let summary = summarize(&req, FieldType::Int64, &samples);
            assert_eq!(summary.get(SummaryKind::Sum), Some(SummaryValue::Int64(3)));
        }
    }
}
