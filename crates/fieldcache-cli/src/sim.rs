//! Deterministic simulated devices.

use fieldcache::{
    field_ids, FieldDescriptor, FieldKey, FieldType, Sample, SampleSource, SampleStatus,
    SampleValue,
};

const FB_TOTAL_MIB: i64 = 81_920;

/// A [`SampleSource`] that synthesizes plausible device readings.
///
/// Values are a pure function of the key and the sampling time, so two
/// runs over the same timestamps produce the same series.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedSource;

impl SimulatedSource {
    /// Creates a simulated source.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    // Load in [0, 1), one slow wave per entity with a per-entity phase.
    fn load(key: FieldKey, now: i64) -> f64 {
        let secs = now as f64 / 1_000_000.0;
        let phase = f64::from(key.entity.id) * 0.7;
        (((secs / 10.0) + phase).sin() + 1.0) / 2.0
    }

    fn value(key: FieldKey, descriptor: &FieldDescriptor, now: i64) -> Option<SampleValue> {
        let load = Self::load(key, now);
        let id = i64::from(key.entity.id);
        let value = match key.field {
            field_ids::GPU_TEMP => SampleValue::Int64(35 + (load * 45.0) as i64),
            field_ids::SWITCH_TEMPERATURE => SampleValue::Int64(40 + (load * 20.0) as i64),
            field_ids::POWER_USAGE => SampleValue::Float64(80.0 + load * 620.0),
            field_ids::GPU_UTIL | field_ids::MEM_COPY_UTIL | field_ids::FAN_SPEED => {
                SampleValue::Int64((load * 100.0) as i64)
            }
            field_ids::SM_CLOCK => SampleValue::Int64(1_095 + (load * 885.0) as i64),
            field_ids::MEM_CLOCK => SampleValue::Int64(2_619),
            field_ids::FB_TOTAL => SampleValue::Int64(FB_TOTAL_MIB),
            field_ids::FB_USED => SampleValue::Int64((load * FB_TOTAL_MIB as f64) as i64),
            field_ids::FB_FREE => {
                SampleValue::Int64(FB_TOTAL_MIB - (load * FB_TOTAL_MIB as f64) as i64)
            }
            field_ids::TOTAL_ENERGY_CONSUMPTION => SampleValue::Int64(now / 1_000 * (id + 1)),
            field_ids::DEV_NAME => SampleValue::String(format!("Simulated GPU {id}")),
            field_ids::DEV_SERIAL => SampleValue::String(format!("SIM{id:010}")),
            field_ids::DRIVER_VERSION => SampleValue::String("550.54.15".to_string()),
            _ => match descriptor.field_type {
                FieldType::Int64 => SampleValue::Int64((load * 1_000.0) as i64),
                FieldType::Float64 => SampleValue::Float64(load),
                FieldType::String | FieldType::Blob => return None,
            },
        };
        Some(value)
    }
}

impl SampleSource for SimulatedSource {
    fn sample(&self, key: FieldKey, descriptor: &FieldDescriptor, now: i64) -> Sample {
        match Self::value(key, descriptor, now) {
            Some(value) => Sample::new(now, value),
            None => Sample::sentinel(now, SampleStatus::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldcache::{EntityRef, FieldRegistry};

    fn sample(key: FieldKey, now: i64) -> Sample {
        let registry = FieldRegistry::with_defaults();
        let descriptor = registry.describe(key.field).unwrap();
        SimulatedSource::new().sample(key, descriptor, now)
    }

    #[test]
    fn samples_are_deterministic() {
        let key = FieldKey::new(EntityRef::gpu(1), field_ids::POWER_USAGE);
        assert_eq!(sample(key, 5_000_000), sample(key, 5_000_000));
    }

    #[test]
    fn values_match_field_types() {
        let registry = FieldRegistry::with_defaults();
        for descriptor in registry.descriptors() {
            let key = FieldKey::new(EntityRef::gpu(0), descriptor.id);
            let sample = SimulatedSource::new().sample(key, descriptor, 1_000_000);
            if let Some(value) = &sample.value {
                assert_eq!(value.field_type(), descriptor.field_type, "{}", descriptor.tag);
            }
        }
    }

    #[test]
    fn temperature_stays_in_range() {
        for t in (0..600).map(|s| s * 1_000_000) {
            let key = FieldKey::new(EntityRef::gpu(3), field_ids::GPU_TEMP);
            let value = sample(key, t).value.and_then(|v| v.as_i64()).unwrap();
            assert!((35..=80).contains(&value));
        }
    }

    #[test]
    fn blobs_are_not_supported() {
        let registry = FieldRegistry::builder()
            .register(FieldDescriptor::new(
                fieldcache::FieldId(9_000),
                "raw",
                FieldType::Blob,
                fieldcache::FieldScope::Gpu,
            ))
            .unwrap()
            .build();
        let key = FieldKey::new(EntityRef::gpu(0), fieldcache::FieldId(9_000));
        let descriptor = registry.describe(key.field).unwrap();
        let sample = SimulatedSource::new().sample(key, descriptor, 0);
        assert_eq!(sample.status, SampleStatus::NotSupported);
    }
}
