//! Field descriptor catalog.
//!
//! The [`FieldRegistry`] maps a [`FieldId`] to its value type, scope and the
//! summary kinds it supports. It is built once and then shared read-only
//! (usually behind an `Arc`) by every component that needs it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::summary::SummaryMask;
use crate::types::{EntityGroup, FieldId, FieldType};

/// Well-known field identifiers registered by [`FieldRegistry::with_defaults`].
pub mod field_ids {
    use crate::types::FieldId;

    /// Driver version string.
    pub const DRIVER_VERSION: FieldId = FieldId(1);
    /// Device product name.
    pub const DEV_NAME: FieldId = FieldId(50);
    /// Device serial number.
    pub const DEV_SERIAL: FieldId = FieldId(53);
    /// Device UUID.
    pub const DEV_UUID: FieldId = FieldId(54);
    /// CPU affinity mask, cores 0-63.
    pub const CPU_AFFINITY_0: FieldId = FieldId(70);
    /// CPU affinity mask, cores 64-127.
    pub const CPU_AFFINITY_1: FieldId = FieldId(71);
    /// CPU affinity mask, cores 128-191.
    pub const CPU_AFFINITY_2: FieldId = FieldId(72);
    /// CPU affinity mask, cores 192-255.
    pub const CPU_AFFINITY_3: FieldId = FieldId(73);
    /// SM clock (MHz).
    pub const SM_CLOCK: FieldId = FieldId(100);
    /// Memory clock (MHz).
    pub const MEM_CLOCK: FieldId = FieldId(101);
    /// GPU temperature (C).
    pub const GPU_TEMP: FieldId = FieldId(150);
    /// Power usage (W).
    pub const POWER_USAGE: FieldId = FieldId(155);
    /// Total energy consumed since driver load (mJ).
    pub const TOTAL_ENERGY_CONSUMPTION: FieldId = FieldId(156);
    /// Fan speed (%).
    pub const FAN_SPEED: FieldId = FieldId(191);
    /// PCIe transmit throughput (KB/s).
    pub const PCIE_TX_THROUGHPUT: FieldId = FieldId(200);
    /// PCIe receive throughput (KB/s).
    pub const PCIE_RX_THROUGHPUT: FieldId = FieldId(201);
    /// PCIe replay counter.
    pub const PCIE_REPLAY_COUNTER: FieldId = FieldId(202);
    /// GPU utilization (%).
    pub const GPU_UTIL: FieldId = FieldId(203);
    /// Memory copy utilization (%).
    pub const MEM_COPY_UTIL: FieldId = FieldId(204);
    /// Maximum PCIe link generation.
    pub const PCIE_MAX_LINK_GEN: FieldId = FieldId(235);
    /// Maximum PCIe link width.
    pub const PCIE_MAX_LINK_WIDTH: FieldId = FieldId(236);
    /// Total framebuffer memory (MB).
    pub const FB_TOTAL: FieldId = FieldId(250);
    /// Free framebuffer memory (MB).
    pub const FB_FREE: FieldId = FieldId(251);
    /// Used framebuffer memory (MB).
    pub const FB_USED: FieldId = FieldId(252);
    /// Volatile single-bit ECC errors.
    pub const ECC_SBE_VOL_TOTAL: FieldId = FieldId(310);
    /// Volatile double-bit ECC errors.
    pub const ECC_DBE_VOL_TOTAL: FieldId = FieldId(311);
    /// Pages retired for single-bit ECC errors.
    pub const RETIRED_SBE: FieldId = FieldId(390);
    /// Pages retired for double-bit ECC errors.
    pub const RETIRED_DBE: FieldId = FieldId(391);
    /// Link bandwidth counter.
    pub const LINK_BANDWIDTH_TOTAL: FieldId = FieldId(449);
    /// Switch temperature (C).
    pub const SWITCH_TEMPERATURE: FieldId = FieldId(856);
    /// Ratio of cycles with at least one warp resident on an SM.
    pub const PROF_SM_ACTIVE: FieldId = FieldId(1002);
    /// Ratio of resident warps to the SM maximum.
    pub const PROF_SM_OCCUPANCY: FieldId = FieldId(1003);
    /// Ratio of cycles the device memory interface is active.
    pub const PROF_DRAM_ACTIVE: FieldId = FieldId(1005);
}

/// Which entities a field can be sampled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldScope {
    /// Not tied to an entity; valid on any entity.
    Global,
    /// GPUs and their partitions.
    Gpu,
    /// Switches.
    Switch,
    /// Links.
    Link,
    /// CPUs and CPU cores.
    Cpu,
}

impl FieldScope {
    /// Returns `true` if a field of this scope can be sampled on the entity kind.
    #[must_use]
    pub const fn applies_to(self, group: EntityGroup) -> bool {
        match self {
            Self::Global => true,
            Self::Gpu => matches!(
                group,
                EntityGroup::Gpu
                    | EntityGroup::VGpu
                    | EntityGroup::GpuInstance
                    | EntityGroup::ComputeInstance
            ),
            Self::Switch => matches!(group, EntityGroup::Switch),
            Self::Link => matches!(group, EntityGroup::Link),
            Self::Cpu => matches!(group, EntityGroup::Cpu | EntityGroup::CpuCore),
        }
    }
}

/// Static description of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// The field identifier.
    pub id: FieldId,
    /// Short machine-readable name, e.g. `gpu_temp`.
    pub tag: String,
    /// Value type of every sample of this field.
    pub field_type: FieldType,
    /// Entities this field applies to.
    pub scope: FieldScope,
    /// Summary kinds the field supports.
    pub summaries: SummaryMask,
}

impl FieldDescriptor {
    /// Creates a descriptor. Numeric fields support every summary kind,
    /// string and blob fields support none.
    #[must_use]
    pub fn new(id: FieldId, tag: impl Into<String>, field_type: FieldType, scope: FieldScope) -> Self {
        let summaries = if field_type.is_numeric() {
            SummaryMask::ALL
        } else {
            SummaryMask::NONE
        };
        Self {
            id,
            tag: tag.into(),
            field_type,
            scope,
            summaries,
        }
    }

    /// Overrides the supported summary kinds.
    #[must_use]
    pub const fn with_summaries(mut self, summaries: SummaryMask) -> Self {
        self.summaries = summaries;
        self
    }

    /// Returns `true` if the field can be sampled on the entity kind.
    #[must_use]
    pub const fn supports(&self, group: EntityGroup) -> bool {
        self.scope.applies_to(group)
    }
}

/// Read-only catalog of field descriptors.
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    fields: HashMap<FieldId, FieldDescriptor>,
}

impl FieldRegistry {
    /// Starts building a custom registry.
    #[must_use]
    pub fn builder() -> FieldRegistryBuilder {
        FieldRegistryBuilder::default()
    }

    /// Returns a registry with the standard device status fields.
    #[must_use]
    pub fn with_defaults() -> Self {
        use field_ids as f;
        use FieldScope::{Global, Gpu, Link, Switch};
        use FieldType::{Float64, Int64, String};

        let fixed = SummaryMask::NONE;
        let descriptors = [
            FieldDescriptor::new(f::DRIVER_VERSION, "driver_version", String, Global),
            FieldDescriptor::new(f::DEV_NAME, "dev_name", String, Gpu),
            FieldDescriptor::new(f::DEV_SERIAL, "dev_serial", String, Gpu),
            FieldDescriptor::new(f::DEV_UUID, "dev_uuid", String, Gpu),
            FieldDescriptor::new(f::CPU_AFFINITY_0, "cpu_affinity_0", Int64, Gpu).with_summaries(fixed),
            FieldDescriptor::new(f::CPU_AFFINITY_1, "cpu_affinity_1", Int64, Gpu).with_summaries(fixed),
            FieldDescriptor::new(f::CPU_AFFINITY_2, "cpu_affinity_2", Int64, Gpu).with_summaries(fixed),
            FieldDescriptor::new(f::CPU_AFFINITY_3, "cpu_affinity_3", Int64, Gpu).with_summaries(fixed),
            FieldDescriptor::new(f::SM_CLOCK, "sm_clock", Int64, Gpu),
            FieldDescriptor::new(f::MEM_CLOCK, "mem_clock", Int64, Gpu),
            FieldDescriptor::new(f::GPU_TEMP, "gpu_temp", Int64, Gpu),
            FieldDescriptor::new(f::POWER_USAGE, "power_usage", Float64, Gpu),
            FieldDescriptor::new(f::TOTAL_ENERGY_CONSUMPTION, "total_energy_consumption", Int64, Gpu),
            FieldDescriptor::new(f::FAN_SPEED, "fan_speed", Int64, Gpu),
            FieldDescriptor::new(f::PCIE_TX_THROUGHPUT, "pcie_tx_throughput", Int64, Gpu),
            FieldDescriptor::new(f::PCIE_RX_THROUGHPUT, "pcie_rx_throughput", Int64, Gpu),
            FieldDescriptor::new(f::PCIE_REPLAY_COUNTER, "pcie_replay_counter", Int64, Gpu),
            FieldDescriptor::new(f::GPU_UTIL, "gpu_util", Int64, Gpu),
            FieldDescriptor::new(f::MEM_COPY_UTIL, "mem_copy_util", Int64, Gpu),
            FieldDescriptor::new(f::PCIE_MAX_LINK_GEN, "pcie_max_link_gen", Int64, Gpu).with_summaries(fixed),
            FieldDescriptor::new(f::PCIE_MAX_LINK_WIDTH, "pcie_max_link_width", Int64, Gpu).with_summaries(fixed),
            FieldDescriptor::new(f::FB_TOTAL, "fb_total", Int64, Gpu),
            FieldDescriptor::new(f::FB_FREE, "fb_free", Int64, Gpu),
            FieldDescriptor::new(f::FB_USED, "fb_used", Int64, Gpu),
            FieldDescriptor::new(f::ECC_SBE_VOL_TOTAL, "ecc_sbe_vol_total", Int64, Gpu),
            FieldDescriptor::new(f::ECC_DBE_VOL_TOTAL, "ecc_dbe_vol_total", Int64, Gpu),
            FieldDescriptor::new(f::RETIRED_SBE, "retired_sbe", Int64, Gpu),
            FieldDescriptor::new(f::RETIRED_DBE, "retired_dbe", Int64, Gpu),
            FieldDescriptor::new(f::LINK_BANDWIDTH_TOTAL, "link_bandwidth_total", Int64, Link),
            FieldDescriptor::new(f::SWITCH_TEMPERATURE, "switch_temperature", Int64, Switch),
            FieldDescriptor::new(f::PROF_SM_ACTIVE, "prof_sm_active", Float64, Gpu),
            FieldDescriptor::new(f::PROF_SM_OCCUPANCY, "prof_sm_occupancy", Float64, Gpu),
            FieldDescriptor::new(f::PROF_DRAM_ACTIVE, "prof_dram_active", Float64, Gpu),
        ];

        Self {
            fields: descriptors.into_iter().map(|d| (d.id, d)).collect(),
        }
    }

    /// Looks up a field descriptor.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::UnknownField` if the id is not registered.
    pub fn describe(&self, id: FieldId) -> Result<&FieldDescriptor> {
        self.fields
            .get(&id)
            .ok_or(CacheError::UnknownField { field_id: id.0 })
    }

    /// Returns the summary kinds supported by a field.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::UnknownField` if the id is not registered.
    pub fn summaries_supported_for(&self, id: FieldId) -> Result<SummaryMask> {
        self.describe(id).map(|d| d.summaries)
    }

    /// Looks up a descriptor by its tag.
    #[must_use]
    pub fn by_tag(&self, tag: &str) -> Option<&FieldDescriptor> {
        self.fields.values().find(|d| d.tag == tag)
    }

    /// Returns `true` if the id is registered.
    #[must_use]
    pub fn contains(&self, id: FieldId) -> bool {
        self.fields.contains_key(&id)
    }

    /// Number of registered fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if no fields are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns all descriptors ordered by field id.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&FieldDescriptor> {
        let mut all: Vec<_> = self.fields.values().collect();
        all.sort_by_key(|d| d.id);
        all
    }
}

/// Builder for a custom [`FieldRegistry`].
#[derive(Debug, Default)]
pub struct FieldRegistryBuilder {
    fields: HashMap<FieldId, FieldDescriptor>,
}

impl FieldRegistryBuilder {
    /// Adds a descriptor.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::DuplicateKey` if the id or tag is already registered.
    pub fn register(mut self, descriptor: FieldDescriptor) -> Result<Self> {
        if self.fields.contains_key(&descriptor.id) {
            return Err(CacheError::DuplicateKey {
                key: format!("field {}", descriptor.id),
            });
        }
        if self.fields.values().any(|d| d.tag == descriptor.tag) {
            return Err(CacheError::DuplicateKey {
                key: format!("field tag {}", descriptor.tag),
            });
        }
        self.fields.insert(descriptor.id, descriptor);
        Ok(self)
    }

    /// Finishes the registry.
    #[must_use]
    pub fn build(self) -> FieldRegistry {
        FieldRegistry {
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::SummaryKind;

    mod default_catalog_tests {
        use super::*;

        #[test]
        fn defaults_describe_known_fields() {
            let registry = FieldRegistry::with_defaults();
            let temp = registry.describe(field_ids::GPU_TEMP).unwrap();
            assert_eq!(temp.tag, "gpu_temp");
            assert_eq!(temp.field_type, FieldType::Int64);
            assert_eq!(temp.scope, FieldScope::Gpu);

            let power = registry.describe(field_ids::POWER_USAGE).unwrap();
            assert_eq!(power.field_type, FieldType::Float64);
        }

        #[test]
        fn unknown_field_fails() {
            let registry = FieldRegistry::with_defaults();
            let result = registry.describe(FieldId(9999));
            assert_eq!(result, Err(CacheError::UnknownField { field_id: 9999 }));
        }

        #[test]
        fn string_fields_support_no_summaries() {
            let registry = FieldRegistry::with_defaults();
            let mask = registry
                .summaries_supported_for(field_ids::DEV_UUID)
                .unwrap();
            assert!(mask.is_empty());
        }

        #[test]
        fn numeric_fields_support_all_summaries() {
            let registry = FieldRegistry::with_defaults();
            let mask = registry.summaries_supported_for(field_ids::GPU_UTIL).unwrap();
            assert!(mask.contains(SummaryKind::Integral));
            assert!(mask.contains(SummaryKind::Diff));
        }

        #[test]
        fn lookup_by_tag() {
            let registry = FieldRegistry::with_defaults();
            assert_eq!(
                registry.by_tag("fb_used").map(|d| d.id),
                Some(field_ids::FB_USED)
            );
            assert!(registry.by_tag("nope").is_none());
        }

        #[test]
        fn descriptors_are_sorted() {
            let registry = FieldRegistry::with_defaults();
            let ids: Vec<_> = registry.descriptors().iter().map(|d| d.id).collect();
            let mut sorted = ids.clone();
            sorted.sort();
            assert_eq!(ids, sorted);
            assert_eq!(ids.len(), registry.len());
        }
    }

    mod scope_tests {
        use super::*;

        #[test]
        fn gpu_scope_covers_partitions() {
            assert!(FieldScope::Gpu.applies_to(EntityGroup::Gpu));
            assert!(FieldScope::Gpu.applies_to(EntityGroup::ComputeInstance));
            assert!(!FieldScope::Gpu.applies_to(EntityGroup::Switch));
        }

        #[test]
        fn global_scope_covers_everything() {
            for group in EntityGroup::ALL {
                assert!(FieldScope::Global.applies_to(group));
            }
        }

        #[test]
        fn switch_field_not_supported_on_gpu() {
            let registry = FieldRegistry::with_defaults();
            let desc = registry.describe(field_ids::SWITCH_TEMPERATURE).unwrap();
            assert!(desc.supports(EntityGroup::Switch));
            assert!(!desc.supports(EntityGroup::Gpu));
        }
    }

    mod builder_tests {
        use super::*;

        #[test]
        fn builder_registers_fields() {
            let registry = FieldRegistry::builder()
                .register(FieldDescriptor::new(
                    FieldId(1),
                    "a",
                    FieldType::Int64,
                    FieldScope::Gpu,
                ))
                .and_then(|b| {
                    b.register(FieldDescriptor::new(
                        FieldId(2),
                        "b",
                        FieldType::Float64,
                        FieldScope::Gpu,
                    ))
                })
                .unwrap()
                .build();
            assert_eq!(registry.len(), 2);
            assert!(registry.contains(FieldId(2)));
        }

        #[test]
        fn builder_rejects_duplicate_id() {
            let desc = FieldDescriptor::new(FieldId(1), "a", FieldType::Int64, FieldScope::Gpu);
            let result = FieldRegistry::builder()
                .register(desc.clone())
                .and_then(|b| b.register(desc));
            assert!(matches!(result, Err(CacheError::DuplicateKey { .. })));
        }

        #[test]
        fn builder_rejects_duplicate_tag() {
            let result = FieldRegistry::builder()
                .register(FieldDescriptor::new(FieldId(1), "a", FieldType::Int64, FieldScope::Gpu))
                .and_then(|b| {
                    b.register(FieldDescriptor::new(FieldId(2), "a", FieldType::Int64, FieldScope::Gpu))
                });
            assert!(matches!(result, Err(CacheError::DuplicateKey { .. })));
        }
    }
}
