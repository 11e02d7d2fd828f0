//! Field-value watch and retention cache for GPU fleet host engines.
#![forbid(unsafe_code)]
//!
//! `fieldcache` keeps a bounded time series per (entity, field) pair for
//! every pair a caller has asked to watch, and answers point, range and
//! aggregate queries over them.
//!
//! # Features
//!
//! - **Groups**: named entity groups and field groups, plus reserved
//!   "all GPUs" style groups resolved against the live inventory
//! - **Watches**: per-binding sampling interval and count/age retention,
//!   merged loosest-wins when bindings overlap
//! - **Explicit statuses**: missing, stale, unwatched, unsupported and
//!   denied data come back as tagged samples, not magic numbers
//! - **Summaries**: min, max, avg, sum, count, integral and diff over a window
//! - **Violation policies**: thermal, power, ECC, PCIe replay and retired
//!   page conditions checked against recorded samples, queued per policy
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use fieldcache::{
//!     field_ids, EntityRef, FieldCache, FieldKey, GroupType, Sample, SampleStatus,
//!     StaticInventory, WatchPolicy,
//! };
//!
//! let cache = FieldCache::builder()
//!     .inventory(Arc::new(StaticInventory::with_devices(2, 0)))
//!     .build()
//!     .unwrap();
//!
//! let gpus = cache.create_group("gpus", GroupType::DefaultGpus).unwrap();
//! let temps = cache.create_field_group("temps", &[field_ids::GPU_TEMP]).unwrap();
//! let policy = WatchPolicy::new(1_000_000, 60.0, 120).unwrap();
//! cache.watch(gpus.into(), temps, policy, None).unwrap();
//!
//! let key = FieldKey::new(EntityRef::gpu(0), field_ids::GPU_TEMP);
//! assert_eq!(cache.latest(key).status, SampleStatus::NoData);
//!
//! cache.record(key, Sample::now(fieldcache::SampleValue::Int64(64))).unwrap();
//! assert_eq!(cache.latest(key).status, SampleStatus::Ok);
//! ```

#![doc(html_root_url = "https://docs.rs/fieldcache/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod access;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod group;
pub mod inventory;
pub mod policy;
pub mod registry;
pub mod sentinel;
pub mod status;
pub mod store;
pub mod summary;
pub mod types;
pub mod watch;

// Re-export main types at crate root
pub use access::{AccessPolicy, AllowAll, DenyList};
pub use config::{CacheConfig, LimitsConfig, StatusConfig, WatchDefaults};
pub use driver::{SampleSource, SamplingDriver, TickReport};
pub use engine::{BatchReport, EntityValues, FieldCache, FieldCacheBuilder, GroupSamples, KeySamples};
pub use error::{CacheError, Result};
pub use group::{
    FieldGroupId, FieldGroupInfo, GroupDirectory, GroupHandle, GroupId, GroupInfo, GroupType,
    ReservedGroup,
};
pub use inventory::{Inventory, StaticInventory};
pub use policy::{
    PolicyCondition, PolicyConditionParams, PolicyHandle, PolicyInfo, PolicyRegistry,
    PolicyViolation, ViolationData,
};
pub use registry::{field_ids, FieldDescriptor, FieldRegistry, FieldRegistryBuilder, FieldScope};
pub use status::{ErrorRecord, StatusHandle, StatusRegistry};
pub use store::{RecordOutcome, Since, TimeSeriesStore};
pub use summary::{
    FieldSummary, FieldSummaryRequest, SummaryKind, SummaryMask, SummaryValue,
    FIELD_SUMMARY_REQUEST_VERSION1,
};
pub use types::{
    make_version, now_micros, EntityGroup, EntityId, EntityRef, FieldId, FieldKey, FieldType,
    Sample, SampleStatus, SampleValue,
};
pub use watch::{WatchPolicy, WatchSpec, WatchTable};
