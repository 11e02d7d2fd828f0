//! A simulated fleet wired to a field cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use fieldcache::{
    now_micros, FieldCache, FieldGroupId, FieldId, FieldRegistry, FieldSummaryRequest,
    GroupHandle, PolicyHandle, ReservedGroup, SampleStatus, SamplingDriver, StaticInventory, StatusHandle,
    SummaryMask,
};

use crate::config::{CliConfig, SimulationConfig};
use crate::error::CliError;
use crate::output::{LatestReport, LatestRow, SummaryReport};
use crate::sim::SimulatedSource;

/// Resolves a field given by numeric id or tag.
///
/// # Errors
///
/// Returns `CliError::InvalidArgument` if the field is not registered.
pub fn resolve_field(registry: &FieldRegistry, name: &str) -> Result<FieldId, CliError> {
    let id = match name.parse::<u16>() {
        Ok(id) => Some(FieldId(id)).filter(|id| registry.contains(*id)),
        Err(_) => registry.by_tag(name).map(|d| d.id),
    };
    id.ok_or_else(|| CliError::InvalidArgument(format!("unknown field '{name}'")))
}

/// Counters from a sampling run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Driver ticks that ran.
    pub ticks: u64,
    /// Samples recorded.
    pub recorded: u64,
    /// Policy violations raised.
    pub violations: u64,
}

/// A cache watching every device of a simulated fleet.
pub struct Session {
    cache: Arc<FieldCache>,
    driver: SamplingDriver<SimulatedSource>,
    simulation: SimulationConfig,
    field_group: FieldGroupId,
    status: StatusHandle,
    policy: Option<PolicyHandle>,
}

impl Session {
    /// Builds the cache and installs one watch over all entities.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured field is unknown or the watch
    /// cannot be installed.
    pub fn new(config: &CliConfig) -> Result<Self, CliError> {
        let sim = &config.simulation;
        let inventory = Arc::new(StaticInventory::with_devices(sim.gpus, sim.switches));
        let cache = Arc::new(
            FieldCache::builder()
                .config(config.cache.clone())
                .inventory(inventory)
                .build()?,
        );

        let mut fields = sim
            .fields
            .iter()
            .map(|name| resolve_field(cache.registry(), name))
            .collect::<Result<Vec<_>, _>>()?;
        // Policies only see recorded samples, so watch what they check.
        if let Some(params) = &config.policy {
            for field in params.fields() {
                if !fields.contains(&field) {
                    fields.push(field);
                }
            }
        }
        let field_group = cache.create_field_group("simulation", &fields)?;
        let status = cache.create_status();
        let spec = cache.watch(
            GroupHandle::AllOfKind(ReservedGroup::AllEntities),
            field_group,
            cache.default_policy(),
            Some(status),
        )?;

        let mut skipped = 0;
        while let Ok(record) = cache.pop_status(status) {
            debug!(record = %record, "pair not watched");
            skipped += 1;
        }
        info!(
            gpus = sim.gpus,
            switches = sim.switches,
            keys = spec.keys,
            skipped,
            "simulated fleet ready"
        );

        let policy = match config.policy {
            Some(params) if sim.gpus > 0 => Some(
                cache.set_violation_policy(GroupHandle::AllOfKind(ReservedGroup::AllGpus), params)?,
            ),
            _ => None,
        };

        Ok(Self {
            driver: SamplingDriver::new(Arc::clone(&cache), SimulatedSource::new()),
            cache,
            simulation: sim.clone(),
            field_group,
            status,
            policy,
        })
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<FieldCache> {
        &self.cache
    }

    /// Samples on the configured tick until the run duration elapses or
    /// the process is interrupted. At least one tick always runs.
    pub async fn run(&mut self) -> RunStats {
        let mut interval = tokio::time::interval(Duration::from_millis(self.simulation.tick_millis));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = Instant::now() + Duration::from_secs(self.simulation.duration_secs);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let mut stats = RunStats::default();
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown => {
                    info!("interrupted, stopping sampling");
                    break;
                }
            }

            let report = self.driver.tick(now_micros());
            stats.ticks += 1;
            stats.recorded += report.recorded as u64;
            let evicted = self.cache.evict_expired();
            if evicted > 0 {
                debug!(evicted, "evicted expired samples");
            }
            stats.violations += self.drain_violations();

            if Instant::now() >= deadline {
                break;
            }
        }

        info!(
            ticks = stats.ticks,
            recorded = stats.recorded,
            violations = stats.violations,
            "sampling finished"
        );
        stats
    }

    fn drain_violations(&self) -> u64 {
        let Some(policy) = self.policy else {
            return 0;
        };
        let mut drained = 0;
        while let Ok(violation) = self.cache.pop_violation(policy) {
            warn!(violation = %violation, "policy violated");
            drained += 1;
        }
        drained
    }

    /// Latest value of every watched key.
    ///
    /// # Errors
    ///
    /// Returns an error if the watched groups no longer resolve.
    pub fn latest(&self, stats: RunStats) -> Result<LatestReport, CliError> {
        let values = self.cache.latest_for_group(
            GroupHandle::AllOfKind(ReservedGroup::AllEntities),
            self.field_group,
        )?;
        let mut rows = Vec::new();
        for entity_values in values {
            for (field, sample) in entity_values.values {
                if matches!(sample.status, SampleStatus::Unwatched | SampleStatus::NotSupported) {
                    continue;
                }
                let tag = self.cache.registry().describe(field)?.tag.clone();
                rows.push(LatestRow {
                    entity: entity_values.entity,
                    field: tag,
                    sample,
                });
            }
        }
        Ok(LatestReport {
            ticks: stats.ticks,
            recorded: stats.recorded,
            violations: stats.violations,
            rows,
        })
    }

    /// Summarizes one field on every entity that watches it.
    ///
    /// An empty `mask` selects every summary the field supports.
    ///
    /// # Errors
    ///
    /// Returns an error if the field supports none of the requested
    /// summaries.
    pub fn summarize(&self, field: FieldId, mask: SummaryMask) -> Result<SummaryReport, CliError> {
        let descriptor = self.cache.registry().describe(field)?;
        let mask = if mask.is_empty() { descriptor.summaries } else { mask };
        if mask.is_empty() {
            return Err(CliError::InvalidArgument(format!(
                "field '{}' supports no summaries",
                descriptor.tag
            )));
        }

        let summaries = self
            .cache
            .watched_keys()
            .into_iter()
            .filter(|(key, _)| key.field == field)
            .map(|(key, _)| self.cache.summarize(&FieldSummaryRequest::new(key, mask)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SummaryReport {
            field: descriptor.tag.clone(),
            kinds: mask.kinds().collect(),
            summaries,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.cache.destroy_status(self.status);
        if let Some(policy) = self.policy {
            let _ = self.cache.clear_violation_policy(policy);
        }
    }
}
