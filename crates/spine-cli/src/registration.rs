//! Explicit startup registration
//!
//! Pipelines, sources, and periods are registered here when the process
//! starts. Linked domain crates contribute their registrations through
//! this function; the core ships only the stock weekly period. A sweep
//! that names an unregistered pipeline fails as a configuration error
//! before any side effect.

use std::sync::Arc;

use spine_core::registry::{PipelineRegistry, RegistryError};
use spine_core::strategy::{PeriodRegistry, PeriodStrategy, SourceRegistry, WeeklyPeriod};

/// Pipeline names the FINRA weekly sweep drives
pub const FINRA_DOMAIN: &str = "finra";
pub const FINRA_INGEST: &str = "finra.otc_transparency.ingest_week";
pub const FINRA_NORMALIZE: &str = "finra.otc_transparency.normalize_week";
pub const FINRA_CALCS: &[&str] = &["finra.otc_transparency.calc_weekly_summary"];

/// Pipeline name the price sweep drives
pub const PRICES_INGEST: &str = "prices.ingest_daily";

/// Default tiers for the FINRA weekly sweep
pub const FINRA_TIERS: &[&str] = &["NMS_TIER_1", "NMS_TIER_2", "OTC"];

/// Install every registration this deployment links in.
///
/// Domain crates add their pipeline factories and source strategies here;
/// the framework itself contributes the weekly (Friday) period.
pub fn install(
    _pipelines: &PipelineRegistry,
    _sources: &SourceRegistry,
    periods: &PeriodRegistry,
) -> Result<(), RegistryError> {
    periods.register(
        "weekly",
        Arc::new(WeeklyPeriod::new()) as Arc<dyn PeriodStrategy>,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spine_core::strategy::{period_registry, source_registry};

    #[test]
    fn test_install_registers_weekly_period() {
        let pipelines = PipelineRegistry::new();
        let sources = source_registry();
        let periods = period_registry();

        install(&pipelines, &sources, &periods).unwrap();
        assert!(periods.contains("weekly"));
        // Nothing leaks into the other registries
        assert!(pipelines.is_empty());
        assert!(sources.is_empty());
    }
}
