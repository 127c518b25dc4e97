//! Built-in algorithms, grouped by concern.

use std::sync::Arc;

use designate_core::Defaults;

use crate::algorithm::Algorithm;
use crate::error::ConstructionError;

pub mod filters;
pub mod locality;
pub mod resources;
pub mod scorers;
pub mod vms;

/// Every built-in algorithm.
pub fn builtin(defaults: &Defaults) -> Result<Vec<Arc<dyn Algorithm>>, ConstructionError> {
    Ok(vec![
        Arc::new(filters::Identity) as Arc<dyn Algorithm>,
        Arc::new(vms::LoadServerVms),
        Arc::new(vms::CalculateTicketedVms),
        Arc::new(vms::HardFilterVolumesFrom),
        Arc::new(locality::CalculateAffinity),
        Arc::new(locality::CalculateLocality),
        Arc::new(locality::HardFilterLocalityHints),
        Arc::new(locality::SoftFilterLocalityHints),
        Arc::new(filters::HardFilterSetup),
        Arc::new(filters::HardFilterRunning),
        Arc::new(filters::HardFilterReserved),
        Arc::new(filters::HardFilterReservoir),
        Arc::new(filters::HardFilterHeadnode),
        Arc::new(filters::HardFilterInvalidServers),
        Arc::new(filters::HardFilterVmCount),
        Arc::new(filters::HardFilterCapness),
        Arc::new(filters::HardFilterHvm),
        Arc::new(filters::HardFilterNicTags),
        Arc::new(filters::HardFilterPlatformVersions),
        Arc::new(filters::HardFilterTraits),
        Arc::new(filters::HardFilterOwnersServers::new(
            defaults.filter_owner_server.clone(),
        )?),
        Arc::new(resources::OverrideOverprovisioning),
        Arc::new(resources::CalculateServerUnreserved),
        Arc::new(resources::HardFilterMinRam),
        Arc::new(resources::HardFilterMinDisk),
        Arc::new(resources::HardFilterMinCpu),
        Arc::new(resources::HardFilterLargeServers),
        Arc::new(scorers::ScoreUnreservedRam),
        Arc::new(scorers::ScoreUnreservedDisk),
        Arc::new(scorers::ScoreNumOwnerZones),
        Arc::new(scorers::ScoreCurrentPlatform),
        Arc::new(scorers::ScoreNextReboot),
    ])
}
