//! The contract every filter and scorer implements.
//!
//! An algorithm receives the current candidate list and the per-request
//! [`Context`], and returns the survivors plus a reasons map. Filters
//! narrow the list; scorers return it unchanged and add to
//! [`Context::scores`]. Returning an error aborts the whole pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use designate_core::{
    AllocationRequest, Brand, Defaults, Locality, Reasons, ResolvedRatios, Server, Unreserved, Vm,
    VmUuid, REASON_SKIP,
};

use crate::error::AllocResult;
use crate::inventory::Inventory;
use crate::locality::LocalityIndex;

/// Accumulated score per server uuid.
pub type Scores = BTreeMap<String, f64>;

/// Request-scoped view of one server.
///
/// The server snapshot itself is shared and read-only; everything an
/// algorithm derives (hosted VMs after loading, resolved ratios, spare
/// resources) lives next to it and dies with the request.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub server: Arc<Server>,
    pub vms: Arc<BTreeMap<VmUuid, Vm>>,
    /// False until the hosted VM list is known.
    pub vms_loaded: bool,
    pub ratios: ResolvedRatios,
    /// Set by `calculate-server-unreserved`.
    pub unreserved: Option<Unreserved>,
}

impl Candidate {
    pub fn new(server: Server) -> Self {
        let ratios = server.overprovision_ratios.resolve(ResolvedRatios::default());
        let (vms, vms_loaded) = match &server.vms {
            Some(vms) => (vms.clone(), true),
            None => (BTreeMap::new(), false),
        };
        Self {
            server: Arc::new(server),
            vms: Arc::new(vms),
            vms_loaded,
            ratios,
            unreserved: None,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.server.uuid
    }

    /// Hosted VMs, including ticketed placeholders.
    pub fn hosted(&self) -> impl Iterator<Item = &Vm> {
        self.vms.values()
    }

    /// Whether any hosted VM belongs to `owner_uuid`.
    pub fn hosts_owner(&self, owner_uuid: &str) -> bool {
        self.hosted().any(|vm| vm.owner_uuid == owner_uuid)
    }

    /// Spare resources; zero when accounting has not run.
    pub fn unreserved(&self) -> Unreserved {
        self.unreserved.unwrap_or_default()
    }
}

/// Facts an algorithm may depend on having been established earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Hosted VM lists are loaded.
    HostedVms,
    /// `unreserved_*` are populated.
    Unreserved,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::HostedVms => f.write_str("hosted VM lists"),
            Capability::Unreserved => f.write_str("unreserved resources"),
        }
    }
}

/// Resource needs of the instance being placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizing {
    /// MiB.
    pub ram: u64,
    /// MiB.
    pub disk: u64,
    /// Percent of one core.
    pub cpu_cap: Option<u64>,
    pub brand: Brand,
}

impl Sizing {
    /// VM values win over package values; HVM disks add the image size.
    pub fn of(request: &AllocationRequest) -> Self {
        let vm = &request.vm;
        let package = request.package.as_ref();
        let ram = if vm.ram > 0 {
            vm.ram
        } else {
            package.map_or(0, |p| p.max_physical_memory)
        };
        let mut disk = if vm.quota > 0 {
            vm.quota * 1024
        } else {
            package.map_or(0, |p| p.quota)
        };
        if vm.brand.is_hvm() {
            disk += request.image.image_size.unwrap_or(0);
        }
        Self {
            ram,
            disk,
            cpu_cap: vm.cpu_cap.or_else(|| package.and_then(|p| p.cpu_cap)),
            brand: vm.brand,
        }
    }
}

/// Per-request state threaded through every algorithm invocation.
pub struct Context<'a> {
    pub request: &'a AllocationRequest,
    pub defaults: &'a Defaults,
    pub inventory: &'a dyn Inventory,
    pub sizing: Sizing,
    pub scores: Scores,
    /// Effective locality: the request's own, or one compiled from affinity.
    pub locality: Option<Locality>,
    /// Where the owner's instances lived before any filtering.
    pub locality_index: Option<LocalityIndex>,
    pub now: DateTime<Utc>,
}

impl<'a> Context<'a> {
    pub fn new(
        request: &'a AllocationRequest,
        defaults: &'a Defaults,
        inventory: &'a dyn Inventory,
    ) -> Self {
        Self {
            request,
            defaults,
            inventory,
            sizing: Sizing::of(request),
            scores: Scores::new(),
            locality: request.vm.locality.clone(),
            locality_index: None,
            now: Utc::now(),
        }
    }

    /// Pin the clock used by time-dependent scorers.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn owner_uuid(&self) -> &str {
        &self.request.vm.owner_uuid
    }

    pub fn score(&self, uuid: &str) -> f64 {
        self.scores.get(uuid).copied().unwrap_or(0.0)
    }
}

/// Survivors of one algorithm invocation, with the reasons for the rest.
#[derive(Debug, Clone, Default)]
pub struct Filtered {
    pub servers: Vec<Candidate>,
    pub reasons: Reasons,
}

impl Filtered {
    pub fn new(servers: Vec<Candidate>, reasons: Reasons) -> Self {
        Self { servers, reasons }
    }

    /// Input passed through untouched with no reasons.
    pub fn unchanged(servers: Vec<Candidate>) -> Self {
        Self {
            servers,
            reasons: Reasons::new(),
        }
    }

    /// Input passed through with a `skip` reason.
    pub fn skip(servers: Vec<Candidate>, why: impl Into<String>) -> Self {
        let mut reasons = Reasons::new();
        reasons.insert(REASON_SKIP.to_string(), why.into());
        Self { servers, reasons }
    }

    /// Keep candidates for which `check` returns `Ok`, recording the error
    /// string as the reason for every other one.
    pub fn retain_with<F>(servers: Vec<Candidate>, mut check: F) -> Self
    where
        F: FnMut(&Candidate) -> Result<(), String>,
    {
        let mut reasons = Reasons::new();
        let servers = servers
            .into_iter()
            .filter(|c| match check(c) {
                Ok(()) => true,
                Err(why) => {
                    reasons.insert(c.uuid().to_string(), why);
                    false
                }
            })
            .collect();
        Self { servers, reasons }
    }
}

/// A named unit of the allocation pipeline.
#[async_trait]
pub trait Algorithm: Send + Sync {
    /// Registry key referenced by pipeline descriptions.
    fn name(&self) -> &'static str;

    /// Label shown in the audit trail.
    fn description(&self) -> &'static str;

    /// Whether the algorithm also applies when estimating capacity.
    fn affects_capacity(&self) -> bool {
        false
    }

    fn requires(&self) -> &'static [Capability] {
        &[]
    }

    fn provides(&self) -> &'static [Capability] {
        &[]
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered>;

    /// Cleanup after the whole pipeline finished.
    fn post(&self, _ctx: &mut Context<'_>) {}
}
