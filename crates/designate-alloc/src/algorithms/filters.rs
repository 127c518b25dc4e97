//! Per-server predicate filters.
//!
//! Each one checks a single server property in isolation and removes
//! servers that fail it, one reason per removed server.

use std::collections::BTreeSet;

use async_trait::async_trait;

use designate_core::{Brand, OwnerServerRule, ServerStatus, VmState};

use crate::algorithm::{Algorithm, Candidate, Capability, Context, Filtered};
use crate::error::{AllocResult, ConstructionError};
use crate::platform;
use crate::predicate::OwnerServerPredicate;
use crate::traits::{match_traits, requested_traits};

const HOSTED_VMS: &[Capability] = &[Capability::HostedVms];

// ── Server state ──────────────────────────────────────────────────

/// Passes every server through untouched.
pub struct Identity;

#[async_trait]
impl Algorithm for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn description(&self) -> &'static str {
        "Identity: keep all servers"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, servers: Vec<Candidate>, _ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        Ok(Filtered::unchanged(servers))
    }
}

pub struct HardFilterSetup;

#[async_trait]
impl Algorithm for HardFilterSetup {
    fn name(&self) -> &'static str {
        "hard-filter-setup"
    }

    fn description(&self) -> &'static str {
        "Servers which are not setup"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, servers: Vec<Candidate>, _ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        Ok(Filtered::retain_with(servers, |c| {
            if c.server.setup {
                Ok(())
            } else {
                Err("Server is not setup".to_string())
            }
        }))
    }
}

pub struct HardFilterRunning;

#[async_trait]
impl Algorithm for HardFilterRunning {
    fn name(&self) -> &'static str {
        "hard-filter-running"
    }

    fn description(&self) -> &'static str {
        "Servers which are not running"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, servers: Vec<Candidate>, _ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        Ok(Filtered::retain_with(servers, |c| {
            if c.server.status == ServerStatus::Running {
                Ok(())
            } else {
                Err("Server is not running".to_string())
            }
        }))
    }
}

pub struct HardFilterReserved;

#[async_trait]
impl Algorithm for HardFilterReserved {
    fn name(&self) -> &'static str {
        "hard-filter-reserved"
    }

    fn description(&self) -> &'static str {
        "Servers which are reserved"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, servers: Vec<Candidate>, _ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        Ok(Filtered::retain_with(servers, |c| {
            if c.server.reserved {
                Err("Server is reserved".to_string())
            } else {
                Ok(())
            }
        }))
    }
}

/// Removes reservoir servers. Usually wrapped as
/// `["or", "hard-filter-reservoir", "identity"]` so the reservoir is only
/// tapped once nothing else is left.
pub struct HardFilterReservoir;

#[async_trait]
impl Algorithm for HardFilterReservoir {
    fn name(&self) -> &'static str {
        "hard-filter-reservoir"
    }

    fn description(&self) -> &'static str {
        "Servers in the reservoir"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, servers: Vec<Candidate>, _ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        Ok(Filtered::retain_with(servers, |c| {
            if c.server.reservoir {
                Err("Server is a reservoir server".to_string())
            } else {
                Ok(())
            }
        }))
    }
}

pub struct HardFilterHeadnode;

#[async_trait]
impl Algorithm for HardFilterHeadnode {
    fn name(&self) -> &'static str {
        "hard-filter-headnode"
    }

    fn description(&self) -> &'static str {
        "Headnodes"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        if !ctx.defaults.filter_headnode {
            return Ok(Filtered::skip(servers, "filter_headnode is disabled"));
        }
        Ok(Filtered::retain_with(servers, |c| {
            if c.server.headnode {
                Err("Server is a headnode".to_string())
            } else {
                Ok(())
            }
        }))
    }
}

/// Removes servers whose telemetry cannot support resource accounting.
pub struct HardFilterInvalidServers;

impl HardFilterInvalidServers {
    fn validate(c: &Candidate) -> Result<(), String> {
        let server = &c.server;
        if server.uuid.is_empty() {
            return Err("Server has no uuid".to_string());
        }
        let Some(sysinfo) = &server.sysinfo else {
            return Err("Server has no sysinfo".to_string());
        };
        if sysinfo.cpu_total_cores == 0 {
            return Err("Server reports no CPU cores".to_string());
        }
        if server.memory_total_bytes == 0 {
            return Err("Server reports no memory".to_string());
        }
        if server.disk_pool_size_bytes == 0 {
            return Err("Server reports no disk pool".to_string());
        }
        if let Some(ratio) = server.reservation_ratio.filter(|r| !(0.0..1.0).contains(r)) {
            return Err(format!("Server has invalid reservation_ratio {ratio}"));
        }
        let ratios = &server.overprovision_ratios;
        for (name, ratio) in [("cpu", ratios.cpu), ("ram", ratios.ram), ("disk", ratios.disk)] {
            if let Some(ratio) = ratio.filter(|r| *r <= 0.0) {
                return Err(format!("Server has invalid {name} overprovision ratio {ratio}"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Algorithm for HardFilterInvalidServers {
    fn name(&self) -> &'static str {
        "hard-filter-invalid-servers"
    }

    fn description(&self) -> &'static str {
        "Servers with invalid data"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, servers: Vec<Candidate>, _ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        Ok(Filtered::retain_with(servers, Self::validate))
    }
}

// ── Hosted instances ──────────────────────────────────────────────

pub struct HardFilterVmCount;

#[async_trait]
impl Algorithm for HardFilterVmCount {
    fn name(&self) -> &'static str {
        "hard-filter-vm-count"
    }

    fn description(&self) -> &'static str {
        "Servers with too many VMs"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    fn requires(&self) -> &'static [Capability] {
        HOSTED_VMS
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let limit = ctx.defaults.filter_vm_limit;
        Ok(Filtered::retain_with(servers, |c| {
            let count = c.vms.len();
            if count < limit {
                Ok(())
            } else {
                Err(format!("Server has {count} VMs (limit is {limit})"))
            }
        }))
    }
}

/// Keeps capped and uncapped instances apart: an uncapped instance may
/// take every core, which breaks the promises made to capped neighbours.
pub struct HardFilterCapness;

#[async_trait]
impl Algorithm for HardFilterCapness {
    fn name(&self) -> &'static str {
        "hard-filter-capness"
    }

    fn description(&self) -> &'static str {
        "Servers mixing capped and uncapped VMs"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    fn requires(&self) -> &'static [Capability] {
        HOSTED_VMS
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let capped = ctx.sizing.cpu_cap.is_some();
        Ok(Filtered::retain_with(servers, |c| {
            let conflict = c
                .hosted()
                .filter(|vm| vm.state != VmState::Failed)
                .find(|vm| vm.cpu_cap.is_some() != capped);
            match conflict {
                None => Ok(()),
                Some(vm) if capped => Err(format!("VM is capped but server hosts uncapped VM {}", vm.uuid)),
                Some(vm) => Err(format!("VM is uncapped but server hosts capped VM {}", vm.uuid)),
            }
        }))
    }
}

// ── Hardware and platform ─────────────────────────────────────────

pub struct HardFilterHvm;

#[async_trait]
impl Algorithm for HardFilterHvm {
    fn name(&self) -> &'static str {
        "hard-filter-hvm"
    }

    fn description(&self) -> &'static str {
        "Servers without the required hardware virtualization"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let brand = ctx.sizing.brand;
        if !brand.is_hvm() {
            return Ok(Filtered::skip(servers, "VM is not HVM"));
        }
        Ok(Filtered::retain_with(servers, |c| {
            let sysinfo = c.server.sysinfo.as_ref();
            let capable = match brand {
                Brand::Kvm => sysinfo.is_some_and(|s| s.vm_capable),
                _ => sysinfo.is_some_and(|s| s.bhyve_capable),
            };
            if capable {
                Ok(())
            } else {
                Err(format!("Server is not {brand:?} capable").to_lowercase())
            }
        }))
    }
}

/// Each NIC tag requirement group lists interchangeable tags; the server
/// must offer at least one tag of every group.
pub struct HardFilterNicTags;

#[async_trait]
impl Algorithm for HardFilterNicTags {
    fn name(&self) -> &'static str {
        "hard-filter-nic-tags"
    }

    fn description(&self) -> &'static str {
        "Servers without the required NIC tags"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let groups = &ctx.request.vm.nic_tag_requirements;
        if groups.is_empty() {
            return Ok(Filtered::skip(servers, "no NIC tag requirements"));
        }
        Ok(Filtered::retain_with(servers, |c| {
            let offered: BTreeSet<&str> = c
                .server
                .sysinfo
                .iter()
                .flat_map(|s| s.network_interfaces.values())
                .flat_map(|nic| nic.nic_names.iter().map(String::as_str))
                .collect();
            match groups
                .iter()
                .find(|group| !group.iter().any(|tag| offered.contains(tag.as_str())))
            {
                None => Ok(()),
                Some(group) => Err(format!("Server has none of NIC tags {}", group.join(","))),
            }
        }))
    }
}

pub struct HardFilterPlatformVersions;

#[async_trait]
impl Algorithm for HardFilterPlatformVersions {
    fn name(&self) -> &'static str {
        "hard-filter-platform-versions"
    }

    fn description(&self) -> &'static str {
        "Servers with unsuitable platform versions"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let requirements = &ctx.request.image.requirements;
        let package_min = ctx.request.package.as_ref().map(|p| &p.min_platform);
        if requirements.min_platform.is_empty()
            && requirements.max_platform.is_empty()
            && package_min.is_none_or(|m| m.is_empty())
        {
            return Ok(Filtered::skip(servers, "no platform requirements"));
        }
        Ok(Filtered::retain_with(servers, |c| {
            let version = c.server.sdc_version();
            let image = c.server.live_image();
            platform::check_min(&requirements.min_platform, version, image)?;
            platform::check_max(&requirements.max_platform, version, image)?;
            if let Some(min) = package_min {
                platform::check_min(min, version, image)?;
            }
            Ok(())
        }))
    }
}

// ── Policy ────────────────────────────────────────────────────────

pub struct HardFilterTraits;

#[async_trait]
impl Algorithm for HardFilterTraits {
    fn name(&self) -> &'static str {
        "hard-filter-traits"
    }

    fn description(&self) -> &'static str {
        "Servers with mismatched traits"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let requested = requested_traits(ctx.request);
        Ok(Filtered::retain_with(servers, |c| {
            match_traits(&requested, &c.server.traits)
        }))
    }
}

/// Applies the `filter_owner_server` rules.
pub struct HardFilterOwnersServers {
    rules: Vec<OwnerServerRule>,
    predicate: OwnerServerPredicate,
}

impl HardFilterOwnersServers {
    pub fn new(rules: Vec<OwnerServerRule>) -> Result<Self, ConstructionError> {
        let predicate = OwnerServerPredicate::compile(&rules)?;
        Ok(Self { rules, predicate })
    }
}

#[async_trait]
impl Algorithm for HardFilterOwnersServers {
    fn name(&self) -> &'static str {
        "hard-filter-owners-servers"
    }

    fn description(&self) -> &'static str {
        "Servers excluded by owner-server rules"
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        // Callers may hand in tunables other than the ones this was built with.
        let compiled;
        let predicate = if ctx.defaults.filter_owner_server == self.rules {
            &self.predicate
        } else {
            compiled = OwnerServerPredicate::compile(&ctx.defaults.filter_owner_server)?;
            &compiled
        };

        let owner = ctx.owner_uuid();
        if !predicate.applies_to(owner) {
            return Ok(Filtered::skip(servers, format!("no rules for owner {owner}")));
        }
        Ok(Filtered::retain_with(servers, |c| predicate.check(owner, &c.server)))
    }
}
