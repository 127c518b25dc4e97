//! Resource algorithms: overprovisioning, accounting and minimums.

use std::cmp::Reverse;

use async_trait::async_trait;
use tracing::debug;

use designate_core::{Reasons, ResolvedRatios};

use crate::algorithm::{Algorithm, Candidate, Capability, Context, Filtered};
use crate::error::AllocResult;
use crate::resources::{self, ram_footprint};

const UNRESERVED: &[Capability] = &[Capability::Unreserved];

/// Share of servers, by unreserved RAM, kept free for large allocations.
pub const LARGE_SERVER_SHARE: f64 = 0.15;

/// Replaces server ratios with the package's, falling back to the
/// `overprovision_ratio_*` tunables.
pub struct OverrideOverprovisioning;

#[async_trait]
impl Algorithm for OverrideOverprovisioning {
    fn name(&self) -> &'static str {
        "override-overprovisioning"
    }

    fn description(&self) -> &'static str {
        "Override server overprovision ratios"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    async fn run(&self, mut servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let defaults = ctx.defaults;
        if defaults.disable_override_overprovisioning {
            return Ok(Filtered::skip(servers, "disable_override_overprovisioning is set"));
        }
        let package = ctx.request.package.as_ref();
        let ratios = ResolvedRatios {
            cpu: package
                .and_then(|p| p.overprovision_cpu)
                .unwrap_or(defaults.overprovision_ratio_cpu),
            ram: package
                .and_then(|p| p.overprovision_ram)
                .unwrap_or(defaults.overprovision_ratio_ram),
            disk: package
                .and_then(|p| p.overprovision_disk)
                .unwrap_or(defaults.overprovision_ratio_disk),
        };
        for candidate in &mut servers {
            candidate.ratios = ratios;
        }
        Ok(Filtered::unchanged(servers))
    }
}

pub struct CalculateServerUnreserved;

#[async_trait]
impl Algorithm for CalculateServerUnreserved {
    fn name(&self) -> &'static str {
        "calculate-server-unreserved"
    }

    fn description(&self) -> &'static str {
        "Calculate unreserved server resources"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    fn requires(&self) -> &'static [Capability] {
        &[Capability::HostedVms]
    }

    fn provides(&self) -> &'static [Capability] {
        UNRESERVED
    }

    async fn run(&self, mut servers: Vec<Candidate>, _ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        for candidate in &mut servers {
            let unreserved = resources::unreserved(&candidate.server, candidate.vms.values(), candidate.ratios);
            debug!(
                server = %candidate.uuid(),
                cpu = unreserved.unreserved_cpu,
                ram = unreserved.unreserved_ram,
                disk = unreserved.unreserved_disk,
                "unreserved resources"
            );
            candidate.unreserved = Some(unreserved);
        }
        Ok(Filtered::unchanged(servers))
    }
}

pub struct HardFilterMinRam;

#[async_trait]
impl Algorithm for HardFilterMinRam {
    fn name(&self) -> &'static str {
        "hard-filter-min-ram"
    }

    fn description(&self) -> &'static str {
        "Servers without enough unreserved RAM"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    fn requires(&self) -> &'static [Capability] {
        UNRESERVED
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        if !ctx.defaults.filter_min_resources {
            return Ok(Filtered::skip(servers, "filter_min_resources is disabled"));
        }
        let sizing = ctx.sizing;
        Ok(Filtered::retain_with(servers, |c| {
            let need = ram_footprint(sizing.ram, sizing.brand.is_hvm(), c.ratios.ram);
            let have = c.unreserved().unreserved_ram;
            if have as f64 >= need {
                Ok(())
            } else {
                Err(format!("VM's calculated {need:.0} MiB RAM is more than server's spare {have} MiB"))
            }
        }))
    }
}

pub struct HardFilterMinDisk;

#[async_trait]
impl Algorithm for HardFilterMinDisk {
    fn name(&self) -> &'static str {
        "hard-filter-min-disk"
    }

    fn description(&self) -> &'static str {
        "Servers without enough unreserved disk"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    fn requires(&self) -> &'static [Capability] {
        UNRESERVED
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        if !ctx.defaults.filter_min_resources {
            return Ok(Filtered::skip(servers, "filter_min_resources is disabled"));
        }
        let sizing = ctx.sizing;
        Ok(Filtered::retain_with(servers, |c| {
            let need = disk_footprint(sizing.disk, sizing.brand.is_hvm(), c.ratios.disk);
            let have = c.unreserved().unreserved_disk;
            if have as f64 >= need {
                Ok(())
            } else {
                Err(format!("VM's calculated {need:.0} MiB disk is more than server's spare {have} MiB"))
            }
        }))
    }
}

/// MiB of disk a new VM is charged for. A fresh zone quota is entirely
/// unused, so all of it is discounted by the disk ratio.
pub fn disk_footprint(disk: u64, hvm: bool, ratio: f64) -> f64 {
    if hvm {
        disk as f64
    } else {
        disk as f64 / ratio
    }
}

pub struct HardFilterMinCpu;

#[async_trait]
impl Algorithm for HardFilterMinCpu {
    fn name(&self) -> &'static str {
        "hard-filter-min-cpu"
    }

    fn description(&self) -> &'static str {
        "Servers without enough unreserved CPU"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    fn requires(&self) -> &'static [Capability] {
        UNRESERVED
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        if !ctx.defaults.filter_min_resources {
            return Ok(Filtered::skip(servers, "filter_min_resources is disabled"));
        }
        let Some(cap) = ctx.sizing.cpu_cap else {
            return Ok(Filtered::skip(servers, "VM has no cpu_cap"));
        };
        Ok(Filtered::retain_with(servers, |c| {
            let need = cap as f64 / c.ratios.cpu;
            let have = c.unreserved().unreserved_cpu;
            if have as f64 >= need {
                Ok(())
            } else {
                Err(format!("VM's calculated {need:.0} CPU is more than server's spare {have}"))
            }
        }))
    }
}

/// Keeps the servers with the most unreserved RAM free so that large
/// allocations still find room.
pub struct HardFilterLargeServers;

#[async_trait]
impl Algorithm for HardFilterLargeServers {
    fn name(&self) -> &'static str {
        "hard-filter-large-servers"
    }

    fn description(&self) -> &'static str {
        "Largest servers, held back for large allocations"
    }

    fn requires(&self) -> &'static [Capability] {
        UNRESERVED
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        if !ctx.defaults.filter_large_servers {
            return Ok(Filtered::skip(servers, "filter_large_servers is disabled"));
        }
        let remove = (servers.len() as f64 * LARGE_SERVER_SHARE).floor() as usize;
        if remove == 0 {
            return Ok(Filtered::unchanged(servers));
        }

        let mut by_ram: Vec<(usize, i64)> = servers
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.unreserved().unreserved_ram))
            .collect();
        by_ram.sort_by_key(|(_, ram)| Reverse(*ram));
        let mut drop = vec![false; servers.len()];
        for (i, _) in by_ram.into_iter().take(remove) {
            drop[i] = true;
        }

        let mut reasons = Reasons::new();
        let kept = servers
            .into_iter()
            .zip(drop)
            .filter_map(|(c, dropped)| {
                if dropped {
                    reasons.insert(
                        c.uuid().to_string(),
                        format!(
                            "Reserved for large allocations ({} MiB unreserved RAM)",
                            c.unreserved().unreserved_ram
                        ),
                    );
                    None
                } else {
                    Some(c)
                }
            })
            .collect();
        Ok(Filtered::new(kept, reasons))
    }
}
