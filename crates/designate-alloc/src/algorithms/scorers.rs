//! Scoring algorithms. None of them removes servers; each adds weighted
//! deltas to the request's score accumulator.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use designate_core::Reasons;

use crate::algorithm::{Algorithm, Candidate, Capability, Context, Filtered};
use crate::error::AllocResult;
use crate::score::{linear, linear_buckets, normalize};

const UNRESERVED: &[Capability] = &[Capability::Unreserved];

fn zero_weight(servers: Vec<Candidate>, knob: &str) -> Filtered {
    Filtered::skip(servers, format!("{knob} is 0"))
}

pub struct ScoreUnreservedRam;

#[async_trait]
impl Algorithm for ScoreUnreservedRam {
    fn name(&self) -> &'static str {
        "score-unreserved-ram"
    }

    fn description(&self) -> &'static str {
        "Score servers by unreserved RAM"
    }

    fn requires(&self) -> &'static [Capability] {
        UNRESERVED
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let weight = ctx.defaults.weight_unreserved_ram;
        if weight == 0.0 {
            return Ok(zero_weight(servers, "weight_unreserved_ram"));
        }
        let values: Vec<(&str, f64)> = servers
            .iter()
            .map(|c| (c.uuid(), c.unreserved().unreserved_ram as f64))
            .collect();
        let mut reasons = Reasons::new();
        normalize(&values, weight, &mut ctx.scores, &mut reasons);
        Ok(Filtered::new(servers, reasons))
    }
}

pub struct ScoreUnreservedDisk;

#[async_trait]
impl Algorithm for ScoreUnreservedDisk {
    fn name(&self) -> &'static str {
        "score-unreserved-disk"
    }

    fn description(&self) -> &'static str {
        "Score servers by unreserved disk"
    }

    fn requires(&self) -> &'static [Capability] {
        UNRESERVED
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let weight = ctx.defaults.weight_unreserved_disk;
        if weight == 0.0 {
            return Ok(zero_weight(servers, "weight_unreserved_disk"));
        }
        let values: Vec<(&str, f64)> = servers
            .iter()
            .map(|c| (c.uuid(), c.unreserved().unreserved_disk as f64))
            .collect();
        let mut reasons = Reasons::new();
        normalize(&values, weight, &mut ctx.scores, &mut reasons);
        Ok(Filtered::new(servers, reasons))
    }
}

/// Fewer instances of the same owner is better.
pub struct ScoreNumOwnerZones;

#[async_trait]
impl Algorithm for ScoreNumOwnerZones {
    fn name(&self) -> &'static str {
        "score-num-owner-zones"
    }

    fn description(&self) -> &'static str {
        "Score servers by number of owner VMs"
    }

    fn requires(&self) -> &'static [Capability] {
        &[Capability::HostedVms]
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let weight = ctx.defaults.weight_num_owner_zones;
        if weight == 0.0 {
            return Ok(zero_weight(servers, "weight_num_owner_zones"));
        }
        let owner = ctx.request.vm.owner_uuid.as_str();
        let mut by_count: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for c in &servers {
            let count = c.hosted().filter(|vm| vm.owner_uuid == owner).count();
            by_count.entry(count).or_default().push(c.uuid());
        }
        let buckets: Vec<Vec<&str>> = by_count.into_values().collect();
        let mut reasons = Reasons::new();
        linear_buckets(&buckets, weight, &mut ctx.scores, &mut reasons);
        Ok(Filtered::new(servers, reasons))
    }
}

/// Newer platform images are better; servers reporting none rank last.
pub struct ScoreCurrentPlatform;

#[async_trait]
impl Algorithm for ScoreCurrentPlatform {
    fn name(&self) -> &'static str {
        "score-current-platform"
    }

    fn description(&self) -> &'static str {
        "Score servers by platform age"
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let weight = ctx.defaults.weight_current_platform;
        if weight == 0.0 {
            return Ok(zero_weight(servers, "weight_current_platform"));
        }
        // Option orders None first, so reversing puts it last.
        let mut by_platform: BTreeMap<Option<&str>, Vec<&str>> = BTreeMap::new();
        for c in &servers {
            by_platform.entry(c.server.live_image()).or_default().push(c.uuid());
        }
        let buckets: Vec<Vec<&str>> = by_platform.into_values().rev().collect();
        let mut reasons = Reasons::new();
        linear_buckets(&buckets, weight, &mut ctx.scores, &mut reasons);
        Ok(Filtered::new(servers, reasons))
    }
}

/// Servers rebooting later, or not at all, are better.
pub struct ScoreNextReboot;

impl ScoreNextReboot {
    /// Upcoming reboot time; past or unparseable schedules count as none.
    fn upcoming(c: &Candidate, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let raw = c.server.next_reboot.as_deref()?;
        match DateTime::parse_from_rfc3339(raw) {
            Ok(at) => Some(at.with_timezone(&Utc)).filter(|at| *at > now),
            Err(e) => {
                debug!(server = %c.uuid(), next_reboot = raw, error = %e, "unparseable next_reboot");
                None
            }
        }
    }
}

#[async_trait]
impl Algorithm for ScoreNextReboot {
    fn name(&self) -> &'static str {
        "score-next-reboot"
    }

    fn description(&self) -> &'static str {
        "Score servers by next scheduled reboot"
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let weight = ctx.defaults.weight_next_reboot;
        if weight == 0.0 {
            return Ok(zero_weight(servers, "weight_next_reboot"));
        }
        let now = ctx.now;
        let mut ranked: Vec<(&str, Option<DateTime<Utc>>)> =
            servers.iter().map(|c| (c.uuid(), Self::upcoming(c, now))).collect();
        if ranked.iter().all(|(_, at)| at.is_none()) {
            return Ok(Filtered::skip(servers, "no reboots scheduled"));
        }
        // No reboot first, then the latest reboot first. Stable on ties.
        ranked.sort_by(|(_, a), (_, b)| match (a, b) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(a), Some(b)) => b.cmp(a),
        });
        let ordered: Vec<&str> = ranked.into_iter().map(|(uuid, _)| uuid).collect();
        let mut reasons = Reasons::new();
        linear(&ordered, weight, &mut ctx.scores, &mut reasons);
        Ok(Filtered::new(servers, reasons))
    }
}
