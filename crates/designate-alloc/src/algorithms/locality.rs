//! Affinity and locality algorithms.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::affinity;
use crate::algorithm::{Algorithm, Candidate, Capability, Context, Filtered};
use crate::error::AllocResult;
use crate::locality::{resolve_soft, resolve_strict, LocalityIndex};

/// Compiles the VM's affinity rules into its effective locality.
pub struct CalculateAffinity;

#[async_trait]
impl Algorithm for CalculateAffinity {
    fn name(&self) -> &'static str {
        "calculate-affinity"
    }

    fn description(&self) -> &'static str {
        "Convert affinity to locality hints"
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let rules = &ctx.request.vm.affinity;
        if rules.is_empty() {
            return Ok(Filtered::skip(servers, "no affinity"));
        }

        let compiled = affinity::compile(rules, ctx.owner_uuid(), ctx.inventory).await?;
        if ctx.locality.as_ref().is_some_and(|l| !l.is_empty()) {
            warn!(vm = %ctx.request.vm.uuid, "affinity replaces explicit locality");
        }
        debug!(locality = ?compiled, "compiled affinity");
        ctx.locality = compiled;
        Ok(Filtered::unchanged(servers))
    }
}

/// Records where the owner's instances live before hard filtering removes
/// those servers from view.
pub struct CalculateLocality;

#[async_trait]
impl Algorithm for CalculateLocality {
    fn name(&self) -> &'static str {
        "calculate-locality"
    }

    fn description(&self) -> &'static str {
        "Calculate locality data"
    }

    fn requires(&self) -> &'static [Capability] {
        &[Capability::HostedVms]
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let index = LocalityIndex::build(ctx.owner_uuid(), ctx.locality.as_ref(), &servers);
        debug!(
            near_servers = index.near_server_uuids.len(),
            far_servers = index.far_server_uuids.len(),
            localities = ?index.localities.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            "precomputed locality"
        );
        ctx.locality_index = Some(index);
        Ok(Filtered::unchanged(servers))
    }

    fn post(&self, ctx: &mut Context<'_>) {
        ctx.locality_index = None;
    }
}

/// The precomputed index, or one built from the current candidates when
/// `calculate-locality` did not run.
fn index_for(ctx: &Context<'_>, servers: &[Candidate]) -> LocalityIndex {
    match &ctx.locality_index {
        Some(index) => index.clone(),
        None => LocalityIndex::build(ctx.owner_uuid(), ctx.locality.as_ref(), servers),
    }
}

pub struct HardFilterLocalityHints;

#[async_trait]
impl Algorithm for HardFilterLocalityHints {
    fn name(&self) -> &'static str {
        "hard-filter-locality-hints"
    }

    fn description(&self) -> &'static str {
        "Servers violating strict locality hints"
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let Some(locality) = ctx.locality.as_ref().filter(|l| l.strict && !l.is_empty()) else {
            return Ok(Filtered::skip(servers, "no strict locality hints"));
        };
        let index = index_for(ctx, &servers);
        let (servers, reasons) = resolve_strict(servers, locality, &index);
        Ok(Filtered::new(servers, reasons))
    }
}

pub struct SoftFilterLocalityHints;

#[async_trait]
impl Algorithm for SoftFilterLocalityHints {
    fn name(&self) -> &'static str {
        "soft-filter-locality-hints"
    }

    fn description(&self) -> &'static str {
        "Servers against non-strict locality hints"
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        if ctx.locality.as_ref().is_some_and(|l| l.strict && !l.is_empty()) {
            return Ok(Filtered::skip(servers, "locality hints are strict"));
        }
        let index = index_for(ctx, &servers);
        let (servers, reasons) = resolve_soft(servers, ctx.locality.as_ref(), &index);
        Ok(Filtered::new(servers, reasons))
    }
}
