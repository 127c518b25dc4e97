//! Offline helpers sharing the daemon's configuration.

use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use designate_alloc::{Allocation, Allocator, SnapshotInventory};
use designate_api::handlers::AllocationBody;

use crate::startup;

/// Validate the configuration and print the parsed pipeline.
pub fn run_check(config_path: &Path) -> anyhow::Result<()> {
    let (config, allocator) = startup::load(config_path)?;
    println!("listen port: {}", config.listen.port);
    println!("pipeline: {}", allocator.expr());
    Ok(())
}

/// Run one allocation from `input` and print the result as JSON.
pub async fn run_allocate(config_path: &Path, input: &Path) -> anyhow::Result<()> {
    let (_, allocator) = startup::load(config_path)?;
    let body = read_body(input)?;
    let allocation = allocate(&allocator, body).await?;
    println!("{}", serde_json::to_string_pretty(&Report::from(&allocation))?);
    Ok(())
}

fn read_body(input: &Path) -> anyhow::Result<AllocationBody> {
    let raw = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid allocation request in {}", input.display()))
}

async fn allocate(allocator: &Allocator, body: AllocationBody) -> anyhow::Result<Allocation> {
    let AllocationBody { servers, request } = body;
    let inventory = SnapshotInventory::from_servers(&servers);
    let allocation = allocator.allocate(servers, &request, &inventory).await?;
    info!(
        server = allocation.server.as_ref().map(|s| s.uuid.as_str()).unwrap_or("none"),
        steps = allocation.steps.len(),
        "offline allocation finished"
    );
    Ok(allocation)
}

/// Printed form: the chosen uuid instead of the whole server record.
#[derive(Serialize)]
struct Report<'a> {
    server: Option<&'a str>,
    last_step: Option<&'a str>,
    steps: &'a [designate_core::Step],
}

impl<'a> From<&'a Allocation> for Report<'a> {
    fn from(allocation: &'a Allocation) -> Self {
        Self {
            server: allocation.server.as_ref().map(|s| s.uuid.as_str()),
            last_step: allocation.last_step(),
            steps: &allocation.steps,
        }
    }
}
