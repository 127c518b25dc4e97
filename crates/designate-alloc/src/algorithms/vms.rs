//! Algorithms that load or reason about hosted instances through the
//! inventory hooks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use designate_core::{Reasons, Vm, VmState};

use crate::algorithm::{Algorithm, Candidate, Capability, Context, Filtered};
use crate::error::{AllocError, AllocResult};

/// Fetches hosted VM lists for servers that arrived without one.
///
/// Fetches run concurrently; a server whose fetch fails is removed on its
/// own without failing the request.
pub struct LoadServerVms;

#[async_trait]
impl Algorithm for LoadServerVms {
    fn name(&self) -> &'static str {
        "load-server-vms"
    }

    fn description(&self) -> &'static str {
        "Load VMs hosted on servers"
    }

    fn affects_capacity(&self) -> bool {
        true
    }

    fn provides(&self) -> &'static [Capability] {
        &[Capability::HostedVms]
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        if servers.iter().all(|c| c.vms_loaded) {
            return Ok(Filtered::unchanged(servers));
        }

        let inventory = ctx.inventory;
        let fetches = servers.iter().map(|c| async move {
            if c.vms_loaded {
                None
            } else {
                Some(inventory.get_server_vms(c.uuid()).await)
            }
        });
        let results = join_all(fetches).await;

        let mut reasons = Reasons::new();
        let mut kept = Vec::with_capacity(servers.len());
        for (mut candidate, result) in servers.into_iter().zip(results) {
            match result {
                None => kept.push(candidate),
                Some(Ok(vms)) => {
                    debug!(server = %candidate.uuid(), vms = vms.len(), "loaded server VMs");
                    let vms: BTreeMap<_, _> = vms.into_iter().map(|vm| (vm.uuid.clone(), vm)).collect();
                    candidate.vms = Arc::new(vms);
                    candidate.vms_loaded = true;
                    kept.push(candidate);
                }
                Some(Err(e)) => {
                    warn!(server = %candidate.uuid(), error = %e, "failed to load server VMs");
                    reasons.insert(candidate.uuid().to_string(), format!("Failed to load VMs: {e}"));
                }
            }
        }
        Ok(Filtered::new(kept, reasons))
    }
}

/// Turns in-flight provision tickets into placeholder VMs so a server is
/// not double-booked before its new VM shows up in inventory.
pub struct CalculateTicketedVms;

#[async_trait]
impl Algorithm for CalculateTicketedVms {
    fn name(&self) -> &'static str {
        "calculate-ticketed-vms"
    }

    fn description(&self) -> &'static str {
        "Account for VMs in ticketed provisions"
    }

    fn requires(&self) -> &'static [Capability] {
        &[Capability::HostedVms]
    }

    async fn run(&self, mut servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let own_uuid = ctx.request.vm.uuid.as_str();
        let tickets: Vec<_> = ctx
            .request
            .tickets
            .iter()
            .filter(|t| t.is_pending_provision() && t.id != own_uuid)
            .collect();
        if tickets.is_empty() {
            return Ok(Filtered::skip(servers, "no pending provision tickets"));
        }

        let mut reasons = Reasons::new();
        for candidate in &mut servers {
            let mut added = 0;
            let candidate_uuid = candidate.uuid().to_string();
            for ticket in tickets.iter().filter(|t| t.server_uuid == candidate_uuid) {
                if candidate.vms.contains_key(&ticket.id) {
                    continue;
                }
                let Some(extra) = &ticket.extra else {
                    debug!(ticket = %ticket.id, "ticket carries no sizing, ignored");
                    continue;
                };
                let placeholder = Vm {
                    uuid: ticket.id.clone(),
                    owner_uuid: extra.owner_uuid.clone(),
                    brand: extra.brand,
                    ram: extra.ram,
                    cpu_cap: extra.cpu_cap,
                    quota: extra.quota,
                    state: VmState::Provisioning,
                    server_uuid: Some(ticket.server_uuid.clone()),
                    ..Vm::default()
                };
                Arc::make_mut(&mut candidate.vms).insert(placeholder.uuid.clone(), placeholder);
                added += 1;
            }
            if added > 0 {
                reasons.insert(
                    candidate.uuid().to_string(),
                    format!("added {added} ticketed VMs"),
                );
            }
        }
        Ok(Filtered::new(servers, reasons))
    }
}

/// Keeps only the server hosting every VM named in `volumes_from`.
///
/// Dependencies are looked up one at a time.
pub struct HardFilterVolumesFrom;

#[async_trait]
impl Algorithm for HardFilterVolumesFrom {
    fn name(&self) -> &'static str {
        "hard-filter-volumes-from"
    }

    fn description(&self) -> &'static str {
        "Servers not hosting volumes_from VMs"
    }

    async fn run(&self, servers: Vec<Candidate>, ctx: &mut Context<'_>) -> AllocResult<Filtered> {
        let deps = &ctx.request.vm.volumes_from;
        if deps.is_empty() {
            return Ok(Filtered::skip(servers, "no volumes_from"));
        }

        let owner = ctx.owner_uuid();
        let mut hosts = BTreeSet::new();
        for uuid in deps {
            let vm = ctx
                .inventory
                .get_vm(uuid)
                .await?
                .filter(|vm| vm.owner_uuid == owner)
                .ok_or_else(|| AllocError::algorithm(self.name(), format!("volumes_from VM {uuid} not found")))?;
            let server = vm.server_uuid.ok_or_else(|| {
                AllocError::algorithm(self.name(), format!("volumes_from VM {uuid} has no server"))
            })?;
            hosts.insert(server);
        }

        if hosts.len() > 1 {
            return Err(AllocError::algorithm(
                self.name(),
                format!(
                    "volumes_from VMs live on different servers: {}",
                    hosts.into_iter().collect::<Vec<_>>().join(",")
                ),
            ));
        }
        let Some(host) = hosts.pop_first() else {
            return Ok(Filtered::skip(servers, "no volumes_from"));
        };

        Ok(Filtered::retain_with(servers, |c| {
            if c.uuid() == host {
                Ok(())
            } else {
                Err(format!("volumes_from VMs live on server {host}"))
            }
        }))
    }
}
