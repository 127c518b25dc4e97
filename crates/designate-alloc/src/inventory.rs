//! Capability hooks into the live instance inventory.
//!
//! The engine never talks to inventory services itself. Callers hand it an
//! [`Inventory`] implementation; these three calls are the only places an
//! allocation suspends.

use std::collections::BTreeMap;

use async_trait::async_trait;
use designate_core::{Server, Vm};

use crate::error::InventoryError;

/// Filter for [`Inventory::list_vms`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmListQuery {
    pub owner_uuid: String,
    /// Only VMs in a live state.
    pub active_only: bool,
}

/// Lookups the engine may perform during an allocation.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Fetch one VM by uuid.
    async fn get_vm(&self, uuid: &str) -> Result<Option<Vm>, InventoryError>;

    /// Search VMs.
    async fn list_vms(&self, query: &VmListQuery) -> Result<Vec<Vm>, InventoryError>;

    /// List the VMs hosted on a server.
    async fn get_server_vms(&self, server_uuid: &str) -> Result<Vec<Vm>, InventoryError>;
}

/// Inventory answered from the request's own server snapshot.
///
/// Used when no live inventory service is wired in: VM lookups search the
/// hosted VMs of the supplied servers, and servers that arrived without a
/// VM list cannot be loaded.
#[derive(Debug, Clone, Default)]
pub struct SnapshotInventory {
    vms: BTreeMap<String, Vm>,
    servers: BTreeMap<String, Vec<Vm>>,
}

impl SnapshotInventory {
    pub fn from_servers(servers: &[Server]) -> Self {
        let mut inventory = Self::default();
        for server in servers {
            let Some(hosted) = &server.vms else { continue };
            let mut list = Vec::with_capacity(hosted.len());
            for vm in hosted.values() {
                let mut vm = vm.clone();
                if vm.server_uuid.is_none() {
                    vm.server_uuid = Some(server.uuid.clone());
                }
                inventory.vms.insert(vm.uuid.clone(), vm.clone());
                list.push(vm);
            }
            inventory.servers.insert(server.uuid.clone(), list);
        }
        inventory
    }
}

#[async_trait]
impl Inventory for SnapshotInventory {
    async fn get_vm(&self, uuid: &str) -> Result<Option<Vm>, InventoryError> {
        Ok(self.vms.get(uuid).cloned())
    }

    async fn list_vms(&self, query: &VmListQuery) -> Result<Vec<Vm>, InventoryError> {
        Ok(self
            .vms
            .values()
            .filter(|vm| vm.owner_uuid == query.owner_uuid)
            .filter(|vm| !query.active_only || vm.state.is_active())
            .cloned()
            .collect())
    }

    async fn get_server_vms(&self, server_uuid: &str) -> Result<Vec<Vm>, InventoryError> {
        self.servers.get(server_uuid).cloned().ok_or_else(|| {
            InventoryError::Unavailable(format!("no VM list supplied for server {server_uuid}"))
        })
    }
}
