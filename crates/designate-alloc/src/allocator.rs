//! Allocation entry points.
//!
//! An [`Allocator`] owns the parsed allocation pipeline plus the fixed
//! sub-pipelines used for capacity reporting. It is built once at startup
//! and shared read-only across requests; every call gets a fresh
//! [`Context`].

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use designate_core::{
    AllocationRequest, Brand, CapacityEntry, Defaults, Description, Image, Package, Server,
    ServerUuid, Step, Unreserved, Vm,
};

use crate::algorithm::{Candidate, Context, Sizing};
use crate::algorithms::resources::disk_footprint;
use crate::error::{AllocError, AllocResult, ConstructionError};
use crate::expr::{dispatch, Expr};
use crate::inventory::Inventory;
use crate::registry::Registry;
use crate::resources::ram_footprint;

/// Sub-pipeline reporting raw spare capacity per server.
const SERVER_CAPACITY: &[&str] = &[
    "hard-filter-setup",
    "hard-filter-running",
    "hard-filter-invalid-servers",
    "load-server-vms",
    "override-overprovisioning",
    "calculate-server-unreserved",
];

/// Owner used for synthetic capacity probes.
const PROBE_OWNER: &str = "00000000-0000-0000-0000-000000000000";

/// Outcome of [`Allocator::allocate`].
#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    /// The winner, or `None` when nothing qualified.
    pub server: Option<Server>,
    pub steps: Vec<Step>,
}

impl Allocation {
    /// Label of the step that ran last, usually the one that removed the
    /// final candidate.
    pub fn last_step(&self) -> Option<&str> {
        self.steps.last().map(|s| s.step.as_str())
    }
}

/// Outcome of [`Allocator::server_capacity`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerCapacity {
    pub servers: BTreeMap<ServerUuid, Unreserved>,
    pub steps: Vec<Step>,
}

#[derive(Debug)]
pub struct Allocator {
    expr: Expr,
    capacity_expr: Option<Expr>,
    server_capacity_expr: Expr,
    defaults: Defaults,
}

impl Allocator {
    /// Build from a pipeline description and the tunables.
    pub fn new(description: &Description, defaults: Defaults) -> Result<Self, ConstructionError> {
        let registry = Registry::builtin(&defaults)?;
        Self::with_registry(description, defaults, &registry)
    }

    /// Build against a custom registry.
    pub fn with_registry(
        description: &Description,
        defaults: Defaults,
        registry: &Registry,
    ) -> Result<Self, ConstructionError> {
        let expr = Expr::parse(description, registry)?;
        let capacity_expr = expr.retain_capacity();
        let server_capacity_expr = Expr::parse(&Description::pipe_of(SERVER_CAPACITY), registry)?;
        debug!(pipeline = %expr, "allocation pipeline ready");
        Ok(Self {
            expr,
            capacity_expr,
            server_capacity_expr,
            defaults,
        })
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    /// Choose a server for `request`.
    ///
    /// An empty result is not an error; the trail tells which step
    /// eliminated the last candidate.
    pub async fn allocate(
        &self,
        servers: Vec<Server>,
        request: &AllocationRequest,
        inventory: &dyn Inventory,
    ) -> AllocResult<Allocation> {
        validate(request)?;

        let mut ctx = Context::new(request, &self.defaults, inventory);
        let candidates: Vec<Candidate> = servers.into_iter().map(Candidate::new).collect();
        let mut steps = Vec::new();
        let result = dispatch(&self.expr, candidates, &mut ctx, &mut steps).await;
        for leaf in self.expr.leaves() {
            leaf.post(&mut ctx);
        }
        let survivors = result?;

        // Strictly greater, so the first of equal scores wins.
        let mut best: Option<(f64, Candidate)> = None;
        for candidate in survivors {
            let score = ctx.score(candidate.uuid());
            if best.as_ref().is_none_or(|(top, _)| score > *top) {
                best = Some((score, candidate));
            }
        }

        let server = best.map(|(score, candidate)| {
            info!(vm = %request.vm.uuid, server = %candidate.uuid(), score, "allocated server");
            (*candidate.server).clone()
        });
        if server.is_none() {
            info!(
                vm = %request.vm.uuid,
                last_step = steps.last().map(|s| s.step.as_str()).unwrap_or("none"),
                "no allocatable servers"
            );
        }
        Ok(Allocation { server, steps })
    }

    /// Spare resources of every usable server.
    pub async fn server_capacity(
        &self,
        servers: Vec<Server>,
        inventory: &dyn Inventory,
    ) -> AllocResult<ServerCapacity> {
        let request = AllocationRequest::default();
        let (candidates, steps) = self.capacity_candidates(servers, &request, inventory).await?;
        Ok(ServerCapacity {
            servers: candidates
                .iter()
                .map(|c| (c.uuid().to_string(), c.unreserved()))
                .collect(),
            steps,
        })
    }

    /// How many more instances of each (package, image) pair fit.
    pub async fn capacity(
        &self,
        servers: Vec<Server>,
        images: &[Image],
        packages: &[Package],
        inventory: &dyn Inventory,
    ) -> AllocResult<Vec<CapacityEntry>> {
        for package in packages {
            validate_package(package)?;
        }
        let base = AllocationRequest::default();
        let (candidates, _) = self.capacity_candidates(servers, &base, inventory).await?;

        let mut entries = Vec::with_capacity(images.len() * packages.len());
        for package in packages {
            for image in images {
                let request = probe(package, image);
                let survivors = match &self.capacity_expr {
                    Some(expr) => {
                        let mut ctx = Context::new(&request, &self.defaults, inventory);
                        let mut steps = Vec::new();
                        dispatch(expr, candidates.clone(), &mut ctx, &mut steps).await?
                    }
                    None => candidates.clone(),
                };
                let sizing = Sizing::of(&request);
                let slots = survivors.iter().map(|c| slots(c, &sizing)).sum();
                debug!(package = %package.uuid, image = %image.uuid, slots, "capacity");
                entries.push(CapacityEntry {
                    package_uuid: package.uuid.clone(),
                    image_uuid: image.uuid.clone(),
                    slots,
                });
            }
        }
        Ok(entries)
    }

    async fn capacity_candidates(
        &self,
        servers: Vec<Server>,
        request: &AllocationRequest,
        inventory: &dyn Inventory,
    ) -> AllocResult<(Vec<Candidate>, Vec<Step>)> {
        let mut ctx = Context::new(request, &self.defaults, inventory);
        let candidates: Vec<Candidate> = servers.into_iter().map(Candidate::new).collect();
        let mut steps = Vec::new();
        let survivors = dispatch(&self.server_capacity_expr, candidates, &mut ctx, &mut steps).await?;
        Ok((survivors, steps))
    }
}

/// Reject requests the pipeline cannot reason about.
pub fn validate(request: &AllocationRequest) -> AllocResult<()> {
    let vm = &request.vm;
    if vm.uuid.is_empty() {
        return Err(AllocError::Validation("vm.uuid is required".into()));
    }
    if vm.owner_uuid.is_empty() {
        return Err(AllocError::Validation("vm.owner_uuid is required".into()));
    }
    if Sizing::of(request).ram == 0 {
        return Err(AllocError::Validation(
            "vm.ram or package.max_physical_memory is required".into(),
        ));
    }
    if let Some(package) = &request.package {
        validate_package(package)?;
    }
    match request.image.requirements.brand {
        Some(brand) if brand != vm.brand => Err(AllocError::Validation(format!(
            "image requires brand {brand:?} but VM is {:?}",
            vm.brand
        ))),
        _ => Ok(()),
    }
}

/// Overprovision ratios are divisors and must be positive.
fn validate_package(package: &Package) -> AllocResult<()> {
    let ratios = [
        ("overprovision_cpu", package.overprovision_cpu),
        ("overprovision_ram", package.overprovision_ram),
        ("overprovision_disk", package.overprovision_disk),
    ];
    for (field, ratio) in ratios {
        match ratio {
            Some(r) if r.is_nan() || r <= 0.0 => {
                return Err(AllocError::Validation(format!(
                    "package {} has {field} {r}, must be positive",
                    package.uuid
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Synthetic request for one (package, image) pair.
fn probe(package: &Package, image: &Image) -> AllocationRequest {
    let brand = image.requirements.brand.unwrap_or(match image.image_type.as_deref() {
        Some("zvol") => Brand::Kvm,
        _ => Brand::Joyent,
    });
    AllocationRequest {
        vm: Vm {
            uuid: format!("capacity-{}-{}", package.uuid, image.uuid),
            owner_uuid: PROBE_OWNER.to_string(),
            brand,
            ..Vm::default()
        },
        image: image.clone(),
        package: Some(package.clone()),
        tickets: Vec::new(),
    }
}

/// Instances of `sizing` that still fit on one server.
fn slots(candidate: &Candidate, sizing: &Sizing) -> u64 {
    let unreserved = candidate.unreserved();
    let hvm = sizing.brand.is_hvm();
    let fit = |have: i64, need: f64| {
        if need <= 0.0 {
            None
        } else {
            Some((have.max(0) as f64 / need).floor() as u64)
        }
    };

    [
        fit(
            unreserved.unreserved_ram,
            ram_footprint(sizing.ram, hvm, candidate.ratios.ram),
        ),
        fit(
            unreserved.unreserved_disk,
            disk_footprint(sizing.disk, hvm, candidate.ratios.disk),
        ),
        sizing
            .cpu_cap
            .and_then(|cap| fit(unreserved.unreserved_cpu, cap as f64 / candidate.ratios.cpu)),
    ]
    .into_iter()
    .flatten()
    .min()
    .unwrap_or(0)
}
