//! Locality resolution: near/far placement relative to the owner's
//! existing instances.
//!
//! Resolution happens in two passes. [`LocalityIndex::build`] runs before
//! hard filtering and records where the owner's instances live (servers
//! and racks), because by the time soft filtering runs most of those
//! servers have already been eliminated. [`resolve_strict`] and
//! [`resolve_soft`] then narrow the surviving candidates.
//!
//! Only instances owned by the requester are ever considered, so one
//! tenant cannot steer placement by naming another tenant's instances.

use std::collections::BTreeSet;

use designate_core::{Locality, Reasons, VmUuid, REASON_ALL};

use crate::algorithm::Candidate;

/// Flavours of locality in effect for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LocalityTag {
    SoftFar,
    HardFar,
    SoftNear,
    HardNear,
}

impl LocalityTag {
    pub fn as_str(self) -> &'static str {
        match self {
            LocalityTag::SoftFar => "soft_far",
            LocalityTag::HardFar => "hard_far",
            LocalityTag::SoftNear => "soft_near",
            LocalityTag::HardNear => "hard_near",
        }
    }
}

/// Where the requesting owner's relevant instances live.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalityIndex {
    pub owner_uuid: String,
    /// Servers hosting at least one owned near VM.
    pub near_server_uuids: BTreeSet<String>,
    /// Servers hosting at least one owned far VM.
    pub far_server_uuids: BTreeSet<String>,
    pub near_rack_ids: BTreeSet<String>,
    pub far_rack_ids: BTreeSet<String>,
    /// Servers hosting any instance of the owner.
    pub owner_server_uuids: BTreeSet<String>,
    /// Near VMs that exist and belong to the owner.
    pub owned_near: BTreeSet<VmUuid>,
    pub localities: Vec<LocalityTag>,
}

impl LocalityIndex {
    /// Index the owner's instances across `servers`.
    pub fn build(owner_uuid: &str, locality: Option<&Locality>, servers: &[Candidate]) -> Self {
        let mut index = LocalityIndex {
            owner_uuid: owner_uuid.to_string(),
            localities: tags(locality),
            ..LocalityIndex::default()
        };

        let near: BTreeSet<&str> = locality
            .map(|l| l.near.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let far: BTreeSet<&str> = locality
            .map(|l| l.far.iter().map(String::as_str).collect())
            .unwrap_or_default();

        for server in servers {
            let rack = server.server.rack_identifier.as_ref();
            for vm in server.hosted().filter(|vm| vm.owner_uuid == owner_uuid) {
                index.owner_server_uuids.insert(server.uuid().to_string());
                if near.contains(vm.uuid.as_str()) {
                    index.owned_near.insert(vm.uuid.clone());
                    index.near_server_uuids.insert(server.uuid().to_string());
                    if let Some(rack) = rack {
                        index.near_rack_ids.insert(rack.clone());
                    }
                }
                if far.contains(vm.uuid.as_str()) {
                    index.far_server_uuids.insert(server.uuid().to_string());
                    if let Some(rack) = rack {
                        index.far_rack_ids.insert(rack.clone());
                    }
                }
            }
        }
        index
    }

    pub fn has(&self, tag: LocalityTag) -> bool {
        self.localities.contains(&tag)
    }
}

fn tags(locality: Option<&Locality>) -> Vec<LocalityTag> {
    let Some(locality) = locality.filter(|l| !l.is_empty()) else {
        // Spreading the owner's instances is the default.
        return vec![LocalityTag::SoftFar];
    };
    let mut tags = Vec::new();
    if !locality.far.is_empty() {
        tags.push(if locality.strict {
            LocalityTag::HardFar
        } else {
            LocalityTag::SoftFar
        });
    }
    if !locality.near.is_empty() {
        tags.push(if locality.strict {
            LocalityTag::HardNear
        } else {
            LocalityTag::SoftNear
        });
    }
    tags
}

fn owned_far<'a>(server: &'a Candidate, owner_uuid: &str, far: &BTreeSet<&str>) -> Vec<&'a str> {
    server
        .hosted()
        .filter(|vm| vm.owner_uuid == owner_uuid && far.contains(vm.uuid.as_str()))
        .map(|vm| vm.uuid.as_str())
        .collect()
}

/// Apply strict locality: `far` first, then `near`.
///
/// Far removes every server hosting an owned far VM. Near keeps only a
/// server hosting every owned near VM; near VMs that do not exist or
/// belong to another owner are ignored, and if none are left nothing
/// qualifies.
pub fn resolve_strict(
    servers: Vec<Candidate>,
    locality: &Locality,
    index: &LocalityIndex,
) -> (Vec<Candidate>, Reasons) {
    let mut reasons = Reasons::new();
    let far: BTreeSet<&str> = locality.far.iter().map(String::as_str).collect();

    let mut servers: Vec<Candidate> = servers
        .into_iter()
        .filter(|server| {
            let hits = owned_far(server, &index.owner_uuid, &far);
            if hits.is_empty() {
                return true;
            }
            reasons.insert(
                server.uuid().to_string(),
                format!("exclude: inst!={}", hits.join(",")),
            );
            false
        })
        .collect();

    if locality.near.is_empty() {
        return (servers, reasons);
    }

    if index.owned_near.is_empty() {
        for server in &servers {
            reasons.remove(server.uuid());
        }
        reasons.insert(
            REASON_ALL.to_string(),
            format!(
                "no server hosts near VMs {} owned by {}",
                locality.near.join(","),
                index.owner_uuid
            ),
        );
        return (Vec::new(), reasons);
    }

    let required = &index.owned_near;
    servers.retain(|server| {
        if required.iter().all(|uuid| server.vms.contains_key(uuid)) {
            return true;
        }
        reasons.insert(
            server.uuid().to_string(),
            format!(
                "exclude: does not host all of inst=={}",
                required.iter().cloned().collect::<Vec<_>>().join(",")
            ),
        );
        false
    });
    (servers, reasons)
}

/// Apply non-strict locality. Never empties a non-empty candidate list.
///
/// Without explicit hints the owner's instances are spread: servers
/// already hosting one are dropped unless that leaves nothing. Explicit
/// `far` prefers other racks, then other servers; explicit `near` prefers
/// the same servers, then the same racks.
pub fn resolve_soft(
    servers: Vec<Candidate>,
    locality: Option<&Locality>,
    index: &LocalityIndex,
) -> (Vec<Candidate>, Reasons) {
    let mut reasons = Reasons::new();
    if servers.is_empty() {
        return (servers, reasons);
    }

    let Some(locality) = locality.filter(|l| !l.is_empty()) else {
        let (kept, dropped): (Vec<_>, Vec<_>) = servers
            .iter()
            .cloned()
            .partition(|s| !s.hosts_owner(&index.owner_uuid));
        if kept.is_empty() {
            reasons.insert(
                REASON_ALL.to_string(),
                format!(
                    "spreading ignored because non-strict: every server hosts instances of owner {}",
                    index.owner_uuid
                ),
            );
            return (servers, reasons);
        }
        for server in dropped {
            reasons.insert(
                server.uuid().to_string(),
                format!("exclude: hosts instances of owner {}", index.owner_uuid),
            );
        }
        return (kept, reasons);
    };

    let mut servers = servers;
    if !locality.far.is_empty() {
        servers = soft_far(servers, locality, index, &mut reasons);
    }
    if !locality.near.is_empty() {
        servers = soft_near(servers, index, &mut reasons);
    }
    (servers, reasons)
}

fn soft_far(
    servers: Vec<Candidate>,
    locality: &Locality,
    index: &LocalityIndex,
    reasons: &mut Reasons,
) -> Vec<Candidate> {
    let in_far_rack = |s: &Candidate| {
        s.server
            .rack_identifier
            .as_ref()
            .is_some_and(|r| index.far_rack_ids.contains(r))
    };
    if servers.iter().any(|s| !in_far_rack(s)) {
        let (kept, dropped): (Vec<_>, Vec<_>) = servers.into_iter().partition(|s| !in_far_rack(s));
        for server in dropped {
            reasons.insert(
                server.uuid().to_string(),
                format!(
                    "exclude: rack {} hosts far VMs",
                    server.server.rack_identifier.as_deref().unwrap_or_default()
                ),
            );
        }
        return kept;
    }

    let far: BTreeSet<&str> = locality.far.iter().map(String::as_str).collect();
    let hosts_far = |s: &Candidate| !owned_far(s, &index.owner_uuid, &far).is_empty();
    if servers.iter().any(|s| !hosts_far(s)) {
        let (kept, dropped): (Vec<_>, Vec<_>) = servers.into_iter().partition(|s| !hosts_far(s));
        for server in dropped {
            let hits = owned_far(&server, &index.owner_uuid, &far).join(",");
            reasons.insert(server.uuid().to_string(), format!("exclude: inst!={hits}"));
        }
        return kept;
    }

    reasons.insert(
        REASON_ALL.to_string(),
        format!(
            "far locality ignored because non-strict: every server hosts one of {}",
            locality.far.join(",")
        ),
    );
    servers
}

fn soft_near(servers: Vec<Candidate>, index: &LocalityIndex, reasons: &mut Reasons) -> Vec<Candidate> {
    let on_near_server = |s: &Candidate| index.near_server_uuids.contains(s.uuid());
    if servers.iter().any(on_near_server) {
        let (kept, dropped): (Vec<_>, Vec<_>) = servers.into_iter().partition(on_near_server);
        for server in dropped {
            reasons.insert(
                server.uuid().to_string(),
                "exclude: does not host near VMs".to_string(),
            );
        }
        return kept;
    }

    let in_near_rack = |s: &Candidate| {
        s.server
            .rack_identifier
            .as_ref()
            .is_some_and(|r| index.near_rack_ids.contains(r))
    };
    if servers.iter().any(in_near_rack) {
        let (kept, dropped): (Vec<_>, Vec<_>) = servers.into_iter().partition(in_near_rack);
        for server in dropped {
            reasons.insert(
                server.uuid().to_string(),
                "exclude: not in a rack hosting near VMs".to_string(),
            );
        }
        return kept;
    }

    reasons.insert(
        REASON_ALL.to_string(),
        "near locality ignored because non-strict: no candidate is near".to_string(),
    );
    servers
}

#[cfg(test)]
mod tests {
    use super::*;
    use designate_core::{Server, Vm};

    fn make_vm(uuid: &str, owner: &str) -> Vm {
        Vm {
            uuid: uuid.to_string(),
            owner_uuid: owner.to_string(),
            ..Vm::default()
        }
    }

    fn make_server(uuid: &str, rack: Option<&str>, vms: Vec<Vm>) -> Candidate {
        Candidate::new(Server {
            uuid: uuid.to_string(),
            rack_identifier: rack.map(str::to_string),
            vms: Some(vms.into_iter().map(|vm| (vm.uuid.clone(), vm)).collect()),
            ..Server::default()
        })
    }

    fn uuids(servers: &[Candidate]) -> Vec<&str> {
        servers.iter().map(Candidate::uuid).collect()
    }

    fn locality(strict: bool, near: &[&str], far: &[&str]) -> Locality {
        Locality {
            strict,
            near: near.iter().map(|s| s.to_string()).collect(),
            far: far.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn pool() -> Vec<Candidate> {
        vec![
            make_server("s1", Some("r1"), vec![make_vm("v1", "o1"), make_vm("v2", "o1")]),
            make_server("s2", Some("r1"), vec![make_vm("v3", "o1")]),
            make_server("s3", Some("r2"), vec![make_vm("x1", "o2")]),
            make_server("s4", Some("r3"), vec![]),
        ]
    }

    #[test]
    fn index_records_owned_servers_and_racks() {
        let loc = locality(false, &["v1", "x1"], &["v3"]);
        let index = LocalityIndex::build("o1", Some(&loc), &pool());
        assert_eq!(index.near_server_uuids, BTreeSet::from(["s1".to_string()]));
        assert_eq!(index.near_rack_ids, BTreeSet::from(["r1".to_string()]));
        assert_eq!(index.far_server_uuids, BTreeSet::from(["s2".to_string()]));
        assert_eq!(index.far_rack_ids, BTreeSet::from(["r1".to_string()]));
        assert_eq!(index.owned_near, BTreeSet::from(["v1".to_string()]));
        assert_eq!(
            index.owner_server_uuids,
            BTreeSet::from(["s1".to_string(), "s2".to_string()])
        );
        assert_eq!(index.localities, vec![LocalityTag::SoftFar, LocalityTag::SoftNear]);
    }

    #[test]
    fn index_defaults_to_soft_far() {
        let index = LocalityIndex::build("o1", None, &pool());
        assert!(index.has(LocalityTag::SoftFar));
        let strict = locality(true, &["v1"], &[]);
        let index = LocalityIndex::build("o1", Some(&strict), &pool());
        assert_eq!(index.localities, vec![LocalityTag::HardNear]);
    }

    #[test]
    fn strict_far_excludes_hosting_servers() {
        let loc = locality(true, &[], &["v1", "x1"]);
        let index = LocalityIndex::build("o1", Some(&loc), &pool());
        let (kept, reasons) = resolve_strict(pool(), &loc, &index);
        // x1 belongs to another owner and is ignored.
        assert_eq!(uuids(&kept), vec!["s2", "s3", "s4"]);
        assert_eq!(reasons["s1"], "exclude: inst!=v1");
    }

    #[test]
    fn strict_near_keeps_the_host_of_all() {
        let loc = locality(true, &["v1", "v2"], &[]);
        let index = LocalityIndex::build("o1", Some(&loc), &pool());
        let (kept, reasons) = resolve_strict(pool(), &loc, &index);
        assert_eq!(uuids(&kept), vec!["s1"]);
        assert_eq!(reasons.len(), 3);
    }

    #[test]
    fn strict_near_split_across_servers_is_empty() {
        let loc = locality(true, &["v1", "v3"], &[]);
        let index = LocalityIndex::build("o1", Some(&loc), &pool());
        let (kept, _) = resolve_strict(pool(), &loc, &index);
        assert!(kept.is_empty());
    }

    #[test]
    fn strict_near_missing_vm_is_empty_with_star() {
        let loc = locality(true, &["nope"], &[]);
        let index = LocalityIndex::build("o1", Some(&loc), &pool());
        let (kept, reasons) = resolve_strict(pool(), &loc, &index);
        assert!(kept.is_empty());
        assert!(reasons.contains_key(REASON_ALL));
    }

    #[test]
    fn strict_near_foreign_vm_is_ignored() {
        let loc = locality(true, &["x1"], &[]);
        let index = LocalityIndex::build("o1", Some(&loc), &pool());
        let (kept, reasons) = resolve_strict(pool(), &loc, &index);
        assert!(kept.is_empty());
        assert_eq!(reasons.keys().collect::<Vec<_>>(), vec![REASON_ALL]);
    }

    #[test]
    fn strict_far_wins_over_near() {
        let loc = locality(true, &["v1"], &["v2"]);
        let index = LocalityIndex::build("o1", Some(&loc), &pool());
        let (kept, reasons) = resolve_strict(pool(), &loc, &index);
        assert!(kept.is_empty());
        assert_eq!(reasons["s1"], "exclude: inst!=v2");
    }

    #[test]
    fn soft_default_spreads_owner() {
        let index = LocalityIndex::build("o1", None, &pool());
        let (kept, reasons) = resolve_soft(pool(), None, &index);
        assert_eq!(uuids(&kept), vec!["s3", "s4"]);
        assert!(reasons.contains_key("s1"));
        assert!(reasons.contains_key("s2"));
    }

    #[test]
    fn soft_default_ignored_when_everything_hosts_owner() {
        let servers: Vec<Candidate> = pool().into_iter().take(2).collect();
        let index = LocalityIndex::build("o1", None, &servers);
        let (kept, reasons) = resolve_soft(servers, None, &index);
        assert_eq!(uuids(&kept), vec!["s1", "s2"]);
        assert!(reasons[REASON_ALL].contains("non-strict"));
    }

    #[test]
    fn soft_far_prefers_other_racks() {
        let loc = locality(false, &[], &["v3"]);
        let index = LocalityIndex::build("o1", Some(&loc), &pool());
        // s1 hosts no far VM but shares rack r1 with s2.
        let (kept, reasons) = resolve_soft(pool(), Some(&loc), &index);
        assert_eq!(uuids(&kept), vec!["s3", "s4"]);
        assert_eq!(reasons["s1"], "exclude: rack r1 hosts far VMs");
    }

    #[test]
    fn soft_far_falls_back_to_servers_then_all() {
        let loc = locality(false, &[], &["v3"]);
        let full = pool();
        let index = LocalityIndex::build("o1", Some(&loc), &full);

        let rack_only: Vec<Candidate> = full.iter().take(2).cloned().collect();
        let (kept, _) = resolve_soft(rack_only, Some(&loc), &index);
        assert_eq!(uuids(&kept), vec!["s1"]);

        let only_far: Vec<Candidate> = full.iter().skip(1).take(1).cloned().collect();
        let (kept, reasons) = resolve_soft(only_far, Some(&loc), &index);
        assert_eq!(uuids(&kept), vec!["s2"]);
        assert!(reasons.contains_key(REASON_ALL));
    }

    #[test]
    fn soft_near_prefers_server_then_rack() {
        let loc = locality(false, &["v3"], &[]);
        let full = pool();
        let index = LocalityIndex::build("o1", Some(&loc), &full);

        let (kept, _) = resolve_soft(full.clone(), Some(&loc), &index);
        assert_eq!(uuids(&kept), vec!["s2"]);

        // s2 already filtered out: its rack-mate s1 is next best.
        let without_s2: Vec<Candidate> = full.iter().filter(|s| s.uuid() != "s2").cloned().collect();
        let (kept, reasons) = resolve_soft(without_s2, Some(&loc), &index);
        assert_eq!(uuids(&kept), vec!["s1"]);
        assert_eq!(reasons["s4"], "exclude: not in a rack hosting near VMs");

        let far_away: Vec<Candidate> = full.iter().skip(2).cloned().collect();
        let (kept, reasons) = resolve_soft(far_away, Some(&loc), &index);
        assert_eq!(uuids(&kept), vec!["s3", "s4"]);
        assert!(reasons.contains_key(REASON_ALL));
    }

    #[test]
    fn soft_never_empties() {
        let loc = locality(false, &["nope"], &["v1", "v3"]);
        let full = pool();
        let index = LocalityIndex::build("o1", Some(&loc), &full);
        let only_s1: Vec<Candidate> = full.into_iter().take(1).collect();
        let (kept, _) = resolve_soft(only_s1, Some(&loc), &index);
        assert_eq!(uuids(&kept), vec!["s1"]);
    }
}
