//! Domain types for allocation requests.
//!
//! These types mirror the payloads supplied by callers: compute nodes
//! (servers) with their hosted instances, the instance being provisioned,
//! its package and image, and in-flight provision tickets. All types are
//! serde-serializable; field names follow the inventory wire format.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a server (compute node).
pub type ServerUuid = String;

/// Unique identifier for a VM/instance.
pub type VmUuid = String;

/// Bytes in one mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Bytes in one gibibyte.
pub const GIB: u64 = 1024 * MIB;

/// Share of server RAM held back for the host itself when a server does
/// not carry its own `reservation_ratio`.
pub const DEFAULT_RESERVATION_RATIO: f64 = 0.15;

// ── Traits ────────────────────────────────────────────────────────

/// A single capability tag value.
///
/// Operators attach these to servers, packages, images and VMs. A trait is
/// either a flag, a single string, or a set of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraitValue {
    Bool(bool),
    String(String),
    List(Vec<String>),
}

/// Trait name → value map.
pub type Traits = BTreeMap<String, TraitValue>;

// ── Overprovisioning ──────────────────────────────────────────────

/// Per-resource overprovision ratios as supplied on a server.
///
/// Missing entries fall back to [`ResolvedRatios::default`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverprovisionRatios {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<f64>,
}

/// Fully resolved overprovision ratios used by resource accounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRatios {
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
}

impl Default for ResolvedRatios {
    /// RAM and disk are not overprovisioned by default; CPU is.
    fn default() -> Self {
        Self {
            cpu: 4.0,
            ram: 1.0,
            disk: 1.0,
        }
    }
}

impl OverprovisionRatios {
    /// Fill missing entries from `fallback`.
    pub fn resolve(&self, fallback: ResolvedRatios) -> ResolvedRatios {
        ResolvedRatios {
            cpu: self.cpu.unwrap_or(fallback.cpu),
            ram: self.ram.unwrap_or(fallback.ram),
            disk: self.disk.unwrap_or(fallback.disk),
        }
    }
}

// ── Server ────────────────────────────────────────────────────────

/// Operational status reported for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    #[default]
    Unknown,
    #[serde(other)]
    Other,
}

/// NIC details from sysinfo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NicInfo {
    #[serde(rename = "NIC Names", default)]
    pub nic_names: Vec<String>,
}

/// Raw hardware/platform telemetry reported by a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sysinfo {
    #[serde(rename = "CPU Total Cores", default)]
    pub cpu_total_cores: u32,
    /// Platform image timestamp, e.g. `20240101T000000Z`.
    #[serde(rename = "Live Image", default, skip_serializing_if = "Option::is_none")]
    pub live_image: Option<String>,
    /// Platform major version, e.g. `7.0`.
    #[serde(rename = "SDC Version", default, skip_serializing_if = "Option::is_none")]
    pub sdc_version: Option<String>,
    #[serde(rename = "VM Capable", default)]
    pub vm_capable: bool,
    #[serde(rename = "Bhyve Capable", default)]
    pub bhyve_capable: bool,
    #[serde(rename = "Network Interfaces", default)]
    pub network_interfaces: BTreeMap<String, NicInfo>,
}

/// A compute node that may receive the new instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub uuid: ServerUuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default)]
    pub setup: bool,
    #[serde(default)]
    pub reserved: bool,
    #[serde(default)]
    pub reservoir: bool,
    #[serde(default)]
    pub headnode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rack_identifier: Option<String>,
    #[serde(default)]
    pub memory_total_bytes: u64,
    /// Share of RAM reserved for the host (default 0.15).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_ratio: Option<f64>,
    #[serde(default)]
    pub disk_pool_size_bytes: u64,
    #[serde(default)]
    pub disk_pool_alloc_bytes: u64,
    #[serde(default)]
    pub disk_system_used_bytes: u64,
    #[serde(default)]
    pub disk_installed_images_used_bytes: u64,
    #[serde(default)]
    pub disk_cores_quota_used_bytes: u64,
    /// Bytes actually written inside zone quotas.
    #[serde(default)]
    pub disk_zone_quota_used_bytes: u64,
    #[serde(default)]
    pub overprovision_ratios: OverprovisionRatios,
    #[serde(default)]
    pub traits: Traits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysinfo: Option<Sysinfo>,
    /// Hosted VMs keyed by uuid. `None` means the list was not supplied
    /// and must be fetched from inventory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vms: Option<BTreeMap<VmUuid, Vm>>,
    /// Scheduled reboot, RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_reboot: Option<String>,
}

impl Server {
    /// Platform timestamp from sysinfo, if known.
    pub fn live_image(&self) -> Option<&str> {
        self.sysinfo.as_ref()?.live_image.as_deref()
    }

    /// Platform major version from sysinfo, if known.
    pub fn sdc_version(&self) -> Option<&str> {
        self.sysinfo.as_ref()?.sdc_version.as_deref()
    }
}

// ── VM ────────────────────────────────────────────────────────────

/// Virtualization technology of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Brand {
    Kvm,
    Bhyve,
    #[default]
    Joyent,
    JoyentMinimal,
    Lx,
    #[serde(other)]
    Other,
}

impl Brand {
    /// Hardware-virtualized brands own their full RAM and disk.
    pub fn is_hvm(self) -> bool {
        matches!(self, Brand::Kvm | Brand::Bhyve)
    }
}

/// Lifecycle state of a hosted VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    #[default]
    Running,
    Stopped,
    Provisioning,
    Failed,
    Destroyed,
    #[serde(other)]
    Other,
}

impl VmState {
    /// States counted as live instances for affinity matching.
    pub fn is_active(self) -> bool {
        !matches!(self, VmState::Failed | VmState::Destroyed)
    }
}

/// A VM, either hosted on a server or the one being allocated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    #[serde(alias = "vm_uuid")]
    pub uuid: VmUuid,
    #[serde(default)]
    pub owner_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub brand: Brand,
    /// MiB.
    #[serde(default, alias = "max_physical_memory")]
    pub ram: u64,
    /// Percent of one core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<u64>,
    /// GiB.
    #[serde(default)]
    pub quota: u64,
    #[serde(default)]
    pub state: VmState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_uuid: Option<ServerUuid>,
    #[serde(default)]
    pub tags: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub traits: Traits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<Locality>,
    /// Rule objects or their `key==value` string form.
    #[serde(default, deserialize_with = "affinity_rules", skip_serializing_if = "Vec::is_empty")]
    pub affinity: Vec<Affinity>,
    /// VMs whose volumes this VM mounts; all must share its server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes_from: Vec<VmUuid>,
    /// Each group lists interchangeable NIC tags; every group must be met.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nic_tag_requirements: Vec<Vec<String>>,
}

// ── Package / Image ───────────────────────────────────────────────

/// Sizing template for a provision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// MiB.
    #[serde(default)]
    pub max_physical_memory: u64,
    /// MiB.
    #[serde(default)]
    pub quota: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<u64>,
    #[serde(default)]
    pub traits: Traits,
    #[serde(default)]
    pub min_platform: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overprovision_cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overprovision_ram: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overprovision_disk: Option<f64>,
}

/// Constraints an image places on its host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<Brand>,
    /// SDC version → minimum platform timestamp.
    #[serde(default)]
    pub min_platform: BTreeMap<String, String>,
    /// SDC version → maximum platform timestamp.
    #[serde(default)]
    pub max_platform: BTreeMap<String, String>,
}

/// The image the instance is created from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
    /// Virtual disk size in MiB for HVM images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<u64>,
    #[serde(default)]
    pub traits: Traits,
    #[serde(default)]
    pub requirements: ImageRequirements,
}

// ── Ticket ────────────────────────────────────────────────────────

/// Sizing carried on a provision ticket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketExtra {
    #[serde(default, alias = "max_physical_memory")]
    pub ram: u64,
    #[serde(default)]
    pub quota: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<u64>,
    #[serde(default)]
    pub brand: Brand,
    #[serde(default)]
    pub owner_uuid: String,
}

/// In-flight provision marker reserving a server for a VM that does not
/// yet appear in its inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// The VM uuid being provisioned.
    pub id: VmUuid,
    pub server_uuid: ServerUuid,
    pub scope: String,
    pub action: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<TicketExtra>,
}

impl Ticket {
    /// Whether this ticket still holds capacity for a pending provision.
    pub fn is_pending_provision(&self) -> bool {
        self.scope == "vm"
            && self.action == "provision"
            && matches!(self.status.as_str(), "active" | "queued")
    }
}

// ── Locality / Affinity ───────────────────────────────────────────

/// Accepts either a single value or a list on input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

/// Near/far placement hints relative to existing VMs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Locality {
    #[serde(default)]
    pub strict: bool,
    #[serde(default, deserialize_with = "one_or_many")]
    pub near: Vec<VmUuid>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub far: Vec<VmUuid>,
}

impl Locality {
    pub fn is_empty(&self) -> bool {
        self.near.is_empty() && self.far.is_empty()
    }
}

/// Affinity comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffinityOperator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

/// How an affinity value is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AffinityValueType {
    #[default]
    Exact,
    Glob,
    Re,
}

/// One Docker-Swarm-style affinity expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Affinity {
    pub key: String,
    pub operator: AffinityOperator,
    pub value: String,
    #[serde(default)]
    pub value_type: AffinityValueType,
    #[serde(default)]
    pub is_soft: bool,
}

impl FromStr for Affinity {
    type Err = String;

    /// Parse `key==value`, `key!=value`, `key==~value` or `key!=~value`,
    /// where `~` marks the rule soft. `/.../` values are regexes, values
    /// with `*` or `?` are globs.
    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        // Split at the leftmost operator; values may contain either one.
        let (at, operator) = match (expr.find("=="), expr.find("!=")) {
            (Some(eq), Some(ne)) if ne < eq => (ne, AffinityOperator::Ne),
            (Some(eq), _) => (eq, AffinityOperator::Eq),
            (None, Some(ne)) => (ne, AffinityOperator::Ne),
            (None, None) => return Err(format!("affinity {expr:?} has no == or != operator")),
        };
        let (key, rest) = (&expr[..at], &expr[at + 2..]);

        let key = key.trim();
        let (is_soft, value) = match rest.strip_prefix('~') {
            Some(value) => (true, value.trim()),
            None => (false, rest.trim()),
        };
        if key.is_empty() || value.is_empty() {
            return Err(format!("affinity {expr:?} needs both a key and a value"));
        }

        let (value_type, value) = match value.strip_prefix('/').and_then(|v| v.strip_suffix('/')) {
            Some(re) if !re.is_empty() => (AffinityValueType::Re, re),
            _ if value.contains(['*', '?']) => (AffinityValueType::Glob, value),
            _ => (AffinityValueType::Exact, value),
        };

        Ok(Affinity {
            key: key.to_string(),
            operator,
            value: value.to_string(),
            value_type,
            is_soft,
        })
    }
}

/// Renders the string form accepted by [`FromStr`].
impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.operator {
            AffinityOperator::Eq => "==",
            AffinityOperator::Ne => "!=",
        };
        let soft = if self.is_soft { "~" } else { "" };
        match self.value_type {
            AffinityValueType::Re => write!(f, "{}{op}{soft}/{}/", self.key, self.value),
            _ => write!(f, "{}{op}{soft}{}", self.key, self.value),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AffinityRepr {
    Text(String),
    Rule(Affinity),
}

fn affinity_rules<'de, D>(deserializer: D) -> Result<Vec<Affinity>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Vec::<AffinityRepr>::deserialize(deserializer)?
        .into_iter()
        .map(|repr| match repr {
            AffinityRepr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            AffinityRepr::Rule(rule) => Ok(rule),
        })
        .collect()
}

// ── Request / results ─────────────────────────────────────────────

/// Everything describing one provision beyond the server pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub vm: Vm,
    #[serde(default)]
    pub image: Image,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<Package>,
    #[serde(default)]
    pub tickets: Vec<Ticket>,
}

/// Exclusion/scoring reasons for one algorithm step, keyed by server uuid
/// or one of the sentinels [`REASON_SKIP`] and [`REASON_ALL`].
pub type Reasons = BTreeMap<String, String>;

/// Reason key: the algorithm declined to act.
pub const REASON_SKIP: &str = "skip";

/// Reason key: the reason applies to the whole removed set.
pub const REASON_ALL: &str = "*";

/// One entry of the allocation audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Human-readable algorithm description.
    pub step: String,
    /// Server uuids still in the running after this step.
    pub remaining: Vec<ServerUuid>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reasons: Reasons,
}

/// Spare resources of one server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unreserved {
    /// Centi-cores.
    pub unreserved_cpu: i64,
    /// MiB.
    pub unreserved_ram: i64,
    /// MiB.
    pub unreserved_disk: i64,
}

/// Remaining room for one (package, image) combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityEntry {
    pub package_uuid: String,
    pub image_uuid: String,
    pub slots: u64,
}
