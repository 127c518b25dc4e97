//! designate.toml configuration parser.
//!
//! The file carries three things: where to listen, the allocation pipeline
//! description, and the `[defaults]` tunables consumed by individual
//! algorithms.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesignateConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    /// Allocation pipeline; the built-in one when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<Description>,
    #[serde(default)]
    pub defaults: Defaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

/// Flat pipeline description: a leaf algorithm name, or a list whose head
/// is `"pipe"`/`"or"` and whose tail are children.
///
/// `["pipe", "a", ["or", "b", "c"]]` in both JSON and TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Description {
    Name(String),
    List(Vec<Description>),
}

impl Description {
    /// `[command, children...]`.
    pub fn command(command: &str, children: Vec<Description>) -> Self {
        let mut list = Vec::with_capacity(children.len() + 1);
        list.push(Description::Name(command.to_string()));
        list.extend(children);
        Description::List(list)
    }

    /// `["pipe", names...]` over plain algorithm names.
    pub fn pipe_of(names: &[&str]) -> Self {
        Self::command("pipe", names.iter().map(|n| Description::from(*n)).collect())
    }
}

impl From<&str> for Description {
    fn from(name: &str) -> Self {
        Description::Name(name.to_string())
    }
}

/// The allocation pipeline used when the configuration does not name one.
pub fn default_allocation() -> Description {
    let names = |names: &[&str]| names.iter().map(|n| Description::from(*n)).collect::<Vec<_>>();

    let mut children = names(&[
        "load-server-vms",
        "calculate-ticketed-vms",
        "calculate-affinity",
        "calculate-locality",
        "hard-filter-setup",
        "hard-filter-running",
        "hard-filter-invalid-servers",
        "hard-filter-volumes-from",
        "hard-filter-reserved",
    ]);
    children.push(Description::command(
        "or",
        names(&["hard-filter-reservoir", "identity"]),
    ));
    children.extend(names(&[
        "hard-filter-headnode",
        "hard-filter-vm-count",
        "hard-filter-capness",
        "hard-filter-hvm",
        "hard-filter-nic-tags",
        "hard-filter-platform-versions",
        "hard-filter-traits",
        "hard-filter-owners-servers",
        "hard-filter-locality-hints",
        "override-overprovisioning",
        "calculate-server-unreserved",
        "hard-filter-min-ram",
        "hard-filter-min-disk",
        "hard-filter-min-cpu",
        "hard-filter-large-servers",
        "soft-filter-locality-hints",
        "score-unreserved-ram",
        "score-unreserved-disk",
        "score-num-owner-zones",
        "score-current-platform",
        "score-next-reboot",
    ]));
    Description::command("pipe", children)
}

/// Comparison used by an owner-server rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOperator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "=~")]
    Matches,
    #[serde(rename = "!~")]
    NotMatches,
}

/// One declarative owner → server placement rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerServerRule {
    /// Owner the rule applies to; every owner when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<String>,
    /// `uuid`, `hostname`, `rack_identifier`, `headnode`, `reserved`,
    /// `platform`, `sdc_version` or `traits.<name>`.
    pub field: String,
    pub operator: RuleOperator,
    pub value: String,
}

/// Named tunables consumed by algorithms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub filter_headnode: bool,
    pub filter_min_resources: bool,
    pub filter_large_servers: bool,
    pub filter_vm_limit: usize,
    pub filter_owner_server: Vec<OwnerServerRule>,
    pub overprovision_ratio_cpu: f64,
    pub overprovision_ratio_ram: f64,
    pub overprovision_ratio_disk: f64,
    pub disable_override_overprovisioning: bool,
    pub weight_current_platform: f64,
    pub weight_next_reboot: f64,
    pub weight_num_owner_zones: f64,
    pub weight_unreserved_disk: f64,
    pub weight_unreserved_ram: f64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            filter_headnode: true,
            filter_min_resources: true,
            filter_large_servers: true,
            filter_vm_limit: 224,
            filter_owner_server: Vec::new(),
            overprovision_ratio_cpu: 4.0,
            overprovision_ratio_ram: 1.0,
            overprovision_ratio_disk: 1.0,
            disable_override_overprovisioning: false,
            weight_current_platform: 1.0,
            weight_next_reboot: 0.5,
            weight_num_owner_zones: 0.0,
            weight_unreserved_disk: 1.0,
            weight_unreserved_ram: 2.0,
        }
    }
}

impl DesignateConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The configured pipeline, or the built-in one.
    pub fn allocation(&self) -> Description {
        self.allocation.clone().unwrap_or_else(default_allocation)
    }
}
