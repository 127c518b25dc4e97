//! Affinity compilation: Docker-Swarm-style rules down to a [`Locality`].
//!
//! Each rule selects some of the owner's live instances by name, uuid or
//! tag. `==` rules turn the matches into `near` hints, `!=` rules into
//! `far` hints. Strictness is all or nothing: as soon as one rule is hard,
//! every soft rule is dropped.

use regex::Regex;
use tracing::debug;

use designate_core::{Affinity, AffinityOperator, AffinityValueType, Locality, Vm};

use crate::error::{AllocError, AllocResult};
use crate::inventory::{Inventory, VmListQuery};

/// Label prefix Docker uses for user labels stored as tags.
const DOCKER_LABEL_PREFIX: &str = "docker:label:";

/// Parse the string form of a rule; see [`Affinity`]'s `FromStr`.
pub fn parse(expr: &str) -> AllocResult<Affinity> {
    expr.parse().map_err(AllocError::Validation)
}

enum ValueMatcher {
    Exact(String),
    Pattern(Regex),
}

impl ValueMatcher {
    fn new(aff: &Affinity) -> AllocResult<Self> {
        let pattern = match aff.value_type {
            AffinityValueType::Exact => return Ok(ValueMatcher::Exact(aff.value.clone())),
            AffinityValueType::Glob => glob_to_regex(&aff.value),
            AffinityValueType::Re => aff.value.clone(),
        };
        Regex::new(&pattern).map(ValueMatcher::Pattern).map_err(|e| {
            AllocError::Validation(format!("affinity {}: invalid pattern: {e}", aff))
        })
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            ValueMatcher::Exact(value) => value == candidate,
            ValueMatcher::Pattern(re) => re.is_match(candidate),
        }
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut re = String::with_capacity(glob.len() + 8);
    re.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    re
}

fn is_instance_key(key: &str) -> bool {
    matches!(key, "container" | "instance")
}

fn tag_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn vm_matches(aff: &Affinity, matcher: &ValueMatcher, vm: &Vm) -> bool {
    if is_instance_key(&aff.key) {
        if matcher.matches(&vm.uuid) || vm.alias.as_deref().is_some_and(|a| matcher.matches(a)) {
            return true;
        }
        // Docker short ids are prefixes of the dashless uuid.
        return match matcher {
            ValueMatcher::Exact(value) => value.len() >= 12 && vm.uuid.replace('-', "").starts_with(value),
            ValueMatcher::Pattern(_) => false,
        };
    }

    [aff.key.clone(), format!("{DOCKER_LABEL_PREFIX}{}", aff.key)]
        .iter()
        .filter_map(|key| vm.tags.get(key))
        .any(|value| matcher.matches(&tag_string(value)))
}

/// Compile `rules` against the owner's live instances.
///
/// Returns `None` when no rule survives. A hard `==` rule matching nothing
/// fails the request; every other empty rule is dropped.
pub async fn compile(
    rules: &[Affinity],
    owner_uuid: &str,
    inventory: &dyn Inventory,
) -> AllocResult<Option<Locality>> {
    if rules.is_empty() {
        return Ok(None);
    }

    let strict = rules.iter().any(|r| !r.is_soft);
    let active: Vec<&Affinity> = rules.iter().filter(|r| !strict || !r.is_soft).collect();
    if active.len() < rules.len() {
        debug!(
            dropped = rules.len() - active.len(),
            "soft affinity rules ignored alongside hard ones"
        );
    }

    let vms = inventory
        .list_vms(&VmListQuery {
            owner_uuid: owner_uuid.to_string(),
            active_only: true,
        })
        .await?;

    let mut locality = Locality {
        strict,
        ..Locality::default()
    };
    for aff in active {
        let matcher = ValueMatcher::new(aff)?;
        let matched: Vec<&Vm> = vms.iter().filter(|vm| vm_matches(aff, &matcher, vm)).collect();

        if matched.is_empty() {
            if !aff.is_soft && aff.operator == AffinityOperator::Eq {
                return Err(AllocError::AffinityUnsatisfiable(format!(
                    "no active instances match affinity {}",
                    aff
                )));
            }
            debug!(rule = %aff, "affinity matched no instances, dropped");
            continue;
        }

        let target = match aff.operator {
            AffinityOperator::Eq => &mut locality.near,
            AffinityOperator::Ne => &mut locality.far,
        };
        for vm in matched {
            if !target.contains(&vm.uuid) {
                target.push(vm.uuid.clone());
            }
        }
    }

    Ok((!locality.is_empty()).then_some(locality))
}
