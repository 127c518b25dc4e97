//! Owner-server placement rules.
//!
//! Operators restrict which servers an owner may land on with declarative
//! `{owner_uuid?, field, operator, value}` rules from the `[defaults]`
//! table. Rules are compiled once; evaluation never runs operator code.

use regex::Regex;

use designate_core::{OwnerServerRule, RuleOperator, Server, TraitValue};

use crate::error::PredicateError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Uuid,
    Hostname,
    RackIdentifier,
    Headnode,
    Reserved,
    Platform,
    SdcVersion,
    Trait(String),
}

impl Field {
    fn parse(name: &str) -> Result<Self, PredicateError> {
        Ok(match name {
            "uuid" => Field::Uuid,
            "hostname" => Field::Hostname,
            "rack_identifier" => Field::RackIdentifier,
            "headnode" => Field::Headnode,
            "reserved" => Field::Reserved,
            "platform" => Field::Platform,
            "sdc_version" => Field::SdcVersion,
            other => match other.strip_prefix("traits.") {
                Some(t) if !t.is_empty() => Field::Trait(t.to_string()),
                _ => return Err(PredicateError::UnknownField(other.to_string())),
            },
        })
    }

    /// All values the server exposes for this field; empty when missing.
    fn values(&self, server: &Server) -> Vec<String> {
        let one = |v: Option<&str>| v.map(str::to_string).into_iter().collect();
        match self {
            Field::Uuid => vec![server.uuid.clone()],
            Field::Hostname => one(server.hostname.as_deref()),
            Field::RackIdentifier => one(server.rack_identifier.as_deref()),
            Field::Headnode => vec![server.headnode.to_string()],
            Field::Reserved => vec![server.reserved.to_string()],
            Field::Platform => one(server.live_image()),
            Field::SdcVersion => one(server.sdc_version()),
            Field::Trait(name) => match server.traits.get(name) {
                None => Vec::new(),
                Some(TraitValue::Bool(b)) => vec![b.to_string()],
                Some(TraitValue::String(s)) => vec![s.clone()],
                Some(TraitValue::List(l)) => l.clone(),
            },
        }
    }
}

#[derive(Debug, Clone)]
enum Test {
    Eq(String),
    Ne(String),
    Matches(Regex),
    NotMatches(Regex),
}

impl Test {
    fn holds(&self, values: &[String]) -> bool {
        match self {
            Test::Eq(want) => values.iter().any(|v| v == want),
            Test::Ne(want) => values.iter().all(|v| v != want),
            Test::Matches(re) => values.iter().any(|v| re.is_match(v)),
            Test::NotMatches(re) => values.iter().all(|v| !re.is_match(v)),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    owner_uuid: Option<String>,
    field: Field,
    test: Test,
    source: OwnerServerRule,
}

/// A compiled set of owner-server rules.
#[derive(Debug, Clone, Default)]
pub struct OwnerServerPredicate {
    rules: Vec<CompiledRule>,
}

impl OwnerServerPredicate {
    pub fn compile(rules: &[OwnerServerRule]) -> Result<Self, PredicateError> {
        let rules = rules
            .iter()
            .map(|rule| {
                let regex = |pattern: &str| {
                    Regex::new(pattern).map_err(|e| PredicateError::Regex {
                        pattern: pattern.to_string(),
                        message: e.to_string(),
                    })
                };
                let test = match rule.operator {
                    RuleOperator::Eq => Test::Eq(rule.value.clone()),
                    RuleOperator::Ne => Test::Ne(rule.value.clone()),
                    RuleOperator::Matches => Test::Matches(regex(&rule.value)?),
                    RuleOperator::NotMatches => Test::NotMatches(regex(&rule.value)?),
                };
                Ok(CompiledRule {
                    owner_uuid: rule.owner_uuid.clone(),
                    field: Field::parse(&rule.field)?,
                    test,
                    source: rule.clone(),
                })
            })
            .collect::<Result<Vec<_>, PredicateError>>()?;
        Ok(Self { rules })
    }

    /// Whether any rule applies to `owner_uuid`.
    pub fn applies_to(&self, owner_uuid: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r.owner_uuid.as_deref().is_none_or(|o| o == owner_uuid))
    }

    /// Evaluate every rule applicable to `owner_uuid` against `server`.
    pub fn check(&self, owner_uuid: &str, server: &Server) -> Result<(), String> {
        for rule in &self.rules {
            if rule.owner_uuid.as_deref().is_some_and(|o| o != owner_uuid) {
                continue;
            }
            if !rule.test.holds(&rule.field.values(server)) {
                let src = &rule.source;
                let op = match src.operator {
                    RuleOperator::Eq => "==",
                    RuleOperator::Ne => "!=",
                    RuleOperator::Matches => "=~",
                    RuleOperator::NotMatches => "!~",
                };
                return Err(format!(
                    "owner {owner_uuid} requires {} {op} {:?}",
                    src.field, src.value
                ));
            }
        }
        Ok(())
    }
}
