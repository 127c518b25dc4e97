//! Pipeline expressions: parsing, validation and dispatch.
//!
//! A [`Description`] from configuration is parsed once into an [`Expr`]
//! tree against a [`Registry`]. The tree is immutable and shared by every
//! request; [`dispatch`] walks it per request, threading the candidate
//! list and recording one [`Step`] per leaf invocation.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use designate_core::{Description, Step};

use crate::algorithm::{Algorithm, Candidate, Capability, Context, Filtered};
use crate::error::{AllocResult, ConstructionError};
use crate::registry::Registry;

const PIPE: &str = "pipe";
const OR: &str = "or";

#[derive(Clone)]
pub enum Expr {
    Leaf(Arc<dyn Algorithm>),
    /// Narrow sequentially; stop once nothing is left.
    Pipe(Vec<Expr>),
    /// First child to return a non-empty list wins.
    Or(Vec<Expr>),
}

impl Expr {
    /// Parse and validate a description.
    ///
    /// Besides the shape checks, every algorithm's required capabilities
    /// must be provided by a leaf visited before it.
    pub fn parse(description: &Description, registry: &Registry) -> Result<Self, ConstructionError> {
        let expr = Self::parse_node(description, registry)?;
        expr.check_capabilities(&mut BTreeSet::new())?;
        Ok(expr)
    }

    fn parse_node(description: &Description, registry: &Registry) -> Result<Self, ConstructionError> {
        let items = match description {
            Description::Name(name) => {
                return registry
                    .get(name)
                    .map(Expr::Leaf)
                    .ok_or_else(|| ConstructionError::UnknownAlgorithm(name.clone()));
            }
            Description::List(items) => items,
        };

        let Some((head, children)) = items.split_first() else {
            return Err(ConstructionError::Empty);
        };
        let command = match head {
            Description::Name(name) if name == PIPE => PIPE,
            Description::Name(name) if name == OR => OR,
            Description::Name(name) if registry.contains(name) => {
                return Err(ConstructionError::LeafAsCommand(name.clone()));
            }
            Description::Name(name) => return Err(ConstructionError::UnknownCommand(name.clone())),
            Description::List(_) => {
                return Err(ConstructionError::UnknownCommand(
                    "<nested list>".to_string(),
                ));
            }
        };

        let min = if command == PIPE { 1 } else { 2 };
        if children.len() < min {
            return Err(ConstructionError::TooFewChildren {
                command,
                min,
                got: children.len(),
            });
        }

        let children = children
            .iter()
            .map(|child| Self::parse_node(child, registry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(if command == PIPE {
            Expr::Pipe(children)
        } else {
            Expr::Or(children)
        })
    }

    /// Walk in visitation order, accumulating provided capabilities. After
    /// an `or` only what every branch provides is guaranteed.
    fn check_capabilities(&self, have: &mut BTreeSet<Capability>) -> Result<(), ConstructionError> {
        match self {
            Expr::Leaf(algorithm) => {
                if let Some(missing) = algorithm.requires().iter().find(|c| !have.contains(c)) {
                    return Err(ConstructionError::MissingCapability {
                        algorithm: algorithm.name().to_string(),
                        capability: missing.to_string(),
                    });
                }
                have.extend(algorithm.provides().iter().copied());
            }
            Expr::Pipe(children) => {
                for child in children {
                    child.check_capabilities(have)?;
                }
            }
            Expr::Or(children) => {
                let mut common: Option<BTreeSet<Capability>> = None;
                for child in children {
                    let mut branch = have.clone();
                    child.check_capabilities(&mut branch)?;
                    common = Some(match common {
                        None => branch,
                        Some(c) => c.intersection(&branch).copied().collect(),
                    });
                }
                if let Some(common) = common {
                    *have = common;
                }
            }
        }
        Ok(())
    }

    /// The same tree with only capacity-relevant leaves. Commands left
    /// with too few children collapse; `None` when nothing remains.
    pub fn retain_capacity(&self) -> Option<Expr> {
        match self {
            Expr::Leaf(algorithm) => algorithm.affects_capacity().then(|| self.clone()),
            Expr::Pipe(children) => {
                let kept: Vec<Expr> = children.iter().filter_map(Expr::retain_capacity).collect();
                (!kept.is_empty()).then_some(Expr::Pipe(kept))
            }
            Expr::Or(children) => {
                let mut kept: Vec<Expr> = children.iter().filter_map(Expr::retain_capacity).collect();
                match kept.len() {
                    0 => None,
                    1 => kept.pop(),
                    _ => Some(Expr::Or(kept)),
                }
            }
        }
    }

    /// Every leaf algorithm in visitation order.
    pub fn leaves(&self) -> Vec<&Arc<dyn Algorithm>> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Arc<dyn Algorithm>>) {
        match self {
            Expr::Leaf(algorithm) => out.push(algorithm),
            Expr::Pipe(children) | Expr::Or(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }
}

/// Renders the tree back in description form.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (command, children) = match self {
            Expr::Leaf(algorithm) => return write!(f, "{:?}", algorithm.name()),
            Expr::Pipe(children) => (PIPE, children),
            Expr::Or(children) => (OR, children),
        };
        write!(f, "[{command:?}")?;
        for child in children {
            write!(f, ", {child}")?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Run `expr` over `servers`, appending to `steps`.
///
/// An empty result is not an error. Algorithm errors abort immediately.
pub fn dispatch<'a, 'b: 'a>(
    expr: &'a Expr,
    servers: Vec<Candidate>,
    ctx: &'a mut Context<'b>,
    steps: &'a mut Vec<Step>,
) -> BoxFuture<'a, AllocResult<Vec<Candidate>>> {
    async move {
        match expr {
            Expr::Leaf(algorithm) => run_leaf(algorithm.as_ref(), servers, ctx, steps).await,
            Expr::Pipe(children) => {
                let mut servers = servers;
                for child in children {
                    servers = dispatch(child, servers, &mut *ctx, &mut *steps).await?;
                    if servers.is_empty() {
                        break;
                    }
                }
                Ok(servers)
            }
            Expr::Or(children) => {
                for child in children {
                    let result = dispatch(child, servers.clone(), &mut *ctx, &mut *steps).await?;
                    if !result.is_empty() {
                        return Ok(result);
                    }
                }
                Ok(Vec::new())
            }
        }
    }
    .boxed()
}

async fn run_leaf(
    algorithm: &dyn Algorithm,
    servers: Vec<Candidate>,
    ctx: &mut Context<'_>,
    steps: &mut Vec<Step>,
) -> AllocResult<Vec<Candidate>> {
    let input: BTreeSet<String> = servers.iter().map(|c| c.uuid().to_string()).collect();
    let Filtered { servers, reasons } = algorithm.run(servers, ctx).await?;

    let mut seen = BTreeSet::new();
    let servers: Vec<Candidate> = servers
        .into_iter()
        .filter(|c| {
            if !input.contains(c.uuid()) {
                warn!(algorithm = algorithm.name(), server = %c.uuid(), "dropping server not in algorithm input");
                return false;
            }
            seen.insert(c.uuid().to_string())
        })
        .collect();

    debug!(algorithm = algorithm.name(), remaining = servers.len(), "step finished");
    steps.push(Step {
        step: algorithm.description().to_string(),
        remaining: servers.iter().map(|c| c.uuid().to_string()).collect(),
        reasons,
    });
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use designate_core::{AllocationRequest, Defaults, Reasons, Server};

    use crate::error::AllocError;
    use crate::inventory::SnapshotInventory;

    /// Keeps servers whose uuid is in `keep`.
    struct Keep {
        name: &'static str,
        keep: &'static [&'static str],
        capacity: bool,
        requires: &'static [Capability],
        provides: &'static [Capability],
    }

    impl Keep {
        fn new(name: &'static str, keep: &'static [&'static str]) -> Self {
            Self {
                name,
                keep,
                capacity: true,
                requires: &[],
                provides: &[],
            }
        }
    }

    #[async_trait]
    impl Algorithm for Keep {
        fn name(&self) -> &'static str {
            self.name
        }
        fn description(&self) -> &'static str {
            self.name
        }
        fn affects_capacity(&self) -> bool {
            self.capacity
        }
        fn requires(&self) -> &'static [Capability] {
            self.requires
        }
        fn provides(&self) -> &'static [Capability] {
            self.provides
        }
        async fn run(&self, servers: Vec<Candidate>, _ctx: &mut Context<'_>) -> AllocResult<Filtered> {
            Ok(Filtered::retain_with(servers, |c| {
                if self.keep.iter().any(|k| *k == c.uuid()) {
                    Ok(())
                } else {
                    Err(format!("{} rejects", self.name))
                }
            }))
        }
    }

    struct Fail;

    #[async_trait]
    impl Algorithm for Fail {
        fn name(&self) -> &'static str {
            "fail"
        }
        fn description(&self) -> &'static str {
            "always fails"
        }
        async fn run(&self, _servers: Vec<Candidate>, _ctx: &mut Context<'_>) -> AllocResult<Filtered> {
            Err(AllocError::algorithm("fail", "boom"))
        }
    }

    struct Invent;

    #[async_trait]
    impl Algorithm for Invent {
        fn name(&self) -> &'static str {
            "invent"
        }
        fn description(&self) -> &'static str {
            "invents a server"
        }
        async fn run(&self, mut servers: Vec<Candidate>, _ctx: &mut Context<'_>) -> AllocResult<Filtered> {
            servers.push(make_candidate("ghost"));
            Ok(Filtered::new(servers, Reasons::new()))
        }
    }

    fn make_candidate(uuid: &str) -> Candidate {
        Candidate::new(Server {
            uuid: uuid.to_string(),
            ..Server::default()
        })
    }

    fn make_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(Arc::new(Keep::new("all", &["s1", "s2", "s3"])));
        registry.register(Arc::new(Keep::new("s1s2", &["s1", "s2"])));
        registry.register(Arc::new(Keep::new("s2s3", &["s2", "s3"])));
        registry.register(Arc::new(Keep::new("none", &[])));
        registry.register(Arc::new(Keep {
            capacity: false,
            ..Keep::new("s3", &["s3"])
        }));
        registry.register(Arc::new(Keep {
            provides: &[Capability::Unreserved],
            ..Keep::new("provider", &["s1", "s2", "s3"])
        }));
        registry.register(Arc::new(Keep {
            requires: &[Capability::Unreserved],
            ..Keep::new("consumer", &["s1", "s2", "s3"])
        }));
        registry.register(Arc::new(Fail));
        registry.register(Arc::new(Invent));
        registry
    }

    fn desc(json: &str) -> Description {
        serde_json::from_str(json).unwrap()
    }

    fn parse(json: &str) -> Result<Expr, ConstructionError> {
        Expr::parse(&desc(json), &make_registry())
    }

    async fn run(json: &str) -> (AllocResult<Vec<String>>, Vec<Step>) {
        let expr = parse(json).unwrap();
        let request = AllocationRequest::default();
        let defaults = Defaults::default();
        let inventory = SnapshotInventory::default();
        let mut ctx = Context::new(&request, &defaults, &inventory);
        let mut steps = Vec::new();
        let servers = vec![make_candidate("s1"), make_candidate("s2"), make_candidate("s3")];
        let result = dispatch(&expr, servers, &mut ctx, &mut steps)
            .await
            .map(|s| s.iter().map(|c| c.uuid().to_string()).collect());
        (result, steps)
    }

    #[test]
    fn parse_validates_shape() {
        assert!(parse(r#"["pipe", "all", ["or", "s1s2", "s2s3"]]"#).is_ok());
        assert_eq!(parse("[]").unwrap_err(), ConstructionError::Empty);
        assert_eq!(
            parse(r#"["pipe"]"#).unwrap_err(),
            ConstructionError::TooFewChildren { command: "pipe", min: 1, got: 0 }
        );
        assert_eq!(
            parse(r#"["or", "all"]"#).unwrap_err(),
            ConstructionError::TooFewChildren { command: "or", min: 2, got: 1 }
        );
        assert_eq!(
            parse(r#"["and", "all"]"#).unwrap_err(),
            ConstructionError::UnknownCommand("and".into())
        );
        assert_eq!(
            parse(r#"["all", "s1s2"]"#).unwrap_err(),
            ConstructionError::LeafAsCommand("all".into())
        );
        assert_eq!(
            parse(r#"["pipe", "all", "missing"]"#).unwrap_err(),
            ConstructionError::UnknownAlgorithm("missing".into())
        );
    }

    #[test]
    fn parse_checks_capabilities() {
        assert!(parse(r#"["pipe", "provider", "consumer"]"#).is_ok());
        assert!(matches!(
            parse(r#"["pipe", "consumer", "provider"]"#),
            Err(ConstructionError::MissingCapability { .. })
        ));
        // Only one branch provides it.
        assert!(matches!(
            parse(r#"["pipe", ["or", "provider", "all"], "consumer"]"#),
            Err(ConstructionError::MissingCapability { .. })
        ));
        assert!(parse(r#"["pipe", ["or", "provider", ["pipe", "all", "provider"]], "consumer"]"#).is_ok());
    }

    #[test]
    fn display_round_trips() {
        let json = r#"["pipe", "all", ["or", "s1s2", "s2s3"]]"#;
        let rendered = parse(json).unwrap().to_string();
        assert_eq!(desc(&rendered), desc(json));
    }

    #[test]
    fn retain_capacity_prunes_and_collapses() {
        let expr = parse(r#"["pipe", "s3", ["or", "s3", "s1s2"], "all"]"#).unwrap();
        let pruned = expr.retain_capacity().unwrap();
        assert_eq!(pruned.to_string(), r#"["pipe", "s1s2", "all"]"#);
        assert!(parse(r#"["pipe", "s3"]"#).unwrap().retain_capacity().is_none());
    }

    #[tokio::test]
    async fn pipe_narrows_and_records_each_leaf() {
        let (result, steps) = run(r#"["pipe", "all", "s1s2", "s2s3"]"#).await;
        assert_eq!(result.unwrap(), vec!["s2"]);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].remaining, vec!["s1", "s2"]);
        assert_eq!(steps[1].reasons["s3"], "s1s2 rejects");
    }

    #[tokio::test]
    async fn pipe_stops_once_empty() {
        let (result, steps) = run(r#"["pipe", "none", "fail"]"#).await;
        assert!(result.unwrap().is_empty());
        assert_eq!(steps.len(), 1);
    }

    #[tokio::test]
    async fn or_returns_first_non_empty_from_shared_input() {
        let (result, steps) = run(r#"["or", "none", "s2s3", "s1s2"]"#).await;
        assert_eq!(result.unwrap(), vec!["s2", "s3"]);
        assert_eq!(steps.len(), 2);

        let (result, _) = run(r#"["or", "none", "none"]"#).await;
        assert!(result.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pipe_is_associative() {
        let (nested, _) = run(r#"["pipe", ["pipe", "all", "s1s2"], "s2s3"]"#).await;
        let (flat, _) = run(r#"["pipe", "all", "s1s2", "s2s3"]"#).await;
        assert_eq!(nested.unwrap(), flat.unwrap());
    }

    #[tokio::test]
    async fn errors_abort() {
        let (result, steps) = run(r#"["pipe", "all", "fail", "s1s2"]"#).await;
        assert!(result.is_err());
        assert_eq!(steps.len(), 1);
    }

    #[tokio::test]
    async fn invented_servers_are_dropped() {
        let (result, _) = run(r#"["pipe", "invent"]"#).await;
        assert_eq!(result.unwrap(), vec!["s1", "s2", "s3"]);
    }
}
