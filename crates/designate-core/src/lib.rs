//! designate-core: data model and configuration for server allocation.
//!
//! Holds the serde types for every payload an allocation request carries
//! (servers, VMs, packages, images, tickets, locality and affinity hints),
//! the audit-trail types produced by the engine, and the TOML
//! configuration: the pipeline description plus the `[defaults]` tunables.
//!
//! Nothing here is persisted. Every value is built per request from
//! caller-supplied snapshots, except the configuration which is loaded
//! once at startup.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    default_allocation, Defaults, DesignateConfig, Description, ListenConfig, OwnerServerRule,
    RuleOperator,
};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
