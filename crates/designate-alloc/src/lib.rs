//! Designate allocation engine.
//!
//! Chooses one server for a new VM by running the caller's server
//! snapshot through a configurable pipeline of algorithms. Hard filters
//! remove servers, soft filters narrow the list only when something
//! survives, and scorers add weighted deltas. Every step is recorded so a
//! caller can see why a server was or was not chosen.
//!
//! # Components
//!
//! - **`expr`**: pipeline expressions (`pipe` / `or`) and their dispatcher
//! - **`algorithms`**: the built-in filters, scorers and data loaders
//! - **`allocator`**: allocation and capacity entry points
//! - **`inventory`**: lookup hooks for VMs that are not in the snapshot

pub mod affinity;
pub mod algorithm;
pub mod algorithms;
pub mod allocator;
pub mod error;
pub mod expr;
pub mod inventory;
pub mod locality;
pub mod platform;
pub mod predicate;
pub mod registry;
pub mod resources;
pub mod score;
pub mod traits;

pub use algorithm::{Algorithm, Candidate, Capability, Context, Filtered, Scores, Sizing};
pub use allocator::{Allocation, Allocator, ServerCapacity};
pub use error::{AllocError, AllocResult, ConstructionError, InventoryError, PredicateError};
pub use expr::Expr;
pub use inventory::{Inventory, SnapshotInventory, VmListQuery};
pub use registry::Registry;
