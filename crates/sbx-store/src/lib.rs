//! In-memory sandbox lifecycle store for the SBX control plane.
//!
//! The store tracks every live sandbox the control plane knows about,
//! admits new starts against per-team quotas, serializes lifecycle
//! transitions per record, and evicts expired sandboxes through a
//! background loop whose callback tears the underlying micro-VM down.
//! Ground truth lives on the worker nodes; `SandboxStore::sync`
//! re-converges the in-memory view from their heartbeat reports.

pub mod cache;
pub mod error;
pub mod identifier;
pub mod latch;
pub mod reservations;
pub mod sandbox;
pub mod shard_map;
pub mod store;
pub mod token;

pub use cache::{Expirable, LifecycleCache};
pub use error::StoreError;
pub use identifier::{IdentifierError, TemplateRef};
pub use latch::{SetOnce, WaitError};
pub use reservations::{Reservation, ReservationGate};
pub use sandbox::{RemoveAction, Removal, Sandbox, SandboxSpec, SandboxState, TransitionHandle};
pub use shard_map::ShardMap;
pub use store::{SandboxRemover, SandboxStore, StoreHooks};
pub use token::AccessTokenHasher;
