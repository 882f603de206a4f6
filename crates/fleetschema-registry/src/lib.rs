//! fleetschema-registry — who is running, and what can they speak.
//!
//! # Components
//!
//! - **`registrar`** — per-process heartbeat loop that keeps this instance's
//!   TTL-bound registration fresh and purges expired ones
//! - **`compatibility`** — intersection of the version ranges advertised by
//!   live registrations

pub mod compatibility;
pub mod error;
pub mod registrar;

pub use compatibility::{CompatibilityResolver, CompatibleVersions};
pub use error::{RegistryError, RegistryResult};
pub use registrar::{HeartbeatOutcome, InstanceRegistrar};
