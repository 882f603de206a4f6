//! fleetschema-catalog — what versions exist, and what the fleet runs.
//!
//! The catalog answers four questions for the migration orchestrator:
//! which versions are available (starting at the database's current one),
//! which range the live fleet is compatible with, which version each live
//! instance last observed, and what the script behind a URI is.
//!
//! # Components
//!
//! - **`library`** — snapshot and diff scripts, loaded from a directory
//! - **`local`** — in-process catalog over a library, a ledger and a resolver
//! - **`client`** — HTTP client for a remote catalog
//! - **`server`** — axum router exposing a local catalog
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/schema/versions` | Available versions, current first |
//! | GET | `/schema/versions/current` | Live instances grouped by observed version |
//! | GET | `/schema/compatibility` | Fleet-wide compatible range (`null` if unknown) |
//! | GET | `/schema/scripts/{id}/snapshot` | Full snapshot script for a version |
//! | GET | `/schema/scripts/{id}/diff` | Diff script from `id - 1` to `id` |
//! | GET | `/healthz` | Liveness |

pub mod catalog;
pub mod client;
pub mod error;
pub mod library;
pub mod local;
pub mod server;

pub use catalog::{AvailableVersion, SchemaCatalog, ScriptKind};
pub use client::HttpCatalogClient;
pub use error::{CatalogError, CatalogResult};
pub use library::ScriptLibrary;
pub use local::LocalCatalog;
pub use server::{CatalogState, build_router};
