pub mod config;
pub mod retry;
pub mod shutdown;
pub mod types;

pub use config::{ConfigError, FleetConfig};
pub use retry::{Backoff, RetryError, RetryPolicy};
pub use types::*;
