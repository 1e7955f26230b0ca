//! `taskcron-core` — configuration shared by the scheduler and the gateway.

pub mod config;
pub mod error;

pub use config::TaskcronConfig;
pub use error::{CoreError, Result};
