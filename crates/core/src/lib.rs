pub mod config;
pub mod errors;
pub mod retry;

pub use config::*;
pub use errors::{HarvesterError, HarvesterResult};
pub use retry::RetryPolicy;
