pub mod entities;
pub mod messages;
pub mod repositories;

pub use entities::*;
pub use harvester_core::{HarvesterError, HarvesterResult};
pub use messages::PushMessage;
pub use repositories::*;
