pub mod config;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod resolver;
pub mod scheduler;
pub mod shell;
pub mod supervisor;
pub mod types;

pub use error::{DeployError, DeployResult};
pub use types::*;
