pub mod cache;
pub mod coalescing;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod fetch_install;
pub mod metrics;
pub mod redact;
pub mod snapshot;
pub mod supervisor;
pub mod worker;

pub use config::AgentConfig;
pub use error::AgentError;
pub use supervisor::Supervisor;
pub use worker::Worker;
