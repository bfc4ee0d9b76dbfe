//! Daemon composition for the Portage gateway node

pub mod config;
pub mod error;
pub mod supervisor;

pub use config::NodeConfig;
pub use error::NodeError;
pub use supervisor::Supervisor;
