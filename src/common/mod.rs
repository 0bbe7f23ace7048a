pub mod config;
pub mod error;

pub use config::NodeConfig;
pub use error::{Error, Result};
