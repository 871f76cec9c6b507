pub mod backends;
pub mod capture;
pub mod config;
pub mod connection;
pub mod deps;
pub mod error;
pub mod executor;
pub mod log_sanitize;
pub mod logging;
pub mod operator;
pub mod orchestrator;
pub mod params;
pub mod signals;
pub mod state;
pub mod workspace;

pub use error::{Error, Result};
