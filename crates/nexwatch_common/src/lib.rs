//! Nexwatch Common - shared types for the nexmon wifi watchdog

pub mod config;
pub mod error;
pub mod history;
pub mod types;

pub use config::*;
pub use error::*;
pub use history::BoundedHistory;
pub use types::*;
