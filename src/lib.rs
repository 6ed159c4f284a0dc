pub mod commands;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod models;
pub mod notify;
pub mod repo;
pub mod scheduler;
pub mod signal;
pub mod utils;

// Re-export commonly used types
pub use crate::config::AppConfig;
pub use crate::utils::error::{AppError, Result};
