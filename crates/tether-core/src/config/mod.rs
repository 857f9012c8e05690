//! Console configuration
//!
//! - `console_config`: Configuration structure
//! - `defaults`: Default configuration values

pub mod console_config;
pub mod defaults;

pub use console_config::ConsoleConfig;
