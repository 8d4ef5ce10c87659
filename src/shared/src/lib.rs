//! Shared types for the Nexus Integration Gateway

pub mod types;

// Export all types from types module
pub use types::*;
