//! Router assembly

pub mod public;
