//! Control-endpoint handlers

pub mod health;
pub mod info;
