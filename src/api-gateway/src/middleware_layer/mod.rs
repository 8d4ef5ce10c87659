//! Request middleware: correlation stamping and credential validation

pub mod auth;
pub mod correlation;
