//! Type definitions shared between the gateway and the event bus

pub mod core;
pub mod events;

pub use core::*;
pub use events::*;
