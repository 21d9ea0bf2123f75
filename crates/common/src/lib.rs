//! Common utilities and types shared across Waypoint components.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
