//! Shared utilities for the ashframe renderer workspace.
//!
//! This crate provides the foundational pieces every other crate leans on:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing

mod error;
mod logging;
mod timer;

pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::FrameClock;
