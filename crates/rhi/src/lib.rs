//! GPU command/resource synchronization core.
//!
//! This crate owns the machinery that lets CPU-side reuse of GPU resources
//! never race ahead of GPU completion:
//! - Pooled command recording, execution queues and completion fences with
//!   deferred, completion-gated return ([`pool`], [`command`], [`queue`],
//!   [`sync`])
//! - An explicit [`context::GraphicsResourceContext`] owning all pool state
//! - The [`backend::GpuBackend`] seam to the graphics-API binding layer,
//!   implemented over Vulkan ([`vulkan`]) and as a pure-CPU simulation
//!   ([`sim`]) for tests and headless runs

mod error;

pub mod backend;
pub mod command;
pub mod context;
pub mod handle;
pub mod pool;
pub mod queue;
pub mod sim;
pub mod sync;
pub mod vulkan;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
