//! Per-frame orchestration.
//!
//! This crate sequences a frame: acquire a presentable image, record the
//! dependent pass batches, submit them with the correct wait/signal
//! chaining, present, advance to the next frame slot. Pass bodies are
//! opaque [`RenderStage`] implementations; everything else comes from the
//! resource context in `ashframe_rhi`.

pub mod orchestrator;
pub mod stage;

pub use orchestrator::{FrameOrchestrator, FrameStatus, OrchestratorDesc};
pub use stage::{FrameInfo, RenderStage};

/// Default number of frames that may carry unfinished GPU work at once.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
