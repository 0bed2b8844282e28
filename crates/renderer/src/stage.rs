//! Render stages: the pass-layer contract.

use ashframe_rhi::RhiResult;
use ashframe_rhi::command::CommandBuffer;
use ashframe_rhi::context::GraphicsResourceContext;

/// Everything a stage needs to know about the frame it is recording for.
#[derive(Clone, Copy, Debug)]
pub struct FrameInfo {
    /// Frame-in-flight slot index.
    pub frame_index: usize,
    /// Swapchain image being rendered to.
    pub image_index: u32,
    /// Seconds since the previous frame.
    pub delta_time: f32,
    /// Which shadow-cascade batch this recording belongs to, if any.
    /// `None` for main-batch stages.
    pub cascade: Option<u32>,
}

/// A pass the orchestrator drives.
///
/// The orchestrator owns sequencing and synchronization; a stage only
/// appends its GPU commands (pass begin/end, binds, draws, dispatches and
/// the barriers its resources need, in exactly the order the consuming
/// passes require) into the supplied command buffer.
pub trait RenderStage: Send {
    fn label(&self) -> &str;

    /// One-time setup after the stage is attached.
    fn init(&mut self, ctx: &GraphicsResourceContext) -> RhiResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Records this stage's commands for one frame.
    fn record(&mut self, frame: &FrameInfo, cmd: &CommandBuffer) -> RhiResult<()>;

    /// Frame-target dimensions changed.
    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        let _ = (width, height);
        Ok(())
    }

    /// Teardown before the context is cleared.
    fn destroy(&mut self, ctx: &GraphicsResourceContext) -> RhiResult<()> {
        let _ = ctx;
        Ok(())
    }
}
