//! Headless frame-loop demo.
//!
//! Drives the full synchronization core (pooled command buffers, queue
//! checkout, the cascade→main submit chain, presentation and deferred
//! returns) against the simulation backend, so the whole protocol runs
//! without a window or a GPU.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use ashframe_core::{FrameClock, init_logging};
use ashframe_renderer::{FrameInfo, FrameOrchestrator, FrameStatus, OrchestratorDesc, RenderStage};
use ashframe_rhi::RhiResult;
use ashframe_rhi::backend::{ImageHandle, PipelineHandle, RenderTargets};
use ashframe_rhi::command::CommandBuffer;
use ashframe_rhi::context::{ContextDesc, GraphicsResourceContext};
use ashframe_rhi::sim::{CompletionMode, SimBackend};
use ashframe_rhi::vk;

const FRAMES: u64 = 300;
const CASCADES: u32 = 3;

/// Depth-only pass, recorded once per shadow cascade.
struct ShadowStage {
    pipeline: PipelineHandle,
    cascade_maps: Vec<ImageHandle>,
}

impl RenderStage for ShadowStage {
    fn label(&self) -> &str {
        "shadow"
    }

    fn record(&mut self, frame: &FrameInfo, cmd: &CommandBuffer) -> RhiResult<()> {
        let cascade = frame.cascade.unwrap_or(0) as usize;
        let map = self.cascade_maps[cascade % self.cascade_maps.len()];
        cmd.begin_rendering(&RenderTargets {
            colors: vec![],
            depth: Some(map),
        })?;
        cmd.bind_graphics_pipeline(self.pipeline)?;
        cmd.draw(36, 1, 0, 0)?;
        cmd.end_rendering()?;
        // The main pass samples this map next.
        cmd.pipeline_barrier(
            &[ashframe_rhi::backend::ImageBarrier {
                image: map,
                old_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                src_stage: vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
            }],
            &[],
        )?;
        Ok(())
    }
}

/// Forward pass writing the frame's color target.
struct MainStage {
    pipeline: PipelineHandle,
    color: ImageHandle,
    depth: ImageHandle,
}

impl RenderStage for MainStage {
    fn label(&self) -> &str {
        "main"
    }

    fn record(&mut self, _frame: &FrameInfo, cmd: &CommandBuffer) -> RhiResult<()> {
        cmd.begin_rendering(&RenderTargets {
            colors: vec![self.color],
            depth: Some(self.depth),
        })?;
        cmd.bind_graphics_pipeline(self.pipeline)?;
        cmd.draw_indexed(10_000, 1, 0, 0, 0)?;
        cmd.end_rendering()?;
        Ok(())
    }
}

fn main() -> Result<()> {
    init_logging();
    info!("Starting ashframe headless demo");

    let sim = Arc::new(SimBackend::new(CompletionMode::Immediate));
    let ctx = GraphicsResourceContext::init(sim.clone(), &ContextDesc::default())?;

    let swapchain = sim.create_swapchain(3, (1280, 720));
    let mut orchestrator = FrameOrchestrator::new(
        ctx.clone(),
        swapchain,
        &OrchestratorDesc {
            cascade_count: CASCADES,
            width: 1280,
            height: 720,
        },
    )?;

    orchestrator.set_shadow_stage(Box::new(ShadowStage {
        pipeline: sim.import_pipeline("shadow_pipeline"),
        cascade_maps: (0..CASCADES)
            .map(|i| sim.import_image(&format!("cascade_map_{}", i)))
            .collect(),
    }))?;
    orchestrator.add_stage(Box::new(MainStage {
        pipeline: sim.import_pipeline("forward_pipeline"),
        color: sim.import_image("scene_color"),
        depth: sim.import_image("scene_depth"),
    }))?;

    let mut clock = FrameClock::new();
    while orchestrator.presented() < FRAMES {
        let delta = clock.tick();
        match orchestrator.run_one_frame(delta)? {
            FrameStatus::Continue => {}
            FrameStatus::Stop => break,
        }
        if orchestrator.presented() % 100 == 0 {
            let family = ctx.family_command_pools(0)?;
            info!(
                "frame {}: {} fence(s), {} command buffer(s), avg frame time {:.3} ms",
                orchestrator.presented(),
                ctx.fences().all_len(),
                family.buffers().all_len(),
                clock.smoothed_frame_time() * 1000.0
            );
        }
    }

    orchestrator.shutdown()?;
    ctx.clear()?;
    info!(
        "Presented {} frame(s) in {:.2} s",
        FRAMES,
        clock.elapsed().as_secs_f32()
    );
    Ok(())
}
