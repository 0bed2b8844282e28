//! The per-frame state machine.
//!
//! One [`FrameOrchestrator::run_one_frame`] call drives a full cycle:
//! acquire image → record batches → submit → present → advance. Dependent
//! sub-batches (shadow cascades feeding the main pass) are chained through
//! ordering semaphores built per frame, so the cascade count is a runtime
//! parameter. The only steady-state CPU block is the wait on the
//! frame-slot fence, which bounds how far the CPU runs ahead of the GPU.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use ashframe_rhi::backend::{QueueCaps, SemaphoreHandle, SwapchainHandle};
use ashframe_rhi::command::CommandBuffer;
use ashframe_rhi::context::GraphicsResourceContext;
use ashframe_rhi::queue::{Queue, SubmitRequest};
use ashframe_rhi::sync::{Fence, completion_ticket};
use ashframe_rhi::{RhiError, RhiResult};

use crate::stage::{FrameInfo, RenderStage};

/// Continue/stop signal returned to the application loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Continue,
    Stop,
}

/// Orchestrator construction parameters.
#[derive(Clone, Copy, Debug)]
pub struct OrchestratorDesc {
    /// Number of dependent shadow-cascade batches per frame. May be zero.
    pub cascade_count: u32,
    /// Initial frame-target dimensions.
    pub width: u32,
    pub height: u32,
}

impl Default for OrchestratorDesc {
    fn default() -> Self {
        Self {
            cascade_count: 0,
            width: 1280,
            height: 720,
        }
    }
}

struct FrameSlot {
    /// Completion fence of this slot's previous frame, consumed (waited,
    /// then released) when the slot comes around again.
    fence: Option<Arc<Fence>>,
}

struct RecordedBatch {
    cmd: Arc<CommandBuffer>,
    waits: Vec<(SemaphoreHandle, vk::PipelineStageFlags)>,
    signals: Vec<SemaphoreHandle>,
}

/// Drives the `AcquireImage → RecordBatches → Submit → Present → Advance`
/// cycle, one iteration per displayed frame.
pub struct FrameOrchestrator {
    ctx: Arc<GraphicsResourceContext>,
    swapchain: SwapchainHandle,
    shadow_stage: Option<Box<dyn RenderStage>>,
    stages: Vec<Box<dyn RenderStage>>,
    cascade_count: u32,
    slots: Vec<FrameSlot>,
    current: usize,
    extent: (u32, u32),
    presented: u64,
}

impl FrameOrchestrator {
    pub fn new(
        ctx: Arc<GraphicsResourceContext>,
        swapchain: SwapchainHandle,
        desc: &OrchestratorDesc,
    ) -> RhiResult<Self> {
        // Each frame needs one ordering signal per cascade, one for the
        // main batch and one for acquisition; the ring must cover that for
        // every frame in flight or signals would be reused while their
        // waiters are still undispatched.
        let per_frame = desc.cascade_count as usize + 2;
        let needed = per_frame * ctx.frames_in_flight();
        if ctx.ordering_signal_capacity() < needed {
            return Err(RhiError::Configuration(format!(
                "ordering signal ring holds {} semaphores but {} frames x {} signals are needed",
                ctx.ordering_signal_capacity(),
                ctx.frames_in_flight(),
                per_frame
            )));
        }

        let slots = (0..ctx.frames_in_flight())
            .map(|_| FrameSlot { fence: None })
            .collect();

        info!(
            "Frame orchestrator created: {} frames in flight, {} shadow cascade(s)",
            ctx.frames_in_flight(),
            desc.cascade_count
        );

        Ok(Self {
            ctx,
            swapchain,
            shadow_stage: None,
            stages: Vec::new(),
            cascade_count: desc.cascade_count,
            slots,
            current: 0,
            extent: (desc.width, desc.height),
            presented: 0,
        })
    }

    /// Attaches the stage recorded once per shadow-cascade batch.
    pub fn set_shadow_stage(&mut self, mut stage: Box<dyn RenderStage>) -> RhiResult<()> {
        stage.init(&self.ctx)?;
        debug!("Shadow stage '{}' attached", stage.label());
        self.shadow_stage = Some(stage);
        Ok(())
    }

    /// Appends a main-batch stage; stages record in attachment order.
    pub fn add_stage(&mut self, mut stage: Box<dyn RenderStage>) -> RhiResult<()> {
        stage.init(&self.ctx)?;
        debug!("Stage '{}' attached", stage.label());
        self.stages.push(stage);
        Ok(())
    }

    #[inline]
    pub fn current_frame(&self) -> usize {
        self.current
    }

    /// Frames successfully presented so far.
    #[inline]
    pub fn presented(&self) -> u64 {
        self.presented
    }

    #[inline]
    pub fn cascade_count(&self) -> u32 {
        self.cascade_count
    }

    /// Runs one full frame cycle.
    ///
    /// A [`RhiError::SurfaceOutOfDate`] means the caller must run the
    /// resize path; it is never retried inline. Every other error is fatal
    /// to the frame loop. There is no mid-frame cancellation.
    pub fn run_one_frame(&mut self, delta_time: f32) -> RhiResult<FrameStatus> {
        // The single CPU/GPU pacing point: before this slot is reused, its
        // previous frame must have fully completed.
        if let Some(fence) = self.slots[self.current].fence.take() {
            fence.wait()?;
            self.ctx.fences().release(&fence)?;
        }
        self.ctx.check_returns()?;

        // Acquisition is itself asynchronous on the GPU; the ring signal
        // hands completion to the first batch that renders to the image.
        let acquire_signal = self.ctx.ordering_signal()?;
        let (image_index, suboptimal) = self
            .ctx
            .backend()
            .acquire_next_image(self.swapchain, acquire_signal)?;
        if suboptimal {
            debug!("Swapchain suboptimal during acquire");
        }

        let queue = self
            .ctx
            .acquire_queue(QueueCaps::GRAPHICS | QueueCaps::PRESENT, 1)?;

        match self.record_and_submit(&queue, delta_time, image_index, acquire_signal) {
            Ok(()) => {
                self.current = (self.current + 1) % self.slots.len();
                self.presented += 1;
                Ok(FrameStatus::Continue)
            }
            Err(e) => {
                if matches!(e, RhiError::SurfaceOutOfDate) {
                    warn!("Presentation surface out of date; resize required");
                }
                Err(e)
            }
        }
    }

    fn record_and_submit(
        &mut self,
        queue: &Arc<Queue>,
        delta_time: f32,
        image_index: u32,
        acquire_signal: SemaphoreHandle,
    ) -> RhiResult<()> {
        let batches =
            match self.record_batches(queue.family(), delta_time, image_index, acquire_signal) {
                Ok(batches) => batches,
                Err(e) => {
                    self.ctx.release_queue(queue).ok();
                    return Err(e);
                }
            };

        // One fence for the whole frame, attached to the final batch only:
        // intermediate batches are ordered ahead of it on the GPU, so it
        // bounds their completion as well.
        let fence = match self.ctx.fences().acquire(|_| true) {
            Ok(fence) => fence,
            Err(e) => {
                self.abandon_frame(&batches, queue);
                return Err(e);
            }
        };
        let ticket = completion_ticket(&fence);
        let last = batches.len() - 1;
        let render_finished = batches[last].signals[0];

        for (i, batch) in batches.iter().enumerate() {
            let wait_semaphores: Vec<SemaphoreHandle> =
                batch.waits.iter().map(|(sem, _)| *sem).collect();
            let wait_stages: Vec<vk::PipelineStageFlags> =
                batch.waits.iter().map(|(_, stage)| *stage).collect();
            if i < last {
                // Tag intermediate handles with the frame fence before
                // dispatch so their deferred return is gated too.
                batch.cmd.mark_in_flight(ticket.clone());
            }
            let submitted = queue.submit(
                &SubmitRequest {
                    command_buffers: std::slice::from_ref(&batch.cmd),
                    wait_semaphores: &wait_semaphores,
                    wait_stages: &wait_stages,
                    signal_semaphores: &batch.signals,
                },
                (i == last).then_some(&fence),
            );
            if let Err(e) = submitted {
                // Fatal path (typically device loss): recycling the fence
                // retires the tickets handed out above, so the deferred
                // returns cannot wedge on a signal that will never come.
                self.ctx.fences().release(&fence).ok();
                self.abandon_frame(&batches, queue);
                return Err(e);
            }
        }

        let present_result = queue.present(&[self.swapchain], &[image_index], &[render_finished]);

        // Whatever presentation said, the GPU work is in flight: hand every
        // resource to its pool's deferred-return path and park the fence in
        // the slot so the resize path (or the next slot reuse) consumes it.
        for batch in &batches {
            self.ctx.release_command_buffer(&batch.cmd)?;
        }
        self.ctx.release_queue(queue)?;
        self.slots[self.current].fence = Some(fence);

        match present_result {
            Ok(suboptimal) => {
                if suboptimal {
                    debug!("Swapchain suboptimal during present");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort release of a frame's resources on an error path where
    /// no completion signal will arrive.
    fn abandon_frame(&self, batches: &[RecordedBatch], queue: &Arc<Queue>) {
        for batch in batches {
            self.ctx.release_command_buffer(&batch.cmd).ok();
        }
        self.ctx.release_queue(queue).ok();
    }

    fn record_batches(
        &mut self,
        family: u32,
        delta_time: f32,
        image_index: u32,
        acquire_signal: SemaphoreHandle,
    ) -> RhiResult<Vec<RecordedBatch>> {
        let mut batches: Vec<RecordedBatch> = Vec::with_capacity(self.cascade_count as usize + 1);
        let result = (|| -> RhiResult<()> {
            let mut previous_signal: Option<SemaphoreHandle> = None;

            if let Some(shadow) = self.shadow_stage.as_mut() {
                for cascade in 0..self.cascade_count {
                    let cmd = self.ctx.acquire_command_buffer(family)?;
                    cmd.begin()?;
                    shadow.record(
                        &FrameInfo {
                            frame_index: self.current,
                            image_index,
                            delta_time,
                            cascade: Some(cascade),
                        },
                        &cmd,
                    )?;
                    cmd.end()?;

                    let signal = self.ctx.ordering_signal()?;
                    let mut waits = Vec::with_capacity(1);
                    if let Some(prev) = previous_signal {
                        waits.push((prev, vk::PipelineStageFlags::ALL_COMMANDS));
                    }
                    batches.push(RecordedBatch {
                        cmd,
                        waits,
                        signals: vec![signal],
                    });
                    previous_signal = Some(signal);
                }
            }

            let cmd = self.ctx.acquire_command_buffer(family)?;
            cmd.begin()?;
            let info = FrameInfo {
                frame_index: self.current,
                image_index,
                delta_time,
                cascade: None,
            };
            for stage in &mut self.stages {
                stage.record(&info, &cmd)?;
            }
            cmd.end()?;

            // The main batch samples the cascades and writes the acquired
            // image, so it waits on both.
            let render_finished = self.ctx.ordering_signal()?;
            let mut waits = Vec::with_capacity(2);
            if let Some(prev) = previous_signal {
                waits.push((prev, vk::PipelineStageFlags::FRAGMENT_SHADER));
            }
            waits.push((
                acquire_signal,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ));
            batches.push(RecordedBatch {
                cmd,
                waits,
                signals: vec![render_finished],
            });
            Ok(())
        })();

        match result {
            Ok(()) => Ok(batches),
            Err(e) => {
                // Never-submitted handles carry no completion tag and go
                // straight back to their pools.
                for batch in &batches {
                    self.ctx.release_command_buffer(&batch.cmd).ok();
                }
                Err(e)
            }
        }
    }

    /// The resize path: device idle, drain in-flight slots and deferred
    /// returns, recreate the ordering-signal ring (a semaphore tied to an
    /// abandoned acquire must never be waited on again), forward the new
    /// dimensions to every stage. The windowing layer recreates the
    /// swapchain itself and installs it via [`set_swapchain`].
    ///
    /// [`set_swapchain`]: FrameOrchestrator::set_swapchain
    pub fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        info!("Resize to {}x{}", width, height);
        self.extent = (width, height);
        self.ctx.backend().device_wait_idle()?;

        for slot in &mut self.slots {
            if let Some(fence) = slot.fence.take() {
                fence.wait()?;
                self.ctx.fences().release(&fence)?;
            }
        }
        self.ctx.drain_pools()?;
        self.ctx.reset_ordering_signals()?;

        if let Some(shadow) = self.shadow_stage.as_mut() {
            shadow.resize(width, height)?;
        }
        for stage in &mut self.stages {
            stage.resize(width, height)?;
        }
        self.current = 0;
        Ok(())
    }

    /// Installs the swapchain recreated by the windowing layer.
    pub fn set_swapchain(&mut self, swapchain: SwapchainHandle) {
        self.swapchain = swapchain;
    }

    #[inline]
    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    /// Changes the number of shadow-cascade batches for subsequent frames.
    pub fn set_cascade_count(&mut self, cascade_count: u32) -> RhiResult<()> {
        let per_frame = cascade_count as usize + 2;
        let needed = per_frame * self.ctx.frames_in_flight();
        if self.ctx.ordering_signal_capacity() < needed {
            return Err(RhiError::Configuration(format!(
                "ordering signal ring too small for {} cascade(s)",
                cascade_count
            )));
        }
        self.cascade_count = cascade_count;
        Ok(())
    }

    /// Orderly teardown: device idle, drain every in-flight slot and
    /// deferred return, destroy the stages.
    pub fn shutdown(&mut self) -> RhiResult<()> {
        self.ctx.backend().device_wait_idle()?;
        for slot in &mut self.slots {
            if let Some(fence) = slot.fence.take() {
                fence.wait()?;
                self.ctx.fences().release(&fence)?;
            }
        }
        self.ctx.drain_pools()?;

        if let Some(mut shadow) = self.shadow_stage.take() {
            shadow.destroy(&self.ctx)?;
        }
        for mut stage in self.stages.drain(..) {
            stage.destroy(&self.ctx)?;
        }
        info!("Frame orchestrator shut down after {} frame(s)", self.presented);
        Ok(())
    }
}
