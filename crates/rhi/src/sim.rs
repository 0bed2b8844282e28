//! Simulation backend.
//!
//! A pure-CPU [`GpuBackend`] used by tests and headless runs. Submissions
//! are logged and either complete at submit time ([`CompletionMode::Immediate`])
//! or sit outstanding until the driver of the test completes them
//! ([`CompletionMode::Manual`]), which is how delayed GPU completion,
//! frame-pacing back-pressure and out-of-date surfaces are exercised
//! without hardware.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use glam::UVec3;

use crate::backend::{
    BufferBarrier, BufferCopy, BufferHandle, BufferMarker, CommandBufferHandle,
    CommandBufferMarker, CommandPoolHandle, CommandPoolMarker, FenceHandle, FenceMarker,
    GpuBackend, ImageBarrier, ImageHandle, ImageMarker, PipelineHandle, PipelineLayoutHandle,
    PipelineLayoutMarker, PipelineMarker, QueueCaps, QueueFamilyInfo, QueueHandle, QueueMarker,
    RenderTargets, ResourceSetHandle, ResourceSetMarker, SemaphoreHandle, SemaphoreMarker,
    SubmitBatch, SwapchainHandle, SwapchainMarker,
};
use crate::error::{RhiError, RhiResult};
use crate::handle::Arena;

/// When simulated GPU work completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionMode {
    /// Every submission completes the moment it is enqueued.
    Immediate,
    /// Submissions stay outstanding until [`SimBackend::complete_next`] or
    /// [`SimBackend::complete_all`] runs them.
    Manual,
}

/// One logged submission, exposed for protocol assertions.
#[derive(Clone, Debug)]
pub struct SubmissionRecord {
    pub queue: QueueHandle,
    pub command_buffers: Vec<CommandBufferHandle>,
    pub wait_semaphores: Vec<SemaphoreHandle>,
    pub signal_semaphores: Vec<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
    pub completed: bool,
}

/// One logged present call.
#[derive(Clone, Debug)]
pub struct PresentRecord {
    pub queue: QueueHandle,
    pub swapchains: Vec<SwapchainHandle>,
    pub image_indices: Vec<u32>,
    pub wait_semaphores: Vec<SemaphoreHandle>,
}

struct SimFence {
    signaled: bool,
    #[allow(dead_code)]
    label: String,
}

struct SimSemaphore {
    #[allow(dead_code)]
    label: String,
}

struct SimCommandPool {
    family: u32,
    #[allow(dead_code)]
    label: String,
}

struct SimCommandBuffer {
    family: u32,
    ops: u32,
    #[allow(dead_code)]
    label: String,
}

struct SimQueue {
    family: u32,
    #[allow(dead_code)]
    index: u32,
}

struct SimSwapchain {
    image_count: u32,
    next_image: u32,
    extent: (u32, u32),
}

struct SimState {
    families: Vec<QueueFamilyInfo>,
    fences: Arena<FenceMarker, SimFence>,
    semaphores: Arena<SemaphoreMarker, SimSemaphore>,
    command_pools: Arena<CommandPoolMarker, SimCommandPool>,
    command_buffers: Arena<CommandBufferMarker, SimCommandBuffer>,
    queues: Arena<QueueMarker, SimQueue>,
    queue_lookup: HashMap<(u32, u32), QueueHandle>,
    swapchains: Arena<SwapchainMarker, SimSwapchain>,
    pipelines: Arena<PipelineMarker, String>,
    pipeline_layouts: Arena<PipelineLayoutMarker, String>,
    resource_sets: Arena<ResourceSetMarker, String>,
    buffers: Arena<BufferMarker, String>,
    images: Arena<ImageMarker, String>,
    submissions: Vec<SubmissionRecord>,
    presents: Vec<PresentRecord>,
    fail_next_acquires: u32,
    fail_next_presents: u32,
}

/// Pure-CPU implementation of [`GpuBackend`].
pub struct SimBackend {
    mode: CompletionMode,
    state: Mutex<SimState>,
}

impl SimBackend {
    /// Backend with the default family layout: one do-everything graphics
    /// family with four queues, an async-compute family with two, and a
    /// dedicated transfer family with coarse image-transfer granularity.
    pub fn new(mode: CompletionMode) -> Self {
        Self::with_families(
            mode,
            vec![
                QueueFamilyInfo {
                    index: 0,
                    caps: QueueCaps::GRAPHICS
                        | QueueCaps::COMPUTE
                        | QueueCaps::TRANSFER
                        | QueueCaps::PRESENT,
                    queue_count: 4,
                    min_image_transfer_granularity: UVec3::new(1, 1, 1),
                },
                QueueFamilyInfo {
                    index: 1,
                    caps: QueueCaps::COMPUTE | QueueCaps::TRANSFER,
                    queue_count: 2,
                    min_image_transfer_granularity: UVec3::new(1, 1, 1),
                },
                QueueFamilyInfo {
                    index: 2,
                    caps: QueueCaps::TRANSFER,
                    queue_count: 1,
                    min_image_transfer_granularity: UVec3::new(8, 8, 8),
                },
            ],
        )
    }

    /// Backend with an explicit family layout.
    pub fn with_families(mode: CompletionMode, families: Vec<QueueFamilyInfo>) -> Self {
        Self {
            mode,
            state: Mutex::new(SimState {
                families,
                fences: Arena::new(),
                semaphores: Arena::new(),
                command_pools: Arena::new(),
                command_buffers: Arena::new(),
                queues: Arena::new(),
                queue_lookup: HashMap::new(),
                swapchains: Arena::new(),
                pipelines: Arena::new(),
                pipeline_layouts: Arena::new(),
                resource_sets: Arena::new(),
                buffers: Arena::new(),
                images: Arena::new(),
                submissions: Vec::new(),
                presents: Vec::new(),
                fail_next_acquires: 0,
                fail_next_presents: 0,
            }),
        }
    }

    /// Registers a simulated presentation target.
    pub fn create_swapchain(&self, image_count: u32, extent: (u32, u32)) -> SwapchainHandle {
        self.lock().swapchains.insert(SimSwapchain {
            image_count,
            next_image: 0,
            extent,
        })
    }

    pub fn swapchain_extent(&self, swapchain: SwapchainHandle) -> Option<(u32, u32)> {
        self.lock().swapchains.get(swapchain).map(|s| s.extent)
    }

    pub fn resize_swapchain(&self, swapchain: SwapchainHandle, extent: (u32, u32)) {
        let mut state = self.lock();
        if let Some(sc) = state.swapchains.get_mut(swapchain) {
            sc.extent = extent;
            sc.next_image = 0;
        }
    }

    /// Opaque imported collaborators (the real layers own these).
    pub fn import_pipeline(&self, label: &str) -> PipelineHandle {
        self.lock().pipelines.insert(label.to_owned())
    }

    pub fn import_pipeline_layout(&self, label: &str) -> PipelineLayoutHandle {
        self.lock().pipeline_layouts.insert(label.to_owned())
    }

    pub fn import_resource_set(&self, label: &str) -> ResourceSetHandle {
        self.lock().resource_sets.insert(label.to_owned())
    }

    pub fn import_buffer(&self, label: &str) -> BufferHandle {
        self.lock().buffers.insert(label.to_owned())
    }

    pub fn import_image(&self, label: &str) -> ImageHandle {
        self.lock().images.insert(label.to_owned())
    }

    /// Completes the oldest outstanding submission: signals its fence and
    /// marks it done. Returns `false` when nothing was outstanding.
    pub fn complete_next(&self) -> bool {
        let mut state = self.lock();
        let Some(pos) = state.submissions.iter().position(|s| !s.completed) else {
            return false;
        };
        Self::finish_submission(&mut state, pos);
        true
    }

    /// Completes every outstanding submission.
    pub fn complete_all(&self) {
        let mut state = self.lock();
        for pos in 0..state.submissions.len() {
            if !state.submissions[pos].completed {
                Self::finish_submission(&mut state, pos);
            }
        }
    }

    /// Number of submissions not yet completed.
    pub fn outstanding_submissions(&self) -> usize {
        self.lock().submissions.iter().filter(|s| !s.completed).count()
    }

    /// Full submission log, oldest first.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.lock().submissions.clone()
    }

    /// Full present log, oldest first.
    pub fn presents(&self) -> Vec<PresentRecord> {
        self.lock().presents.clone()
    }

    /// Makes the next `count` acquires fail with an out-of-date surface.
    pub fn fail_next_acquires(&self, count: u32) {
        self.lock().fail_next_acquires = count;
    }

    /// Makes the next `count` presents fail with an out-of-date surface.
    pub fn fail_next_presents(&self, count: u32) {
        self.lock().fail_next_presents = count;
    }

    /// Number of ops recorded into a command buffer so far.
    pub fn recorded_ops(&self, cmd: CommandBufferHandle) -> Option<u32> {
        self.lock().command_buffers.get(cmd).map(|c| c.ops)
    }

    fn finish_submission(state: &mut SimState, pos: usize) {
        let fence = state.submissions[pos].fence;
        state.submissions[pos].completed = true;
        if let Some(fence) = fence {
            if let Some(f) = state.fences.get_mut(fence) {
                f.signaled = true;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record_op(&self, cmd: CommandBufferHandle) -> RhiResult<()> {
        let mut state = self.lock();
        let buffer = state
            .command_buffers
            .get_mut(cmd)
            .ok_or_else(|| stale("command buffer"))?;
        buffer.ops += 1;
        Ok(())
    }

    fn queue_family(&self, queue: QueueHandle) -> RhiResult<u32> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.family)
            .ok_or_else(|| stale("queue"))
    }
}

fn stale(kind: &str) -> RhiError {
    RhiError::InvalidState(format!("stale {} handle", kind))
}

impl GpuBackend for SimBackend {
    fn queue_families(&self) -> Vec<QueueFamilyInfo> {
        self.lock().families.clone()
    }

    fn device_queue(&self, family: u32, index: u32) -> RhiResult<QueueHandle> {
        let mut state = self.lock();
        if let Some(&handle) = state.queue_lookup.get(&(family, index)) {
            return Ok(handle);
        }
        let info = state
            .families
            .iter()
            .find(|f| f.index == family)
            .copied()
            .ok_or_else(|| {
                RhiError::Configuration(format!("queue family {} does not exist", family))
            })?;
        if index >= info.queue_count {
            return Err(RhiError::Configuration(format!(
                "queue family {} exposes {} queue(s), index {} requested",
                family, info.queue_count, index
            )));
        }
        let handle = state.queues.insert(SimQueue { family, index });
        state.queue_lookup.insert((family, index), handle);
        Ok(handle)
    }

    fn create_fence(&self, signaled: bool, label: &str) -> RhiResult<FenceHandle> {
        Ok(self.lock().fences.insert(SimFence {
            signaled,
            label: label.to_owned(),
        }))
    }

    fn destroy_fence(&self, fence: FenceHandle) -> RhiResult<()> {
        self.lock()
            .fences
            .remove(fence)
            .map(|_| ())
            .ok_or_else(|| stale("fence"))
    }

    fn fence_status(&self, fence: FenceHandle) -> RhiResult<bool> {
        self.lock()
            .fences
            .get(fence)
            .map(|f| f.signaled)
            .ok_or_else(|| stale("fence"))
    }

    fn wait_fence(&self, fence: FenceHandle) -> RhiResult<()> {
        // Cooperative wait: the signal arrives from another thread driving
        // complete_next/complete_all. Never holds the state lock while
        // spinning.
        loop {
            if self.fence_status(fence)? {
                return Ok(());
            }
            std::thread::yield_now();
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> RhiResult<()> {
        let mut state = self.lock();
        let f = state.fences.get_mut(fence).ok_or_else(|| stale("fence"))?;
        if !f.signaled {
            // Resetting an unsignaled fence is legal; nothing to consume.
            return Ok(());
        }
        f.signaled = false;
        Ok(())
    }

    fn create_semaphore(&self, label: &str) -> RhiResult<SemaphoreHandle> {
        Ok(self.lock().semaphores.insert(SimSemaphore {
            label: label.to_owned(),
        }))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) -> RhiResult<()> {
        self.lock()
            .semaphores
            .remove(semaphore)
            .map(|_| ())
            .ok_or_else(|| stale("semaphore"))
    }

    fn create_command_pool(&self, family: u32, label: &str) -> RhiResult<CommandPoolHandle> {
        let mut state = self.lock();
        if !state.families.iter().any(|f| f.index == family) {
            return Err(RhiError::Configuration(format!(
                "queue family {} does not exist",
                family
            )));
        }
        Ok(state.command_pools.insert(SimCommandPool {
            family,
            label: label.to_owned(),
        }))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) -> RhiResult<()> {
        self.lock()
            .command_pools
            .remove(pool)
            .map(|_| ())
            .ok_or_else(|| stale("command pool"))
    }

    fn allocate_command_buffer(
        &self,
        pool: CommandPoolHandle,
        label: &str,
    ) -> RhiResult<CommandBufferHandle> {
        let mut state = self.lock();
        let family = state
            .command_pools
            .get(pool)
            .map(|p| p.family)
            .ok_or_else(|| stale("command pool"))?;
        Ok(state.command_buffers.insert(SimCommandBuffer {
            family,
            ops: 0,
            label: label.to_owned(),
        }))
    }

    fn cmd_begin(&self, cmd: CommandBufferHandle) -> RhiResult<()> {
        let mut state = self.lock();
        state
            .command_buffers
            .get_mut(cmd)
            .map(|_| ())
            .ok_or_else(|| stale("command buffer"))
    }

    fn cmd_end(&self, cmd: CommandBufferHandle) -> RhiResult<()> {
        self.lock()
            .command_buffers
            .get(cmd)
            .map(|_| ())
            .ok_or_else(|| stale("command buffer"))
    }

    fn cmd_reset(&self, cmd: CommandBufferHandle) -> RhiResult<()> {
        let mut state = self.lock();
        let buffer = state
            .command_buffers
            .get_mut(cmd)
            .ok_or_else(|| stale("command buffer"))?;
        buffer.ops = 0;
        Ok(())
    }

    fn cmd_begin_rendering(
        &self,
        cmd: CommandBufferHandle,
        _targets: &RenderTargets,
    ) -> RhiResult<()> {
        self.record_op(cmd)
    }

    fn cmd_end_rendering(&self, cmd: CommandBufferHandle) -> RhiResult<()> {
        self.record_op(cmd)
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        _bind_point: ash::vk::PipelineBindPoint,
        pipeline: PipelineHandle,
    ) -> RhiResult<()> {
        if self.lock().pipelines.get(pipeline).is_none() {
            return Err(stale("pipeline"));
        }
        self.record_op(cmd)
    }

    fn cmd_bind_resources(
        &self,
        cmd: CommandBufferHandle,
        _bind_point: ash::vk::PipelineBindPoint,
        _layout: PipelineLayoutHandle,
        _first_set: u32,
        _sets: &[ResourceSetHandle],
    ) -> RhiResult<()> {
        self.record_op(cmd)
    }

    fn cmd_draw(
        &self,
        cmd: CommandBufferHandle,
        _vertex_count: u32,
        _instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) -> RhiResult<()> {
        self.record_op(cmd)
    }

    fn cmd_draw_indexed(
        &self,
        cmd: CommandBufferHandle,
        _index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) -> RhiResult<()> {
        self.record_op(cmd)
    }

    fn cmd_dispatch(&self, cmd: CommandBufferHandle, _x: u32, _y: u32, _z: u32) -> RhiResult<()> {
        self.record_op(cmd)
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: CommandBufferHandle,
        _image_barriers: &[ImageBarrier],
        _buffer_barriers: &[BufferBarrier],
    ) -> RhiResult<()> {
        self.record_op(cmd)
    }

    fn cmd_copy_buffer(
        &self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        _regions: &[BufferCopy],
    ) -> RhiResult<()> {
        {
            let state = self.lock();
            if state.buffers.get(src).is_none() || state.buffers.get(dst).is_none() {
                return Err(stale("buffer"));
            }
        }
        self.record_op(cmd)
    }

    fn cmd_copy_image(
        &self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
    ) -> RhiResult<()> {
        {
            let state = self.lock();
            if state.images.get(src).is_none() || state.images.get(dst).is_none() {
                return Err(stale("image"));
            }
        }
        self.record_op(cmd)
    }

    fn queue_submit(&self, queue: QueueHandle, batch: &SubmitBatch) -> RhiResult<()> {
        let queue_family = self.queue_family(queue)?;
        let mut state = self.lock();
        for &cmd in batch.command_buffers {
            let buffer = state
                .command_buffers
                .get(cmd)
                .ok_or_else(|| stale("command buffer"))?;
            if buffer.family != queue_family {
                return Err(RhiError::InvalidState(format!(
                    "command buffer of family {} submitted to a family-{} queue",
                    buffer.family, queue_family
                )));
            }
        }
        if let Some(fence) = batch.fence {
            if state.fences.get(fence).is_none() {
                return Err(stale("fence"));
            }
        }
        state.submissions.push(SubmissionRecord {
            queue,
            command_buffers: batch.command_buffers.to_vec(),
            wait_semaphores: batch.wait_semaphores.to_vec(),
            signal_semaphores: batch.signal_semaphores.to_vec(),
            fence: batch.fence,
            completed: false,
        });
        if self.mode == CompletionMode::Immediate {
            let pos = state.submissions.len() - 1;
            Self::finish_submission(&mut state, pos);
        }
        Ok(())
    }

    fn queue_present(
        &self,
        queue: QueueHandle,
        swapchains: &[SwapchainHandle],
        image_indices: &[u32],
        wait_semaphores: &[SemaphoreHandle],
    ) -> RhiResult<bool> {
        let mut state = self.lock();
        if state.queues.get(queue).is_none() {
            return Err(stale("queue"));
        }
        if state.fail_next_presents > 0 {
            state.fail_next_presents -= 1;
            return Err(RhiError::SurfaceOutOfDate);
        }
        for &sc in swapchains {
            if state.swapchains.get(sc).is_none() {
                return Err(stale("swapchain"));
            }
        }
        state.presents.push(PresentRecord {
            queue,
            swapchains: swapchains.to_vec(),
            image_indices: image_indices.to_vec(),
            wait_semaphores: wait_semaphores.to_vec(),
        });
        Ok(false)
    }

    fn queue_idle(&self, queue: QueueHandle) -> RhiResult<bool> {
        let state = self.lock();
        if state.queues.get(queue).is_none() {
            return Err(stale("queue"));
        }
        Ok(!state
            .submissions
            .iter()
            .any(|s| s.queue == queue && !s.completed))
    }

    fn queue_wait_idle(&self, queue: QueueHandle) -> RhiResult<()> {
        loop {
            if self.queue_idle(queue)? {
                return Ok(());
            }
            std::thread::yield_now();
        }
    }

    fn device_wait_idle(&self) -> RhiResult<()> {
        loop {
            if self.lock().submissions.iter().all(|s| s.completed) {
                return Ok(());
            }
            std::thread::yield_now();
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        _signal: SemaphoreHandle,
    ) -> RhiResult<(u32, bool)> {
        let mut state = self.lock();
        if state.fail_next_acquires > 0 {
            state.fail_next_acquires -= 1;
            return Err(RhiError::SurfaceOutOfDate);
        }
        let sc = state
            .swapchains
            .get_mut(swapchain)
            .ok_or_else(|| stale("swapchain"))?;
        let image = sc.next_image;
        sc.next_image = (sc.next_image + 1) % sc.image_count;
        Ok((image, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_mode_defers_completion() {
        let sim = SimBackend::new(CompletionMode::Manual);
        let fence = sim.create_fence(false, "f").unwrap();
        let pool = sim.create_command_pool(0, "p").unwrap();
        let cmd = sim.allocate_command_buffer(pool, "c").unwrap();
        let queue = sim.device_queue(0, 0).unwrap();

        sim.queue_submit(
            queue,
            &SubmitBatch {
                command_buffers: &[cmd],
                wait_semaphores: &[],
                wait_stages: &[],
                signal_semaphores: &[],
                fence: Some(fence),
            },
        )
        .unwrap();

        assert!(!sim.fence_status(fence).unwrap());
        assert_eq!(sim.outstanding_submissions(), 1);
        assert!(sim.complete_next());
        assert!(sim.fence_status(fence).unwrap());
        assert!(!sim.complete_next());
    }

    #[test]
    fn test_immediate_mode_signals_at_submit() {
        let sim = SimBackend::new(CompletionMode::Immediate);
        let fence = sim.create_fence(false, "f").unwrap();
        let pool = sim.create_command_pool(0, "p").unwrap();
        let cmd = sim.allocate_command_buffer(pool, "c").unwrap();
        let queue = sim.device_queue(0, 0).unwrap();

        sim.queue_submit(
            queue,
            &SubmitBatch {
                command_buffers: &[cmd],
                wait_semaphores: &[],
                wait_stages: &[],
                signal_semaphores: &[],
                fence: Some(fence),
            },
        )
        .unwrap();
        assert!(sim.fence_status(fence).unwrap());
        assert!(sim.queue_idle(queue).unwrap());
    }

    #[test]
    fn test_cross_family_submit_is_rejected() {
        let sim = SimBackend::new(CompletionMode::Immediate);
        let pool = sim.create_command_pool(1, "p").unwrap();
        let cmd = sim.allocate_command_buffer(pool, "c").unwrap();
        let queue = sim.device_queue(0, 0).unwrap();

        let result = sim.queue_submit(
            queue,
            &SubmitBatch {
                command_buffers: &[cmd],
                wait_semaphores: &[],
                wait_stages: &[],
                signal_semaphores: &[],
                fence: None,
            },
        );
        assert!(matches!(result, Err(RhiError::InvalidState(_))));
    }

    #[test]
    fn test_destroyed_fence_handle_is_stale() {
        let sim = SimBackend::new(CompletionMode::Immediate);
        let fence = sim.create_fence(false, "f").unwrap();
        sim.destroy_fence(fence).unwrap();
        assert!(matches!(
            sim.fence_status(fence),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_acquire_cycles_images() {
        let sim = SimBackend::new(CompletionMode::Immediate);
        let sc = sim.create_swapchain(3, (640, 480));
        let sem = sim.create_semaphore("acq").unwrap();
        let indices: Vec<u32> = (0..4)
            .map(|_| sim.acquire_next_image(sc, sem).unwrap().0)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_failed_present_is_out_of_date() {
        let sim = SimBackend::new(CompletionMode::Immediate);
        let sc = sim.create_swapchain(2, (640, 480));
        let queue = sim.device_queue(0, 0).unwrap();
        sim.fail_next_presents(1);
        let result = sim.queue_present(queue, &[sc], &[0], &[]);
        assert!(matches!(result, Err(RhiError::SurfaceOutOfDate)));
        // Next present succeeds again.
        sim.queue_present(queue, &[sc], &[0], &[]).unwrap();
        assert_eq!(sim.presents().len(), 1);
    }

    #[test]
    fn test_out_of_range_queue_index_is_configuration_error() {
        let sim = SimBackend::new(CompletionMode::Immediate);
        assert!(matches!(
            sim.device_queue(2, 5),
            Err(RhiError::Configuration(_))
        ));
    }
}
