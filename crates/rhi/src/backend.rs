//! The seam to the graphics-API binding layer.
//!
//! Everything the synchronization core needs from the GPU is expressed as
//! the [`GpuBackend`] trait: queue-family enumeration, sync-object and
//! command-buffer primitives, submission and presentation. The production
//! implementation lives in [`crate::vulkan`]; tests and headless runs use
//! [`crate::sim`]. All failure codes are checked at the call site and
//! converted to [`RhiError`](crate::RhiError); nothing is silently ignored.

use ash::vk;
use bitflags::bitflags;
use glam::UVec3;

use crate::error::RhiResult;
use crate::handle::Handle;

pub enum FenceMarker {}
pub enum SemaphoreMarker {}
pub enum CommandPoolMarker {}
pub enum CommandBufferMarker {}
pub enum QueueMarker {}
pub enum SwapchainMarker {}
pub enum PipelineMarker {}
pub enum PipelineLayoutMarker {}
pub enum ResourceSetMarker {}
pub enum BufferMarker {}
pub enum ImageMarker {}

pub type FenceHandle = Handle<FenceMarker>;
pub type SemaphoreHandle = Handle<SemaphoreMarker>;
pub type CommandPoolHandle = Handle<CommandPoolMarker>;
pub type CommandBufferHandle = Handle<CommandBufferMarker>;
pub type QueueHandle = Handle<QueueMarker>;
pub type SwapchainHandle = Handle<SwapchainMarker>;
pub type PipelineHandle = Handle<PipelineMarker>;
pub type PipelineLayoutHandle = Handle<PipelineLayoutMarker>;
pub type ResourceSetHandle = Handle<ResourceSetMarker>;
pub type BufferHandle = Handle<BufferMarker>;
pub type ImageHandle = Handle<ImageMarker>;

bitflags! {
    /// Capability mask of an execution queue.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct QueueCaps: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const PRESENT = 1 << 3;
        const SPARSE_BINDING = 1 << 4;
    }
}

/// One queue family as exposed by the device, captured once at startup.
#[derive(Clone, Copy, Debug)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub caps: QueueCaps,
    pub queue_count: u32,
    /// Minimum granularity of image transfers on this family's queues.
    pub min_image_transfer_granularity: UVec3,
}

/// One batch handed to [`GpuBackend::queue_submit`].
///
/// All `wait_semaphores` must be satisfied on the GPU before any command
/// buffer in the batch begins; `signal_semaphores` become satisfied once the
/// whole batch completes; `fence`, if present, is signaled on completion.
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [CommandBufferHandle],
    pub wait_semaphores: &'a [SemaphoreHandle],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [SemaphoreHandle],
    pub fence: Option<FenceHandle>,
}

/// Attachment set for a dynamic-rendering pass.
#[derive(Clone, Debug, Default)]
pub struct RenderTargets {
    pub colors: Vec<ImageHandle>,
    pub depth: Option<ImageHandle>,
}

/// Image layout transition recorded into a command buffer. Issued in caller
/// order; the core never reorders or infers barriers.
#[derive(Clone, Copy, Debug)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// Buffer memory barrier recorded into a command buffer.
#[derive(Clone, Copy, Debug)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub offset: u64,
    pub size: u64,
}

/// Region of a buffer-to-buffer copy.
#[derive(Clone, Copy, Debug)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// The graphics-API binding layer, consumed as an opaque interface.
///
/// Handles are arena-indexed (index + generation); operations on a stale
/// handle fail with `InvalidState` rather than touching a recycled object.
/// Blocking operations (`wait_fence`, `queue_wait_idle`, `device_wait_idle`)
/// block the calling thread and are reserved for frame pacing, deferred
/// returns and teardown respectively.
pub trait GpuBackend: Send + Sync {
    // Device topology
    fn queue_families(&self) -> Vec<QueueFamilyInfo>;
    fn device_queue(&self, family: u32, index: u32) -> RhiResult<QueueHandle>;

    // Fences (CPU-observable completion)
    fn create_fence(&self, signaled: bool, label: &str) -> RhiResult<FenceHandle>;
    fn destroy_fence(&self, fence: FenceHandle) -> RhiResult<()>;
    fn fence_status(&self, fence: FenceHandle) -> RhiResult<bool>;
    fn wait_fence(&self, fence: FenceHandle) -> RhiResult<()>;
    fn reset_fence(&self, fence: FenceHandle) -> RhiResult<()>;

    // Semaphores (GPU-side ordering)
    fn create_semaphore(&self, label: &str) -> RhiResult<SemaphoreHandle>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) -> RhiResult<()>;

    // Command pools and buffers
    fn create_command_pool(&self, family: u32, label: &str) -> RhiResult<CommandPoolHandle>;
    fn destroy_command_pool(&self, pool: CommandPoolHandle) -> RhiResult<()>;
    fn allocate_command_buffer(
        &self,
        pool: CommandPoolHandle,
        label: &str,
    ) -> RhiResult<CommandBufferHandle>;

    // Recording: side-effecting appends to a command buffer's stream.
    // Nothing executes until submission.
    fn cmd_begin(&self, cmd: CommandBufferHandle) -> RhiResult<()>;
    fn cmd_end(&self, cmd: CommandBufferHandle) -> RhiResult<()>;
    fn cmd_reset(&self, cmd: CommandBufferHandle) -> RhiResult<()>;
    fn cmd_begin_rendering(
        &self,
        cmd: CommandBufferHandle,
        targets: &RenderTargets,
    ) -> RhiResult<()>;
    fn cmd_end_rendering(&self, cmd: CommandBufferHandle) -> RhiResult<()>;
    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineHandle,
    ) -> RhiResult<()>;
    fn cmd_bind_resources(
        &self,
        cmd: CommandBufferHandle,
        bind_point: vk::PipelineBindPoint,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[ResourceSetHandle],
    ) -> RhiResult<()>;
    fn cmd_draw(
        &self,
        cmd: CommandBufferHandle,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()>;
    fn cmd_draw_indexed(
        &self,
        cmd: CommandBufferHandle,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> RhiResult<()>;
    fn cmd_dispatch(&self, cmd: CommandBufferHandle, x: u32, y: u32, z: u32) -> RhiResult<()>;
    fn cmd_pipeline_barrier(
        &self,
        cmd: CommandBufferHandle,
        image_barriers: &[ImageBarrier],
        buffer_barriers: &[BufferBarrier],
    ) -> RhiResult<()>;
    fn cmd_copy_buffer(
        &self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    ) -> RhiResult<()>;
    fn cmd_copy_image(
        &self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
    ) -> RhiResult<()>;

    // Submission and presentation
    fn queue_submit(&self, queue: QueueHandle, batch: &SubmitBatch) -> RhiResult<()>;
    fn queue_present(
        &self,
        queue: QueueHandle,
        swapchains: &[SwapchainHandle],
        image_indices: &[u32],
        wait_semaphores: &[SemaphoreHandle],
    ) -> RhiResult<bool>;
    /// Non-blocking idle query. Backends that cannot answer report `false`
    /// for any queue that has ever been submitted to.
    fn queue_idle(&self, queue: QueueHandle) -> RhiResult<bool>;
    fn queue_wait_idle(&self, queue: QueueHandle) -> RhiResult<()>;
    fn device_wait_idle(&self) -> RhiResult<()>;

    // Presentation source
    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
    ) -> RhiResult<(u32, bool)>;

    // Debug regions; backends without debug tooling ignore these.
    fn queue_begin_debug_region(&self, queue: QueueHandle, label: &str) -> RhiResult<()> {
        let _ = (queue, label);
        Ok(())
    }
    fn queue_insert_debug_label(&self, queue: QueueHandle, label: &str) -> RhiResult<()> {
        let _ = (queue, label);
        Ok(())
    }
    fn queue_end_debug_region(&self, queue: QueueHandle) -> RhiResult<()> {
        let _ = queue;
        Ok(())
    }
}
