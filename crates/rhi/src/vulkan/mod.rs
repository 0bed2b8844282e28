//! ash-based implementation of the backend seam.
//!
//! Owns instance, physical-device selection and the logical device, and
//! maps arena-indexed handles onto raw Vulkan objects. Sync objects and
//! command pools are created and destroyed here; swapchains, pipelines,
//! buffers and images belong to the excluded windowing/PSO/asset layers
//! and are *imported*: this backend records and submits against them but
//! never destroys them.

mod device;
mod instance;
mod physical_device;

pub use device::Device;
pub use instance::Instance;
pub use physical_device::{PhysicalDeviceInfo, select_physical_device};

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Mutex, MutexGuard};

use ash::vk;
use tracing::info;

use crate::backend::{
    BufferBarrier, BufferCopy, BufferHandle, BufferMarker, CommandBufferHandle,
    CommandBufferMarker, CommandPoolHandle, CommandPoolMarker, FenceHandle, FenceMarker,
    GpuBackend, ImageBarrier, ImageHandle, ImageMarker, PipelineHandle, PipelineLayoutHandle,
    PipelineLayoutMarker, PipelineMarker, QueueFamilyInfo, QueueHandle, QueueMarker,
    RenderTargets, ResourceSetHandle, ResourceSetMarker, SemaphoreHandle, SemaphoreMarker,
    SubmitBatch, SwapchainHandle, SwapchainMarker,
};
use crate::error::{RhiError, RhiResult};
use crate::handle::Arena;

/// An imported image: raw handle plus the view and metadata recording needs.
#[derive(Clone, Copy)]
struct ImageEntry {
    #[allow(dead_code)]
    raw: vk::Image,
    view: vk::ImageView,
    extent: vk::Extent2D,
    aspect: vk::ImageAspectFlags,
}

#[derive(Default)]
struct Registry {
    fences: Arena<FenceMarker, vk::Fence>,
    semaphores: Arena<SemaphoreMarker, vk::Semaphore>,
    command_pools: Arena<CommandPoolMarker, vk::CommandPool>,
    command_buffers: Arena<CommandBufferMarker, vk::CommandBuffer>,
    queues: Arena<QueueMarker, vk::Queue>,
    queue_lookup: HashMap<(u32, u32), QueueHandle>,
    swapchains: Arena<SwapchainMarker, vk::SwapchainKHR>,
    pipelines: Arena<PipelineMarker, vk::Pipeline>,
    pipeline_layouts: Arena<PipelineLayoutMarker, vk::PipelineLayout>,
    resource_sets: Arena<ResourceSetMarker, vk::DescriptorSet>,
    buffers: Arena<BufferMarker, vk::Buffer>,
    images: Arena<ImageMarker, ImageEntry>,
}

fn stale(kind: &str) -> RhiError {
    RhiError::InvalidState(format!("stale {} handle", kind))
}

/// Vulkan implementation of [`GpuBackend`].
pub struct VulkanBackend {
    // Field order matters for drop: the registry's objects are destroyed
    // explicitly in Drop before `device` and `instance` go away.
    registry: Mutex<Registry>,
    swapchain_loader: ash::khr::swapchain::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    surface: Option<(ash::khr::surface::Instance, vk::SurfaceKHR)>,
    families: Vec<QueueFamilyInfo>,
    device: Device,
    /// External synchronization for vkQueueSubmit across threads.
    submit_lock: Mutex<()>,
    _instance: Instance,
}

impl VulkanBackend {
    /// Headless backend: no surface, so no family carries the present
    /// capability and acquire/present are unusable.
    pub fn new(enable_validation: bool) -> RhiResult<Self> {
        Self::create(enable_validation, None)
    }

    /// Backend with a presentation surface created by the (external)
    /// windowing layer via the supplied closure.
    pub fn with_surface<F>(enable_validation: bool, create_surface: F) -> RhiResult<Self>
    where
        F: FnOnce(&ash::Entry, &ash::Instance) -> RhiResult<vk::SurfaceKHR>,
    {
        let instance = Instance::new(enable_validation)?;
        let surface = create_surface(instance.entry(), instance.handle())?;
        Self::create_with_instance(instance, Some(surface))
    }

    fn create(enable_validation: bool, surface: Option<vk::SurfaceKHR>) -> RhiResult<Self> {
        let instance = Instance::new(enable_validation)?;
        Self::create_with_instance(instance, surface)
    }

    fn create_with_instance(
        instance: Instance,
        surface: Option<vk::SurfaceKHR>,
    ) -> RhiResult<Self> {
        let surface_pair = surface.map(|s| {
            (
                ash::khr::surface::Instance::new(instance.entry(), instance.handle()),
                s,
            )
        });

        let physical = select_physical_device(
            instance.handle(),
            surface_pair.as_ref().map(|(loader, s)| (loader, *s)),
        )?;
        let families = physical.families.clone();
        let device = Device::new(&instance, &physical)?;
        let swapchain_loader =
            ash::khr::swapchain::Device::new(instance.handle(), device.handle());
        let debug_utils = instance.has_validation().then(|| {
            ash::ext::debug_utils::Device::new(instance.handle(), device.handle())
        });

        info!("Vulkan backend ready on '{}'", physical.device_name());
        Ok(Self {
            registry: Mutex::new(Registry::default()),
            swapchain_loader,
            debug_utils,
            surface: surface_pair,
            families,
            device,
            submit_lock: Mutex::new(()),
            _instance: instance,
        })
    }

    /// Adopts a swapchain owned by the windowing layer.
    pub fn import_swapchain(&self, swapchain: vk::SwapchainKHR) -> SwapchainHandle {
        self.lock().swapchains.insert(swapchain)
    }

    /// Forgets an imported swapchain (e.g. before the windowing layer
    /// recreates it). The raw object is not destroyed.
    pub fn forget_swapchain(&self, swapchain: SwapchainHandle) {
        self.lock().swapchains.remove(swapchain);
    }

    pub fn import_pipeline(&self, pipeline: vk::Pipeline) -> PipelineHandle {
        self.lock().pipelines.insert(pipeline)
    }

    pub fn import_pipeline_layout(&self, layout: vk::PipelineLayout) -> PipelineLayoutHandle {
        self.lock().pipeline_layouts.insert(layout)
    }

    pub fn import_resource_set(&self, set: vk::DescriptorSet) -> ResourceSetHandle {
        self.lock().resource_sets.insert(set)
    }

    pub fn import_buffer(&self, buffer: vk::Buffer) -> BufferHandle {
        self.lock().buffers.insert(buffer)
    }

    pub fn import_image(
        &self,
        image: vk::Image,
        view: vk::ImageView,
        extent: vk::Extent2D,
        aspect: vk::ImageAspectFlags,
    ) -> ImageHandle {
        self.lock().images.insert(ImageEntry {
            raw: image,
            view,
            extent,
            aspect,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn raw_fence(&self, fence: FenceHandle) -> RhiResult<vk::Fence> {
        self.lock()
            .fences
            .get(fence)
            .copied()
            .ok_or_else(|| stale("fence"))
    }

    fn raw_queue(&self, queue: QueueHandle) -> RhiResult<vk::Queue> {
        self.lock()
            .queues
            .get(queue)
            .copied()
            .ok_or_else(|| stale("queue"))
    }

    fn raw_cmd(&self, cmd: CommandBufferHandle) -> RhiResult<vk::CommandBuffer> {
        self.lock()
            .command_buffers
            .get(cmd)
            .copied()
            .ok_or_else(|| stale("command buffer"))
    }
}

impl GpuBackend for VulkanBackend {
    fn queue_families(&self) -> Vec<QueueFamilyInfo> {
        self.families.clone()
    }

    fn device_queue(&self, family: u32, index: u32) -> RhiResult<QueueHandle> {
        let mut registry = self.lock();
        if let Some(&handle) = registry.queue_lookup.get(&(family, index)) {
            return Ok(handle);
        }
        let info = self
            .families
            .iter()
            .find(|f| f.index == family)
            .ok_or_else(|| {
                RhiError::Configuration(format!("queue family {} does not exist", family))
            })?;
        if index >= info.queue_count {
            return Err(RhiError::Configuration(format!(
                "queue family {} exposes {} queue(s), index {} requested",
                family, info.queue_count, index
            )));
        }
        let raw = unsafe { self.device.handle().get_device_queue(family, index) };
        let handle = registry.queues.insert(raw);
        registry.queue_lookup.insert((family, index), handle);
        Ok(handle)
    }

    fn create_fence(&self, signaled: bool, _label: &str) -> RhiResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device.handle().create_fence(&create_info, None)? };
        Ok(self.lock().fences.insert(fence))
    }

    fn destroy_fence(&self, fence: FenceHandle) -> RhiResult<()> {
        let raw = self.lock().fences.remove(fence).ok_or_else(|| stale("fence"))?;
        unsafe { self.device.handle().destroy_fence(raw, None) };
        Ok(())
    }

    fn fence_status(&self, fence: FenceHandle) -> RhiResult<bool> {
        let raw = self.raw_fence(fence)?;
        let signaled = unsafe { self.device.handle().get_fence_status(raw)? };
        Ok(signaled)
    }

    fn wait_fence(&self, fence: FenceHandle) -> RhiResult<()> {
        let raw = self.raw_fence(fence)?;
        let fences = [raw];
        unsafe {
            self.device
                .handle()
                .wait_for_fences(&fences, true, u64::MAX)?
        };
        Ok(())
    }

    fn reset_fence(&self, fence: FenceHandle) -> RhiResult<()> {
        let raw = self.raw_fence(fence)?;
        let fences = [raw];
        unsafe { self.device.handle().reset_fences(&fences)? };
        Ok(())
    }

    fn create_semaphore(&self, _label: &str) -> RhiResult<SemaphoreHandle> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.device.handle().create_semaphore(&create_info, None)? };
        Ok(self.lock().semaphores.insert(semaphore))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) -> RhiResult<()> {
        let raw = self
            .lock()
            .semaphores
            .remove(semaphore)
            .ok_or_else(|| stale("semaphore"))?;
        unsafe { self.device.handle().destroy_semaphore(raw, None) };
        Ok(())
    }

    fn create_command_pool(&self, family: u32, _label: &str) -> RhiResult<CommandPoolHandle> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.handle().create_command_pool(&create_info, None)? };
        Ok(self.lock().command_pools.insert(pool))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) -> RhiResult<()> {
        let raw = self
            .lock()
            .command_pools
            .remove(pool)
            .ok_or_else(|| stale("command pool"))?;
        unsafe { self.device.handle().destroy_command_pool(raw, None) };
        Ok(())
    }

    fn allocate_command_buffer(
        &self,
        pool: CommandPoolHandle,
        _label: &str,
    ) -> RhiResult<CommandBufferHandle> {
        let raw_pool = self
            .lock()
            .command_pools
            .get(pool)
            .copied()
            .ok_or_else(|| stale("command pool"))?;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(raw_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info)? };
        Ok(self.lock().command_buffers.insert(buffers[0]))
    }

    fn cmd_begin(&self, cmd: CommandBufferHandle) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.handle().begin_command_buffer(raw, &begin_info)? };
        Ok(())
    }

    fn cmd_end(&self, cmd: CommandBufferHandle) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        unsafe { self.device.handle().end_command_buffer(raw)? };
        Ok(())
    }

    fn cmd_reset(&self, cmd: CommandBufferHandle) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        unsafe {
            self.device
                .handle()
                .reset_command_buffer(raw, vk::CommandBufferResetFlags::empty())?
        };
        Ok(())
    }

    fn cmd_begin_rendering(
        &self,
        cmd: CommandBufferHandle,
        targets: &RenderTargets,
    ) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        let registry = self.lock();

        let mut extent = vk::Extent2D::default();
        let mut color_infos = Vec::with_capacity(targets.colors.len());
        for &image in &targets.colors {
            let entry = registry.images.get(image).ok_or_else(|| stale("image"))?;
            extent = entry.extent;
            color_infos.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(entry.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: [0.0, 0.0, 0.0, 1.0],
                        },
                    }),
            );
        }

        let depth_info = match targets.depth {
            Some(image) => {
                let entry = registry.images.get(image).ok_or_else(|| stale("image"))?;
                extent = entry.extent;
                Some(
                    vk::RenderingAttachmentInfo::default()
                        .image_view(entry.view)
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .load_op(vk::AttachmentLoadOp::CLEAR)
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .clear_value(vk::ClearValue {
                            depth_stencil: vk::ClearDepthStencilValue {
                                depth: 1.0,
                                stencil: 0,
                            },
                        }),
                )
            }
            None => None,
        };

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(depth) = depth_info.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        unsafe { self.device.handle().cmd_begin_rendering(raw, &rendering_info) };
        Ok(())
    }

    fn cmd_end_rendering(&self, cmd: CommandBufferHandle) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        unsafe { self.device.handle().cmd_end_rendering(raw) };
        Ok(())
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineHandle,
    ) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        let raw_pipeline = self
            .lock()
            .pipelines
            .get(pipeline)
            .copied()
            .ok_or_else(|| stale("pipeline"))?;
        unsafe {
            self.device
                .handle()
                .cmd_bind_pipeline(raw, bind_point, raw_pipeline)
        };
        Ok(())
    }

    fn cmd_bind_resources(
        &self,
        cmd: CommandBufferHandle,
        bind_point: vk::PipelineBindPoint,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[ResourceSetHandle],
    ) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        let registry = self.lock();
        let raw_layout = registry
            .pipeline_layouts
            .get(layout)
            .copied()
            .ok_or_else(|| stale("pipeline layout"))?;
        let mut raw_sets = Vec::with_capacity(sets.len());
        for &set in sets {
            raw_sets.push(
                registry
                    .resource_sets
                    .get(set)
                    .copied()
                    .ok_or_else(|| stale("resource set"))?,
            );
        }
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                raw,
                bind_point,
                raw_layout,
                first_set,
                &raw_sets,
                &[],
            )
        };
        Ok(())
    }

    fn cmd_draw(
        &self,
        cmd: CommandBufferHandle,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        unsafe {
            self.device.handle().cmd_draw(
                raw,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
        Ok(())
    }

    fn cmd_draw_indexed(
        &self,
        cmd: CommandBufferHandle,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        unsafe {
            self.device.handle().cmd_draw_indexed(
                raw,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
        Ok(())
    }

    fn cmd_dispatch(&self, cmd: CommandBufferHandle, x: u32, y: u32, z: u32) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        unsafe { self.device.handle().cmd_dispatch(raw, x, y, z) };
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: CommandBufferHandle,
        image_barriers: &[ImageBarrier],
        buffer_barriers: &[BufferBarrier],
    ) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        let registry = self.lock();

        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();

        let mut raw_image_barriers = Vec::with_capacity(image_barriers.len());
        for barrier in image_barriers {
            let entry = registry
                .images
                .get(barrier.image)
                .ok_or_else(|| stale("image"))?;
            src_stages |= barrier.src_stage;
            dst_stages |= barrier.dst_stage;
            raw_image_barriers.push(
                vk::ImageMemoryBarrier::default()
                    .image(entry.raw)
                    .old_layout(barrier.old_layout)
                    .new_layout(barrier.new_layout)
                    .src_access_mask(barrier.src_access)
                    .dst_access_mask(barrier.dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(entry.aspect)
                            .base_mip_level(0)
                            .level_count(vk::REMAINING_MIP_LEVELS)
                            .base_array_layer(0)
                            .layer_count(vk::REMAINING_ARRAY_LAYERS),
                    ),
            );
        }

        let mut raw_buffer_barriers = Vec::with_capacity(buffer_barriers.len());
        for barrier in buffer_barriers {
            let raw_buffer = registry
                .buffers
                .get(barrier.buffer)
                .copied()
                .ok_or_else(|| stale("buffer"))?;
            src_stages |= barrier.src_stage;
            dst_stages |= barrier.dst_stage;
            raw_buffer_barriers.push(
                vk::BufferMemoryBarrier::default()
                    .buffer(raw_buffer)
                    .src_access_mask(barrier.src_access)
                    .dst_access_mask(barrier.dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .offset(barrier.offset)
                    .size(barrier.size),
            );
        }

        if src_stages.is_empty() {
            src_stages = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        if dst_stages.is_empty() {
            dst_stages = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        }

        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                raw,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &raw_buffer_barriers,
                &raw_image_barriers,
            )
        };
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    ) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        let registry = self.lock();
        let raw_src = registry.buffers.get(src).copied().ok_or_else(|| stale("buffer"))?;
        let raw_dst = registry.buffers.get(dst).copied().ok_or_else(|| stale("buffer"))?;
        let raw_regions: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|r| vk::BufferCopy {
                src_offset: r.src_offset,
                dst_offset: r.dst_offset,
                size: r.size,
            })
            .collect();
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(raw, raw_src, raw_dst, &raw_regions)
        };
        Ok(())
    }

    fn cmd_copy_image(
        &self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
    ) -> RhiResult<()> {
        let raw = self.raw_cmd(cmd)?;
        let registry = self.lock();
        let src_entry = registry.images.get(src).ok_or_else(|| stale("image"))?;
        let dst_entry = registry.images.get(dst).ok_or_else(|| stale("image"))?;
        let region = vk::ImageCopy::default()
            .src_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(src_entry.aspect)
                    .layer_count(1),
            )
            .dst_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(dst_entry.aspect)
                    .layer_count(1),
            )
            .extent(vk::Extent3D {
                width: src_entry.extent.width,
                height: src_entry.extent.height,
                depth: 1,
            });
        unsafe {
            self.device.handle().cmd_copy_image(
                raw,
                src_entry.raw,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_entry.raw,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        };
        Ok(())
    }

    fn queue_submit(&self, queue: QueueHandle, batch: &SubmitBatch) -> RhiResult<()> {
        let (raw_queue, raw_cmds, raw_waits, raw_signals, raw_fence) = {
            let registry = self.lock();
            let raw_queue = registry
                .queues
                .get(queue)
                .copied()
                .ok_or_else(|| stale("queue"))?;
            let mut raw_cmds = Vec::with_capacity(batch.command_buffers.len());
            for &cmd in batch.command_buffers {
                raw_cmds.push(
                    registry
                        .command_buffers
                        .get(cmd)
                        .copied()
                        .ok_or_else(|| stale("command buffer"))?,
                );
            }
            let mut raw_waits = Vec::with_capacity(batch.wait_semaphores.len());
            for &sem in batch.wait_semaphores {
                raw_waits.push(
                    registry
                        .semaphores
                        .get(sem)
                        .copied()
                        .ok_or_else(|| stale("semaphore"))?,
                );
            }
            let mut raw_signals = Vec::with_capacity(batch.signal_semaphores.len());
            for &sem in batch.signal_semaphores {
                raw_signals.push(
                    registry
                        .semaphores
                        .get(sem)
                        .copied()
                        .ok_or_else(|| stale("semaphore"))?,
                );
            }
            let raw_fence = match batch.fence {
                Some(fence) => registry
                    .fences
                    .get(fence)
                    .copied()
                    .ok_or_else(|| stale("fence"))?,
                None => vk::Fence::null(),
            };
            (raw_queue, raw_cmds, raw_waits, raw_signals, raw_fence)
        };

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&raw_waits)
            .wait_dst_stage_mask(batch.wait_stages)
            .command_buffers(&raw_cmds)
            .signal_semaphores(&raw_signals);

        let _guard = self.submit_lock.lock().unwrap_or_else(|p| p.into_inner());
        unsafe {
            self.device
                .handle()
                .queue_submit(raw_queue, &[submit_info], raw_fence)?
        };
        Ok(())
    }

    fn queue_present(
        &self,
        queue: QueueHandle,
        swapchains: &[SwapchainHandle],
        image_indices: &[u32],
        wait_semaphores: &[SemaphoreHandle],
    ) -> RhiResult<bool> {
        let (raw_queue, raw_swapchains, raw_waits) = {
            let registry = self.lock();
            let raw_queue = registry
                .queues
                .get(queue)
                .copied()
                .ok_or_else(|| stale("queue"))?;
            let mut raw_swapchains = Vec::with_capacity(swapchains.len());
            for &sc in swapchains {
                raw_swapchains.push(
                    registry
                        .swapchains
                        .get(sc)
                        .copied()
                        .ok_or_else(|| stale("swapchain"))?,
                );
            }
            let mut raw_waits = Vec::with_capacity(wait_semaphores.len());
            for &sem in wait_semaphores {
                raw_waits.push(
                    registry
                        .semaphores
                        .get(sem)
                        .copied()
                        .ok_or_else(|| stale("semaphore"))?,
                );
            }
            (raw_queue, raw_swapchains, raw_waits)
        };

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&raw_waits)
            .swapchains(&raw_swapchains)
            .image_indices(image_indices);

        let suboptimal = unsafe {
            self.swapchain_loader
                .queue_present(raw_queue, &present_info)?
        };
        Ok(suboptimal)
    }

    fn queue_idle(&self, queue: QueueHandle) -> RhiResult<bool> {
        // Vulkan has no non-blocking queue-idle query; deferred returns
        // always take the wait-idle waiter path on this backend.
        let _ = self.raw_queue(queue)?;
        Ok(false)
    }

    fn queue_wait_idle(&self, queue: QueueHandle) -> RhiResult<()> {
        let raw = self.raw_queue(queue)?;
        unsafe { self.device.handle().queue_wait_idle(raw)? };
        Ok(())
    }

    fn device_wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
    ) -> RhiResult<(u32, bool)> {
        let (raw_swapchain, raw_signal) = {
            let registry = self.lock();
            (
                registry
                    .swapchains
                    .get(swapchain)
                    .copied()
                    .ok_or_else(|| stale("swapchain"))?,
                registry
                    .semaphores
                    .get(signal)
                    .copied()
                    .ok_or_else(|| stale("semaphore"))?,
            )
        };
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                raw_swapchain,
                u64::MAX,
                raw_signal,
                vk::Fence::null(),
            )?
        };
        Ok(result)
    }

    fn queue_begin_debug_region(&self, queue: QueueHandle, label: &str) -> RhiResult<()> {
        let Some(debug_utils) = &self.debug_utils else {
            return Ok(());
        };
        let raw = self.raw_queue(queue)?;
        let name = CString::new(label).unwrap_or_default();
        let info = vk::DebugUtilsLabelEXT::default().label_name(&name);
        unsafe { debug_utils.queue_begin_debug_utils_label(raw, &info) };
        Ok(())
    }

    fn queue_insert_debug_label(&self, queue: QueueHandle, label: &str) -> RhiResult<()> {
        let Some(debug_utils) = &self.debug_utils else {
            return Ok(());
        };
        let raw = self.raw_queue(queue)?;
        let name = CString::new(label).unwrap_or_default();
        let info = vk::DebugUtilsLabelEXT::default().label_name(&name);
        unsafe { debug_utils.queue_insert_debug_utils_label(raw, &info) };
        Ok(())
    }

    fn queue_end_debug_region(&self, queue: QueueHandle) -> RhiResult<()> {
        let Some(debug_utils) = &self.debug_utils else {
            return Ok(());
        };
        let raw = self.raw_queue(queue)?;
        unsafe { debug_utils.queue_end_debug_utils_label(raw) };
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        // Force-destroy everything this backend owns after a full idle
        // wait. Imported objects (swapchains, pipelines, buffers, images,
        // resource sets) belong to their creating layers and are skipped.
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Device idle wait failed during backend teardown: {:?}", e);
        }
        let mut registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        unsafe {
            for fence in registry.fences.drain_values() {
                self.device.handle().destroy_fence(fence, None);
            }
            for semaphore in registry.semaphores.drain_values() {
                self.device.handle().destroy_semaphore(semaphore, None);
            }
            // Command buffers are freed with their pools.
            for pool in registry.command_pools.drain_values() {
                self.device.handle().destroy_command_pool(pool, None);
            }
            if let Some((loader, surface)) = self.surface.take() {
                loader.destroy_surface(surface, None);
            }
        }
        info!("Vulkan backend destroyed");
    }
}
