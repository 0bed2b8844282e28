//! Execution queues.
//!
//! A [`Queue`] submits recorded command buffers to the GPU with explicit
//! wait/signal ordering and performs presentation. The registry of queues
//! is built once at context init from the device's queue families and is
//! immutable afterward; individual instances cycle through the queue pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use glam::UVec3;
use tracing::trace;

use crate::backend::{GpuBackend, QueueCaps, QueueHandle, SemaphoreHandle, SubmitBatch, SwapchainHandle};
use crate::command::CommandBuffer;
use crate::error::{RhiError, RhiResult};
use crate::pool::{ObjectPool, Poolable};
use crate::sync::{Fence, completion_ticket};

/// One batch to submit: recorded buffers plus the ordering tokens gating
/// them. `wait_stages[i]` is the pipeline stage at which the batch blocks
/// on `wait_semaphores[i]`.
pub struct SubmitRequest<'a> {
    pub command_buffers: &'a [Arc<CommandBuffer>],
    pub wait_semaphores: &'a [SemaphoreHandle],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [SemaphoreHandle],
}

/// A GPU execution channel.
pub struct Queue {
    backend: Arc<dyn GpuBackend>,
    handle: QueueHandle,
    family: u32,
    caps: QueueCaps,
    min_image_transfer_granularity: UVec3,
    label: String,
    submissions: AtomicU64,
}

impl Queue {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        handle: QueueHandle,
        family: u32,
        caps: QueueCaps,
        min_image_transfer_granularity: UVec3,
        label: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            handle,
            family,
            caps,
            min_image_transfer_granularity,
            label: label.into(),
            submissions: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn handle(&self) -> QueueHandle {
        self.handle
    }

    #[inline]
    pub fn family(&self) -> u32 {
        self.family
    }

    #[inline]
    pub fn caps(&self) -> QueueCaps {
        self.caps
    }

    #[inline]
    pub fn min_image_transfer_granularity(&self) -> UVec3 {
        self.min_image_transfer_granularity
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Total batches submitted over this queue's lifetime.
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Selector predicate: capability superset plus an upper bound on the
    /// image-transfer granularity in every dimension.
    pub fn supports(&self, caps: QueueCaps, max_granularity: u32) -> bool {
        self.caps.contains(caps)
            && self.min_image_transfer_granularity.x <= max_granularity
            && self.min_image_transfer_granularity.y <= max_granularity
            && self.min_image_transfer_granularity.z <= max_granularity
    }

    /// Enqueues one batch for GPU execution.
    ///
    /// All wait semaphores must be satisfied GPU-side before any buffer in
    /// the batch begins; signal semaphores fire when the whole batch
    /// completes. A supplied `completion` fence is signaled on batch
    /// completion, and every buffer's association with it is recorded
    /// before dispatch; the deferred-return protocol depends on that
    /// ordering.
    pub fn submit(
        &self,
        request: &SubmitRequest,
        completion: Option<&Arc<Fence>>,
    ) -> RhiResult<()> {
        if request.wait_semaphores.len() != request.wait_stages.len() {
            return Err(RhiError::InvalidState(format!(
                "queue '{}': wait semaphore/stage count mismatch ({} vs {})",
                self.label,
                request.wait_semaphores.len(),
                request.wait_stages.len()
            )));
        }

        let ticket = completion.map(completion_ticket);
        let mut handles = Vec::with_capacity(request.command_buffers.len());
        for cmd in request.command_buffers {
            cmd.prepare_submit(ticket.clone())?;
            handles.push(cmd.handle());
        }

        if let Some(fence) = completion {
            if fence.is_submitted() {
                return Err(RhiError::InvalidState(format!(
                    "fence '{}' is already attached to an in-flight submission",
                    fence.label()
                )));
            }
            fence.mark_submitted();
        }

        let batch = SubmitBatch {
            command_buffers: &handles,
            wait_semaphores: request.wait_semaphores,
            wait_stages: request.wait_stages,
            signal_semaphores: request.signal_semaphores,
            fence: completion.map(|f| f.handle()),
        };
        if let Err(e) = self.backend.queue_submit(self.handle, &batch) {
            if let Some(fence) = completion {
                fence.unmark_submitted();
            }
            return Err(e);
        }
        self.submissions.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Queue '{}': submitted {} buffer(s), {} wait(s), {} signal(s)",
            self.label,
            handles.len(),
            request.wait_semaphores.len(),
            request.signal_semaphores.len()
        );
        Ok(())
    }

    /// Submit + CPU-side block on a fresh fence + reset + return.
    ///
    /// One-off synchronous work only (startup uploads, single compute
    /// dispatches); in the per-frame path it would defeat pipelining.
    pub fn submit_and_wait(
        &self,
        request: &SubmitRequest,
        fences: &ObjectPool<Fence>,
    ) -> RhiResult<()> {
        let fence = fences.acquire(|_| true)?;
        self.submit(request, Some(&fence))?;
        fence.wait()?;
        fences.release(&fence)
    }

    /// Requests display of the given images once `wait_semaphores` are
    /// satisfied. Returns `true` when the surface is suboptimal;
    /// a stale surface surfaces as [`RhiError::SurfaceOutOfDate`].
    pub fn present(
        &self,
        swapchains: &[SwapchainHandle],
        image_indices: &[u32],
        wait_semaphores: &[SemaphoreHandle],
    ) -> RhiResult<bool> {
        if !self.caps.contains(QueueCaps::PRESENT) {
            return Err(RhiError::InvalidState(format!(
                "queue '{}' cannot present",
                self.label
            )));
        }
        self.backend
            .queue_present(self.handle, swapchains, image_indices, wait_semaphores)
    }

    /// Blocks until all work submitted to this queue has completed.
    /// Teardown/resize only; never in the steady-state frame path.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.backend.queue_wait_idle(self.handle)
    }

    pub fn begin_debug_region(&self, label: &str) -> RhiResult<()> {
        self.backend.queue_begin_debug_region(self.handle, label)
    }

    pub fn insert_debug_label(&self, label: &str) -> RhiResult<()> {
        self.backend.queue_insert_debug_label(self.handle, label)
    }

    pub fn end_debug_region(&self) -> RhiResult<()> {
        self.backend.queue_end_debug_region(self.handle)
    }
}

impl Poolable for Queue {
    fn pool_key(&self) -> u64 {
        self.handle.id()
    }

    fn debug_label(&self) -> &str {
        &self.label
    }

    fn is_idle(&self) -> RhiResult<bool> {
        if self.submissions() == 0 {
            return Ok(true);
        }
        self.backend.queue_idle(self.handle)
    }

    /// A queue may have several outstanding batches, so its completion
    /// condition is a full wait-idle, run on the background waiter.
    fn wait_ready(&self) -> RhiResult<()> {
        self.backend.queue_wait_idle(self.handle)
    }

    fn recycle(&self) -> RhiResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPool;
    use crate::sim::{CompletionMode, SimBackend};

    fn setup(mode: CompletionMode) -> (Arc<SimBackend>, Arc<dyn GpuBackend>, Queue) {
        let sim = Arc::new(SimBackend::new(mode));
        let backend: Arc<dyn GpuBackend> = sim.clone();
        let families = backend.queue_families();
        let info = families[0];
        let handle = backend.device_queue(info.index, 0).unwrap();
        let queue = Queue::new(
            backend.clone(),
            handle,
            info.index,
            info.caps,
            info.min_image_transfer_granularity,
            "queue_0_0",
        );
        (sim, backend, queue)
    }

    fn recorded(backend: &Arc<dyn GpuBackend>, pool: &CommandPool) -> Arc<CommandBuffer> {
        let _ = backend;
        let cmd = Arc::new(pool.allocate("cmd").unwrap());
        cmd.begin().unwrap();
        cmd.draw(3, 1, 0, 0).unwrap();
        cmd.end().unwrap();
        cmd
    }

    #[test]
    fn test_submit_records_fence_association() {
        let (_sim, backend, queue) = setup(CompletionMode::Manual);
        let pool = CommandPool::new(backend.clone(), queue.family(), "pool").unwrap();
        let cmd = recorded(&backend, &pool);
        let fence = Arc::new(Fence::new(backend.clone(), false, "frame").unwrap());

        queue
            .submit(
                &SubmitRequest {
                    command_buffers: std::slice::from_ref(&cmd),
                    wait_semaphores: &[],
                    wait_stages: &[],
                    signal_semaphores: &[],
                },
                Some(&fence),
            )
            .unwrap();

        assert!(fence.is_submitted());
        // Association recorded: the buffer is not idle until the fence fires.
        assert!(!cmd.is_idle().unwrap());
        assert_eq!(queue.submissions(), 1);
    }

    #[test]
    fn test_submit_unended_buffer_is_rejected() {
        let (_sim, backend, queue) = setup(CompletionMode::Immediate);
        let pool = CommandPool::new(backend.clone(), queue.family(), "pool").unwrap();
        let cmd = Arc::new(pool.allocate("cmd").unwrap());
        cmd.begin().unwrap();

        let result = queue.submit(
            &SubmitRequest {
                command_buffers: std::slice::from_ref(&cmd),
                wait_semaphores: &[],
                wait_stages: &[],
                signal_semaphores: &[],
            },
            None,
        );
        assert!(matches!(result, Err(RhiError::InvalidState(_))));
    }

    #[test]
    fn test_wait_stage_count_mismatch_is_rejected() {
        let (_sim, backend, queue) = setup(CompletionMode::Immediate);
        let pool = CommandPool::new(backend.clone(), queue.family(), "pool").unwrap();
        let cmd = recorded(&backend, &pool);
        let sem = crate::sync::Semaphore::new(backend.clone(), "s").unwrap();

        let result = queue.submit(
            &SubmitRequest {
                command_buffers: std::slice::from_ref(&cmd),
                wait_semaphores: &[sem.handle()],
                wait_stages: &[],
                signal_semaphores: &[],
            },
            None,
        );
        assert!(matches!(result, Err(RhiError::InvalidState(_))));
    }

    #[test]
    fn test_double_fence_attach_is_rejected() {
        let (_sim, backend, queue) = setup(CompletionMode::Manual);
        let pool = CommandPool::new(backend.clone(), queue.family(), "pool").unwrap();
        let fence = Arc::new(Fence::new(backend.clone(), false, "frame").unwrap());

        let first = recorded(&backend, &pool);
        queue
            .submit(
                &SubmitRequest {
                    command_buffers: std::slice::from_ref(&first),
                    wait_semaphores: &[],
                    wait_stages: &[],
                    signal_semaphores: &[],
                },
                Some(&fence),
            )
            .unwrap();

        let second = recorded(&backend, &pool);
        let result = queue.submit(
            &SubmitRequest {
                command_buffers: std::slice::from_ref(&second),
                wait_semaphores: &[],
                wait_stages: &[],
                signal_semaphores: &[],
            },
            Some(&fence),
        );
        assert!(matches!(result, Err(RhiError::InvalidState(_))));
    }

    #[test]
    fn test_submit_and_wait_returns_fence_to_pool() {
        let (_sim, backend, queue) = setup(CompletionMode::Immediate);
        let pool = CommandPool::new(backend.clone(), queue.family(), "pool").unwrap();
        let cmd = recorded(&backend, &pool);

        let fence_backend = backend.clone();
        let counter = AtomicU64::new(0);
        let fences: ObjectPool<Fence> = ObjectPool::new(
            "fences",
            Some(Box::new(move || {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                Ok(Arc::new(Fence::new(
                    fence_backend.clone(),
                    false,
                    format!("fence_{}", n),
                )?))
            })),
        );

        queue
            .submit_and_wait(
                &SubmitRequest {
                    command_buffers: std::slice::from_ref(&cmd),
                    wait_semaphores: &[],
                    wait_stages: &[],
                    signal_semaphores: &[],
                },
                &fences,
            )
            .unwrap();

        // The fence came back reset and available.
        assert_eq!(fences.all_len(), 1);
        assert_eq!(fences.available_len(), 1);
        let fence = fences.acquire(|_| true).unwrap();
        assert!(!fence.status().unwrap());
        assert!(!fence.is_submitted());
    }

    #[test]
    fn test_present_requires_present_capability() {
        let sim = Arc::new(SimBackend::new(CompletionMode::Immediate));
        let backend: Arc<dyn GpuBackend> = sim.clone();
        // Pick a compute-only family (family 1 in the sim's default layout).
        let families = backend.queue_families();
        let info = families
            .iter()
            .find(|f| !f.caps.contains(QueueCaps::PRESENT))
            .copied()
            .expect("sim exposes a non-present family");
        let handle = backend.device_queue(info.index, 0).unwrap();
        let queue = Queue::new(
            backend.clone(),
            handle,
            info.index,
            info.caps,
            info.min_image_transfer_granularity,
            "compute_queue",
        );
        let swapchain = sim.create_swapchain(3, (1280, 720));
        let result = queue.present(&[swapchain], &[0], &[]);
        assert!(matches!(result, Err(RhiError::InvalidState(_))));
    }
}
