//! The owner of all pooled GPU-synchronization state.
//!
//! [`GraphicsResourceContext`] replaces process-wide registries with one
//! explicit struct constructed at device init and passed by `Arc` to every
//! component: the fixed queue registry, per-family command pools (created
//! on demand), the fence pool and the ordering-semaphore ring. `init` and
//! `clear` bracket the device's lifetime; `clear` performs a global idle
//! wait, drains every deferred return, then destroys all outstanding
//! objects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use crate::backend::{GpuBackend, QueueCaps, SemaphoreHandle};
use crate::command::{CommandBuffer, CommandPool};
use crate::error::{RhiError, RhiResult};
use crate::pool::ObjectPool;
use crate::queue::Queue;
use crate::sync::{Fence, SemaphoreRing};

/// Context construction parameters.
#[derive(Clone, Debug)]
pub struct ContextDesc {
    /// How many frame slots may carry unfinished GPU work at once.
    pub frames_in_flight: usize,
    /// Ordering semaphores reserved per frame slot; the ring holds
    /// `frames_in_flight * ordering_signals_per_frame` semaphores.
    pub ordering_signals_per_frame: usize,
    /// Queue capability combinations the application cannot run without.
    /// Validated here so a misconfigured device fails at startup, not at
    /// pool-exhaustion time mid-frame.
    pub required_queue_caps: Vec<QueueCaps>,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            ordering_signals_per_frame: 8,
            required_queue_caps: vec![QueueCaps::GRAPHICS | QueueCaps::PRESENT],
        }
    }
}

/// Command pool plus buffer pool for one queue family.
pub struct FamilyCommandPools {
    pool: Arc<CommandPool>,
    buffers: ObjectPool<CommandBuffer>,
}

impl FamilyCommandPools {
    fn new(backend: Arc<dyn GpuBackend>, family: u32) -> RhiResult<Self> {
        let pool = Arc::new(CommandPool::new(
            backend,
            family,
            format!("cmd_pool_family_{}", family),
        )?);
        let factory_pool = pool.clone();
        let counter = AtomicU64::new(0);
        let buffers = ObjectPool::new(
            format!("command_buffers_family_{}", family),
            Some(Box::new(move || {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                let label = format!("cmd_{}_{}", factory_pool.family(), n);
                Ok(Arc::new(factory_pool.allocate(label)?))
            })),
        );
        Ok(Self { pool, buffers })
    }

    #[inline]
    pub fn pool(&self) -> &Arc<CommandPool> {
        &self.pool
    }

    #[inline]
    pub fn buffers(&self) -> &ObjectPool<CommandBuffer> {
        &self.buffers
    }
}

/// All pool state of the synchronization core, tied to one device.
pub struct GraphicsResourceContext {
    backend: Arc<dyn GpuBackend>,
    queues: ObjectPool<Queue>,
    fences: ObjectPool<Fence>,
    ordering_signals: RwLock<SemaphoreRing>,
    command_pools: Mutex<HashMap<u32, Arc<FamilyCommandPools>>>,
    frames_in_flight: usize,
    cleared: AtomicBool,
}

impl GraphicsResourceContext {
    /// Builds the context: enumerates queue families into the (immutable)
    /// queue registry, validates required capabilities, creates the fence
    /// pool and the ordering-semaphore ring.
    pub fn init(backend: Arc<dyn GpuBackend>, desc: &ContextDesc) -> RhiResult<Arc<Self>> {
        if desc.frames_in_flight == 0 {
            return Err(RhiError::Configuration(
                "frames_in_flight must be at least 1".into(),
            ));
        }

        let queues: ObjectPool<Queue> = ObjectPool::new("queues", None);
        let families = backend.queue_families();
        for family in &families {
            for i in 0..family.queue_count {
                let handle = backend.device_queue(family.index, i)?;
                queues.register(Arc::new(Queue::new(
                    backend.clone(),
                    handle,
                    family.index,
                    family.caps,
                    family.min_image_transfer_granularity,
                    format!("queue_{}_{}", family.index, i),
                )));
            }
            debug!(
                "Registered queue family {}: {:?}, {} queue(s)",
                family.index, family.caps, family.queue_count
            );
        }

        for &caps in &desc.required_queue_caps {
            let satisfied = families.iter().any(|f| f.caps.contains(caps));
            if !satisfied {
                return Err(RhiError::Configuration(format!(
                    "device exposes no queue family with capabilities {:?}",
                    caps
                )));
            }
        }

        let fence_backend = backend.clone();
        let fence_counter = AtomicU64::new(0);
        let fences = ObjectPool::new(
            "fences",
            Some(Box::new(move || {
                let n = fence_counter.fetch_add(1, Ordering::Relaxed);
                Ok(Arc::new(Fence::new(
                    fence_backend.clone(),
                    false,
                    format!("fence_{}", n),
                )?))
            }) as Box<dyn Fn() -> RhiResult<Arc<Fence>> + Send + Sync>),
        );

        let ring_capacity = desc.frames_in_flight * desc.ordering_signals_per_frame;
        let ordering_signals = SemaphoreRing::new(backend.clone(), ring_capacity, "ordering")?;

        info!(
            "Graphics resource context initialized: {} queue(s), {} frames in flight, {} ordering signals",
            queues.all_len(),
            desc.frames_in_flight,
            ring_capacity
        );

        Ok(Arc::new(Self {
            backend,
            queues,
            fences,
            ordering_signals: RwLock::new(ordering_signals),
            command_pools: Mutex::new(HashMap::new()),
            frames_in_flight: desc.frames_in_flight,
            cleared: AtomicBool::new(false),
        }))
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    #[inline]
    pub fn queues(&self) -> &ObjectPool<Queue> {
        &self.queues
    }

    #[inline]
    pub fn fences(&self) -> &ObjectPool<Fence> {
        &self.fences
    }

    /// Checks out a queue matching the capability mask and granularity
    /// bound.
    pub fn acquire_queue(&self, caps: QueueCaps, max_granularity: u32) -> RhiResult<Arc<Queue>> {
        self.queues.acquire(|q| q.supports(caps, max_granularity))
    }

    pub fn release_queue(&self, queue: &Arc<Queue>) -> RhiResult<()> {
        self.queues.release(queue)
    }

    /// Command pools for one family, created on first use.
    pub fn family_command_pools(&self, family: u32) -> RhiResult<Arc<FamilyCommandPools>> {
        let mut pools = self
            .command_pools
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = pools.get(&family) {
            return Ok(existing.clone());
        }
        let created = Arc::new(FamilyCommandPools::new(self.backend.clone(), family)?);
        pools.insert(family, created.clone());
        Ok(created)
    }

    /// Checks out a command buffer scoped to `family`. Handles are never
    /// interchangeable across families.
    pub fn acquire_command_buffer(&self, family: u32) -> RhiResult<Arc<CommandBuffer>> {
        self.family_command_pools(family)?.buffers.acquire(|_| true)
    }

    pub fn release_command_buffer(&self, cmd: &Arc<CommandBuffer>) -> RhiResult<()> {
        self.family_command_pools(cmd.family())?
            .buffers
            .release(cmd)
    }

    /// Next ordering semaphore from the ring.
    pub fn ordering_signal(&self) -> RhiResult<SemaphoreHandle> {
        self.ordering_signals
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .next()
    }

    pub fn ordering_signal_capacity(&self) -> usize {
        self.ordering_signals
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .capacity()
    }

    /// Replaces the ordering ring wholesale. Used by the resize path: a
    /// semaphore attached to an abandoned acquire is in an unknown state
    /// and must not be waited on again.
    pub fn reset_ordering_signals(&self) -> RhiResult<()> {
        let capacity = self.ordering_signal_capacity();
        let fresh = SemaphoreRing::new(self.backend.clone(), capacity, "ordering")?;
        *self
            .ordering_signals
            .write()
            .unwrap_or_else(|p| p.into_inner()) = fresh;
        debug!("Ordering signal ring recreated ({} semaphores)", capacity);
        Ok(())
    }

    /// Folds completed deferred returns back into every pool. Called
    /// opportunistically by the frame loop.
    pub fn check_returns(&self) -> RhiResult<()> {
        self.queues.check_futures()?;
        self.fences.check_futures()?;
        let pools: Vec<Arc<FamilyCommandPools>> = {
            let map = self
                .command_pools
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            map.values().cloned().collect()
        };
        for family in pools {
            family.buffers.check_futures()?;
        }
        Ok(())
    }

    /// Blocks until no deferred return remains anywhere.
    pub fn drain_pools(&self) -> RhiResult<()> {
        self.queues.drain()?;
        self.fences.drain()?;
        let pools: Vec<Arc<FamilyCommandPools>> = {
            let map = self
                .command_pools
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            map.values().cloned().collect()
        };
        for family in pools {
            family.buffers.drain()?;
        }
        Ok(())
    }

    /// Tears down all pooled state: global device-idle wait, drain every
    /// deferred return, then force-destroy all outstanding objects.
    /// Idempotent.
    pub fn clear(&self) -> RhiResult<()> {
        if self.cleared.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.backend.device_wait_idle()?;
        self.drain_pools()?;

        self.queues.clear_all()?;
        self.fences.clear_all()?;
        {
            let mut pools = self
                .command_pools
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            for (family, pool) in pools.iter() {
                pool.buffers.clear_all()?;
                debug!("Cleared command buffers for family {}", family);
            }
            pools.clear();
        }
        self.ordering_signals
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        info!("Graphics resource context cleared");
        Ok(())
    }
}

impl Drop for GraphicsResourceContext {
    fn drop(&mut self) {
        if !self.cleared.load(Ordering::Acquire) {
            if let Err(e) = self.clear() {
                tracing::error!("Graphics resource context teardown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{CompletionMode, SimBackend};

    fn context() -> Arc<GraphicsResourceContext> {
        let backend: Arc<dyn GpuBackend> = Arc::new(SimBackend::new(CompletionMode::Immediate));
        GraphicsResourceContext::init(backend, &ContextDesc::default()).unwrap()
    }

    #[test]
    fn test_missing_capability_fails_at_init() {
        let backend: Arc<dyn GpuBackend> = Arc::new(SimBackend::new(CompletionMode::Immediate));
        let desc = ContextDesc {
            required_queue_caps: vec![QueueCaps::GRAPHICS | QueueCaps::SPARSE_BINDING],
            ..Default::default()
        };
        let result = GraphicsResourceContext::init(backend, &desc);
        assert!(matches!(result, Err(RhiError::Configuration(_))));
    }

    #[test]
    fn test_queue_registry_is_prebuilt() {
        let ctx = context();
        // Default sim layout: 4 + 2 + 1 queues.
        assert_eq!(ctx.queues().all_len(), 7);
    }

    #[test]
    fn test_queue_selection_honors_granularity() {
        let ctx = context();
        // Only the dedicated transfer family has coarse granularity; a
        // bound of 1 must never select it.
        let queue = ctx.acquire_queue(QueueCaps::TRANSFER, 1).unwrap();
        assert!(queue.min_image_transfer_granularity().max_element() <= 1);
        ctx.release_queue(&queue).unwrap();

        // A relaxed bound may select any transfer-capable family.
        let coarse = ctx.acquire_queue(QueueCaps::TRANSFER, 8).unwrap();
        assert!(coarse.supports(QueueCaps::TRANSFER, 8));
        ctx.release_queue(&coarse).unwrap();
    }

    #[test]
    fn test_family_command_pools_are_singletons() {
        let ctx = context();
        let a = ctx.family_command_pools(0).unwrap();
        let b = ctx.family_command_pools(0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let other = ctx.family_command_pools(1).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_command_buffers_stay_in_their_family() {
        let ctx = context();
        let a = ctx.acquire_command_buffer(0).unwrap();
        let b = ctx.acquire_command_buffer(1).unwrap();
        assert_eq!(a.family(), 0);
        assert_eq!(b.family(), 1);
        ctx.release_command_buffer(&a).unwrap();
        ctx.release_command_buffer(&b).unwrap();

        // Repeated requests for family 1 never see the family-0 buffer.
        for _ in 0..8 {
            let cmd = ctx.acquire_command_buffer(1).unwrap();
            assert_eq!(cmd.family(), 1);
            ctx.release_command_buffer(&cmd).unwrap();
        }
    }

    #[test]
    fn test_clear_is_idempotent() {
        let ctx = context();
        let cmd = ctx.acquire_command_buffer(0).unwrap();
        ctx.release_command_buffer(&cmd).unwrap();
        ctx.clear().unwrap();
        ctx.clear().unwrap();
        // The ring is gone after teardown.
        assert!(ctx.ordering_signal().is_err());
    }
}
