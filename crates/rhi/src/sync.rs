//! Synchronization primitives.
//!
//! Two kinds of signal sequence GPU work:
//! - [`Fence`]: a CPU-observable completion flag, set by the GPU when a
//!   submission finishes and reset by the CPU after the signal has been
//!   observed and consumed. This is the only primitive the CPU ever blocks
//!   on, and the gate for every deferred pool return.
//! - [`Semaphore`]: a GPU-side-only ordering token chaining one
//!   submission's completion to another's start; never observed by the CPU.
//!   Semaphores are allocated from a fixed [`SemaphoreRing`] and reused
//!   cyclically.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tracing::debug;

use crate::backend::{FenceHandle, GpuBackend, SemaphoreHandle};
use crate::error::{RhiError, RhiResult};
use crate::pool::Poolable;

/// CPU-observable completion flag (fence).
///
/// A fence is associated with at most one in-flight submission at a time.
/// `generation` counts consume/reset cycles so that observers holding a
/// [`CompletionTicket`] from a previous cycle cannot confuse a fresh
/// submission's state with the one they are waiting on.
pub struct Fence {
    backend: Arc<dyn GpuBackend>,
    handle: FenceHandle,
    label: String,
    submitted: AtomicBool,
    generation: AtomicU64,
}

impl Fence {
    /// Creates a fence, optionally in the pre-signaled state.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        signaled: bool,
        label: impl Into<String>,
    ) -> RhiResult<Self> {
        let label = label.into();
        let handle = backend.create_fence(signaled, &label)?;
        debug!(
            "Created fence '{}' ({})",
            label,
            if signaled { "signaled" } else { "unsignaled" }
        );
        Ok(Self {
            backend,
            handle,
            label,
            submitted: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn handle(&self) -> FenceHandle {
        self.handle
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Blocks the calling thread until the fence is signaled. Unbounded.
    pub fn wait(&self) -> RhiResult<()> {
        self.backend.wait_fence(self.handle)
    }

    /// Non-blocking poll of the signaled state.
    pub fn status(&self) -> RhiResult<bool> {
        self.backend.fence_status(self.handle)
    }

    /// Resets the fence to unsignaled. Must only be called after the signal
    /// has been observed; bumps the consume generation so stale tickets
    /// resolve as complete.
    pub fn reset(&self) -> RhiResult<()> {
        self.backend.reset_fence(self.handle)?;
        self.submitted.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Whether the fence is attached to an in-flight submission.
    #[inline]
    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_submitted(&self) {
        self.submitted.store(true, Ordering::Release);
    }

    /// Rolls back `mark_submitted` when a submission never reached the
    /// GPU; without this a deferred return would wait on a signal that
    /// cannot come.
    pub(crate) fn unmark_submitted(&self) {
        self.submitted.store(false, Ordering::Release);
    }

    #[inline]
    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if let Err(e) = self.backend.destroy_fence(self.handle) {
            tracing::error!("Failed to destroy fence '{}': {}", self.label, e);
        }
    }
}

impl Poolable for Fence {
    fn pool_key(&self) -> u64 {
        self.handle.id()
    }

    fn debug_label(&self) -> &str {
        &self.label
    }

    fn is_idle(&self) -> RhiResult<bool> {
        if !self.is_submitted() {
            return Ok(true);
        }
        self.status()
    }

    fn wait_ready(&self) -> RhiResult<()> {
        if self.is_submitted() {
            self.wait()?;
        }
        Ok(())
    }

    fn recycle(&self) -> RhiResult<()> {
        // Reset unconditionally: the generation bump retires any ticket
        // still pointing at the previous cycle, including the
        // never-signaled tickets of an abandoned submission chain.
        self.reset()
    }
}

/// Completion evidence captured when work is submitted against a fence.
///
/// A ticket resolves as complete when the fence reports signaled, or when
/// the fence has since been consumed and reset (its generation moved on),
/// which, by the reset-after-observe protocol, implies the tracked
/// submission finished. This closes the race between a deferred-return
/// waiter polling a fence and the frame loop recycling that same fence.
#[derive(Clone)]
pub struct CompletionTicket {
    fence: Arc<Fence>,
    generation: u64,
}

impl CompletionTicket {
    pub fn is_complete(&self) -> RhiResult<bool> {
        if self.fence.current_generation() != self.generation {
            return Ok(true);
        }
        self.fence.status()
    }

    #[inline]
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }
}

/// Creates a ticket for the fence's current consume cycle.
pub fn completion_ticket(fence: &Arc<Fence>) -> CompletionTicket {
    CompletionTicket {
        fence: fence.clone(),
        generation: fence.current_generation(),
    }
}

/// GPU-side ordering token (semaphore). Stateless from the CPU's view.
pub struct Semaphore {
    backend: Arc<dyn GpuBackend>,
    handle: SemaphoreHandle,
    label: String,
}

impl Semaphore {
    pub fn new(backend: Arc<dyn GpuBackend>, label: impl Into<String>) -> RhiResult<Self> {
        let label = label.into();
        let handle = backend.create_semaphore(&label)?;
        Ok(Self {
            backend,
            handle,
            label,
        })
    }

    #[inline]
    pub fn handle(&self) -> SemaphoreHandle {
        self.handle
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if let Err(e) = self.backend.destroy_semaphore(self.handle) {
            tracing::error!("Failed to destroy semaphore '{}': {}", self.label, e);
        }
    }
}

/// Fixed ring of ordering semaphores, handed out cyclically.
///
/// Capacity must cover every signal a frame can use times the number of
/// frames in flight: the frame-pacing fence guarantees all waiters on a
/// signal have been dispatched before the ring wraps back to it.
pub struct SemaphoreRing {
    signals: Vec<Semaphore>,
    cursor: AtomicUsize,
}

impl SemaphoreRing {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        capacity: usize,
        label_prefix: &str,
    ) -> RhiResult<Self> {
        let mut signals = Vec::with_capacity(capacity);
        for i in 0..capacity {
            signals.push(Semaphore::new(
                backend.clone(),
                format!("{}_{}", label_prefix, i),
            )?);
        }
        debug!("Created semaphore ring '{}' x{}", label_prefix, capacity);
        Ok(Self {
            signals,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Next semaphore in the cycle.
    pub fn next(&self) -> RhiResult<SemaphoreHandle> {
        if self.signals.is_empty() {
            return Err(RhiError::InvalidState(
                "semaphore ring is empty (context cleared?)".into(),
            ));
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.signals.len();
        Ok(self.signals[index].handle())
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.signals.len()
    }

    /// Drops every semaphore in the ring; used at teardown after the device
    /// has gone idle.
    pub fn clear(&mut self) {
        self.signals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{CompletionMode, SimBackend};

    fn backend() -> Arc<dyn GpuBackend> {
        Arc::new(SimBackend::new(CompletionMode::Manual))
    }

    #[test]
    fn test_fence_starts_unsignaled() {
        let fence = Fence::new(backend(), false, "test").unwrap();
        assert!(!fence.status().unwrap());
        assert!(!fence.is_submitted());
    }

    #[test]
    fn test_fence_pre_signaled() {
        let fence = Fence::new(backend(), true, "test").unwrap();
        assert!(fence.status().unwrap());
    }

    #[test]
    fn test_ticket_completes_on_reset() {
        let fence = Arc::new(Fence::new(backend(), false, "test").unwrap());
        let ticket = completion_ticket(&fence);
        assert!(!ticket.is_complete().unwrap());
        // A reset means the previous cycle's signal was observed and
        // consumed, so the ticket resolves complete even though the raw
        // status is unsignaled again.
        fence.reset().unwrap();
        assert!(ticket.is_complete().unwrap());
        assert!(!fence.status().unwrap());
    }

    #[test]
    fn test_ring_cycles() {
        let ring = SemaphoreRing::new(backend(), 3, "ring").unwrap();
        let a = ring.next().unwrap();
        let b = ring.next().unwrap();
        let c = ring.next().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, ring.next().unwrap());
    }

    #[test]
    fn test_fence_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Fence>();
        assert_send_sync::<Semaphore>();
        assert_send_sync::<SemaphoreRing>();
    }
}
