//! Command recording.
//!
//! A [`CommandBuffer`] is a single-writer recording session scoped to one
//! queue family: `begin` → record operations → `end` → submit, then back to
//! its pool once the GPU is done with it. Recording operations are
//! side-effecting appends to the buffer's command stream; nothing executes
//! until submission, and barriers are recorded exactly in caller order.
//!
//! [`CommandPool`] owns the backend pool the buffers of one family are
//! allocated from.

use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use tracing::info;

use crate::backend::{
    BufferBarrier, BufferCopy, BufferHandle, CommandBufferHandle, CommandPoolHandle, GpuBackend,
    ImageBarrier, ImageHandle, PipelineHandle, PipelineLayoutHandle, RenderTargets,
    ResourceSetHandle,
};
use crate::error::{RhiError, RhiResult};
use crate::pool::Poolable;
use crate::sync::CompletionTicket;

/// Recording lifecycle of a command buffer.
///
/// `Pending` covers the stretch from submission until the deferred return
/// completes; a buffer is never recorded into while pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordState {
    Initial,
    Recording,
    Executable,
    Pending,
}

/// Owner of the backend command pool for one queue family.
pub struct CommandPool {
    backend: Arc<dyn GpuBackend>,
    handle: CommandPoolHandle,
    family: u32,
    label: String,
}

impl CommandPool {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        family: u32,
        label: impl Into<String>,
    ) -> RhiResult<Self> {
        let label = label.into();
        let handle = backend.create_command_pool(family, &label)?;
        info!("Command pool '{}' created for queue family {}", label, family);
        Ok(Self {
            backend,
            handle,
            family,
            label,
        })
    }

    #[inline]
    pub fn handle(&self) -> CommandPoolHandle {
        self.handle
    }

    #[inline]
    pub fn family(&self) -> u32 {
        self.family
    }

    /// Allocates a fresh command buffer out of this pool.
    pub fn allocate(&self, label: impl Into<String>) -> RhiResult<CommandBuffer> {
        let label = label.into();
        let handle = self.backend.allocate_command_buffer(self.handle, &label)?;
        Ok(CommandBuffer {
            backend: self.backend.clone(),
            handle,
            family: self.family,
            label,
            state: Mutex::new(RecordState::Initial),
            in_flight: Mutex::new(None),
        })
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        if let Err(e) = self.backend.destroy_command_pool(self.handle) {
            tracing::error!("Failed to destroy command pool '{}': {}", self.label, e);
        } else {
            info!(
                "Command pool '{}' destroyed (queue family {})",
                self.label, self.family
            );
        }
    }
}

/// One GPU-command recording session.
///
/// Checkout from the pool gives logical exclusivity; the state machine
/// turns any concurrent or out-of-order use into an `InvalidState` error
/// instead of corrupting the stream.
pub struct CommandBuffer {
    backend: Arc<dyn GpuBackend>,
    handle: CommandBufferHandle,
    family: u32,
    label: String,
    state: Mutex<RecordState>,
    in_flight: Mutex<Option<CompletionTicket>>,
}

impl CommandBuffer {
    #[inline]
    pub fn handle(&self) -> CommandBufferHandle {
        self.handle
    }

    #[inline]
    pub fn family(&self) -> u32 {
        self.family
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> RecordState {
        *self.lock_state()
    }

    /// Opens the buffer for one-time-use recording.
    pub fn begin(&self) -> RhiResult<()> {
        let mut state = self.lock_state();
        match *state {
            RecordState::Initial => {}
            RecordState::Executable => {
                // Recorded but never submitted; start the recording over.
                self.backend.cmd_reset(self.handle)?;
            }
            RecordState::Recording => {
                return Err(RhiError::InvalidState(format!(
                    "'{}' is already recording",
                    self.label
                )));
            }
            RecordState::Pending => {
                return Err(RhiError::InvalidState(format!(
                    "'{}' has in-flight GPU work and cannot be recorded",
                    self.label
                )));
            }
        }
        self.backend.cmd_begin(self.handle)?;
        *state = RecordState::Recording;
        Ok(())
    }

    /// Closes recording; no further operations may be appended.
    pub fn end(&self) -> RhiResult<()> {
        let mut state = self.lock_state();
        if *state != RecordState::Recording {
            return Err(RhiError::InvalidState(format!(
                "'{}' is not recording, cannot end",
                self.label
            )));
        }
        self.backend.cmd_end(self.handle)?;
        *state = RecordState::Executable;
        Ok(())
    }

    pub fn begin_rendering(&self, targets: &RenderTargets) -> RhiResult<()> {
        self.recording()?;
        self.backend.cmd_begin_rendering(self.handle, targets)
    }

    pub fn end_rendering(&self) -> RhiResult<()> {
        self.recording()?;
        self.backend.cmd_end_rendering(self.handle)
    }

    pub fn bind_graphics_pipeline(&self, pipeline: PipelineHandle) -> RhiResult<()> {
        self.recording()?;
        self.backend
            .cmd_bind_pipeline(self.handle, vk::PipelineBindPoint::GRAPHICS, pipeline)
    }

    pub fn bind_compute_pipeline(&self, pipeline: PipelineHandle) -> RhiResult<()> {
        self.recording()?;
        self.backend
            .cmd_bind_pipeline(self.handle, vk::PipelineBindPoint::COMPUTE, pipeline)
    }

    pub fn bind_resources(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[ResourceSetHandle],
    ) -> RhiResult<()> {
        self.recording()?;
        self.backend
            .cmd_bind_resources(self.handle, bind_point, layout, first_set, sets)
    }

    pub fn draw(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.recording()?;
        self.backend.cmd_draw(
            self.handle,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        )
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.recording()?;
        self.backend.cmd_draw_indexed(
            self.handle,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        )
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.recording()?;
        self.backend.cmd_dispatch(self.handle, x, y, z)
    }

    pub fn pipeline_barrier(
        &self,
        image_barriers: &[ImageBarrier],
        buffer_barriers: &[BufferBarrier],
    ) -> RhiResult<()> {
        self.recording()?;
        self.backend
            .cmd_pipeline_barrier(self.handle, image_barriers, buffer_barriers)
    }

    pub fn copy_buffer(
        &self,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    ) -> RhiResult<()> {
        self.recording()?;
        self.backend.cmd_copy_buffer(self.handle, src, dst, regions)
    }

    pub fn copy_image(&self, src: ImageHandle, dst: ImageHandle) -> RhiResult<()> {
        self.recording()?;
        self.backend.cmd_copy_image(self.handle, src, dst)
    }

    /// Ties this buffer to the completion evidence of the submission it is
    /// part of. Recorded before dispatch so a deferred return can never
    /// observe the buffer as idle while the GPU still owns it.
    pub fn mark_in_flight(&self, ticket: CompletionTicket) {
        *self.lock_in_flight() = Some(ticket);
    }

    /// Transition to `Pending` at submission time; called by the queue.
    pub(crate) fn prepare_submit(&self, ticket: Option<CompletionTicket>) -> RhiResult<()> {
        let mut state = self.lock_state();
        if *state != RecordState::Executable {
            return Err(RhiError::InvalidState(format!(
                "'{}' submitted in {:?} state (must be ended first)",
                self.label, *state
            )));
        }
        if let Some(ticket) = ticket {
            *self.lock_in_flight() = Some(ticket);
        }
        *state = RecordState::Pending;
        Ok(())
    }

    fn recording(&self) -> RhiResult<()> {
        if *self.lock_state() != RecordState::Recording {
            return Err(RhiError::InvalidState(format!(
                "'{}' is not in the recording state",
                self.label
            )));
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<CompletionTicket>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Poolable for CommandBuffer {
    fn pool_key(&self) -> u64 {
        self.handle.id()
    }

    fn debug_label(&self) -> &str {
        &self.label
    }

    fn is_idle(&self) -> RhiResult<bool> {
        match self.lock_in_flight().as_ref() {
            None => Ok(true),
            Some(ticket) => ticket.is_complete(),
        }
    }

    fn wait_ready(&self) -> RhiResult<()> {
        let ticket = match self.lock_in_flight().as_ref() {
            None => return Ok(()),
            Some(ticket) => ticket.clone(),
        };
        while !ticket.is_complete()? {
            std::thread::yield_now();
        }
        Ok(())
    }

    fn recycle(&self) -> RhiResult<()> {
        *self.lock_in_flight() = None;
        let mut state = self.lock_state();
        if *state != RecordState::Initial {
            self.backend.cmd_reset(self.handle)?;
            *state = RecordState::Initial;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{CompletionMode, SimBackend};

    fn pool() -> (Arc<dyn GpuBackend>, CommandPool) {
        let backend: Arc<dyn GpuBackend> = Arc::new(SimBackend::new(CompletionMode::Immediate));
        let pool = CommandPool::new(backend.clone(), 0, "test_pool").unwrap();
        (backend, pool)
    }

    #[test]
    fn test_begin_twice_is_protocol_error() {
        let (_backend, pool) = pool();
        let cmd = pool.allocate("cmd").unwrap();
        cmd.begin().unwrap();
        assert!(matches!(cmd.begin(), Err(RhiError::InvalidState(_))));
    }

    #[test]
    fn test_recording_before_begin_is_protocol_error() {
        let (_backend, pool) = pool();
        let cmd = pool.allocate("cmd").unwrap();
        assert!(matches!(
            cmd.draw(3, 1, 0, 0),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_end_without_begin_is_protocol_error() {
        let (_backend, pool) = pool();
        let cmd = pool.allocate("cmd").unwrap();
        assert!(matches!(cmd.end(), Err(RhiError::InvalidState(_))));
    }

    #[test]
    fn test_recording_after_end_is_protocol_error() {
        let (_backend, pool) = pool();
        let cmd = pool.allocate("cmd").unwrap();
        cmd.begin().unwrap();
        cmd.draw(3, 1, 0, 0).unwrap();
        cmd.end().unwrap();
        assert!(matches!(
            cmd.dispatch(1, 1, 1),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_submit_of_unended_buffer_is_protocol_error() {
        let (_backend, pool) = pool();
        let cmd = pool.allocate("cmd").unwrap();
        cmd.begin().unwrap();
        assert!(matches!(
            cmd.prepare_submit(None),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_never_submitted_buffer_is_idle() {
        let (_backend, pool) = pool();
        let cmd = pool.allocate("cmd").unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        // Error path: recorded but never submitted; returnable immediately.
        assert!(cmd.is_idle().unwrap());
    }

    #[test]
    fn test_recycle_rewinds_state() {
        let (_backend, pool) = pool();
        let cmd = pool.allocate("cmd").unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        cmd.recycle().unwrap();
        assert_eq!(cmd.state(), RecordState::Initial);
        cmd.begin().unwrap();
    }

    #[test]
    fn test_command_buffer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CommandBuffer>();
    }
}
