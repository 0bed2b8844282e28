//! Frame-protocol tests over the simulation backend: premature-reuse
//! protection, ordering-chain construction, the frames-in-flight bound and
//! the full cascade scenario end to end.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use ashframe_renderer::{FrameInfo, FrameOrchestrator, FrameStatus, OrchestratorDesc, RenderStage};
use ashframe_rhi::RhiResult;
use ashframe_rhi::backend::{PipelineHandle, QueueCaps};
use ashframe_rhi::command::CommandBuffer;
use ashframe_rhi::context::{ContextDesc, GraphicsResourceContext};
use ashframe_rhi::queue::SubmitRequest;
use ashframe_rhi::sim::{CompletionMode, SimBackend};

struct DrawStage {
    pipeline: PipelineHandle,
    name: &'static str,
}

impl RenderStage for DrawStage {
    fn label(&self) -> &str {
        self.name
    }

    fn record(&mut self, _frame: &FrameInfo, cmd: &CommandBuffer) -> RhiResult<()> {
        cmd.bind_graphics_pipeline(self.pipeline)?;
        cmd.draw(3, 1, 0, 0)
    }
}

struct Harness {
    sim: Arc<SimBackend>,
    ctx: Arc<GraphicsResourceContext>,
    orchestrator: FrameOrchestrator,
}

fn harness(mode: CompletionMode, cascade_count: u32) -> Harness {
    let sim = Arc::new(SimBackend::new(mode));
    let ctx = GraphicsResourceContext::init(sim.clone(), &ContextDesc::default()).unwrap();
    let swapchain = sim.create_swapchain(3, (1280, 720));
    let mut orchestrator = FrameOrchestrator::new(
        ctx.clone(),
        swapchain,
        &OrchestratorDesc {
            cascade_count,
            width: 1280,
            height: 720,
        },
    )
    .unwrap();

    if cascade_count > 0 {
        orchestrator
            .set_shadow_stage(Box::new(DrawStage {
                pipeline: sim.import_pipeline("shadow_pipeline"),
                name: "shadow",
            }))
            .unwrap();
    }
    orchestrator
        .add_stage(Box::new(DrawStage {
            pipeline: sim.import_pipeline("forward_pipeline"),
            name: "main",
        }))
        .unwrap();

    Harness {
        sim,
        ctx,
        orchestrator,
    }
}

#[test]
fn ordering_chain_links_every_dependent_batch() {
    // In a K-cascade frame, batch k+1 must wait on every signal batch k
    // produces, and presentation waits on the final batch's signal.
    let mut h = harness(CompletionMode::Immediate, 3);
    h.orchestrator.run_one_frame(0.016).unwrap();

    let submissions = h.sim.submissions();
    assert_eq!(submissions.len(), 4, "3 cascade batches + 1 main batch");

    for k in 0..submissions.len() - 1 {
        for signal in &submissions[k].signal_semaphores {
            assert!(
                submissions[k + 1].wait_semaphores.contains(signal),
                "batch {} does not wait on batch {}'s signal",
                k + 1,
                k
            );
        }
    }

    // The main batch additionally waits on the surface acquisition signal.
    let main = submissions.last().unwrap();
    assert_eq!(main.wait_semaphores.len(), 2);

    let presents = h.sim.presents();
    assert_eq!(presents.len(), 1);
    assert_eq!(presents[0].wait_semaphores, main.signal_semaphores);
}

#[test]
fn completion_fence_rides_the_final_batch_only() {
    let mut h = harness(CompletionMode::Immediate, 3);
    h.orchestrator.run_one_frame(0.016).unwrap();

    let submissions = h.sim.submissions();
    for batch in &submissions[..submissions.len() - 1] {
        assert!(batch.fence.is_none(), "intermediate batch carries a fence");
    }
    assert!(submissions.last().unwrap().fence.is_some());
}

#[test]
fn frames_in_flight_bound_blocks_the_extra_frame() {
    // With 2 frames in flight and no GPU completion, the third frame
    // must block on the slot fence instead of allocating a third
    // outstanding completion signal.
    let h = harness(CompletionMode::Manual, 0);
    let sim = h.sim.clone();
    let ctx = h.ctx.clone();
    let mut orchestrator = h.orchestrator;

    let (tx, rx) = mpsc::channel();
    let worker = std::thread::spawn(move || {
        for i in 0..3u32 {
            orchestrator.run_one_frame(0.016).unwrap();
            tx.send(i).unwrap();
        }
        orchestrator
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    // Frame 3 reuses slot 0 and must stall on its fence.
    assert!(
        rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "third frame ran without GPU completion"
    );
    assert_eq!(
        ctx.fences().all_len(),
        2,
        "an extra completion signal was allocated"
    );

    // Let the GPU "finish": the stalled frame must now complete promptly.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        sim.complete_all();
        match rx.recv_timeout(Duration::from_millis(20)) {
            Ok(2) => break,
            Ok(_) => continue,
            Err(_) => assert!(Instant::now() < deadline, "third frame never unblocked"),
        }
    }
    let orchestrator = worker.join().unwrap();
    assert_eq!(orchestrator.presented(), 3);

    // Retire the tail end so teardown does not wait on unfinished work.
    sim.complete_all();
    ctx.drain_pools().unwrap();
}

#[test]
fn returned_command_buffer_stays_out_until_completion() {
    // A submitted-and-returned buffer must not reappear before its
    // completion signal fires, and must reappear promptly after.
    let sim = Arc::new(SimBackend::new(CompletionMode::Manual));
    let ctx = GraphicsResourceContext::init(sim.clone(), &ContextDesc::default()).unwrap();

    let queue = ctx
        .acquire_queue(QueueCaps::GRAPHICS, 1)
        .unwrap();
    let cmd = ctx.acquire_command_buffer(queue.family()).unwrap();
    let key = cmd.handle().id();
    cmd.begin().unwrap();
    cmd.draw(3, 1, 0, 0).unwrap();
    cmd.end().unwrap();

    let fence = ctx.fences().acquire(|_| true).unwrap();
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
    ctx.release_command_buffer(&cmd).unwrap();

    // Completion is still outstanding: repeated checkouts must grow the
    // pool rather than hand the same buffer back.
    for _ in 0..5 {
        let other = ctx.acquire_command_buffer(queue.family()).unwrap();
        assert_ne!(other.handle().id(), key);
        ctx.release_command_buffer(&other).unwrap();
    }

    sim.complete_all();
    let family = ctx.family_command_pools(queue.family()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while family.buffers().pending_len() > 0 {
        family.buffers().check_futures().unwrap();
        assert!(Instant::now() < deadline, "deferred return never completed");
        std::thread::yield_now();
    }

    // Promptly available again.
    let recovered = family
        .buffers()
        .acquire(|c| c.handle().id() == key)
        .unwrap();
    assert_eq!(recovered.handle().id(), key);

    fence.wait().unwrap();
    ctx.fences().release(&fence).unwrap();
    ctx.release_queue(&queue).unwrap();
    ctx.release_command_buffer(&recovered).unwrap();
}

#[test]
fn e2e_ten_cascade_frames_stabilize() {
    // End-to-end scenario: 2 frames in flight, 3 cascades + 1 main batch,
    // 10 frames with immediate completion. Exactly 10 presents, zero
    // protocol errors, pool sizes stable after the first 2 frames.
    let mut h = harness(CompletionMode::Immediate, 3);

    for _ in 0..2 {
        assert_eq!(
            h.orchestrator.run_one_frame(0.016).unwrap(),
            FrameStatus::Continue
        );
    }
    let fences_after_warmup = h.ctx.fences().all_len();
    let cmds_after_warmup = h
        .ctx
        .family_command_pools(0)
        .unwrap()
        .buffers()
        .all_len();

    for _ in 2..10 {
        assert_eq!(
            h.orchestrator.run_one_frame(0.016).unwrap(),
            FrameStatus::Continue
        );
    }

    assert_eq!(h.sim.presents().len(), 10);
    assert_eq!(h.sim.submissions().len(), 40, "4 batches per frame");
    assert_eq!(h.ctx.fences().all_len(), fences_after_warmup);
    assert_eq!(
        h.ctx.family_command_pools(0).unwrap().buffers().all_len(),
        cmds_after_warmup,
        "command buffer pool kept growing"
    );
    assert_eq!(h.ctx.queues().all_len(), 7, "queue registry is immutable");

    h.orchestrator.shutdown().unwrap();
    h.ctx.clear().unwrap();
}

#[test]
fn out_of_date_present_surfaces_the_resize_error() {
    let mut h = harness(CompletionMode::Immediate, 1);
    h.sim.fail_next_presents(1);

    let err = h.orchestrator.run_one_frame(0.016).unwrap_err();
    assert!(matches!(err, ashframe_rhi::RhiError::SurfaceOutOfDate));
    assert_eq!(h.orchestrator.presented(), 0);

    // The resize path recovers the orchestrator; the (external) windowing
    // layer would recreate the swapchain and re-install it.
    h.orchestrator.resize(1024, 768).unwrap();
    h.orchestrator.run_one_frame(0.016).unwrap();
    assert_eq!(h.orchestrator.presented(), 1);
}

#[test]
fn out_of_date_acquire_surfaces_the_resize_error() {
    let mut h = harness(CompletionMode::Immediate, 0);
    h.sim.fail_next_acquires(1);

    let err = h.orchestrator.run_one_frame(0.016).unwrap_err();
    assert!(matches!(err, ashframe_rhi::RhiError::SurfaceOutOfDate));

    h.orchestrator.resize(800, 600).unwrap();
    h.orchestrator.run_one_frame(0.016).unwrap();
    assert_eq!(h.orchestrator.presented(), 1);
}

#[test]
fn cascade_count_is_a_runtime_parameter() {
    let mut h = harness(CompletionMode::Immediate, 2);
    h.orchestrator.run_one_frame(0.016).unwrap();
    assert_eq!(h.sim.submissions().len(), 3);

    h.orchestrator.set_cascade_count(5).unwrap();
    h.orchestrator.run_one_frame(0.016).unwrap();
    assert_eq!(h.sim.submissions().len(), 3 + 6);

    // A count the signal ring cannot cover is a configuration error.
    assert!(h.orchestrator.set_cascade_count(64).is_err());
}

#[test]
fn shutdown_then_clear_is_clean() {
    let mut h = harness(CompletionMode::Immediate, 3);
    for _ in 0..4 {
        h.orchestrator.run_one_frame(0.016).unwrap();
    }
    h.orchestrator.shutdown().unwrap();
    h.ctx.clear().unwrap();
    assert!(h.ctx.ordering_signal().is_err());
}
