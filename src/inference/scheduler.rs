//! Frame inference scheduler
//!
//! One scheduler serves every element sharing a model instance. Streaming
//! threads hand buffers to [`InferenceScheduler::transform_frame`], which
//! decides whether inference runs, queues the buffer and submits its
//! regions to the engine. Engines report completions on a channel drained
//! by a dispatcher thread, which post-processes the results and pushes
//! finished buffers downstream.
//!
//! # Ordering
//!
//! Buffers leave the output queue in the order they entered it. A buffer
//! whose inference finished early waits for all buffers queued before it.
//! The one exception is a blocked downstream: buffers of a blocked sink
//! are skipped for the current pass so other sinks sharing the scheduler
//! keep flowing, which makes ordering a per-sink guarantee.
//!
//! # Locking
//!
//! - `general` serializes buffer admission and flushing. It is released
//!   while waiting on a blocked sink or on the latency gate, and before
//!   anything is pushed downstream: a downstream element sharing the
//!   scheduler re-enters `transform_frame` on the same thread.
//! - `output` guards the output queue. It is never held while submitting
//!   to the engine or while pushing downstream.
//! - `push_lock` serializes push passes so buffers popped by one pass are
//!   pushed before the next pass starts. It is only ever try-locked. Every
//!   caller raises `repush` before trying; the holder keeps running passes
//!   until it finds the flag lowered after releasing the lock, so a caller
//!   finding the lock busy never loses its pass.

use super::element::ElementHandle;
use super::engine::{Completion, CompletionReceiver, CompletionSender, InferenceEngine, InferenceRequest, OutputBlobs};
use super::error::InferenceError;
use super::frame::{FrameId, InferenceFrame, OutputFrame};
use super::meta::{self, RegionResult};
use super::region::collect_regions;
use crate::common::{create_inference_message, InferenceSettings, SchedulingPolicy, CAT};
use gstreamer as gst;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Interval at which admission waits re-check their condition.
const WAIT_STEP: Duration = Duration::from_millis(10);
/// Upper bound for draining the engine and the output queue on flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceStatus {
    Executed,
    SkippedPerInterval,
    SkippedNoBlock,
}

/// What the element must do with the buffer it handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Nothing is queued; the buffer continues downstream right away.
    Passthrough,
    /// The scheduler owns a copy and pushes it later.
    Queued,
}

#[derive(Debug, Default)]
struct OutputQueue {
    frames: VecDeque<OutputFrame>,
    // Frames forced out by the failure path, regardless of their count.
    forced: HashSet<FrameId>,
    // Frames popped by a push pass and not yet pushed.
    pushing: bool,
}

pub struct InferenceScheduler {
    engine: Arc<dyn InferenceEngine>,
    general: Mutex<()>,
    output: Mutex<OutputQueue>,
    output_changed: Condvar,
    push_lock: Mutex<()>,
    repush: AtomicBool,
    in_flight: Mutex<usize>,
    in_flight_done: Condvar,
    next_id: AtomicU64,
    completions: CompletionSender,
}

impl InferenceScheduler {
    /// Creates a scheduler on top of `engine` and starts its completion
    /// dispatcher thread. The thread ends once the scheduler is dropped.
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Result<Arc<Self>, InferenceError> {
        let (completions, receiver) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            engine,
            general: Mutex::new(()),
            output: Mutex::new(OutputQueue::default()),
            output_changed: Condvar::new(),
            push_lock: Mutex::new(()),
            repush: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            in_flight_done: Condvar::new(),
            next_id: AtomicU64::new(0),
            completions,
        });

        let weak = Arc::downgrade(&scheduler);
        thread::Builder::new()
            .name("gva-completions".into())
            .spawn(move || dispatch_completions(weak, receiver))
            .map_err(|e| InferenceError::Engine(format!("failed to start completion dispatcher: {}", e)))?;

        Ok(scheduler)
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    /// Number of buffers waiting in the output queue.
    pub fn queued(&self) -> usize {
        self.output.lock().unwrap().frames.len()
    }

    /// Whether the output queue is empty and no push is in progress.
    pub fn is_drained(&self) -> bool {
        let queue = self.output.lock().unwrap();
        queue.frames.is_empty() && !queue.pushing
    }

    /// Number of submitted regions whose completion was not handled yet.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock().unwrap()
    }

    /// Admits one buffer of `element`
    ///
    /// Returns [`FrameDisposition::Passthrough`] when no inference is needed
    /// and nothing is queued ahead of the buffer. Otherwise a shallow copy
    /// of the buffer is queued and pushed from the completion path; the
    /// caller must drop its own reference.
    pub fn transform_frame(
        &self,
        element: &Arc<ElementHandle>,
        buffer: &gst::Buffer,
    ) -> Result<FrameDisposition, InferenceError> {
        let mut general = self.general.lock().unwrap();

        let video = element
            .video()
            .ok_or(InferenceError::InvalidState("video caps were not negotiated"))?;
        let settings = element.settings();
        let policy = settings.policy()?;

        let status = self.inference_status(element, &settings);
        let frame_num = element.next_frame_num();
        if frame_num == u64::MAX - 1 {
            gst::warning!(CAT, "Frame counter of <{}> is about to wrap", element.name());
        }
        let regions = match status {
            InferenceStatus::Executed => collect_regions(element, &settings, buffer, &video.info, frame_num),
            _ => Vec::new(),
        };
        let inference_count = regions.len();

        gst::trace!(
            CAT,
            "<{}> buffer {:?}: {:?} with {} regions",
            element.name(),
            buffer.pts(),
            status,
            inference_count
        );

        while element.sink().is_blocked() {
            gst::info!(CAT, "Wait on blocking output <{}>", element.sink().name());
            general = self.wait_step(general);
        }

        let mut queue = match policy {
            SchedulingPolicy::Throughput => self.output.lock().unwrap(),
            SchedulingPolicy::Latency => {
                let (g, q) = self.wait_latency(general, buffer.pts(), &settings);
                general = g;
                q
            }
        };

        if inference_count == 0 && queue.frames.is_empty() && !queue.pushing {
            return Ok(FrameDisposition::Passthrough);
        }

        let id = FrameId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let copy = buffer.copy();
        queue.frames.push_back(OutputFrame {
            id,
            buffer: copy.clone(),
            inference_count,
            element: element.clone(),
            inference_rois: Vec::new(),
        });
        drop(queue);

        if inference_count == 0 {
            drop(general);
            self.push_output();
            return Ok(FrameDisposition::Queued);
        }

        let frames = regions
            .into_iter()
            .map(|roi| InferenceFrame::new(id, copy.clone(), roi, element.clone(), video.info.clone()))
            .collect();
        let submitted = self.submit_images(frames);
        drop(general);

        if let Err(id) = submitted {
            self.push_frames_by_id(&[id]);
        }
        Ok(FrameDisposition::Queued)
    }

    fn inference_status(&self, element: &ElementHandle, settings: &InferenceSettings) -> InferenceStatus {
        let mut status = if element.interval_elapsed(settings.inference_interval) {
            InferenceStatus::Executed
        } else {
            InferenceStatus::SkippedPerInterval
        };
        if settings.no_block && self.engine.is_queue_full() {
            status = InferenceStatus::SkippedNoBlock;
        }
        if status == InferenceStatus::Executed {
            element.reset_interval();
        }
        status
    }

    /// Releases both locks for one bounded wait and re-acquires `general`.
    fn wait_step<'a>(&'a self, general: MutexGuard<'a, ()>) -> MutexGuard<'a, ()> {
        let queue = self.output.lock().unwrap();
        drop(general);
        drop(self.output_changed.wait_timeout(queue, WAIT_STEP).unwrap());
        self.general.lock().unwrap()
    }

    /// Holds back a buffer whose timestamp is later than everything queued
    /// while more frames are queued than the engine can have in flight.
    fn wait_latency<'a>(
        &'a self,
        mut general: MutexGuard<'a, ()>,
        pts: Option<gst::ClockTime>,
        settings: &InferenceSettings,
    ) -> (MutexGuard<'a, ()>, MutexGuard<'a, OutputQueue>) {
        let limit = self.engine.nireq().max(1)
            * self.engine.batch_size().max(1)
            * settings.inference_interval.max(1) as usize;

        loop {
            let queue = self.output.lock().unwrap();
            let latest = queue
                .frames
                .iter()
                .filter_map(|f| f.buffer.pts())
                .max()
                .unwrap_or(gst::ClockTime::ZERO);
            // Buffers without a timestamp sort after everything.
            let later = pts.map_or(true, |pts| pts > latest);
            if !later || queue.frames.len() <= limit {
                return (general, queue);
            }

            drop(general);
            drop(self.output_changed.wait_timeout(queue, WAIT_STEP).unwrap());
            general = self.general.lock().unwrap();
        }
    }

    /// Hands the regions of one buffer to the engine.
    ///
    /// Returns the buffer id when the engine refused a region; the caller
    /// forces that buffer out once it released `general`.
    fn submit_images(&self, frames: Vec<InferenceFrame>) -> Result<(), FrameId> {
        for frame in frames {
            let id = frame.output_id;
            *self.in_flight.lock().unwrap() += 1;
            let request = InferenceRequest {
                frame,
                completions: self.completions.clone(),
            };
            if let Err(err) = self.engine.submit(request) {
                gst::error!(CAT, "Failed to submit buffer {:?} to inference: {}", id, err);
                self.end_requests(1);
                return Err(id);
            }
        }
        Ok(())
    }

    fn end_requests(&self, count: usize) {
        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight = in_flight.saturating_sub(count);
        if *in_flight == 0 {
            self.in_flight_done.notify_all();
        }
    }

    fn handle_completion(&self, completion: Completion) {
        match completion {
            Completion::Done { blobs, frames } => self.inference_completion(blobs, frames),
            Completion::Failed { frames, error } => {
                gst::warning!(
                    CAT,
                    "Inference failed for {} regions, pushing their buffers as they are: {}",
                    frames.len(),
                    error
                );
                let count = frames.len();
                self.push_frames_if_inference_failed(frames);
                self.end_requests(count);
            }
        }
    }

    /// Handles a completed batch: runs post-processing, accounts the
    /// frames against their output buffers and pushes what became ready.
    ///
    /// Post-processing failures are logged; the buffers are pushed anyway.
    pub fn inference_completion(&self, blobs: OutputBlobs, mut frames: Vec<InferenceFrame>) {
        if frames.is_empty() {
            return;
        }
        let count = frames.len();

        let post_processor = frames[0].element.post_processor();
        if let Err(err) = post_processor.process(&blobs, &mut frames) {
            gst::error!(CAT, "Post-processing of {} regions failed: {}", count, err);
        }

        self.update_output_frames(frames);
        self.end_requests(count);
        self.push_output();
    }

    fn update_output_frames(&self, frames: Vec<InferenceFrame>) {
        let mut queue = self.output.lock().unwrap();
        for frame in frames {
            match queue.frames.iter_mut().find(|o| o.id == frame.output_id) {
                Some(output) if output.inference_count > 0 => {
                    output.inference_count -= 1;
                    output.inference_rois.push(frame);
                }
                Some(output) => gst::warning!(
                    CAT,
                    "Unexpected completion for buffer {:?} with no inference outstanding",
                    output.id
                ),
                None => gst::debug!(
                    CAT,
                    "Completion for buffer {:?} that already left the queue",
                    frame.output_id
                ),
            }
        }
    }

    /// Pushes the leading run of finished buffers downstream.
    pub fn push_output(&self) {
        self.repush.store(true, Ordering::SeqCst);
        loop {
            let guard = match self.push_lock.try_lock() {
                Ok(guard) => guard,
                // The holder sees the raised flag and runs another pass.
                Err(TryLockError::WouldBlock) => return,
                Err(TryLockError::Poisoned(err)) => err.into_inner(),
            };
            while self.repush.swap(false, Ordering::SeqCst) {
                self.push_pass();
            }
            drop(guard);

            if !self.repush.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    fn push_pass(&self) {
        let ready = {
            let mut queue = self.output.lock().unwrap();
            let ready = take_ready(&mut queue);
            if !ready.is_empty() {
                queue.pushing = true;
            }
            ready
        };
        if ready.is_empty() {
            return;
        }

        for frame in ready {
            self.push_buffer(frame);
        }

        let mut queue = self.output.lock().unwrap();
        queue.pushing = false;
        self.output_changed.notify_all();
    }

    /// Writes the results onto the buffer and pushes it, unless the
    /// element was stopped in the meantime.
    fn push_buffer(&self, frame: OutputFrame) {
        let OutputFrame {
            id,
            mut buffer,
            element,
            inference_rois,
            ..
        } = frame;
        let sink = element.sink().clone();
        if sink.is_stopped() {
            gst::debug!(CAT, "<{}> stopped, dropping buffer {:?}", element.name(), id);
            return;
        }

        // Release the region references first so the buffer is not copied again.
        let results: Vec<RegionResult> = inference_rois.into_iter().map(RegionResult::from).collect();
        let (width, height) = element
            .video()
            .map(|v| (v.info.width(), v.info.height()))
            .unwrap_or_default();
        {
            let buffer = buffer.make_mut();
            meta::attach_results(buffer, &results, width, height);

            if let Some(history) = element.history() {
                for result in &results {
                    let Some(object_id) = result.roi.object_id else {
                        continue;
                    };
                    for classification in &result.classifications {
                        history.update_roi_params(object_id, classification);
                    }
                }
                if history.reclassify_interval() != 1 {
                    history.fill_roi_params(buffer, &element.settings().object_classes());
                }
            }
        }

        if let Some((result_type, json)) = meta::results_json(&results) {
            sink.post_message(create_inference_message(
                "video",
                buffer.pts().unwrap_or(gst::ClockTime::ZERO),
                result_type,
                json,
            ));
        }

        if let Err(err) = sink.push(buffer) {
            gst::warning!(CAT, "Push of buffer {:?} to <{}> returned {:?}", id, sink.name(), err);
        }
    }

    /// Forces out the buffers owning `frames` after the engine failed to
    /// run them. Results already received for those buffers are kept.
    pub fn push_frames_if_inference_failed(&self, frames: Vec<InferenceFrame>) {
        let mut ids: Vec<FrameId> = frames.iter().map(|f| f.output_id).collect();
        ids.dedup();
        drop(frames);
        self.push_frames_by_id(&ids);
    }

    fn push_frames_by_id(&self, ids: &[FrameId]) {
        {
            let mut queue = self.output.lock().unwrap();
            for id in ids {
                if queue.frames.iter().any(|f| f.id == *id) {
                    queue.forced.insert(*id);
                }
            }
        }
        self.push_output();
    }

    /// Waits until the engine finished every submitted region, then drains
    /// the buffers queued so far. Buffers that still lack completions are
    /// forced out.
    pub fn flush_inference(&self) {
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        let flushed: HashSet<FrameId> = {
            let _general = self.general.lock().unwrap();
            self.engine.flush();
            self.output.lock().unwrap().frames.iter().map(|f| f.id).collect()
        };

        // Without `general`: completions push downstream, where an element
        // sharing this scheduler re-enters `transform_frame`.
        self.wait_in_flight(deadline);

        {
            let mut queue = self.output.lock().unwrap();
            let stuck = queue
                .frames
                .iter()
                .filter(|f| f.inference_count > 0 && flushed.contains(&f.id))
                .count();
            if stuck > 0 {
                gst::warning!(CAT, "Forcing out {} buffers still waiting for inference", stuck);
            }
            let ids: Vec<FrameId> = queue
                .frames
                .iter()
                .map(|f| f.id)
                .filter(|id| flushed.contains(id))
                .collect();
            queue.forced.extend(ids);
        }

        self.push_output();
        self.wait_drained(&flushed, deadline);
    }

    /// Pushes whatever the engine finished while the pipeline was paused.
    pub fn flush_outputs(&self) {
        self.push_output();
    }

    fn wait_in_flight(&self, deadline: Instant) {
        let mut in_flight = self.in_flight.lock().unwrap();
        while *in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                gst::warning!(CAT, "Timed out waiting for {} inference requests", *in_flight);
                return;
            }
            in_flight = self.in_flight_done.wait_timeout(in_flight, deadline - now).unwrap().0;
        }
    }

    fn wait_drained(&self, flushed: &HashSet<FrameId>, deadline: Instant) {
        let mut queue = self.output.lock().unwrap();
        while queue.pushing || queue.frames.iter().any(|f| flushed.contains(&f.id)) {
            let now = Instant::now();
            if now >= deadline {
                gst::warning!(CAT, "{} buffers still queued after flush", queue.frames.len());
                return;
            }
            queue = self.output_changed.wait_timeout(queue, WAIT_STEP).unwrap().0;
            if !queue.pushing && !queue.frames.is_empty() {
                drop(queue);
                self.push_output();
                queue = self.output.lock().unwrap();
            }
        }
    }
}

/// Removes the buffers a push pass may push, in queue order
///
/// Stops at the first buffer still waiting for inference, except for
/// buffers forced out by the failure path. Buffers of a blocked sink are
/// left in place for this pass while other sinks proceed.
fn take_ready(queue: &mut OutputQueue) -> Vec<OutputFrame> {
    let mut ready = Vec::new();
    let mut blocked: HashSet<String> = HashSet::new();
    let mut stalled = false;
    let mut i = 0;

    while i < queue.frames.len() {
        let frame = &queue.frames[i];
        if queue.forced.contains(&frame.id) {
            let id = frame.id;
            queue.forced.remove(&id);
            if let Some(frame) = queue.frames.remove(i) {
                ready.push(frame);
            }
            continue;
        }
        if stalled || frame.inference_count != 0 {
            stalled = true;
            i += 1;
            continue;
        }

        let name = frame.element.name().to_string();
        if blocked.contains(&name) || frame.element.sink().is_blocked() {
            blocked.insert(name);
            i += 1;
            continue;
        }
        if let Some(frame) = queue.frames.remove(i) {
            ready.push(frame);
        }
    }

    ready
}

fn dispatch_completions(scheduler: Weak<InferenceScheduler>, mut receiver: CompletionReceiver) {
    while let Some(completion) = receiver.blocking_recv() {
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        scheduler.handle_completion(completion);
    }
    gst::debug!(CAT, "Completion dispatcher finished");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::{ElementKind, InferenceRegion};
    use crate::inference::element::OutputSink;
    use crate::inference::engine::{CapsFeature, MemoryType};
    use crate::inference::post_process::PostProcessor;
    use gstreamer_video as gst_video;
    use std::sync::atomic::AtomicUsize;

    pub(crate) fn init() {
        use std::sync::Once;
        static INIT: Once = Once::new();

        INIT.call_once(|| {
            gst::init().unwrap();
        });
    }

    /// Engine keeping requests until the test completes them.
    #[derive(Default)]
    pub(crate) struct ManualEngine {
        pending: Mutex<Vec<InferenceRequest>>,
        memory: Option<MemoryType>,
        pub(crate) queue_full: AtomicBool,
        pub(crate) reject: AtomicBool,
    }

    impl ManualEngine {
        pub(crate) fn with_memory(memory: MemoryType) -> Self {
            Self {
                memory: Some(memory),
                ..Self::default()
            }
        }

        pub(crate) fn pending(&self) -> usize {
            self.pending.lock().unwrap().len()
        }

        pub(crate) fn has(&self, pts: u64) -> bool {
            self.pending
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.frame.buffer.pts() == Some(gst::ClockTime::from_nseconds(pts)))
        }

        fn take(&self, pts: u64) -> InferenceRequest {
            let mut pending = self.pending.lock().unwrap();
            let pos = pending
                .iter()
                .position(|r| r.frame.buffer.pts() == Some(gst::ClockTime::from_nseconds(pts)))
                .expect("request for pts");
            pending.remove(pos)
        }

        pub(crate) fn complete(&self, pts: u64) {
            let request = self.take(pts);
            let _ = request.completions.send(Completion::Done {
                blobs: OutputBlobs::new(),
                frames: vec![request.frame],
            });
        }

        /// Completes one region of each buffer in a single batch.
        pub(crate) fn complete_batch(&self, pts: &[u64]) {
            let requests: Vec<InferenceRequest> = pts.iter().map(|pts| self.take(*pts)).collect();
            let Some(completions) = requests.first().map(|r| r.completions.clone()) else {
                return;
            };
            let _ = completions.send(Completion::Done {
                blobs: OutputBlobs::new(),
                frames: requests.into_iter().map(|r| r.frame).collect(),
            });
        }

        pub(crate) fn fail(&self, pts: u64) {
            let request = self.take(pts);
            let _ = request.completions.send(Completion::Failed {
                frames: vec![request.frame],
                error: InferenceError::Engine("device lost".into()),
            });
        }
    }

    impl InferenceEngine for ManualEngine {
        fn submit(&self, request: InferenceRequest) -> Result<(), InferenceError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(InferenceError::Engine("rejected".into()));
            }
            self.pending.lock().unwrap().push(request);
            Ok(())
        }

        fn flush(&self) {
            for request in self.pending.lock().unwrap().drain(..) {
                let _ = request.completions.send(Completion::Done {
                    blobs: OutputBlobs::new(),
                    frames: vec![request.frame],
                });
            }
        }

        fn is_queue_full(&self) -> bool {
            self.queue_full.load(Ordering::SeqCst)
        }

        fn batch_size(&self) -> usize {
            1
        }

        fn nireq(&self) -> usize {
            1
        }

        fn memory_type(&self) -> MemoryType {
            self.memory.unwrap_or(MemoryType::System)
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        name: String,
        pub(crate) pushed: Mutex<Vec<gst::Buffer>>,
        pub(crate) blocked: AtomicBool,
        pub(crate) stopped: AtomicBool,
    }

    impl RecordingSink {
        pub(crate) fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ..Self::default()
            })
        }

        pub(crate) fn pts(&self) -> Vec<u64> {
            self.pushed
                .lock()
                .unwrap()
                .iter()
                .map(|b| b.pts().map_or(u64::MAX, |p| p.nseconds()))
                .collect()
        }
    }

    impl OutputSink for RecordingSink {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn is_blocked(&self) -> bool {
            self.blocked.load(Ordering::SeqCst)
        }

        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }

        fn push(&self, buffer: gst::Buffer) -> Result<gst::FlowSuccess, gst::FlowError> {
            self.pushed.lock().unwrap().push(buffer);
            Ok(gst::FlowSuccess::Ok)
        }
    }

    /// Post-processor counting invocations without producing results.
    #[derive(Default)]
    struct CountingPostProcessor {
        calls: AtomicUsize,
    }

    impl PostProcessor for CountingPostProcessor {
        fn process(&self, _blobs: &OutputBlobs, _frames: &mut [InferenceFrame]) -> Result<(), InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(InferenceError::PostProcessing("no output".into()))
        }
    }

    pub(crate) fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    pub(crate) fn element(name: &str, sink: Arc<RecordingSink>, settings: InferenceSettings) -> Arc<ElementHandle> {
        element_with_sink(name, sink, settings)
    }

    fn element_with_sink(name: &str, sink: Arc<dyn OutputSink>, settings: InferenceSettings) -> Arc<ElementHandle> {
        let handle = ElementHandle::builder(name, sink)
            .kind(ElementKind::Detect)
            .settings(settings)
            .post_processor(Arc::new(CountingPostProcessor::default()))
            .build();
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, 1024, 768)
            .build()
            .unwrap();
        handle.set_video(info, CapsFeature::SystemMemory);
        handle
    }

    fn buffer(pts: u64) -> gst::Buffer {
        let mut buffer = gst::Buffer::with_size(16).unwrap();
        buffer.get_mut().unwrap().set_pts(gst::ClockTime::from_nseconds(pts));
        buffer
    }

    fn buffer_with_rois(pts: u64, count: u32) -> gst::Buffer {
        let mut buffer = buffer(pts);
        {
            let buffer = buffer.get_mut().unwrap();
            for i in 0..count {
                gst_video::VideoRegionOfInterestMeta::add(buffer, "person", (10 + i * 100, 10, 50, 80));
            }
        }
        buffer
    }

    fn roi_list() -> InferenceSettings {
        InferenceSettings {
            inference_region: InferenceRegion::RoiList,
            ..InferenceSettings::default()
        }
    }

    /// Sink handing its buffers to a second element served by the same
    /// scheduler, on the pushing thread.
    #[derive(Default)]
    struct ChainedSink {
        next: Mutex<Option<(Arc<InferenceScheduler>, Arc<ElementHandle>)>>,
    }

    impl OutputSink for ChainedSink {
        fn name(&self) -> String {
            "chain".to_string()
        }

        fn is_blocked(&self) -> bool {
            false
        }

        fn is_stopped(&self) -> bool {
            false
        }

        fn push(&self, buffer: gst::Buffer) -> Result<gst::FlowSuccess, gst::FlowError> {
            let next = self.next.lock().unwrap().clone();
            let Some((scheduler, handle)) = next else {
                return Err(gst::FlowError::Flushing);
            };
            match scheduler.transform_frame(&handle, &buffer) {
                Ok(FrameDisposition::Passthrough) => handle.sink().push(buffer),
                Ok(FrameDisposition::Queued) => Ok(gst::FlowSuccess::Ok),
                Err(_) => Err(gst::FlowError::Error),
            }
        }
    }

    fn setup(settings: InferenceSettings) -> (Arc<ManualEngine>, Arc<InferenceScheduler>, Arc<RecordingSink>, Arc<ElementHandle>) {
        init();
        let engine = Arc::new(ManualEngine::default());
        let scheduler = InferenceScheduler::new(engine.clone()).unwrap();
        let sink = RecordingSink::named("sink0");
        let handle = element("detect0", sink.clone(), settings);
        (engine, scheduler, sink, handle)
    }

    #[test]
    fn out_of_order_completions_are_pushed_in_order() {
        let (engine, scheduler, sink, handle) = setup(InferenceSettings::default());

        for pts in 1..=3 {
            assert_eq!(
                scheduler.transform_frame(&handle, &buffer(pts)).unwrap(),
                FrameDisposition::Queued
            );
        }
        assert_eq!(engine.pending(), 3);
        assert_eq!(scheduler.queued(), 3);

        engine.complete(2);
        assert!(wait_for(|| scheduler.in_flight() == 2));
        thread::sleep(Duration::from_millis(50));
        assert!(sink.pts().is_empty());

        engine.complete(1);
        assert!(wait_for(|| sink.pts().len() == 2));
        assert_eq!(sink.pts(), vec![1, 2]);

        engine.complete(3);
        assert!(wait_for(|| sink.pts().len() == 3));
        assert_eq!(sink.pts(), vec![1, 2, 3]);
        assert_eq!(scheduler.queued(), 0);
    }

    #[test]
    fn buffers_without_inference_pass_through_an_empty_queue() {
        let settings = InferenceSettings {
            inference_region: InferenceRegion::RoiList,
            ..InferenceSettings::default()
        };
        let (engine, scheduler, sink, handle) = setup(settings);

        let disposition = scheduler.transform_frame(&handle, &buffer(1)).unwrap();

        assert_eq!(disposition, FrameDisposition::Passthrough);
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(engine.pending(), 0);
        assert!(sink.pts().is_empty());
    }

    #[test]
    fn skipped_buffers_wait_behind_pending_ones() {
        let settings = InferenceSettings {
            inference_interval: 2,
            ..InferenceSettings::default()
        };
        let (engine, scheduler, sink, handle) = setup(settings);

        for pts in 1..=4 {
            assert_eq!(
                scheduler.transform_frame(&handle, &buffer(pts)).unwrap(),
                FrameDisposition::Queued
            );
        }
        // Inference ran on buffers 1 and 3 only.
        assert_eq!(engine.pending(), 2);

        engine.complete(3);
        engine.complete(1);
        assert!(wait_for(|| sink.pts().len() == 4));
        assert_eq!(sink.pts(), vec![1, 2, 3, 4]);

        // Queue is empty again, skipped buffers pass straight through.
        assert_eq!(
            scheduler.transform_frame(&handle, &buffer(5)).unwrap(),
            FrameDisposition::Queued
        );
        engine.complete(5);
        assert!(wait_for(|| sink.pts().len() == 5 && scheduler.is_drained()));
        assert_eq!(
            scheduler.transform_frame(&handle, &buffer(6)).unwrap(),
            FrameDisposition::Passthrough
        );
    }

    #[test]
    fn no_block_skips_inference_while_engine_is_full() {
        let settings = InferenceSettings {
            no_block: true,
            ..InferenceSettings::default()
        };
        let (engine, scheduler, _sink, handle) = setup(settings);

        engine.queue_full.store(true, Ordering::SeqCst);
        assert_eq!(
            scheduler.transform_frame(&handle, &buffer(1)).unwrap(),
            FrameDisposition::Passthrough
        );
        engine.queue_full.store(false, Ordering::SeqCst);
        assert_eq!(
            scheduler.transform_frame(&handle, &buffer(2)).unwrap(),
            FrameDisposition::Queued
        );
        assert_eq!(engine.pending(), 1);
    }

    #[test]
    fn blocked_sink_does_not_hold_back_other_sinks() {
        let (engine, scheduler, sink_a, handle_a) = setup(InferenceSettings::default());
        let sink_b = RecordingSink::named("sink1");
        let handle_b = element("detect1", sink_b.clone(), InferenceSettings::default());

        scheduler.transform_frame(&handle_a, &buffer(1)).unwrap();
        scheduler.transform_frame(&handle_b, &buffer(2)).unwrap();

        sink_a.blocked.store(true, Ordering::SeqCst);
        engine.complete(1);
        engine.complete(2);

        assert!(wait_for(|| sink_b.pts() == vec![2]));
        assert!(sink_a.pts().is_empty());
        assert_eq!(scheduler.queued(), 1);

        sink_a.blocked.store(false, Ordering::SeqCst);
        scheduler.flush_outputs();
        assert!(wait_for(|| sink_a.pts() == vec![1]));
        assert!(wait_for(|| scheduler.is_drained()));
    }

    #[test]
    fn failed_inference_pushes_buffer_once() {
        let (engine, scheduler, sink, handle) = setup(InferenceSettings::default());

        scheduler.transform_frame(&handle, &buffer(1)).unwrap();
        scheduler.transform_frame(&handle, &buffer(2)).unwrap();

        engine.fail(2);
        assert!(wait_for(|| sink.pts() == vec![2]));

        engine.complete(1);
        assert!(wait_for(|| sink.pts().len() == 2));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.pts(), vec![2, 1]);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn rejected_submission_does_not_lose_the_buffer() {
        let (engine, scheduler, sink, handle) = setup(InferenceSettings::default());
        engine.reject.store(true, Ordering::SeqCst);

        assert_eq!(
            scheduler.transform_frame(&handle, &buffer(1)).unwrap(),
            FrameDisposition::Queued
        );

        assert_eq!(sink.pts(), vec![1]);
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn flush_drains_engine_and_queue() {
        let (engine, scheduler, sink, handle) = setup(InferenceSettings::default());

        for pts in 1..=3 {
            scheduler.transform_frame(&handle, &buffer(pts)).unwrap();
        }
        scheduler.flush_inference();

        assert_eq!(engine.pending(), 0);
        assert_eq!(sink.pts(), vec![1, 2, 3]);
        assert_eq!(scheduler.queued(), 0);
    }

    #[test]
    fn stopped_sink_drops_buffers() {
        let (engine, scheduler, sink, handle) = setup(InferenceSettings::default());

        scheduler.transform_frame(&handle, &buffer(1)).unwrap();
        sink.stopped.store(true, Ordering::SeqCst);
        engine.complete(1);

        assert!(wait_for(|| scheduler.queued() == 0));
        assert!(sink.pts().is_empty());
    }

    #[test]
    fn latency_policy_holds_back_later_buffers() {
        let settings = InferenceSettings {
            scheduling_policy: "latency".into(),
            ..InferenceSettings::default()
        };
        let (engine, scheduler, sink, handle) = setup(settings);

        scheduler.transform_frame(&handle, &buffer(1)).unwrap();
        scheduler.transform_frame(&handle, &buffer(2)).unwrap();

        let admitted = Arc::new(AtomicBool::new(false));
        let waiter = {
            let scheduler = scheduler.clone();
            let handle = handle.clone();
            let admitted = admitted.clone();
            thread::spawn(move || {
                scheduler.transform_frame(&handle, &buffer(3)).unwrap();
                admitted.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!admitted.load(Ordering::SeqCst));

        engine.complete(1);
        assert!(wait_for(|| admitted.load(Ordering::SeqCst)));
        waiter.join().unwrap();

        engine.complete(2);
        engine.complete(3);
        assert!(wait_for(|| sink.pts().len() == 3));
        assert_eq!(sink.pts(), vec![1, 2, 3]);
    }

    #[test]
    fn transform_requires_negotiated_caps() {
        init();
        let engine = Arc::new(ManualEngine::default());
        let scheduler = InferenceScheduler::new(engine).unwrap();
        let handle = ElementHandle::builder("detect0", RecordingSink::named("sink0")).build();

        let err = scheduler.transform_frame(&handle, &buffer(1)).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidState(_)));
    }

    #[test]
    fn partially_completed_buffer_is_forced_out_once() {
        let (engine, scheduler, sink, handle) = setup(roi_list());

        assert_eq!(
            scheduler.transform_frame(&handle, &buffer_with_rois(1, 3)).unwrap(),
            FrameDisposition::Queued
        );
        assert_eq!(engine.pending(), 3);

        engine.complete(1);
        assert!(wait_for(|| scheduler.in_flight() == 2));
        assert!(sink.pts().is_empty());

        engine.fail(1);
        assert!(wait_for(|| sink.pts() == vec![1]));
        assert_eq!(scheduler.queued(), 0);

        // The last region completes after its buffer left.
        engine.complete(1);
        assert!(wait_for(|| scheduler.in_flight() == 0));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.pts(), vec![1]);
        assert!(scheduler.is_drained());
    }

    #[test]
    fn batch_spanning_several_buffers_keeps_order() {
        let (engine, scheduler, sink, handle) = setup(InferenceSettings::default());

        for pts in 1..=3 {
            scheduler.transform_frame(&handle, &buffer(pts)).unwrap();
        }

        engine.complete_batch(&[3, 1]);
        assert!(wait_for(|| scheduler.in_flight() == 1));
        assert!(wait_for(|| sink.pts() == vec![1]));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.pts(), vec![1]);

        engine.complete(2);
        assert!(wait_for(|| sink.pts().len() == 3));
        assert_eq!(sink.pts(), vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_push_requests_are_not_lost() {
        const COUNT: u64 = 200;
        let (engine, scheduler, sink, handle) = setup(InferenceSettings::default());
        let passive_sink = RecordingSink::named("sink1");
        let passive = element("classify0", passive_sink.clone(), roi_list());

        let completer = {
            let engine = engine.clone();
            thread::spawn(move || {
                for pts in 0..COUNT {
                    assert!(wait_for(|| engine.has(pts)));
                    engine.complete(pts);
                }
            })
        };

        let mut passed_through = 0;
        for pts in 0..COUNT {
            scheduler.transform_frame(&handle, &buffer(pts)).unwrap();
            if scheduler.transform_frame(&passive, &buffer(10_000 + pts)).unwrap() == FrameDisposition::Passthrough {
                passed_through += 1;
            }
        }
        completer.join().unwrap();

        assert!(wait_for(|| scheduler.is_drained()));
        assert_eq!(sink.pts(), (0..COUNT).collect::<Vec<_>>());
        assert_eq!(passive_sink.pts().len() + passed_through, COUNT as usize);
    }

    #[test]
    fn downstream_element_sharing_the_scheduler_can_reenter() {
        init();
        let engine = Arc::new(ManualEngine::default());
        let scheduler = InferenceScheduler::new(engine.clone()).unwrap();
        let chain = Arc::new(ChainedSink::default());
        let upstream = element_with_sink("detect0", chain.clone(), InferenceSettings::default());
        let sink = RecordingSink::named("sink1");
        let downstream = element("classify0", sink.clone(), roi_list());
        *chain.next.lock().unwrap() = Some((scheduler.clone(), downstream));

        let done = Arc::new(AtomicBool::new(false));
        let streaming = {
            let engine = engine.clone();
            let scheduler = scheduler.clone();
            let done = done.clone();
            thread::spawn(move || {
                // A refused submission pushes from the streaming thread.
                engine.reject.store(true, Ordering::SeqCst);
                scheduler.transform_frame(&upstream, &buffer(1)).unwrap();
                engine.reject.store(false, Ordering::SeqCst);

                scheduler.transform_frame(&upstream, &buffer(2)).unwrap();
                scheduler.transform_frame(&upstream, &buffer(3)).unwrap();
                scheduler.flush_inference();
                done.store(true, Ordering::SeqCst);
            })
        };

        assert!(wait_for(|| done.load(Ordering::SeqCst)));
        streaming.join().unwrap();
        assert!(wait_for(|| scheduler.is_drained()));
        assert_eq!(sink.pts(), vec![1, 2, 3]);
    }
}
