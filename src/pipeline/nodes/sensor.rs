//! SensorNode: the graph's frame source.
//!
//! Publishes the sensor properties of every request and produces the raw
//! frame. Without a hardware queue the base logic signals the outputs as
//! soon as execution returns. With one, the fences are handed to a queue
//! thread that signals them after the frame latency, strictly in
//! submission order.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fence::{FencePrimitive, FenceResult};
use crate::pipeline::id::{FenceHandle, RequestId};
use crate::pipeline::metadata::{tags, MetadataValue, TagQuery};
use crate::pipeline::node::{
    BufferNegotiable, DeactivateMode, ExecuteContext, RequestExecutable, StreamLifecycle,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default sensor mode. Requests may override exposure and gain through
/// their settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub exposure_ns: i64,
    pub gain: f64,
    pub frame_duration_ns: i64,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            exposure_ns: 10_000_000,
            gain: 1.0,
            frame_duration_ns: 33_333_333,
        }
    }
}

struct Submission {
    request: RequestId,
    fences: Vec<FenceHandle>,
    due: Instant,
    result: FenceResult,
}

/// Simulated hardware queue: one thread, FIFO.
struct HardwareQueue {
    tx: Option<Sender<Submission>>,
    handle: Option<JoinHandle<()>>,
}

impl HardwareQueue {
    fn start(name: &str, fences: Arc<dyn FencePrimitive>) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name(format!("{}-hwq", name))
            .spawn(move || queue_loop(rx, fences))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn submit(&self, submission: Submission) -> PipelineResult<()> {
        self.tx
            .as_ref()
            .ok_or(PipelineError::ChannelSend)?
            .send(submission)
            .map_err(|_| PipelineError::ChannelSend)
    }

    /// Let the queue finish what it holds, then join it.
    fn stop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Hardware queue thread panicked");
            }
        }
    }
}

impl Drop for HardwareQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn queue_loop(rx: Receiver<Submission>, fences: Arc<dyn FencePrimitive>) {
    while let Ok(sub) = rx.recv() {
        let now = Instant::now();
        if sub.due > now {
            std::thread::sleep(sub.due - now);
        }
        for fence in sub.fences {
            // A flushed request has its fences signaled already.
            if let Err(e) = fences.signal(fence, sub.result) {
                tracing::debug!("Request {} fence {:?} not signaled: {}", sub.request, fence, e);
            }
        }
    }
}

pub struct SensorNode {
    settings: SensorSettings,
    frame_latency: Option<Duration>,
    /// Every n-th frame completes with a failed fence.
    fail_every: Option<u64>,
    queue: Option<HardwareQueue>,
    frames: u64,
}

impl SensorNode {
    pub fn new() -> Self {
        Self {
            settings: SensorSettings::default(),
            frame_latency: None,
            fail_every: None,
            queue: None,
            frames: 0,
        }
    }

    pub fn with_settings(mut self, settings: SensorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Signal outputs from a queue thread `latency` after submission.
    pub fn with_hardware_queue(mut self, latency: Duration) -> Self {
        self.frame_latency = Some(latency);
        self
    }

    pub fn with_fault_injection(mut self, every: u64) -> Self {
        self.fail_every = (every > 0).then_some(every);
        self
    }

    pub fn settings(&self) -> &SensorSettings {
        &self.settings
    }

    /// Frames produced since stream on.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Start of frame `sync_id`, pinned at `i64::MAX` once it no longer fits.
    fn frame_timestamp(&self, sync_id: u64) -> i64 {
        i64::try_from(sync_id)
            .unwrap_or(i64::MAX)
            .saturating_mul(self.settings.frame_duration_ns)
    }

    fn frame_result(&self) -> FenceResult {
        match self.fail_every {
            Some(n) if self.frames % n == 0 => FenceResult::Failed,
            _ => FenceResult::Success,
        }
    }
}

impl Default for SensorNode {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferNegotiable for SensorNode {}

impl RequestExecutable for SensorNode {
    fn execute_process_request(&mut self, ctx: &mut ExecuteContext<'_>) -> PipelineResult<()> {
        let overrides = ctx.get_data_list(&[
            TagQuery::current(tags::SENSOR_EXPOSURE_NS),
            TagQuery::current(tags::SENSOR_GAIN),
        ]);
        let exposure = overrides[0]
            .as_ref()
            .and_then(MetadataValue::as_int)
            .unwrap_or(self.settings.exposure_ns);
        let gain = overrides[1]
            .as_ref()
            .and_then(MetadataValue::as_float)
            .unwrap_or(self.settings.gain);
        let timestamp = self.frame_timestamp(ctx.request().sync_id);
        ctx.write_data_list(&[
            (tags::SENSOR_EXPOSURE_NS, MetadataValue::Int(exposure)),
            (tags::SENSOR_GAIN, MetadataValue::Float(gain)),
            (tags::SENSOR_TIMESTAMP_NS, MetadataValue::Int(timestamp)),
            (
                tags::SENSOR_FRAME_DURATION_NS,
                MetadataValue::Int(self.settings.frame_duration_ns),
            ),
        ]);
        ctx.mark_partial_metadata_done();

        self.frames += 1;
        let result = self.frame_result();
        let Some(latency) = self.frame_latency else {
            if !result.is_success() {
                ctx.signal_all_outputs(result)?;
            }
            return Ok(());
        };

        if self.queue.is_none() {
            let queue = HardwareQueue::start(ctx.node_name(), ctx.fence_provider()).map_err(|e| {
                PipelineError::ResourceExhausted(format!("{} hardware queue: {}", ctx.node_name(), e))
            })?;
            self.queue = Some(queue);
        }
        if let Some(queue) = &self.queue {
            queue.submit(Submission {
                request: ctx.request_id(),
                fences: ctx.unsignaled_output_fences(),
                due: Instant::now() + latency,
                result,
            })?;
            ctx.mark_submitted();
        }
        Ok(())
    }
}

impl StreamLifecycle for SensorNode {
    fn on_stream_on(&mut self) -> PipelineResult<()> {
        self.frames = 0;
        tracing::info!(
            "Sensor streaming: exposure {} ns, gain {:.2}, frame {} ns",
            self.settings.exposure_ns,
            self.settings.gain,
            self.settings.frame_duration_ns
        );
        Ok(())
    }

    fn on_stream_off(&mut self, _mode: DeactivateMode) -> PipelineResult<()> {
        if let Some(mut queue) = self.queue.take() {
            queue.stop();
        }
        Ok(())
    }
}
