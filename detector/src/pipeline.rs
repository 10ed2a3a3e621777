use bytes::Bytes;
use dropwatch_camera::{FrameSource, SourceError};
use dropwatch_common::config::Config;
use dropwatch_common::event::{unix_now_secs, ClientEvent, TriggerEvent};
use dropwatch_common::frame::{encode_jpeg, Frame, Region};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::annotate::annotate;
use crate::hub::BroadcastHub;
use crate::motion::{BackgroundModel, BlobDetector};
use crate::storage::TriggerSink;
use crate::trigger::{select_largest, Decision, PersistenceTracker};

const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(50);
const ITERATION_YIELD: Duration = Duration::from_millis(10);

/// Tunables for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub bg_learning_rate: f32,
    pub diff_threshold: u8,
    pub kernel_size: u32,
    pub min_area_ratio: f64,
    pub persistence_frames: u32,
    pub cooldown_secs: f64,
    pub crop_margin: u32,
    pub fps_limit: u32,
    pub stream_jpeg_quality: u8,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        let d = &config.detection;
        Self {
            bg_learning_rate: d.bg_learning_rate,
            diff_threshold: d.diff_threshold,
            kernel_size: d.kernel_size,
            min_area_ratio: d.min_area_ratio,
            persistence_frames: d.persistence_frames,
            cooldown_secs: d.cooldown_secs,
            crop_margin: d.crop_margin,
            fps_limit: config.stream.fps_limit,
            stream_jpeg_quality: config.stream.jpeg_quality,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Lets at most one frame through per `1 / fps` interval. Frames arriving
/// early are dropped rather than queued.
#[derive(Debug, Clone)]
pub struct FrameRateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl FrameRateLimiter {
    pub fn new(fps: u32) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / f64::from(fps.max(1))),
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a frame may be sent at `now`. Claims the slot when it returns
    /// `true`.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Totals reported when [`PipelineDriver::run`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub frames_processed: u64,
    pub triggers_fired: u64,
    pub frames_streamed: u64,
    pub snapshot_failures: u64,
}

/// What happened to a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub regions: Vec<Region>,
    /// Set when a trigger fired and its snapshot was persisted.
    pub triggered: Option<TriggerEvent>,
    pub streamed: bool,
}

/// Owns all per-stream detection state and runs the capture/detect/trigger
/// loop. Nothing in here is shared, so independent drivers can coexist.
pub struct PipelineDriver {
    settings: PipelineSettings,
    background: BackgroundModel,
    detector: BlobDetector,
    tracker: PersistenceTracker,
    limiter: FrameRateLimiter,
    hub: Arc<BroadcastHub>,
    sink: Arc<dyn TriggerSink>,
    summary: PipelineSummary,
}

impl PipelineDriver {
    pub fn new(
        settings: PipelineSettings,
        hub: Arc<BroadcastHub>,
        sink: Arc<dyn TriggerSink>,
    ) -> Self {
        Self {
            background: BackgroundModel::new(
                settings.bg_learning_rate,
                settings.diff_threshold,
                settings.kernel_size,
            ),
            detector: BlobDetector::new(settings.min_area_ratio),
            tracker: PersistenceTracker::new(settings.persistence_frames, settings.cooldown_secs),
            limiter: FrameRateLimiter::new(settings.fps_limit),
            settings,
            hub,
            sink,
            summary: PipelineSummary::default(),
        }
    }

    pub fn summary(&self) -> PipelineSummary {
        self.summary
    }

    pub fn tracker(&self) -> &PersistenceTracker {
        &self.tracker
    }

    /// Run one iteration on `frame`. `now` is wall-clock Unix seconds used
    /// for cooldowns and event timestamps; `mono` drives the stream rate
    /// limit.
    pub async fn process_frame(&mut self, frame: &Frame, now: f64, mono: Instant) -> FrameReport {
        self.summary.frames_processed += 1;

        let mask = self.background.update(frame);
        let regions = self.detector.detect(&mask, frame.area());

        let mut triggered = None;
        if self.tracker.step(&regions, now) == Decision::Fire {
            triggered = self.fire(frame, &regions, now).await;
        }

        let vis = annotate(frame, &regions);

        let mut streamed = false;
        if !self.hub.is_empty() && self.limiter.ready(mono) {
            match encode_jpeg(&vis, self.settings.stream_jpeg_quality) {
                Ok(jpeg) => {
                    self.hub.broadcast_binary(Bytes::from(jpeg));
                    self.summary.frames_streamed += 1;
                    streamed = true;
                }
                Err(e) => warn!(error = %e, seq = frame.seq, "failed to encode preview frame"),
            }
        }

        FrameReport {
            regions,
            triggered,
            streamed,
        }
    }

    async fn fire(&mut self, frame: &Frame, regions: &[Region], now: f64) -> Option<TriggerEvent> {
        let (w, h) = frame.dimensions();
        let whole = Region::new(0, 0, w, h);
        let target = select_largest(regions).unwrap_or(&whole);
        let crop = frame.crop_padded(target, self.settings.crop_margin);

        match self.sink.save(&crop, now).await {
            Ok(file) => {
                let event = TriggerEvent { file, ts: now };
                let delivered = self.hub.broadcast_json(&ClientEvent::from(event.clone()));
                self.summary.triggers_fired += 1;
                info!(
                    file = event.file,
                    area = target.area,
                    clients = delivered,
                    "trigger fired"
                );
                Some(event)
            }
            Err(e) => {
                self.summary.snapshot_failures += 1;
                error!(error = %e, area = target.area, "failed to persist trigger snapshot, event dropped");
                None
            }
        }
    }

    /// Pull frames from `source` until it is exhausted, fails permanently or
    /// `cancel` fires. Cancellation is only observed between iterations.
    pub async fn run(
        &mut self,
        source: &mut dyn FrameSource,
        cancel: CancellationToken,
    ) -> PipelineSummary {
        info!(source = source.name(), fps_limit = self.settings.fps_limit, "pipeline started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("pipeline cancelled");
                    break;
                }
                next = source.next_frame() => next,
            };

            match next {
                Ok(frame) => {
                    let report = self
                        .process_frame(&frame, unix_now_secs(), Instant::now())
                        .await;
                    if self.summary.frames_processed % 100 == 0 {
                        debug!(
                            total = self.summary.frames_processed,
                            regions = report.regions.len(),
                            "frames processed"
                        );
                    }
                }
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "frame source unavailable, retrying");
                    if sleep_or_cancel(TRANSIENT_RETRY_DELAY, &cancel).await {
                        break;
                    }
                    continue;
                }
                Err(SourceError::Closed) => {
                    info!("frame source exhausted");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "frame source failed permanently");
                    break;
                }
            }

            if sleep_or_cancel(ITERATION_YIELD, &cancel).await {
                break;
            }
        }

        info!(
            frames = self.summary.frames_processed,
            triggers = self.summary.triggers_fired,
            streamed = self.summary.frames_streamed,
            snapshot_failures = self.summary.snapshot_failures,
            "pipeline stopped"
        );
        self.summary
    }
}

/// Returns `true` if `cancel` fired before `delay` elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
