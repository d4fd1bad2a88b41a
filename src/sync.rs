//! Single-slot hand-off between a vendor callback thread and a pulling consumer.
//!
//! The producer side (`FrameSynchronizer::producer`) runs on the pipeline's
//! thread. Framesets overwrite one pending slot; every overwrite before the
//! consumer reads counts as a drop. Motion samples bypass the slot and go
//! straight to the registered handlers.
//!
//! All frame state lives behind one mutex with one condition variable. The
//! consumer re-checks the ready flag in a loop, so spurious wakeups are
//! harmless. Alignment runs after the lock is released.
//!
//! Motion handlers have their own lock, held only long enough to snapshot the
//! list; handlers run with no lock held.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::device::MotionHandler;
use crate::frame::{ColorImage, DepthImage, MotionSample};
use crate::ingest::pipeline::{
    Frameset, PipelineUnit, StreamData, StreamKind, StreamProfile, UnitCallback,
};

/// Framesets closer than this to the last accepted one are duplicates (seconds).
pub const DUPLICATE_EPSILON_SECS: f64 = 0.001;

/// Re-projects depth onto the pixel grid of a target stream.
///
/// Only the resolution is reconciled (nearest-neighbour resampling); both
/// streams are assumed to share an optical centre.
#[derive(Debug, PartialEq)]
pub struct Alignment {
    target: StreamKind,
    target_id: u32,
    depth_id: u32,
}

impl Alignment {
    /// Choose the stream depth should be aligned to: colour when present,
    /// otherwise any other video stream. Fails without depth or a counterpart.
    pub fn for_profiles<'a>(profiles: impl IntoIterator<Item = &'a StreamProfile>) -> Result<Self> {
        let video: Vec<&StreamProfile> = profiles
            .into_iter()
            .filter(|profile| !profile.kind.is_motion())
            .collect();
        let depth = video
            .iter()
            .find(|profile| profile.kind == StreamKind::Depth)
            .ok_or_else(|| anyhow!("no depth stream in the active profile"))?;
        let target = video
            .iter()
            .find(|profile| profile.kind == StreamKind::Color)
            .or_else(|| video.iter().find(|profile| profile.kind != StreamKind::Depth))
            .ok_or_else(|| anyhow!("no stream to align depth to"))?;
        Ok(Self {
            target: target.kind,
            target_id: target.unique_id,
            depth_id: depth.unique_id,
        })
    }

    pub fn target(&self) -> StreamKind {
        self.target
    }

    /// Target stream image resampled to `width` x `height`.
    pub fn color(&self, frameset: &Frameset, width: u32, height: u32) -> Result<ColorImage> {
        let frame = frameset
            .frames
            .iter()
            .find(|frame| frame.profile.unique_id == self.target_id)
            .ok_or_else(|| anyhow!("frameset lacks the {:?} stream", self.target))?;
        match &frame.data {
            StreamData::Bgr8(image) => resample_color(image, width, height),
            StreamData::Z16(_) => Err(anyhow!("{:?} stream carries depth data", self.target)),
        }
    }

    /// Co-registered colour and depth at `width` x `height`.
    pub fn process(
        &self,
        frameset: &Frameset,
        width: u32,
        height: u32,
    ) -> Result<(ColorImage, DepthImage)> {
        let color = self.color(frameset, width, height)?;
        let frame = frameset
            .frames
            .iter()
            .find(|frame| frame.profile.unique_id == self.depth_id)
            .ok_or_else(|| anyhow!("frameset lacks the depth stream"))?;
        let depth = match &frame.data {
            StreamData::Z16(depth) => resample_depth(depth, width, height)?,
            StreamData::Bgr8(_) => return Err(anyhow!("depth stream carries colour data")),
        };
        Ok((color, depth))
    }
}

fn source_index(out: u32, out_len: u32, src_len: u32) -> usize {
    (u64::from(out) * u64::from(src_len) / u64::from(out_len)) as usize
}

fn resample_color(image: &ColorImage, width: u32, height: u32) -> Result<ColorImage> {
    if (image.width, image.height) == (width, height) {
        return Ok(image.clone());
    }
    if image.is_empty() || width == 0 || height == 0 {
        return Err(anyhow!("cannot resample an empty image"));
    }
    let channels = ColorImage::CHANNELS;
    let src = image.as_bytes();
    let mut data = Vec::with_capacity(width as usize * height as usize * channels);
    for y in 0..height {
        let row = source_index(y, height, image.height) * image.width as usize;
        for x in 0..width {
            let offset = (row + source_index(x, width, image.width)) * channels;
            data.extend_from_slice(&src[offset..offset + channels]);
        }
    }
    ColorImage::new(width, height, data)
}

fn resample_depth(depth: &DepthImage, width: u32, height: u32) -> Result<DepthImage> {
    if (depth.width, depth.height) == (width, height) {
        return Ok(depth.clone());
    }
    if depth.is_empty() || width == 0 || height == 0 {
        return Err(anyhow!("cannot resample an empty depth image"));
    }
    let src = depth.samples();
    let mut data = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        let row = source_index(y, height, depth.height) * depth.width as usize;
        for x in 0..width {
            data.push(src[row + source_index(x, width, depth.width)]);
        }
    }
    DepthImage::new(width, height, data)
}

/// Counters since the synchronizer was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub consumed: u64,
    pub dropped: u64,
}

struct SlotState {
    last_frameset: Option<Frameset>,
    image_ready: bool,
    last_timestamp: f64,
    /// Framesets stored since the last read; the consumer reports one less.
    pending_count: u64,
    profile_ids: Vec<u32>,
    alignment: Option<Arc<Alignment>>,
    failure: Option<String>,
    cancelled: bool,
    stats: SyncStats,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            last_frameset: None,
            image_ready: false,
            last_timestamp: -1.0,
            pending_count: 0,
            profile_ids: Vec::new(),
            alignment: None,
            failure: None,
            cancelled: false,
            stats: SyncStats::default(),
        }
    }
}

struct Shared {
    slot: Mutex<SlotState>,
    frame_ready: Condvar,
    motion_handlers: Mutex<Vec<SharedMotionHandler>>,
}

type SharedMotionHandler = Arc<dyn Fn(MotionSample) + Send + Sync>;

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // The vendor thread cannot propagate errors; keep serving after a panic.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, unit: PipelineUnit) {
        match unit {
            PipelineUnit::Motion(sample) => self.dispatch_motion(sample),
            PipelineUnit::Frameset(frameset) => self.store_frameset(frameset),
        }
    }

    fn dispatch_motion(&self, sample: MotionSample) {
        let handlers = self
            .motion_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in &handlers {
            handler(sample);
        }
    }

    fn store_frameset(&self, frameset: Frameset) {
        let timestamp = frameset.timestamp_secs();
        let mut state = self.lock();
        if state.failure.is_some() || state.cancelled {
            return;
        }
        if (timestamp - state.last_timestamp).abs() < DUPLICATE_EPSILON_SECS {
            state.stats.duplicates += 1;
            log::trace!("FrameSynchronizer: duplicate frameset at {:.6}s", timestamp);
            return;
        }
        if timestamp < state.last_timestamp {
            log::debug!(
                "FrameSynchronizer: discarding stale frameset at {:.6}s (last {:.6}s)",
                timestamp,
                state.last_timestamp
            );
            return;
        }

        let profile_ids: Vec<u32> = frameset
            .profiles()
            .filter(|profile| !profile.kind.is_motion())
            .map(|profile| profile.unique_id)
            .collect();
        if profile_ids != state.profile_ids {
            // Drop the old alignment before building the new one.
            state.alignment = None;
            match Alignment::for_profiles(frameset.profiles()) {
                Ok(alignment) => {
                    log::info!(
                        "FrameSynchronizer: stream profile changed, aligning depth to {:?}",
                        alignment.target()
                    );
                    state.alignment = Some(Arc::new(alignment));
                    state.profile_ids = profile_ids;
                }
                Err(err) => {
                    log::error!("FrameSynchronizer: session failed: {}", err);
                    state.failure = Some(err.to_string());
                    state.last_frameset = None;
                    state.image_ready = false;
                    drop(state);
                    self.frame_ready.notify_all();
                    return;
                }
            }
        }

        state.last_frameset = Some(frameset);
        state.last_timestamp = timestamp;
        state.pending_count += 1;
        state.image_ready = true;
        state.stats.accepted += 1;
        drop(state);
        self.frame_ready.notify_one();
    }
}

/// A frameset taken from the slot, paired with the alignment installed with it.
pub struct PendingFrame {
    pub frameset: Frameset,
    /// Seconds.
    pub timestamp: f64,
    /// Framesets overwritten since the previous read.
    pub dropped: u64,
    pub alignment: Arc<Alignment>,
}

/// Releases a consumer blocked in `FrameSynchronizer::next_frame`.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    pub fn cancel(&self) {
        let mut state = self.shared.lock();
        state.cancelled = true;
        drop(state);
        self.shared.frame_ready.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub struct FrameSynchronizer {
    shared: Arc<Shared>,
}

impl Default for FrameSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSynchronizer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(SlotState::default()),
                frame_ready: Condvar::new(),
                motion_handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Callback to hand to the pipeline.
    pub fn producer(&self) -> UnitCallback {
        let shared = self.shared.clone();
        Arc::new(move |unit| shared.deliver(unit))
    }

    pub fn subscribe_motion(&self, handler: MotionHandler) {
        self.shared
            .motion_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::from(handler));
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            shared: self.shared.clone(),
        }
    }

    pub fn failure(&self) -> Option<String> {
        self.shared.lock().failure.clone()
    }

    pub fn stats(&self) -> SyncStats {
        self.shared.lock().stats
    }

    /// Block until a frameset is pending and take it.
    ///
    /// `None` when the wait timed out, the token was cancelled, or the session
    /// failed. Without a timeout the wait only ends on delivery, cancellation
    /// or failure.
    pub fn next_frame(&self, timeout: Option<Duration>) -> Option<PendingFrame> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.lock();
        loop {
            if state.cancelled || state.failure.is_some() {
                return None;
            }
            if state.image_ready {
                break;
            }
            state = match deadline {
                None => self
                    .shared
                    .frame_ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        log::debug!("FrameSynchronizer: timed out waiting for a frameset");
                        return None;
                    }
                    self.shared
                        .frame_ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        state.image_ready = false;
        let frameset = state.last_frameset.take()?;
        let alignment = state.alignment.clone()?;
        let timestamp = state.last_timestamp;
        let dropped = state.pending_count.saturating_sub(1);
        state.pending_count = 0;
        state.stats.consumed += 1;
        state.stats.dropped += dropped;
        drop(state);

        if dropped > 0 {
            log::warn!(
                "FrameSynchronizer: {} frameset(s) dropped before {:.6}s",
                dropped,
                timestamp
            );
        }
        Some(PendingFrame {
            frameset,
            timestamp,
            dropped,
            alignment,
        })
    }
}
