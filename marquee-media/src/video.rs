//! # Video Pipeline - Decode Thread and Pacing
//!
//! One dedicated thread per playing video stream. Each loop iteration
//! either presents the frame whose time has come, decodes ahead into a
//! small bounded frame queue, or sleeps.
//!
//! Pacing is wall-clock: a frame is due at `pts * time_base` after
//! `play()`. Falling more than one tick behind walks a quality score
//! down, which maps to an ever more aggressive [`DecodePolicy`]; once
//! the policy discards everything, queued frames are dropped unpresented
//! until the stream is a full tick ahead of schedule again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::decode::{DecodeError, DecodePolicy, VideoPicture};
use crate::packet::{Packet, TimeBase};
use crate::pixel_convert;

/// Decode-ahead depth. Small on purpose: a deep queue only adds latency
/// between the quality feedback and its effect.
pub const MAX_FRAME_QUEUE: usize = 4;

// ============================================================================
// Video Stream Seam
// ============================================================================

/// The pipeline's view of a demuxed video stream
pub trait VideoStream: Send + Sync {
    fn time_base(&self) -> TimeBase;
    /// Aspect-corrected size presented frames are scaled to
    fn output_size(&self) -> (u32, u32);
    /// Next buffered packet, `None` if the queue is dry
    fn next_packet(&self) -> Option<Packet>;
    /// Pull one more packet from the container into the queues
    fn pump(&self) -> bool;
    /// Container exhausted, nothing more will arrive
    fn at_input_end(&self) -> bool;
    fn decode(
        &self,
        packet: &Packet,
        policy: DecodePolicy,
    ) -> Result<Option<VideoPicture>, DecodeError>;
    fn discard_queued(&self);
}

// ============================================================================
// Quality Gauge
// ============================================================================

/// Bounded quality score with its paired adjustment step.
///
/// Starts at 100/10. Every backlogged frame costs one step; idle
/// iterations with a full frame queue pay it back, shrinking the step
/// while any discard policy is active so recovery overshoots less.
#[derive(Debug, Clone)]
pub struct QualityGauge {
    score: i32,
    adjust: i32,
}

impl QualityGauge {
    pub fn new() -> Self {
        Self {
            score: 100,
            adjust: 10,
        }
    }

    pub fn score(&self) -> i32 {
        self.score
    }

    /// Discard rung for the current score
    pub fn policy(&self) -> DecodePolicy {
        DecodePolicy::from_score(self.score)
    }

    /// A frame came up more than one tick late
    pub fn backlog(&mut self) {
        self.score -= self.adjust;
    }

    /// The frame queue is full and nothing is due: decoding is keeping up
    pub fn recover(&mut self) {
        if self.policy() != DecodePolicy::Default && self.adjust > 1 {
            self.adjust -= 1;
        }

        if self.score <= -100 {
            // Stick at the lowest rate while actually discarding frames
            self.score = -100;
        } else if self.score < 100 {
            self.score += self.adjust;
        }
    }
}

impl Default for QualityGauge {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Pacer
// ============================================================================

/// What to do with the frame at the head of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadAction {
    /// Not due for a while yet, go manage the queue instead
    Defer,
    /// On schedule: sleep out the remainder, then present
    Hold(Duration),
    /// Slightly late, present immediately
    Present,
    /// More than a tick late, the score pays for it
    Backlogged,
    /// Discard mode is on and the deficit is still unpaid
    Discard,
}

/// Pacing decisions for the head frame, including the discard latch.
///
/// The latch engages when the decode policy bottoms out and releases
/// only once the head frame is a full tick ahead of schedule, so a
/// catch-up run completes instead of flapping on and off.
struct Pacer {
    tick_ns: i128,
    max_sleep_ns: i128,
    discarding: bool,
}

impl Pacer {
    fn new(tick: Duration) -> Self {
        let tick_ns = tick.as_nanos() as i128;
        Self {
            tick_ns,
            max_sleep_ns: tick_ns / 2,
            discarding: false,
        }
    }

    fn max_sleep(&self) -> Duration {
        Duration::from_nanos(self.max_sleep_ns as u64)
    }

    fn discarding(&self) -> bool {
        self.discarding
    }

    /// Latch discard mode while the policy discards everything
    fn engage(&mut self, bottomed: bool) {
        if bottomed {
            self.discarding = true;
        }
    }

    /// Classify the head frame by how far away its presentation time is.
    ///
    /// The release check runs before the schedule gate: a frame due a
    /// full tick in the future ends the catch-up run even when it is
    /// too early to present.
    fn classify(&mut self, wait_ns: i128) -> HeadAction {
        if self.discarding && wait_ns >= self.tick_ns {
            self.discarding = false;
        }

        if wait_ns >= self.max_sleep_ns {
            HeadAction::Defer
        } else if wait_ns < -self.tick_ns {
            HeadAction::Backlogged
        } else if self.discarding {
            HeadAction::Discard
        } else if wait_ns >= 0 {
            HeadAction::Hold(Duration::from_nanos(wait_ns as u64))
        } else {
            HeadAction::Present
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// State shared between the decode thread and the caller
struct Shared {
    run: AtomicBool,
    at_end: AtomicBool,
    /// Latest presented frame, taken by `tick()` on the caller's thread
    frame: Mutex<Option<Vec<u8>>>,
    displayed: AtomicU64,
    discarded: AtomicU64,
    score: AtomicI32,
    last_pts: AtomicI64,
    peak_queue: AtomicUsize,
}

/// Playback counters, queryable at any time
#[derive(Debug, Clone)]
pub struct VideoStats {
    pub displayed: u64,
    pub discarded: u64,
    pub quality_score: i32,
    /// Most recently presented pts in stream ticks
    pub last_pts: i64,
    /// Deepest the frame queue ever got
    pub peak_queue: usize,
}

// ============================================================================
// Video Pipeline
// ============================================================================

pub struct VideoPipeline {
    stream: Arc<dyn VideoStream>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl VideoPipeline {
    pub fn new(stream: Arc<dyn VideoStream>) -> Self {
        Self {
            stream,
            shared: Arc::new(Shared {
                run: AtomicBool::new(false),
                at_end: AtomicBool::new(false),
                frame: Mutex::new(None),
                displayed: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                score: AtomicI32::new(100),
                last_pts: AtomicI64::new(0),
                peak_queue: AtomicUsize::new(0),
            }),
            thread: None,
        }
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.stream.output_size()
    }

    /// Decode the first displayable frame synchronously so a poster frame
    /// is up before `play()`. Quality scoring is bypassed.
    pub fn preload(&self) {
        let (dst_w, dst_h) = self.stream.output_size();
        let mut rgba = Vec::new();
        loop {
            let Some(packet) = self.stream.next_packet() else {
                if self.stream.at_input_end() {
                    break;
                }
                self.stream.pump();
                continue;
            };

            match self.stream.decode(&packet, DecodePolicy::Default) {
                Ok(Some(picture)) => {
                    pixel_convert::i420_to_rgba(&picture, dst_w, dst_h, &mut rgba);
                    if !rgba.is_empty() {
                        self.shared.last_pts.store(picture.pts, Ordering::Relaxed);
                        *self.shared.frame.lock() = Some(rgba);
                    }
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("video preload decode failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Start the decode thread; the presentation clock starts now
    pub fn play(&mut self) {
        if self.thread.is_some() {
            return;
        }
        self.shared.run.store(true, Ordering::SeqCst);
        self.shared.at_end.store(false, Ordering::SeqCst);
        self.shared.displayed.store(0, Ordering::Relaxed);
        self.shared.discarded.store(0, Ordering::Relaxed);
        self.shared.score.store(100, Ordering::Relaxed);
        self.shared.peak_queue.store(0, Ordering::Relaxed);

        let stream = self.stream.clone();
        let shared = self.shared.clone();
        let started = Instant::now();
        self.thread = Some(thread::spawn(move || {
            decode_loop(stream.as_ref(), &shared, started);
        }));
    }

    /// Stop and join the decode thread, then flush buffered packets
    pub fn stop(&mut self) {
        self.shared.run.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("video decode thread panicked");
            }
        }
        self.stream.discard_queued();
        self.shared.at_end.store(false, Ordering::SeqCst);
        *self.shared.frame.lock() = None;
    }

    /// True once the thread has presented or dropped everything
    pub fn at_end(&self) -> bool {
        self.shared.at_end.load(Ordering::SeqCst)
    }

    /// Take the most recent presented frame, if a new one is up
    pub fn take_frame(&self) -> Option<Vec<u8>> {
        self.shared.frame.lock().take()
    }

    pub fn stats(&self) -> VideoStats {
        VideoStats {
            displayed: self.shared.displayed.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
            quality_score: self.shared.score.load(Ordering::Relaxed),
            last_pts: self.shared.last_pts.load(Ordering::Relaxed),
            peak_queue: self.shared.peak_queue.load(Ordering::Relaxed),
        }
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Decode Loop
// ============================================================================

fn decode_loop(stream: &dyn VideoStream, shared: &Shared, started: Instant) {
    let tick = stream.time_base().tick();
    let tick_ns = tick.as_nanos() as i128;
    let (dst_w, dst_h) = stream.output_size();

    let mut gauge = QualityGauge::new();
    let mut pacer = Pacer::new(tick);
    let mut queue: VecDeque<VideoPicture> = VecDeque::with_capacity(MAX_FRAME_QUEUE);
    let mut rgba = Vec::new();

    debug!("video decode thread started");
    while shared.run.load(Ordering::SeqCst) {
        let mut manage_queue = true;

        // Present a queued frame if its time is coming up
        if let Some(front_pts) = queue.front().map(|f| f.pts) {
            let wait_ns =
                front_pts as i128 * tick_ns - started.elapsed().as_nanos() as i128;

            let action = pacer.classify(wait_ns);
            if action != HeadAction::Defer {
                match action {
                    HeadAction::Backlogged => {
                        // Falling behind; start discarding once the
                        // policy bottoms out
                        gauge.backlog();
                        shared.score.store(gauge.score(), Ordering::Relaxed);
                        pacer.engage(gauge.policy().discards_everything());
                    }
                    HeadAction::Hold(wait) => thread::sleep(wait),
                    _ => {}
                }

                if let Some(picture) = queue.pop_front() {
                    if pacer.discarding() {
                        shared.discarded.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    pixel_convert::i420_to_rgba(&picture, dst_w, dst_h, &mut rgba);
                    shared.last_pts.store(picture.pts, Ordering::Relaxed);
                    *shared.frame.lock() = Some(std::mem::take(&mut rgba));
                    shared.displayed.fetch_add(1, Ordering::Relaxed);
                    manage_queue = false;
                }
            }
        }

        if !manage_queue {
            continue;
        }

        if queue.len() < MAX_FRAME_QUEUE {
            match stream.next_packet() {
                None => {
                    if !stream.at_input_end() {
                        stream.pump();
                    } else if queue.is_empty() {
                        // Container and queue both drained
                        break;
                    } else {
                        // Let the remaining queued frames play out
                        thread::sleep(pacer.max_sleep());
                    }
                }
                Some(packet) => match stream.decode(&packet, gauge.policy()) {
                    Ok(Some(picture)) => {
                        queue.push_back(picture);
                        if queue.len() > shared.peak_queue.load(Ordering::Relaxed) {
                            shared.peak_queue.store(queue.len(), Ordering::Relaxed);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("video decode error: {}", e),
                },
            }
        } else {
            // Full queue and nothing due: decoding is ahead, pay the
            // quality score back and sleep
            gauge.recover();
            shared.score.store(gauge.score(), Ordering::Relaxed);
            thread::sleep(pacer.max_sleep());
        }
    }

    shared.score.store(gauge.score(), Ordering::Relaxed);
    shared.at_end.store(true, Ordering::SeqCst);
    *shared.frame.lock() = None;

    debug!(
        "video decode thread ended: displayed={} discarded={} qscore={}",
        shared.displayed.load(Ordering::Relaxed),
        shared.discarded.load(Ordering::Relaxed),
        gauge.score()
    );
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const TICK_NS: u64 = 10_000_000; // 10 ms

    /// Deterministic in-memory stream: a fixed run of 2x2 frames with an
    /// optional simulated decode cost for the first `slow_frames` of them.
    struct StubVideo {
        packets: Mutex<VecDeque<Packet>>,
        slow_frames: i64,
        decode_cost: Duration,
    }

    impl StubVideo {
        fn new(frames: i64, slow_frames: i64, decode_cost: Duration) -> Self {
            let packets = (0..frames)
                .map(|pts| Packet {
                    stream_id: 1,
                    data: vec![0u8; 8],
                    pts,
                    keyframe: pts % 10 == 0,
                })
                .collect();
            Self {
                packets: Mutex::new(packets),
                slow_frames,
                decode_cost,
            }
        }
    }

    impl VideoStream for StubVideo {
        fn time_base(&self) -> TimeBase {
            TimeBase::from_nanos(TICK_NS)
        }

        fn output_size(&self) -> (u32, u32) {
            (2, 2)
        }

        fn next_packet(&self) -> Option<Packet> {
            self.packets.lock().pop_front()
        }

        fn pump(&self) -> bool {
            false
        }

        fn at_input_end(&self) -> bool {
            self.packets.lock().is_empty()
        }

        fn decode(
            &self,
            packet: &Packet,
            policy: DecodePolicy,
        ) -> Result<Option<VideoPicture>, DecodeError> {
            match policy {
                DecodePolicy::SkipAll => return Ok(None),
                DecodePolicy::SkipNonKey if !packet.keyframe => return Ok(None),
                _ => {}
            }
            if packet.pts < self.slow_frames {
                thread::sleep(self.decode_cost);
            }
            Ok(Some(VideoPicture {
                data: vec![128u8; 6], // 2x2 I420
                width: 2,
                height: 2,
                pts: packet.pts,
            }))
        }

        fn discard_queued(&self) {
            self.packets.lock().clear();
        }
    }

    fn wait_for_end(pipeline: &VideoPipeline) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !pipeline.at_end() {
            assert!(Instant::now() < deadline, "pipeline never reached end");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_gauge_thresholds_and_recovery() {
        let mut gauge = QualityGauge::new();
        assert_eq!(gauge.score(), 100);
        assert_eq!(gauge.policy(), DecodePolicy::Default);

        for _ in 0..3 {
            gauge.backlog();
        }
        assert_eq!(gauge.score(), 70);

        // Healthy region: recovery climbs back to 100 and holds
        for _ in 0..4 {
            gauge.recover();
        }
        assert_eq!(gauge.score(), 100);
        gauge.recover();
        assert_eq!(gauge.score(), 100);
    }

    #[test]
    fn test_gauge_sticks_at_discard_floor() {
        let mut gauge = QualityGauge::new();
        for _ in 0..21 {
            gauge.backlog();
        }
        assert_eq!(gauge.score(), -110);
        assert_eq!(gauge.policy(), DecodePolicy::SkipNonKey);

        gauge.recover();
        assert_eq!(gauge.score(), -100);
        for _ in 0..50 {
            gauge.recover();
        }
        // Pinned while frames are being discarded
        assert_eq!(gauge.score(), -100);
    }

    #[test]
    fn test_gauge_adjust_decays_only_under_discard() {
        let mut gauge = QualityGauge::new();
        gauge.backlog(); // 90, policy Default
        gauge.recover();
        assert_eq!(gauge.score(), 100); // step still 10

        let mut gauge = QualityGauge::new();
        for _ in 0..11 {
            gauge.backlog(); // -10, policy SkipNonRef
        }
        gauge.recover(); // step decays to 9 first
        assert_eq!(gauge.score(), -1);
    }

    #[test]
    fn test_pacer_schedule_classification() {
        let mut pacer = Pacer::new(Duration::from_millis(10));

        // Half a tick out or more: not due yet
        assert_eq!(pacer.classify(ms(5)), HeadAction::Defer);
        assert_eq!(pacer.classify(ms(500)), HeadAction::Defer);
        // Inside the window: sleep out the remainder
        assert_eq!(pacer.classify(ms(3)), HeadAction::Hold(Duration::from_millis(3)));
        // Less than a tick late: show it anyway
        assert_eq!(pacer.classify(ms(-9)), HeadAction::Present);
        // More than a tick late
        assert_eq!(pacer.classify(ms(-11)), HeadAction::Backlogged);
    }

    #[test]
    fn test_pacer_latch_holds_until_a_full_tick_ahead() {
        let mut pacer = Pacer::new(Duration::from_millis(10));
        assert!(!pacer.discarding());
        pacer.engage(false);
        assert!(!pacer.discarding());
        pacer.engage(true);
        assert!(pacer.discarding());

        // On-time and slightly-late frames are still dropped while the
        // deficit stands
        assert_eq!(pacer.classify(ms(0)), HeadAction::Discard);
        assert_eq!(pacer.classify(ms(4)), HeadAction::Discard);
        assert_eq!(pacer.classify(ms(-5)), HeadAction::Discard);
        // Deep backlog keeps charging the score
        assert_eq!(pacer.classify(ms(-20)), HeadAction::Backlogged);
        assert!(pacer.discarding());

        // A frame due a full tick out releases the latch even though it
        // is too early to present
        assert_eq!(pacer.classify(ms(12)), HeadAction::Defer);
        assert!(!pacer.discarding());
        assert_eq!(
            pacer.classify(ms(3)),
            HeadAction::Hold(Duration::from_millis(3))
        );
    }

    #[test]
    fn test_pacer_release_at_exactly_one_tick() {
        let mut pacer = Pacer::new(Duration::from_millis(10));
        pacer.engage(true);
        pacer.classify(ms(10));
        assert!(!pacer.discarding());
    }

    fn ms(v: i64) -> i128 {
        i128::from(v) * 1_000_000
    }

    #[test]
    fn test_smooth_playback_presents_everything() {
        let stream = Arc::new(StubVideo::new(30, 0, Duration::ZERO));
        let mut pipeline = VideoPipeline::new(stream);
        pipeline.play();
        wait_for_end(&pipeline);

        let stats = pipeline.stats();
        assert!(stats.displayed + stats.discarded <= 30);
        assert!(stats.displayed > 0);
        assert!(stats.peak_queue <= MAX_FRAME_QUEUE);
    }

    #[test]
    fn test_slow_decode_drops_frames_and_catches_up() {
        // First 15 frames cost 2.5 ticks each to decode: hopelessly behind
        let stream = Arc::new(StubVideo::new(40, 15, Duration::from_millis(25)));
        let mut pipeline = VideoPipeline::new(stream);
        pipeline.play();
        wait_for_end(&pipeline);

        let stats = pipeline.stats();
        assert!(stats.discarded > 0, "expected dropped frames: {stats:?}");
        assert!(stats.quality_score < 100, "score never moved: {stats:?}");
        assert!(stats.displayed >= 1);
        assert!(stats.peak_queue <= MAX_FRAME_QUEUE);
    }

    #[test]
    fn test_presentation_order_is_monotonic() {
        let stream = Arc::new(StubVideo::new(50, 0, Duration::ZERO));
        let mut pipeline = VideoPipeline::new(stream);
        pipeline.play();

        let mut last = -1i64;
        while !pipeline.at_end() {
            let pts = pipeline.stats().last_pts;
            assert!(pts >= last, "pts went backwards: {pts} < {last}");
            last = pts;
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_stop_joins_and_clears() {
        let stream = Arc::new(StubVideo::new(500, 0, Duration::ZERO));
        let mut pipeline = VideoPipeline::new(stream.clone());
        pipeline.play();
        thread::sleep(Duration::from_millis(30));
        pipeline.stop();

        assert!(!pipeline.at_end());
        assert!(pipeline.take_frame().is_none());
        assert!(stream.packets.lock().is_empty()); // flushed

        // Stop twice is harmless
        pipeline.stop();
    }

    #[test]
    fn test_preload_publishes_poster_frame() {
        let stream = Arc::new(StubVideo::new(10, 0, Duration::ZERO));
        let pipeline = VideoPipeline::new(stream);
        pipeline.preload();

        let frame = pipeline.take_frame().expect("poster frame");
        assert_eq!(frame.len(), 2 * 2 * 4);
        // Taking it empties the slot until the next present
        assert!(pipeline.take_frame().is_none());
    }
}
