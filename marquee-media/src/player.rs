//! # Player - Playback Controller
//!
//! Owns one opened source and up to one pipeline per stream kind, and
//! exposes the surface the frontend drives: `open`, `play`, `tick` once
//! per rendered frame, `stop`, `close`.
//!
//! The display surface and audio output are caller-supplied trait
//! objects; the player never touches a window or an audio device itself.

use std::io::{Read, Seek};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::audio::{AudioPipeline, AudioPump};
use crate::decode::DecoderPreference;
use crate::io::{self, ByteSource};
use crate::source::{AudioFeed, MediaError, MediaInfo, MediaSource, OpenOptions, VideoFeed};
use crate::video::{VideoPipeline, VideoStats};

// ============================================================================
// Output Seams
// ============================================================================

/// Where presented frames go, driven from the caller's thread in `tick`
pub trait VideoSurface: Send {
    /// Called once per open with the aspect-corrected display size
    fn prepare(&mut self, width: u32, height: u32);
    /// Tightly packed RGBA at the prepared size
    fn upload(&mut self, rgba: &[u8]);
}

/// External audio output.
///
/// Gets an [`AudioPump`] at configure time and pulls from it on its own
/// thread; the pump must be pulled from one thread at a time.
pub trait AudioSink: Send {
    fn configure(&mut self, channels: u16, sample_rate: u32, pump: AudioPump);
    fn start(&mut self);
    fn stop(&mut self);
    fn is_active(&self) -> bool;
}

/// Sink for callers without an audio device
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn configure(&mut self, _channels: u16, _sample_rate: u32, _pump: AudioPump) {}
    fn start(&mut self) {}
    fn stop(&mut self) {}
    fn is_active(&self) -> bool {
        false
    }
}

// ============================================================================
// Player
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Closed,
    Opened,
    Playing,
    Stopped,
}

pub struct Player {
    options: OpenOptions,
    looping: bool,
    volume: f32,
    surface: Box<dyn VideoSurface>,
    sink: Box<dyn AudioSink>,
    source: Option<Arc<MediaSource>>,
    video: Option<VideoPipeline>,
    audio: Option<Arc<AudioPipeline>>,
    state: PlayerState,
}

impl Player {
    pub fn new(surface: Box<dyn VideoSurface>, sink: Box<dyn AudioSink>) -> Self {
        Self {
            options: OpenOptions::default(),
            looping: true,
            volume: 1.0,
            surface,
            sink,
            source: None,
            video: None,
            audio: None,
            state: PlayerState::Closed,
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    /// Applies to subsequent opens
    pub fn set_decoder_preference(&mut self, preference: DecoderPreference) {
        self.options.decoder = preference;
    }

    pub fn set_loop(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        if let Some(audio) = &self.audio {
            audio.set_muted(self.volume <= 0.0);
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn media_info(&self) -> Option<&MediaInfo> {
        self.source.as_deref().map(MediaSource::info)
    }

    /// Video pipeline counters, when a video stream is open
    pub fn video_stats(&self) -> Option<VideoStats> {
        self.video.as_ref().map(VideoPipeline::stats)
    }

    /// Open a container and stand both pipelines up.
    ///
    /// Sizes the surface, decodes a poster frame, and hands the sink its
    /// pump; playback starts only on `play()`. Any previously opened
    /// media is closed first.
    pub fn open(&mut self, stream: Box<dyn ByteSource>) -> Result<(), MediaError> {
        self.close();

        let source = Arc::new(MediaSource::open(stream, &self.options)?);

        if source.has_video() {
            let pipeline = VideoPipeline::new(Arc::new(VideoFeed(source.clone())));
            let (width, height) = pipeline.output_size();
            self.surface.prepare(width, height);
            pipeline.preload();
            if let Some(poster) = pipeline.take_frame() {
                self.surface.upload(&poster);
            }
            self.video = Some(pipeline);
        }

        if source.has_audio() {
            let pipeline = Arc::new(AudioPipeline::new(Arc::new(AudioFeed(source.clone()))));
            pipeline.set_muted(self.volume <= 0.0);
            self.sink.configure(
                pipeline.channels(),
                pipeline.sample_rate(),
                AudioPump::new(pipeline.clone()),
            );
            self.audio = Some(pipeline);
        }

        debug!(
            "opened media: video={} audio={}",
            source.has_video(),
            source.has_audio()
        );
        self.source = Some(source);
        self.state = PlayerState::Opened;
        Ok(())
    }

    /// Open one member of a ZIP archive
    pub fn open_archive<R: Read + Seek>(
        &mut self,
        archive: R,
        member: &str,
    ) -> Result<(), MediaError> {
        let stream = io::open_archive_member(archive, member)?;
        self.open(Box::new(stream))
    }

    /// Start (or resume from a stop, which rewound to the start)
    pub fn play(&mut self) {
        match self.state {
            PlayerState::Closed | PlayerState::Playing => return,
            PlayerState::Opened | PlayerState::Stopped => {}
        }

        if let Some(video) = &mut self.video {
            video.play();
        }
        if self.audio.is_some() {
            self.sink.start();
        }
        self.state = PlayerState::Playing;
        debug!("playing");
    }

    /// Halt playback and rewind to the start
    pub fn stop(&mut self) {
        if self.state == PlayerState::Closed {
            return;
        }

        self.sink.stop();
        if let Some(video) = &mut self.video {
            video.stop();
        }
        if let Some(audio) = &self.audio {
            audio.rewind();
        }
        if let Some(source) = &self.source {
            source.clear_queues();
            if let Err(e) = source.rewind() {
                warn!("rewind failed: {}", e);
            }
        }
        self.state = PlayerState::Stopped;
        debug!("stopped");
    }

    /// Advance presentation: upload a newly presented frame if one is up.
    ///
    /// Returns true when the surface changed. With looping on, a stream
    /// that has played out restarts from the top.
    pub fn tick(&mut self) -> bool {
        if self.video.is_none() && self.audio.is_none() {
            return false;
        }

        if let Some(video) = &self.video {
            if let Some(frame) = video.take_frame() {
                self.surface.upload(&frame);
                return true;
            }
        }

        if self.state == PlayerState::Playing && self.looping && !self.is_playing() {
            debug!("end of stream, looping");
            self.stop();
            self.play();
        }
        false
    }

    /// True while there is still something to present
    pub fn is_playing(&self) -> bool {
        if let Some(video) = &self.video {
            if !video.at_end() {
                return true;
            }
        }
        self.audio.is_some() && self.sink.is_active()
    }

    /// Tear everything down; safe to call repeatedly
    pub fn close(&mut self) {
        if self.state == PlayerState::Closed {
            return;
        }
        self.stop();
        self.video = None;
        self.audio = None;
        self.source = None;
        self.state = PlayerState::Closed;
        debug!("closed");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioStream;
    use crate::decode::{DecodeError, DecodePolicy, VideoPicture};
    use crate::packet::{Packet, TimeBase};
    use crate::video::VideoStream;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingSurface;

    impl VideoSurface for RecordingSurface {
        fn prepare(&mut self, width: u32, height: u32) {
            assert!(width > 0 && height > 0);
        }

        fn upload(&mut self, rgba: &[u8]) {
            assert!(!rgba.is_empty());
        }
    }

    /// Sink that flips its active flag on start/stop
    struct FlagSink {
        active: Arc<AtomicBool>,
        starts: Arc<AtomicU32>,
    }

    impl AudioSink for FlagSink {
        fn configure(&mut self, channels: u16, sample_rate: u32, _pump: AudioPump) {
            assert!(channels > 0);
            assert!(sample_rate > 0);
        }

        fn start(&mut self) {
            self.active.store(true, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&mut self) {
            self.active.store(false, Ordering::SeqCst);
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    /// Finite video stream that refills itself when flushed, standing in
    /// for a rewindable container
    struct LoopingVideo {
        packets: Mutex<VecDeque<Packet>>,
        frames: i64,
    }

    impl LoopingVideo {
        fn new(frames: i64) -> Self {
            let s = Self {
                packets: Mutex::new(VecDeque::new()),
                frames,
            };
            s.refill();
            s
        }

        fn refill(&self) {
            let mut q = self.packets.lock();
            q.clear();
            q.extend((0..self.frames).map(|pts| Packet {
                stream_id: 1,
                data: vec![0u8; 4],
                pts,
                keyframe: true,
            }));
        }
    }

    impl VideoStream for LoopingVideo {
        fn time_base(&self) -> TimeBase {
            TimeBase::from_nanos(5_000_000)
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
            _policy: DecodePolicy,
        ) -> Result<Option<VideoPicture>, DecodeError> {
            Ok(Some(VideoPicture {
                data: vec![128u8; 6],
                width: 2,
                height: 2,
                pts: packet.pts,
            }))
        }

        fn discard_queued(&self) {
            self.refill();
        }
    }

    struct SilentAudio;

    impl AudioStream for SilentAudio {
        fn time_base(&self) -> TimeBase {
            TimeBase::default()
        }

        fn sample_rate(&self) -> u32 {
            1000
        }

        fn channels(&self) -> u16 {
            1
        }

        fn next_packet(&self) -> Option<Packet> {
            None
        }

        fn pump(&self) -> bool {
            false
        }

        fn at_input_end(&self) -> bool {
            true
        }

        fn decode(&self, _packet: &Packet) -> Result<Vec<i16>, DecodeError> {
            Ok(Vec::new())
        }

        fn discard_queued(&self) {}
    }

    fn assembled_player(video_frames: Option<i64>, audio: bool) -> (Player, Arc<AtomicBool>) {
        let active = Arc::new(AtomicBool::new(false));
        let sink = FlagSink {
            active: active.clone(),
            starts: Arc::new(AtomicU32::new(0)),
        };
        let mut player = Player::new(Box::new(RecordingSurface::default()), Box::new(sink));
        player.video =
            video_frames.map(|n| VideoPipeline::new(Arc::new(LoopingVideo::new(n))));
        player.audio = audio.then(|| Arc::new(AudioPipeline::new(Arc::new(SilentAudio))));
        if player.video.is_some() || player.audio.is_some() {
            player.state = PlayerState::Opened;
        }
        (player, active)
    }

    #[test]
    fn test_lifecycle_without_media_is_inert() {
        let (mut player, _) = assembled_player(None, false);
        player.state = PlayerState::Closed;
        assert_eq!(player.state(), PlayerState::Closed);
        assert!(!player.tick());
        assert!(!player.is_playing());
        player.play();
        assert_eq!(player.state(), PlayerState::Closed);
        player.stop();
        player.close();
        player.close();
    }

    #[test]
    fn test_open_garbage_leaves_player_closed() {
        let (mut player, _) = assembled_player(None, false);
        player.state = PlayerState::Closed;
        let junk: Box<dyn ByteSource> = Box::new(Cursor::new(vec![0u8; 128]));
        assert!(player.open(junk).is_err());
        assert_eq!(player.state(), PlayerState::Closed);
        assert!(player.media_info().is_none());
        assert!(player.video.is_none());
    }

    #[test]
    fn test_audio_only_playback_tracks_sink() {
        let (mut player, active) = assembled_player(None, true);
        assert!(!player.is_playing());

        player.play();
        assert_eq!(player.state(), PlayerState::Playing);
        assert!(active.load(Ordering::SeqCst));
        assert!(player.is_playing());
        // No video: tick never claims a surface change
        assert!(!player.tick());

        player.stop();
        assert!(!active.load(Ordering::SeqCst));
        assert!(!player.is_playing());
    }

    #[test]
    fn test_video_playback_uploads_frames() {
        let (mut player, _) = assembled_player(Some(20), false);
        player.set_loop(false);
        player.play();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut uploads = 0u32;
        while player.is_playing() && Instant::now() < deadline {
            if player.tick() {
                uploads += 1;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(uploads > 0, "no frames reached the surface");

        player.stop();
        assert_eq!(player.state(), PlayerState::Stopped);
        assert!(!player.tick());
    }

    #[test]
    fn test_looping_restarts_after_stream_end() {
        let (mut player, _) = assembled_player(Some(8), false);
        player.set_loop(true);
        player.play();

        // Drain until the pipeline reports end, then one tick restarts it
        let deadline = Instant::now() + Duration::from_secs(10);
        while player.is_playing() {
            assert!(Instant::now() < deadline, "stream never ended");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!player.tick());
        assert_eq!(player.state(), PlayerState::Playing);
        assert!(player.is_playing(), "loop did not restart playback");
    }

    #[test]
    fn test_stop_is_idempotent_and_replayable() {
        let (mut player, _) = assembled_player(Some(10), false);
        player.play();
        player.stop();
        player.stop();
        assert_eq!(player.state(), PlayerState::Stopped);

        // A stopped player can play again from the top
        player.play();
        assert_eq!(player.state(), PlayerState::Playing);
        player.close();
        assert_eq!(player.state(), PlayerState::Closed);
    }
}
