//! # Media Source - Container Demuxing
//!
//! Opens a Matroska/WebM container over a [`ByteSource`], probes at most
//! one video and one audio track, owns their codec contexts, and routes
//! compressed packets into per-stream queues on demand.
//!
//! Both pipelines call [`MediaSource::read_packet`] whenever their own
//! queue runs dry; a single mutex over the demuxer cursor keeps the two
//! readers from interleaving. Packets for the other stream land in that
//! stream's queue, so one side pumping feeds both.

use std::io::{Seek, SeekFrom};
use std::sync::Arc;

use matroska_demuxer::{Frame as MkvFrame, MatroskaFile, TrackEntry, TrackType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::audio::AudioStream;
use crate::decode::{
    AudioDecoder, DecodeError, DecodePolicy, DecoderPreference, VideoDecoder, VideoPicture,
};
use crate::io::{ByteSource, SharedStream};
use crate::packet::{Packet, PacketQueue, TimeBase};
use crate::video::VideoStream;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("container parse error: {0}")]
    Container(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("no playable stream found")]
    NoUsableStream,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

// ============================================================================
// Open Options
// ============================================================================

/// What to set up at open time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOptions {
    pub want_video: bool,
    pub want_audio: bool,
    pub decoder: DecoderPreference,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            want_video: true,
            want_audio: true,
            decoder: DecoderPreference::default(),
        }
    }
}

// ============================================================================
// Media Info
// ============================================================================

/// What the container told us about the selected tracks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Container duration, if the header carries one
    pub duration_ms: Option<u64>,
    pub video: Option<VideoTrackInfo>,
    pub audio: Option<AudioTrackInfo>,
}

impl MediaInfo {
    /// A clip with a video track has more than one frame to show
    pub fn is_multiframe(&self) -> bool {
        self.video.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoTrackInfo {
    pub codec: String,
    /// Coded dimensions
    pub width: u32,
    pub height: u32,
    /// Aspect-corrected dimensions the surface should be sized to
    pub display_width: u32,
    pub display_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioTrackInfo {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
}

// ============================================================================
// Stream Halves
// ============================================================================

struct VideoHalf {
    stream_id: u64,
    time_base: TimeBase,
    display_width: u32,
    display_height: u32,
    queue: PacketQueue,
    decoder: Mutex<VideoDecoder>,
}

struct AudioHalf {
    stream_id: u64,
    time_base: TimeBase,
    sample_rate: u32,
    channels: u16,
    queue: PacketQueue,
    decoder: Mutex<AudioDecoder>,
}

/// Demuxer cursor state, all behind the single read mutex
struct Demux {
    file: MatroskaFile<SharedStream>,
    scratch: MkvFrame,
    /// Sticky once the container runs out or errors
    eof: bool,
    /// Nanoseconds per stream tick
    scale: u64,
}

// ============================================================================
// Media Source
// ============================================================================

/// One opened container: demuxer plus the stream halves built from it
pub struct MediaSource {
    raw: Arc<Mutex<Box<dyn ByteSource>>>,
    demux: Mutex<Demux>,
    video: Option<VideoHalf>,
    audio: Option<AudioHalf>,
    info: MediaInfo,
}

impl MediaSource {
    /// Open a container and probe its tracks.
    ///
    /// A track whose decoder cannot be built is treated as absent, not
    /// fatal; only a container with no usable track at all is an error.
    pub fn open(stream: Box<dyn ByteSource>, options: &OpenOptions) -> Result<Self, MediaError> {
        let raw = Arc::new(Mutex::new(stream));
        let mut handle = SharedStream::new(raw.clone());
        handle.seek(SeekFrom::Start(0))?;

        let file = MatroskaFile::open(handle)
            .map_err(|e| MediaError::Container(format!("{e:?}")))?;
        let scale = file.info().timestamp_scale().get();
        let duration_ms = file.info().duration().map(|ns| ns as u64 / 1_000_000);

        let mut info = MediaInfo {
            duration_ms,
            ..MediaInfo::default()
        };

        let mut video = None;
        if options.want_video {
            if let Some(track) = pick_track(file.tracks(), TrackType::Video) {
                match build_video_half(track, options.decoder, scale) {
                    Ok((half, track_info)) => {
                        debug!(
                            "video track {}: {} {}x{}",
                            half.stream_id, track_info.codec, track_info.width, track_info.height
                        );
                        info.video = Some(track_info);
                        video = Some(half);
                    }
                    Err(e) => warn!("video track unusable: {}", e),
                }
            }
        }

        let mut audio = None;
        if options.want_audio {
            if let Some(track) = pick_track(file.tracks(), TrackType::Audio) {
                match build_audio_half(track, scale) {
                    Ok((half, track_info)) => {
                        debug!(
                            "audio track {}: {} {} Hz x{}",
                            half.stream_id,
                            track_info.codec,
                            track_info.sample_rate,
                            track_info.channels
                        );
                        info.audio = Some(track_info);
                        audio = Some(half);
                    }
                    Err(e) => warn!("audio track unusable: {}", e),
                }
            }
        }

        if video.is_none() && audio.is_none() {
            return Err(MediaError::NoUsableStream);
        }

        Ok(Self {
            raw,
            demux: Mutex::new(Demux {
                file,
                scratch: MkvFrame::default(),
                eof: false,
                scale,
            }),
            video,
            audio,
            info,
        })
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Pull the next packet off the container and route it.
    ///
    /// Returns false once the container is exhausted; the end flag is
    /// sticky until [`rewind`](Self::rewind).
    pub fn read_packet(&self) -> bool {
        let mut guard = self.demux.lock();
        let demux = &mut *guard;
        if demux.eof {
            return false;
        }

        match demux.file.next_frame(&mut demux.scratch) {
            Ok(true) => {}
            Ok(false) => {
                debug!("end of container input");
                demux.eof = true;
                return false;
            }
            Err(e) => {
                warn!("demux error, treating as end of input: {:?}", e);
                demux.eof = true;
                return false;
            }
        }

        let frame = &mut demux.scratch;
        let packet = Packet {
            stream_id: frame.track,
            data: std::mem::take(&mut frame.data),
            pts: (frame.timestamp / demux.scale) as i64,
            keyframe: frame.is_keyframe.unwrap_or(false),
        };

        // Route while still holding the read lock so queue contents track
        // the demux cursor.
        route_packet(self.video.as_ref(), self.audio.as_ref(), packet);
        true
    }

    /// True once the container has no more packets to give
    pub fn end_of_input(&self) -> bool {
        self.demux.lock().eof
    }

    /// Seek back to the start of the stream, the only supported target.
    ///
    /// Reopens the demuxer over the shared byte source and flushes both
    /// codec contexts and queues.
    pub fn rewind(&self) -> Result<(), MediaError> {
        let mut demux = self.demux.lock();

        let mut handle = SharedStream::new(self.raw.clone());
        handle.seek(SeekFrom::Start(0))?;
        demux.file = MatroskaFile::open(handle)
            .map_err(|e| MediaError::Container(format!("{e:?}")))?;
        demux.eof = false;
        drop(demux);

        if let Some(v) = &self.video {
            v.queue.clear();
            v.decoder.lock().reset();
        }
        if let Some(a) = &self.audio {
            a.queue.clear();
            a.decoder.lock().reset();
        }
        debug!("rewound to stream start");
        Ok(())
    }

    /// Drop everything buffered without touching the demux cursor
    pub(crate) fn clear_queues(&self) {
        if let Some(v) = &self.video {
            v.queue.clear();
        }
        if let Some(a) = &self.audio {
            a.queue.clear();
        }
    }
}

/// Hand one demuxed packet to the stream that owns its track, or drop it
fn route_packet(video: Option<&VideoHalf>, audio: Option<&AudioHalf>, packet: Packet) {
    match (video, audio) {
        (Some(v), _) if v.stream_id == packet.stream_id => {
            trace!("video packet pts {}", packet.pts);
            v.queue.push(packet);
        }
        (_, Some(a)) if a.stream_id == packet.stream_id => {
            trace!("audio packet pts {}", packet.pts);
            a.queue.push(packet);
        }
        _ => trace!("discarding packet for unselected track {}", packet.stream_id),
    }
}

fn pick_track(tracks: &[TrackEntry], kind: TrackType) -> Option<&TrackEntry> {
    tracks
        .iter()
        .filter(|t| t.track_type() == kind)
        .find(|t| t.flag_default())
        .or_else(|| tracks.iter().find(|t| t.track_type() == kind))
}

fn build_video_half(
    track: &TrackEntry,
    preference: DecoderPreference,
    scale: u64,
) -> Result<(VideoHalf, VideoTrackInfo), MediaError> {
    let video = track
        .video()
        .ok_or_else(|| MediaError::Container("video track without video element".into()))?;

    let width = video.pixel_width().get() as u32;
    let height = video.pixel_height().get() as u32;
    let display_width = video.display_width().map(|w| w.get() as u32).unwrap_or(width);
    let display_height = video
        .display_height()
        .map(|h| h.get() as u32)
        .unwrap_or(height);

    let codec = track.codec_id().to_string();
    let decoder = VideoDecoder::new(&codec, track.codec_private(), preference)?;

    let half = VideoHalf {
        stream_id: track.track_number().get(),
        time_base: TimeBase::from_nanos(scale),
        display_width,
        display_height,
        queue: PacketQueue::new(),
        decoder: Mutex::new(decoder),
    };
    let info = VideoTrackInfo {
        codec,
        width,
        height,
        display_width,
        display_height,
    };
    Ok((half, info))
}

fn build_audio_half(
    track: &TrackEntry,
    scale: u64,
) -> Result<(AudioHalf, AudioTrackInfo), MediaError> {
    let audio = track
        .audio()
        .ok_or_else(|| MediaError::Container("audio track without audio element".into()))?;

    let sample_rate = audio.sampling_frequency() as u32;
    let channels = audio.channels().get() as u16;
    let codec = track.codec_id().to_string();
    let decoder = AudioDecoder::new(&codec, sample_rate, channels, track.codec_private())?;

    let half = AudioHalf {
        stream_id: track.track_number().get(),
        time_base: TimeBase::from_nanos(scale),
        sample_rate,
        channels,
        queue: PacketQueue::new(),
        decoder: Mutex::new(decoder),
    };
    let info = AudioTrackInfo {
        codec,
        sample_rate,
        channels,
    };
    Ok((half, info))
}

// ============================================================================
// Pipeline Feeds
// ============================================================================

/// The video pipeline's view of an opened source
pub(crate) struct VideoFeed(pub(crate) Arc<MediaSource>);

impl VideoStream for VideoFeed {
    fn time_base(&self) -> TimeBase {
        self.half().time_base
    }

    fn output_size(&self) -> (u32, u32) {
        let half = self.half();
        (half.display_width, half.display_height)
    }

    fn next_packet(&self) -> Option<Packet> {
        self.half().queue.pop()
    }

    fn pump(&self) -> bool {
        self.0.read_packet()
    }

    fn at_input_end(&self) -> bool {
        self.0.end_of_input()
    }

    fn decode(
        &self,
        packet: &Packet,
        policy: DecodePolicy,
    ) -> Result<Option<VideoPicture>, DecodeError> {
        self.half().decoder.lock().decode(packet, policy)
    }

    fn discard_queued(&self) {
        self.half().queue.clear();
    }
}

impl VideoFeed {
    fn half(&self) -> &VideoHalf {
        // Constructed only for sources probed with a video track
        match &self.0.video {
            Some(half) => half,
            None => unreachable!("video feed over source without video"),
        }
    }
}

/// The audio pipeline's view of an opened source
pub(crate) struct AudioFeed(pub(crate) Arc<MediaSource>);

impl AudioStream for AudioFeed {
    fn time_base(&self) -> TimeBase {
        self.half().time_base
    }

    fn sample_rate(&self) -> u32 {
        self.half().sample_rate
    }

    fn channels(&self) -> u16 {
        self.half().channels
    }

    fn next_packet(&self) -> Option<Packet> {
        self.half().queue.pop()
    }

    fn pump(&self) -> bool {
        self.0.read_packet()
    }

    fn at_input_end(&self) -> bool {
        self.0.end_of_input()
    }

    fn decode(&self, packet: &Packet) -> Result<Vec<i16>, DecodeError> {
        self.half().decoder.lock().decode(packet)
    }

    fn discard_queued(&self) {
        self.half().queue.clear();
    }
}

impl AudioFeed {
    fn half(&self) -> &AudioHalf {
        match &self.0.audio {
            Some(half) => half,
            None => unreachable!("audio feed over source without audio"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
