//! # Marquee Media - Threaded Playback Engine
//!
//! Plays short audio/video clips (Matroska/WebM) behind a menu frontend:
//! - Demuxes a caller-supplied byte source into per-stream packet queues
//! - Decodes video on a dedicated thread, audio on the sink's pull thread
//! - Paces presentation against the wall clock
//! - Drops frames adaptively under load via a bounded quality score
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌───────────────┐   ┌─────────┐
//! │ ByteSource │──►│ MediaSource │──►│ VideoPipeline │──►│ Surface │
//! │ (file/zip) │   │  (demux)    │   │ (decode thrd) │   │ (tick)  │
//! └────────────┘   └─────────────┘   └───────────────┘   └─────────┘
//!                        │           ┌───────────────┐   ┌─────────┐
//!                        └──────────►│ AudioPipeline │──►│  Sink   │
//!                                    │ (fill pulls)  │   │ (pull)  │
//!                                    └───────────────┘   └─────────┘
//! ```
//!
//! The caller drives everything through [`Player`]: `open`, `play`,
//! `tick` once per rendered frame, `stop`, `close`.

pub mod audio;
pub mod decode;
pub mod io;
pub mod packet;
pub mod pixel_convert;
pub mod player;
pub mod source;
pub mod video;

pub use audio::{AudioPipeline, AudioPump, AudioStream};
pub use decode::{DecodeError, DecodePolicy, DecoderPreference, VideoPicture};
pub use io::{open_archive_member, ByteSource};
pub use packet::{Packet, PacketQueue, TimeBase};
pub use player::{AudioSink, NullAudioSink, Player, PlayerState, VideoSurface};
pub use source::{
    AudioTrackInfo, MediaError, MediaInfo, MediaSource, OpenOptions, VideoTrackInfo,
};
pub use video::{QualityGauge, VideoPipeline, VideoStats, VideoStream, MAX_FRAME_QUEUE};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
