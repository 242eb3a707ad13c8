//! # Decoders
//!
//! Codec contexts for the two stream kinds plus the discard policy the
//! video pipeline feeds back into each decode call.
//!
//! Video is H.264 through `openh264` (Matroska carries avcC extradata and
//! length-prefixed NALs, the decoder wants Annex B). Audio goes through
//! `symphonia` and comes back as interleaved signed 16-bit samples.

use openh264::decoder::Decoder as H264Decoder;
use openh264::formats::YUVSource;
use serde::{Deserialize, Serialize};
use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{
    CodecParameters, CodecType, Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_AAC,
    CODEC_TYPE_FLAC, CODEC_TYPE_MP2, CODEC_TYPE_MP3, CODEC_TYPE_OPUS, CODEC_TYPE_PCM_S16LE,
    CODEC_TYPE_VORBIS,
};
use symphonia::core::formats::Packet as SymphoniaPacket;
use thiserror::Error;
use tracing::{debug, warn};

use crate::packet::Packet;

/// Annex B start code (4-byte version)
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("decoder init failed: {0}")]
    DecoderInit(String),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

// ============================================================================
// Decode Policy
// ============================================================================

/// How aggressively a decode call may discard work, least to most.
///
/// A pure function of the quality score; the pipeline recomputes it before
/// every call so there is no hidden codec-context state to get stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DecodePolicy {
    /// Decode everything
    Default,
    /// Skip frames nothing else references
    SkipNonRef,
    /// Skip bidirectionally predicted frames
    SkipBidir,
    /// Decode keyframes only
    SkipNonKey,
    /// Decode nothing
    SkipAll,
}

impl DecodePolicy {
    /// Map a quality score to a discard rung
    pub fn from_score(score: i32) -> Self {
        if score <= -120 {
            Self::SkipAll
        } else if score <= -100 {
            Self::SkipNonKey
        } else if score <= -40 {
            Self::SkipBidir
        } else if score <= 0 {
            Self::SkipNonRef
        } else {
            Self::Default
        }
    }

    /// True when no frame can come out of a decode call at this rung
    pub fn discards_everything(self) -> bool {
        self == Self::SkipAll
    }
}

/// Which video decoder to try first.
///
/// Passed into `open`; a hardware probe that finds nothing falls back to
/// the software path without surfacing an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoderPreference {
    #[default]
    Software,
    HardwareIfAvailable,
}

// ============================================================================
// Video
// ============================================================================

/// One decoded picture, planar I420, owned
#[derive(Debug, Clone)]
pub struct VideoPicture {
    /// Y plane followed by U and V, no stride padding
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in stream ticks
    pub pts: i64,
}

/// SPS/PPS headers recovered from avcC extradata
struct AvcConfig {
    /// Parameter sets with start codes, ready to prepend to the first NAL
    headers: Vec<u8>,
    /// Width of the length prefix on each packet NAL (1-4 bytes)
    nal_length_size: usize,
}

impl AvcConfig {
    /// Parse avcC extradata.
    ///
    /// Layout: version, profile, compat, level, then
    /// `0xFC | (nal_length_size - 1)`, `0xE0 | num_sps`, SPS entries
    /// (u16 length each), num_pps, PPS entries.
    fn parse(extradata: &[u8]) -> Option<Self> {
        if extradata.len() < 7 || extradata[0] != 1 {
            return None;
        }

        let nal_length_size = ((extradata[4] & 0x03) + 1) as usize;
        let num_sps = (extradata[5] & 0x1F) as usize;
        let mut headers = Vec::with_capacity(extradata.len() + 32);
        let mut offset = 6;

        for _ in 0..num_sps {
            offset = copy_prefixed_nal(extradata, offset, &mut headers)?;
        }

        if offset < extradata.len() {
            let num_pps = extradata[offset] as usize;
            offset += 1;
            for _ in 0..num_pps {
                match copy_prefixed_nal(extradata, offset, &mut headers) {
                    Some(next) => offset = next,
                    None => break,
                }
            }
        }

        Some(Self {
            headers,
            nal_length_size,
        })
    }
}

/// Copy one u16-length-prefixed NAL from `data[offset..]` into `out` with
/// a start code, returning the offset past it
fn copy_prefixed_nal(data: &[u8], offset: usize, out: &mut Vec<u8>) -> Option<usize> {
    let len = u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]) as usize;
    let start = offset + 2;
    let nal = data.get(start..start + len)?;
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(nal);
    Some(start + len)
}

/// True if the payload already carries Annex B start codes
fn is_annexb(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    (data[0] == 0 && data[1] == 0 && data[2] == 0 && data[3] == 1)
        || (data[0] == 0 && data[1] == 0 && data[2] == 1)
}

/// Rewrite length-prefixed NALs as Annex B
fn length_prefixed_to_annexb(data: &[u8], nal_length_size: usize, out: &mut Vec<u8>) {
    let mut offset = 0;
    while offset + nal_length_size <= data.len() {
        let mut len = 0usize;
        for &b in &data[offset..offset + nal_length_size] {
            len = (len << 8) | b as usize;
        }
        offset += nal_length_size;
        if len == 0 || offset + len > data.len() {
            break;
        }
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&data[offset..offset + len]);
        offset += len;
    }
}

/// H.264 decode context for one video stream
pub struct VideoDecoder {
    decoder: H264Decoder,
    nal_length_size: usize,
    /// Annex B parameter sets, re-fed after every reset
    headers: Vec<u8>,
    headers_sent: bool,
}

impl std::fmt::Debug for VideoDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoDecoder")
            .field("nal_length_size", &self.nal_length_size)
            .field("headers_sent", &self.headers_sent)
            .finish_non_exhaustive()
    }
}

impl VideoDecoder {
    /// Build a decoder for one Matroska video track.
    ///
    /// Only `V_MPEG4/ISO/AVC` is playable; anything else fails here and
    /// the caller treats the track as absent. The hardware preference is
    /// probed and currently always falls back to software.
    pub fn new(
        codec_id: &str,
        codec_private: Option<&[u8]>,
        preference: DecoderPreference,
    ) -> Result<Self, DecodeError> {
        if codec_id != "V_MPEG4/ISO/AVC" {
            return Err(DecodeError::UnsupportedCodec(codec_id.to_string()));
        }

        if preference == DecoderPreference::HardwareIfAvailable {
            // No hardware path is wired up on this target; stay quiet and
            // take the software decoder.
            debug!("hardware decoder unavailable, using software h264");
        }

        let config = codec_private.and_then(AvcConfig::parse);
        let (headers, nal_length_size) = match config {
            Some(c) => (c.headers, c.nal_length_size),
            // No extradata: assume in-band parameter sets and 4-byte lengths
            None => (Vec::new(), 4),
        };

        let decoder =
            H264Decoder::new().map_err(|e| DecodeError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            nal_length_size,
            headers,
            headers_sent: false,
        })
    }

    /// Decode one packet under the given policy.
    ///
    /// `Ok(None)` means the policy skipped it or the decoder is buffering;
    /// both look the same to the pipeline.
    pub fn decode(
        &mut self,
        packet: &Packet,
        policy: DecodePolicy,
    ) -> Result<Option<VideoPicture>, DecodeError> {
        match policy {
            DecodePolicy::SkipAll => return Ok(None),
            DecodePolicy::SkipNonKey if !packet.keyframe => return Ok(None),
            // openh264 has no partial-skip knobs; the intermediate rungs
            // decode normally and rely on presentation-side dropping.
            _ => {}
        }

        let mut annexb = Vec::with_capacity(self.headers.len() + packet.data.len() + 16);
        if !self.headers_sent && !self.headers.is_empty() {
            annexb.extend_from_slice(&self.headers);
        }
        if is_annexb(&packet.data) {
            annexb.extend_from_slice(&packet.data);
        } else {
            length_prefixed_to_annexb(&packet.data, self.nal_length_size, &mut annexb);
        }
        if annexb.is_empty() {
            return Ok(None);
        }

        let yuv = match self.decoder.decode(&annexb) {
            Ok(Some(yuv)) => yuv,
            Ok(None) => {
                self.headers_sent = true;
                return Ok(None);
            }
            Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
        };
        self.headers_sent = true;

        // The decoded planes borrow the decoder; copy them out row by row
        // into a tightly packed I420 buffer.
        let (width, height) = yuv.dimensions();
        let (y_stride, u_stride, v_stride) = yuv.strides();
        let (cw, ch) = ((width + 1) / 2, (height + 1) / 2);
        let mut data = Vec::with_capacity(width * height + 2 * cw * ch);
        copy_plane(yuv.y(), y_stride, width, height, &mut data);
        copy_plane(yuv.u(), u_stride, cw, ch, &mut data);
        copy_plane(yuv.v(), v_stride, cw, ch, &mut data);

        Ok(Some(VideoPicture {
            data,
            width: width as u32,
            height: height as u32,
            pts: packet.pts,
        }))
    }

    /// Drop all reference state, for rewind
    pub fn reset(&mut self) {
        // openh264 has no flush call; a fresh context is the reliable way
        match H264Decoder::new() {
            Ok(d) => {
                self.decoder = d;
                self.headers_sent = false;
            }
            Err(e) => warn!("h264 decoder reset failed: {}", e),
        }
    }
}

fn copy_plane(src: &[u8], stride: usize, width: usize, height: usize, out: &mut Vec<u8>) {
    for row in 0..height {
        let start = row * stride;
        out.extend_from_slice(&src[start..start + width]);
    }
}

// ============================================================================
// Audio
// ============================================================================

/// Map a Matroska audio codec id to a symphonia codec type
fn audio_codec_type(codec_id: &str) -> Option<CodecType> {
    if codec_id.starts_with("A_AAC") {
        return Some(CODEC_TYPE_AAC);
    }
    match codec_id {
        "A_VORBIS" => Some(CODEC_TYPE_VORBIS),
        "A_OPUS" => Some(CODEC_TYPE_OPUS),
        "A_FLAC" => Some(CODEC_TYPE_FLAC),
        "A_MPEG/L3" => Some(CODEC_TYPE_MP3),
        "A_MPEG/L2" => Some(CODEC_TYPE_MP2),
        "A_PCM/INT/LIT" => Some(CODEC_TYPE_PCM_S16LE),
        _ => None,
    }
}

/// Audio decode context for one audio stream.
///
/// Whatever sample format the codec emits is converted to interleaved
/// i16 through a lazily sized `SampleBuffer`; if a packet's layout can't
/// be converted the stream degrades to silence rather than failing.
pub struct AudioDecoder {
    decoder: Box<dyn SymphoniaDecoder>,
    converter: Option<SampleBuffer<i16>>,
    converter_failed: bool,
}

impl std::fmt::Debug for AudioDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDecoder")
            .field("converter_failed", &self.converter_failed)
            .finish_non_exhaustive()
    }
}

impl AudioDecoder {
    pub fn new(
        codec_id: &str,
        sample_rate: u32,
        channels: u16,
        codec_private: Option<&[u8]>,
    ) -> Result<Self, DecodeError> {
        let codec_type = audio_codec_type(codec_id)
            .ok_or_else(|| DecodeError::UnsupportedCodec(codec_id.to_string()))?;

        let channel_mask = match channels {
            1 => Channels::FRONT_LEFT,
            2 => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
            n => {
                return Err(DecodeError::UnsupportedCodec(format!(
                    "{codec_id} with {n} channels"
                )))
            }
        };

        let mut params = CodecParameters::new();
        params
            .for_codec(codec_type)
            .with_sample_rate(sample_rate)
            .with_channels(channel_mask);
        if codec_type == CODEC_TYPE_PCM_S16LE {
            // The PCM decoder sizes its buffer up front and Matroska
            // carries no per-packet frame count; one second is a safe bound
            params
                .with_bits_per_sample(16)
                .with_max_frames_per_packet(u64::from(sample_rate));
        }
        if let Some(extra) = codec_private {
            params.with_extra_data(extra.to_vec().into_boxed_slice());
        }

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderInit(format!("{codec_id}: {e}")))?;

        Ok(Self {
            decoder,
            converter: None,
            converter_failed: false,
        })
    }

    /// Decode one packet into interleaved i16 samples
    pub fn decode(&mut self, packet: &Packet) -> Result<Vec<i16>, DecodeError> {
        let sp = SymphoniaPacket::new_from_slice(0, packet.pts.max(0) as u64, 0, &packet.data);
        let decoded = self
            .decoder
            .decode(&sp)
            .map_err(|e| DecodeError::DecodeFailed(e.to_string()))?;

        let spec = *decoded.spec();
        // Length of this chunk is the frames actually decoded; the buffer
        // capacity can be much larger (it is the codec's per-packet bound)
        let produced = decoded.frames() * spec.channels.count();
        if produced == 0 {
            return Ok(Vec::new());
        }

        if self.converter_failed {
            return Ok(vec![0i16; produced]);
        }

        let cap = decoded.capacity() * spec.channels.count();
        let rebuild = match &self.converter {
            Some(buf) => buf.capacity() < cap,
            None => true,
        };
        if rebuild {
            if spec.rate == 0 {
                warn!("audio sample converter unavailable, emitting silence");
                self.converter_failed = true;
                return Ok(vec![0i16; produced]);
            }
            self.converter = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }

        // Converter is Some here by construction
        let Some(buf) = self.converter.as_mut() else {
            return Ok(Vec::new());
        };
        buf.copy_interleaved_ref(decoded);
        Ok(buf.samples().to_vec())
    }

    /// Flush codec state, for rewind
    pub fn reset(&mut self) {
        self.decoder.reset();
    }
}

// ============================================================================
// Tests
// ============================================================================
