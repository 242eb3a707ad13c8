//! # Audio Pipeline - Pull-Driven PCM Servicing
//!
//! No thread of its own: the external sink calls [`AudioPump::fill`] from
//! its playback thread whenever it wants another chunk, and the pipeline
//! decodes packets until roughly one second of interleaved i16 samples is
//! buffered. The wall clock never appears here; the sink's own sample
//! consumption rate is the sync.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::decode::DecodeError;
use crate::packet::{Packet, TimeBase};

/// Fallback silence chunk when nothing has been decoded yet, interleaved
/// samples
const DEFAULT_CHUNK: usize = 2048;

// ============================================================================
// Audio Stream Seam
// ============================================================================

/// The pipeline's view of a demuxed audio stream
pub trait AudioStream: Send + Sync {
    fn time_base(&self) -> TimeBase;
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    /// Next buffered packet, `None` if the queue is dry
    fn next_packet(&self) -> Option<Packet>;
    /// Pull one more packet from the container into the queues
    fn pump(&self) -> bool;
    /// Container exhausted, nothing more will arrive
    fn at_input_end(&self) -> bool;
    fn decode(&self, packet: &Packet) -> Result<Vec<i16>, DecodeError>;
    fn discard_queued(&self);
}

// ============================================================================
// Audio Pipeline
// ============================================================================

pub struct AudioPipeline {
    stream: Arc<dyn AudioStream>,
    /// Staging buffer for one fill, behind its own lock
    buffer: Mutex<Vec<i16>>,
    at_end: AtomicBool,
    /// Zero volume short-circuits decoding entirely
    muted: AtomicBool,
    /// Samples the last decoded packet produced, the silence size when
    /// muted with no timing reference yet
    last_chunk: AtomicUsize,
    /// pts of the last packet consumed while muted, so silence can be
    /// sized from packet timing instead of a fixed chunk
    muted_pts: Mutex<Option<i64>>,
}

impl AudioPipeline {
    pub fn new(stream: Arc<dyn AudioStream>) -> Self {
        let capacity = stream.sample_rate() as usize;
        Self {
            stream,
            buffer: Mutex::new(Vec::with_capacity(capacity + DEFAULT_CHUNK)),
            at_end: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            last_chunk: AtomicUsize::new(DEFAULT_CHUNK),
            muted_pts: Mutex::new(None),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.stream.sample_rate()
    }

    pub fn channels(&self) -> u16 {
        self.stream.channels()
    }

    /// Volume zero means the codec is never touched; packets still drain
    /// so video keeps getting fed
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        // Drop the timing reference; pts seen under an earlier mute must
        // not stretch the first silence chunk of this one
        *self.muted_pts.lock() = None;
    }

    /// True once a fill came up completely empty with the input exhausted
    pub fn at_end(&self) -> bool {
        self.at_end.load(Ordering::SeqCst)
    }

    /// Forget a previous end-of-stream, for stop/rewind
    pub fn rewind(&self) {
        self.at_end.store(false, Ordering::SeqCst);
        *self.muted_pts.lock() = None;
    }

    /// Service one pull from the sink.
    ///
    /// Decodes until at least one time slice (`sample_rate` interleaved
    /// samples) is buffered or the input runs out. Returns false only
    /// when nothing at all could be produced, which the sink takes as
    /// end of stream.
    pub fn fill(&self, out: &mut Vec<i16>) -> bool {
        out.clear();
        if self.at_end.load(Ordering::SeqCst) {
            return false;
        }

        let slice = self.stream.sample_rate() as usize;
        let mut buffer = self.buffer.lock();
        buffer.clear();

        while buffer.len() < slice {
            let packet = loop {
                if let Some(p) = self.stream.next_packet() {
                    break Some(p);
                }
                if self.stream.at_input_end() {
                    break None;
                }
                self.stream.pump();
            };

            let Some(packet) = packet else {
                // Queue and container both exhausted
                debug!("audio input exhausted");
                self.at_end.store(true, Ordering::SeqCst);
                break;
            };

            if self.muted.load(Ordering::Relaxed) {
                let n = self.silence_len(&packet);
                buffer.extend(std::iter::repeat(0).take(n));
                continue;
            }

            match self.stream.decode(&packet) {
                Ok(samples) => {
                    if !samples.is_empty() {
                        self.last_chunk.store(samples.len(), Ordering::Relaxed);
                    }
                    buffer.extend_from_slice(&samples);
                }
                // Bad packet: drop it and keep going
                Err(e) => warn!("audio decode error: {}", e),
            }
        }

        out.extend_from_slice(&buffer);
        !out.is_empty()
    }

    /// Silence substitute for one undecoded packet, sized from the pts
    /// gap to the previous one so a muted stream stays on the clock
    fn silence_len(&self, packet: &Packet) -> usize {
        let mut prev = self.muted_pts.lock();
        let n = match *prev {
            Some(p) if packet.pts > p => {
                let gap_ns = (packet.pts - p) as u128
                    * u128::from(self.stream.time_base().nanos_per_tick());
                let frames = gap_ns * u128::from(self.stream.sample_rate()) / 1_000_000_000;
                frames as usize * usize::from(self.stream.channels())
            }
            // First packet of this mute has no reference gap yet
            _ => self.last_chunk.load(Ordering::Relaxed),
        };
        *prev = Some(packet.pts);
        n
    }
}

// ============================================================================
// Audio Pump
// ============================================================================

/// Cloneable fill handle handed to the external sink
#[derive(Clone)]
pub struct AudioPump(Arc<AudioPipeline>);

impl AudioPump {
    pub(crate) fn new(pipeline: Arc<AudioPipeline>) -> Self {
        Self(pipeline)
    }

    /// See [`AudioPipeline::fill`]
    pub fn fill(&self, out: &mut Vec<i16>) -> bool {
        self.0.fill(out)
    }

    pub fn sample_rate(&self) -> u32 {
        self.0.sample_rate()
    }

    pub fn channels(&self) -> u16 {
        self.0.channels()
    }
}

// ============================================================================
// Tests
// ============================================================================
