//! # Packet Queue - Compressed Stream Buffering
//!
//! One queue per elementary stream. The demux thread (whoever calls
//! `MediaSource::read_packet`) pushes, the owning pipeline pops. Plain
//! `VecDeque` behind a short-held mutex; packets arrive in container
//! order and are consumed in the same order.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

// ============================================================================
// Time Base
// ============================================================================

/// Fixed conversion from stream ticks to wall-clock time.
///
/// For Matroska this is the container timestamp scale (nanoseconds per
/// tick, 1 ms by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    nanos_per_tick: u64,
}

impl TimeBase {
    pub fn from_nanos(nanos_per_tick: u64) -> Self {
        Self {
            nanos_per_tick: nanos_per_tick.max(1),
        }
    }

    /// Duration of a single tick
    pub fn tick(&self) -> Duration {
        Duration::from_nanos(self.nanos_per_tick)
    }

    /// Convert a pts in ticks to a wall-clock offset from stream start
    pub fn ticks_to_duration(&self, ticks: i64) -> Duration {
        if ticks <= 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(ticks as u64 * self.nanos_per_tick)
    }

    pub fn nanos_per_tick(&self) -> u64 {
        self.nanos_per_tick
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        // Matroska default timestamp scale: 1 ms
        Self::from_nanos(1_000_000)
    }
}

// ============================================================================
// Packet
// ============================================================================

/// One compressed packet as it came out of the container
#[derive(Debug, Clone)]
pub struct Packet {
    /// Container track number this packet belongs to
    pub stream_id: u64,
    /// Compressed payload
    pub data: Vec<u8>,
    /// Presentation timestamp in stream ticks
    pub pts: i64,
    /// Keyframe flag from the container (conservative: false if unknown)
    pub keyframe: bool,
}

// ============================================================================
// Packet Queue
// ============================================================================

/// Thread-safe FIFO of compressed packets for one stream
#[derive(Debug, Default)]
pub struct PacketQueue {
    inner: Mutex<VecDeque<Packet>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a packet in arrival order
    pub fn push(&self, packet: Packet) {
        self.inner.lock().push_back(packet);
    }

    /// Remove and return the oldest packet, `None` immediately if empty
    pub fn pop(&self) -> Option<Packet> {
        self.inner.lock().pop_front()
    }

    /// Drop all buffered packets
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn packet(pts: i64) -> Packet {
        Packet {
            stream_id: 1,
            data: vec![0u8; 4],
            pts,
            keyframe: false,
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = PacketQueue::new();
        for pts in [10, 20, 30] {
            queue.push(packet(pts));
        }

        assert_eq!(queue.pop().unwrap().pts, 10);
        assert_eq!(queue.pop().unwrap().pts, 20);
        assert_eq!(queue.pop().unwrap().pts, 30);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_pop_empty_returns_immediately() {
        let queue = PacketQueue::new();
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let queue = PacketQueue::new();
        queue.push(packet(1));
        queue.push(packet(2));
        queue.clear();
        assert_eq!(queue.len(), 0);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_concurrent_push_pop() {
        let queue = Arc::new(PacketQueue::new());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for pts in 0..200 {
                    queue.push(packet(pts));
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 200 {
            if let Some(p) = queue.pop() {
                seen.push(p.pts);
            }
        }
        producer.join().unwrap();

        // Arrival order survives the thread boundary
        let mut expect = seen.clone();
        expect.sort_unstable();
        assert_eq!(seen, expect);
    }

    #[test]
    fn test_time_base_conversion() {
        let tb = TimeBase::default();
        assert_eq!(tb.tick(), Duration::from_millis(1));
        assert_eq!(tb.ticks_to_duration(1500), Duration::from_millis(1500));
        assert_eq!(tb.ticks_to_duration(-5), Duration::ZERO);

        let ntsc = TimeBase::from_nanos(33_366_666);
        assert_eq!(ntsc.ticks_to_duration(2), Duration::from_nanos(66_733_332));
    }
}
