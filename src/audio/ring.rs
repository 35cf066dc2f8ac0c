//! Sample buffers used by the capture side.
//!
//! - [`DeviceRing`]: fixed-capacity buffer the microphone writes into. Readers
//!   keep their own cursor and ask for "samples written since cursor".
//! - [`RollingBuffer`]: bounded history the VAD runs over, evicting the
//!   oldest samples once it reaches its maximum length.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// What the device ring does once it has been written all the way round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// Continuous monitoring: wrap to the start and overwrite the oldest samples.
    Wrap,
    /// Finite recording: stop accepting samples once full.
    StopWhenFull,
}

/// Ring shared between the audio callback (writer) and the capture poll (reader).
pub type SharedRing = Arc<Mutex<DeviceRing>>;

/// Number of samples written between `cursor` and `position` in a ring of
/// `capacity` samples.
///
/// A position behind the cursor means the writer wrapped. A full lap between
/// two reads is indistinguishable from no progress and reports 0.
pub fn available_since(cursor: usize, position: usize, capacity: usize) -> usize {
    if position >= cursor {
        position - cursor
    } else {
        position + capacity - cursor
    }
}

/// Fixed-capacity sample ring with an explicit write position.
#[derive(Debug, Clone)]
pub struct DeviceRing {
    samples: Vec<f32>,
    position: usize,
    policy: OverwritePolicy,
}

impl DeviceRing {
    pub fn new(capacity: usize, policy: OverwritePolicy) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            position: 0,
            policy,
        }
    }

    pub fn shared(capacity: usize, policy: OverwritePolicy) -> SharedRing {
        Arc::new(Mutex::new(Self::new(capacity, policy)))
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Current write position.
    ///
    /// In `Wrap` mode this is always `< capacity`; in `StopWhenFull` mode it
    /// reaches `capacity` once the ring is full.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn policy(&self) -> OverwritePolicy {
        self.policy
    }

    pub fn is_full(&self) -> bool {
        self.policy == OverwritePolicy::StopWhenFull && self.position == self.capacity()
    }

    /// Rewind to position 0 with a new policy. Old contents become unreachable.
    pub fn reset(&mut self, policy: OverwritePolicy) {
        self.position = 0;
        self.policy = policy;
        self.samples.fill(0.0);
    }

    /// Append samples, returning how many were stored.
    pub fn write(&mut self, input: &[f32]) -> usize {
        let capacity = self.capacity();
        match self.policy {
            OverwritePolicy::StopWhenFull => {
                let room = capacity - self.position;
                let stored = input.len().min(room);
                self.samples[self.position..self.position + stored]
                    .copy_from_slice(&input[..stored]);
                self.position += stored;
                stored
            }
            OverwritePolicy::Wrap => {
                // Only the last `capacity` samples can survive a single write
                let skip = input.len().saturating_sub(capacity);
                if skip > 0 {
                    self.position = (self.position + skip) % capacity;
                }
                for &sample in &input[skip..] {
                    self.samples[self.position] = sample;
                    self.position = (self.position + 1) % capacity;
                }
                input.len()
            }
        }
    }

    /// Samples written since `cursor`, in write order, plus the new cursor.
    pub fn read_since(&self, cursor: usize) -> (Vec<f32>, usize) {
        let capacity = self.capacity();
        let cursor = cursor.min(capacity);
        let count = available_since(cursor, self.position, capacity);
        let mut out = Vec::with_capacity(count);

        let first = count.min(capacity - cursor);
        out.extend_from_slice(&self.samples[cursor..cursor + first]);
        out.extend_from_slice(&self.samples[..count - first]);

        (out, self.position)
    }

    /// Everything written since the last reset, for `StopWhenFull` recordings.
    pub fn recorded(&self) -> &[f32] {
        match self.policy {
            OverwritePolicy::StopWhenFull => &self.samples[..self.position],
            OverwritePolicy::Wrap => &[],
        }
    }
}

/// Bounded sample history with oldest-first eviction.
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    samples: VecDeque<f32>,
    max_len: usize,
}

impl RollingBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_len),
            max_len,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Append samples and evict from the front beyond `max_len`.
    ///
    /// Returns the number of evicted samples so callers can shift offsets.
    pub fn extend(&mut self, input: &[f32]) -> usize {
        self.samples.extend(input.iter().copied());
        let excess = self.samples.len().saturating_sub(self.max_len);
        self.samples.drain(..excess);
        excess
    }

    /// Contiguous view of the buffered samples.
    pub fn as_slice(&mut self) -> &[f32] {
        self.samples.make_contiguous()
    }

    /// Copy of `[start, len)`. Out-of-range starts yield an empty vector.
    pub fn copy_from(&self, start: usize) -> Vec<f32> {
        self.samples.range(start.min(self.len())..).copied().collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| i as f32).collect()
    }

    #[test]
    fn test_available_since_without_wrap() {
        assert_eq!(available_since(0, 0, 10), 0);
        assert_eq!(available_since(2, 7, 10), 5);
        assert_eq!(available_since(0, 10, 10), 10);
    }

    #[test]
    fn test_available_since_with_wrap() {
        assert_eq!(available_since(8, 3, 10), 5);
        assert_eq!(available_since(9, 0, 10), 1);
    }

    #[test]
    fn test_wrap_ring_reads_across_boundary() {
        let mut ring = DeviceRing::new(8, OverwritePolicy::Wrap);
        ring.write(&ramp(0, 6));
        let (first, cursor) = ring.read_since(0);
        assert_eq!(first, ramp(0, 6));
        assert_eq!(cursor, 6);

        ring.write(&ramp(6, 5));
        assert_eq!(ring.position(), 3);
        let (second, cursor) = ring.read_since(cursor);
        assert_eq!(second, ramp(6, 5));
        assert_eq!(cursor, 3);
    }

    #[test]
    fn test_wrap_ring_oversized_write_keeps_latest() {
        let mut ring = DeviceRing::new(4, OverwritePolicy::Wrap);
        assert_eq!(ring.write(&ramp(0, 10)), 10);
        // 10 samples into a 4-ring: position 10 % 4 == 2
        assert_eq!(ring.position(), 2);
        let (tail, _) = ring.read_since(3);
        assert_eq!(tail, ramp(7, 3));
    }

    #[test]
    fn test_stop_when_full_ring_drops_overflow() {
        let mut ring = DeviceRing::new(5, OverwritePolicy::StopWhenFull);
        assert_eq!(ring.write(&ramp(0, 3)), 3);
        assert_eq!(ring.write(&ramp(3, 4)), 2);
        assert!(ring.is_full());
        assert_eq!(ring.position(), 5);
        assert_eq!(ring.recorded(), ramp(0, 5).as_slice());

        let (rest, cursor) = ring.read_since(3);
        assert_eq!(rest, ramp(3, 2));
        assert_eq!(cursor, 5);
        let (nothing, _) = ring.read_since(cursor);
        assert!(nothing.is_empty());
    }

    #[test]
    fn test_reset_rewinds_and_switches_policy() {
        let mut ring = DeviceRing::new(4, OverwritePolicy::Wrap);
        ring.write(&[1.0, 1.0]);
        ring.reset(OverwritePolicy::StopWhenFull);
        assert_eq!(ring.position(), 0);
        assert_eq!(ring.policy(), OverwritePolicy::StopWhenFull);
        assert!(ring.recorded().is_empty());
    }

    #[test]
    fn test_wrap_ring_has_no_finite_recording() {
        let mut ring = DeviceRing::new(4, OverwritePolicy::Wrap);
        ring.write(&[0.5; 3]);
        assert!(ring.recorded().is_empty());
    }

    #[test]
    fn test_rolling_buffer_evicts_oldest() {
        let mut buffer = RollingBuffer::new(5);
        assert_eq!(buffer.extend(&ramp(0, 3)), 0);
        assert_eq!(buffer.extend(&ramp(3, 4)), 2);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.as_slice(), ramp(2, 5).as_slice());
    }

    #[test]
    fn test_rolling_buffer_copy_from() {
        let mut buffer = RollingBuffer::new(10);
        buffer.extend(&ramp(0, 6));
        assert_eq!(buffer.copy_from(4), ramp(4, 2));
        assert!(buffer.copy_from(6).is_empty());
        assert!(buffer.copy_from(60).is_empty());
    }

    #[test]
    fn test_rolling_buffer_never_exceeds_max_len() {
        let mut buffer = RollingBuffer::new(100);
        for size in [0, 7, 99, 100, 101, 250, 3, 1] {
            buffer.extend(&vec![0.1; size]);
            assert!(buffer.len() <= buffer.max_len());
        }
    }
}
