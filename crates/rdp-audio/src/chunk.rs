//! Component A: the chunk list.
//!
//! A FIFO of fixed-duration (200 ms) buffers of internal-format samples,
//! filled by the VM producer and drained by the scheduler once each
//! chunk's due time has passed.

use std::collections::VecDeque;

use crate::types::{Sample, CHUNK_MS};

/// One 200 ms window of internal-format samples at a single source rate.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub start_ts_ms: u64,
    pub created_ts_ms: u64,
    pub samples_start_ns: u64,
    pub src_freq: u32,
    pub is_first: bool,
    pub buffer: Vec<Sample>,
    capacity: usize,
}

impl Chunk {
    fn new(start_ts_ms: u64, created_ts_ms: u64, samples_start_ns: u64, src_freq: u32, is_first: bool) -> Self {
        let capacity = (u64::from(src_freq) * CHUNK_MS / 1000) as usize;
        Self {
            start_ts_ms,
            created_ts_ms,
            samples_start_ns,
            src_freq,
            is_first,
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.capacity
    }

    pub fn free_len(&self) -> usize {
        self.capacity - self.buffer.len()
    }

    /// True once this chunk's scheduled playback window has been reached.
    /// The first chunk of a stream is deferred by an extra interval so
    /// clients have something buffered before the first WRITE lands.
    pub fn is_due(&self, now_ms: u64) -> bool {
        let delay_ms = if self.is_first { 2 * CHUNK_MS } else { CHUNK_MS };
        self.start_ts_ms + delay_ms <= now_ms
    }
}

/// FIFO of chunks plus the bookkeeping needed to decide where the next
/// one starts and whether it continues the current stream segment.
#[derive(Debug, Default)]
pub struct ChunkList {
    chunks: VecDeque<Chunk>,
}

impl ChunkList {
    pub fn new() -> Self {
        Self { chunks: VecDeque::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Append `samples` (already at `src_freq`) to the list, opening new
    /// chunks as needed. Returns `true` if a new stream segment was
    /// started (i.e. the caller must (re)start the resampler).
    pub fn append_samples(&mut self, samples: &[Sample], src_freq: u32, now_ms: u64, now_ns: u64) -> bool {
        let starting_new_segment = match self.chunks.back() {
            None => true,
            Some(tail) => tail.src_freq != src_freq,
        };

        if starting_new_segment {
            let samples_start_ns = now_ns.saturating_sub(crate::types::duration_ns(samples.len() as u64, src_freq));
            // A true first chunk starts at the current wall clock; a rate
            // change partway through a stream continues the existing
            // chunk cadence instead of resetting it to `now_ms`.
            let (start_ts_ms, is_first) = match self.chunks.back() {
                None => (now_ms, true),
                Some(tail) => (tail.start_ts_ms + CHUNK_MS, false),
            };
            self.chunks.push_back(Chunk::new(start_ts_ms, now_ms, samples_start_ns, src_freq, is_first));
        }

        let mut remaining = samples;
        while !remaining.is_empty() {
            if self.chunks.back().map(Chunk::is_full).unwrap_or(true) {
                let (start_ts_ms, samples_start_ns) = match self.chunks.back() {
                    Some(tail) => (tail.start_ts_ms + CHUNK_MS, now_ns),
                    None => (now_ms, now_ns),
                };
                self.chunks.push_back(Chunk::new(start_ts_ms, now_ms, samples_start_ns, src_freq, false));
            }
            let tail = self.chunks.back_mut().expect("chunk just ensured");
            let take = remaining.len().min(tail.free_len());
            tail.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
        }

        starting_new_segment
    }

    /// Remove and return all chunks whose due time has passed, in FIFO
    /// order. Stops at the first chunk that is not yet due — due-ness is
    /// monotonic down the queue, so later chunks cannot be due if an
    /// earlier one isn't.
    pub fn drain_due(&mut self, now_ms: u64) -> Vec<Chunk> {
        let mut due = Vec::new();
        while let Some(front) = self.chunks.front() {
            if front.is_due(now_ms) {
                due.push(self.chunks.pop_front().expect("front just checked"));
            } else {
                break;
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(n: usize) -> Vec<Sample> {
        vec![Sample::from_i16(1, 1); n]
    }

    #[test]
    fn first_chunk_marked_and_capacity_matches_rate() {
        let mut list = ChunkList::new();
        list.append_samples(&samples(100), 22050, 0, 0);
        assert_eq!(list.len(), 1);
        let chunk = &list.chunks[0];
        assert!(chunk.is_first);
        assert_eq!(chunk.capacity(), 22050 * 200 / 1000);
    }

    #[test]
    fn cadence_is_200ms_between_chunk_starts() {
        let mut list = ChunkList::new();
        // 22050 Hz for 1.0s split across many small submissions: should
        // produce 5 chunks of 200ms each, spaced exactly 200ms apart.
        for _ in 0..10 {
            list.append_samples(&samples(2205), 22050, 0, 0);
        }
        let starts: Vec<u64> = list.chunks.iter().map(|c| c.start_ts_ms).collect();
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], 200);
        }
    }

    #[test]
    fn rate_change_starts_new_segment() {
        let mut list = ChunkList::new();
        assert!(list.append_samples(&samples(100), 22050, 0, 0));
        assert!(!list.append_samples(&samples(100), 22050, 0, 0));
        assert!(list.append_samples(&samples(100), 44100, 0, 0));
    }

    #[test]
    fn drain_due_respects_first_chunk_double_delay() {
        let mut list = ChunkList::new();
        list.append_samples(&samples(10), 22050, 0, 0);
        assert!(list.drain_due(200).is_empty());
        assert_eq!(list.drain_due(400).len(), 1);
    }

    #[test]
    fn only_tail_may_be_partially_filled() {
        let mut list = ChunkList::new();
        list.append_samples(&samples(22050 * 2), 22050, 0, 0);
        let full_count = list.chunks.iter().filter(|c| c.is_full()).count();
        assert!(full_count == list.len() || full_count == list.len() - 1);
    }
}
