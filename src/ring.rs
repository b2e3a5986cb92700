//! Single-producer/single-consumer handoff ring between the server's realtime
//! thread and the host's pull thread.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use once_cell::sync::Lazy;

/// Smallest ring the bridge will allocate, in frames.
pub const MIN_CAPACITY_FRAMES: usize = 512;

/// Outcome of a single [`HandoffBuffer::push`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Frames stored in the ring by this push.
    pub written: usize,
    /// Frames discarded to make room, including input frames beyond capacity.
    pub dropped: usize,
}

/// Outcome of a single pull from the ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Frames delivered from buffered audio.
    pub read: usize,
    /// Frames filled with silence because the ring ran dry.
    pub padded: usize,
}

/// Counter snapshot for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Ring capacity in frames.
    pub capacity_frames: usize,
    /// Frames currently buffered.
    pub available: usize,
    /// Pushes that had to drop buffered audio.
    pub overruns: u64,
    /// Total frames dropped by overrunning pushes.
    pub dropped_frames: u64,
    /// Pulls that had to be padded with silence.
    pub underruns: u64,
    /// Total frames of silence inserted by padded pulls.
    pub padded_frames: u64,
}

/// Lock-free mono `f32` ring. Samples are stored as atomic bit patterns so a
/// consumer copy that races a drop-oldest reclaim is well defined; such a copy
/// is detected through the read cursor and retried.
pub struct HandoffBuffer {
    samples: Box<[AtomicU32]>,
    capacity_frames: usize,
    write_index: AtomicU64,
    read_index: AtomicU64,
    last_timestamp_ns: AtomicU64,
    overruns: AtomicU64,
    dropped_frames: AtomicU64,
    underruns: AtomicU64,
    padded_frames: AtomicU64,
}

impl HandoffBuffer {
    /// Allocate a ring holding `capacity_frames` samples.
    pub fn new(capacity_frames: usize) -> Self {
        let capacity_frames = capacity_frames.max(1);
        let samples = (0..capacity_frames)
            .map(|_| AtomicU32::new(0.0f32.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            samples,
            capacity_frames,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            last_timestamp_ns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            padded_frames: AtomicU64::new(0),
        }
    }

    /// Total capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Producer side. Stores `frames`, dropping the oldest buffered audio when
    /// the ring is full. Never blocks.
    pub fn push(&self, frames: &[f32]) -> PushReport {
        if frames.is_empty() {
            return PushReport::default();
        }
        let capacity = self.capacity_frames as u64;
        let (frames, skipped) = if frames.len() > self.capacity_frames {
            let skip = frames.len() - self.capacity_frames;
            (&frames[skip..], skip)
        } else {
            (frames, 0)
        };
        let len = frames.len() as u64;
        let write_index = self.write_index.load(Ordering::Relaxed);

        let mut reclaimed = 0u64;
        loop {
            let read_index = self.read_index.load(Ordering::Acquire);
            let used = write_index.saturating_sub(read_index).min(capacity);
            let free = capacity - used;
            if free >= len {
                break;
            }
            let deficit = len - free;
            if self
                .read_index
                .compare_exchange(
                    read_index,
                    read_index + deficit,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                reclaimed = deficit;
                break;
            }
        }

        let start = (write_index % capacity) as usize;
        let first = (self.capacity_frames - start).min(frames.len());
        for (cell, sample) in self.samples[start..start + first].iter().zip(&frames[..first]) {
            cell.store(sample.to_bits(), Ordering::Relaxed);
        }
        for (cell, sample) in self.samples.iter().zip(&frames[first..]) {
            cell.store(sample.to_bits(), Ordering::Relaxed);
        }
        self.write_index.store(write_index + len, Ordering::Release);
        self.last_timestamp_ns
            .store(monotonic_timestamp_ns(), Ordering::Relaxed);

        let dropped = skipped + reclaimed as usize;
        if dropped > 0 {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            self.dropped_frames
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        PushReport {
            written: frames.len(),
            dropped,
        }
    }

    /// Producer side. Pushes `frames` zero samples using `silence` as the
    /// source block, in chunks if `frames` exceeds its length.
    pub fn push_silence(&self, frames: usize, silence: &[f32]) -> PushReport {
        let mut report = PushReport::default();
        if silence.is_empty() {
            return report;
        }
        let mut remaining = frames;
        while remaining > 0 {
            let chunk = remaining.min(silence.len());
            let step = self.push(&silence[..chunk]);
            report.written += step.written;
            report.dropped += step.dropped;
            remaining -= chunk;
        }
        report
    }

    /// Consumer side. Copies up to `out.len()` buffered frames and returns how
    /// many were copied. Does not pad or count underruns.
    pub fn read_into(&self, out: &mut [f32]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let capacity = self.capacity_frames as u64;
        loop {
            let read_index = self.read_index.load(Ordering::Acquire);
            let write_index = self.write_index.load(Ordering::Acquire);
            let available = write_index.saturating_sub(read_index).min(capacity) as usize;
            let count = available.min(out.len());
            if count == 0 {
                return 0;
            }
            let start = (read_index % capacity) as usize;
            let first = (self.capacity_frames - start).min(count);
            for (dst, cell) in out[..first].iter_mut().zip(&self.samples[start..start + first]) {
                *dst = f32::from_bits(cell.load(Ordering::Relaxed));
            }
            for (dst, cell) in out[first..count].iter_mut().zip(self.samples.iter()) {
                *dst = f32::from_bits(cell.load(Ordering::Relaxed));
            }
            if self
                .read_index
                .compare_exchange(
                    read_index,
                    read_index + count as u64,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return count;
            }
        }
    }

    /// Consumer side. Always fills `out` completely, padding with silence when
    /// not enough audio is buffered.
    pub fn pull(&self, out: &mut [f32]) -> PullReport {
        let read = self.read_into(out);
        let padded = out.len() - read;
        if padded > 0 {
            out[read..].fill(0.0);
            self.note_underrun(padded);
        }
        PullReport { read, padded }
    }

    /// Record a consumer-side underrun of `padded` frames.
    pub fn note_underrun(&self, padded: usize) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
        self.padded_frames
            .fetch_add(padded as u64, Ordering::Relaxed);
    }

    /// Frames ready for reading.
    pub fn available_read(&self) -> usize {
        let capacity = self.capacity_frames as u64;
        let read_index = self.read_index.load(Ordering::Acquire);
        let write_index = self.write_index.load(Ordering::Acquire);
        write_index.saturating_sub(read_index).min(capacity) as usize
    }

    /// Fraction of the ring currently holding audio (0-1).
    pub fn fill_ratio(&self) -> f32 {
        self.available_read() as f32 / self.capacity_frames as f32
    }

    /// Timestamp of the last push.
    pub fn last_timestamp_ns(&self) -> u64 {
        self.last_timestamp_ns.load(Ordering::Relaxed)
    }

    /// Pushes that had to drop buffered audio.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Pulls that had to be padded with silence.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            capacity_frames: self.capacity_frames,
            available: self.available_read(),
            overruns: self.overruns(),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            underruns: self.underruns(),
            padded_frames: self.padded_frames.load(Ordering::Relaxed),
        }
    }
}

/// Ring capacity for the given block sizes: `headroom` times the larger block,
/// rounded up to a power of two and never below [`MIN_CAPACITY_FRAMES`].
pub fn capacity_for_blocks(server_block: usize, host_block: usize, headroom: usize) -> usize {
    let largest = server_block.max(host_block).max(1);
    (largest * headroom.max(2))
        .next_power_of_two()
        .max(MIN_CAPACITY_FRAMES)
}

/// Monotonic timestamp in nanoseconds since the first call.
pub fn monotonic_timestamp_ns() -> u64 {
    static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
    let elapsed = START.elapsed();
    (elapsed.as_secs() * 1_000_000_000) + elapsed.subsec_nanos() as u64
}
