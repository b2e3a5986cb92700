//! Realtime capture callback.
//!
//! Runs on the server's realtime thread: no allocation, no locks, no logging.
//! Everything it touches is either owned by the callback or shared through
//! atomics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::MAX_CHANNELS;
use crate::ring::{HandoffBuffer, monotonic_timestamp_ns};
use crate::server::{Control, ProcessHandler};

/// Sizing state written by server notifications and read by the consumer
/// side of every handoff buffer.
pub struct SharedSizing {
    sample_rate: AtomicU32,
    block_frames: AtomicU32,
    capacity_frames: usize,
    resize_pending: AtomicBool,
    stopped: AtomicBool,
    cycles: AtomicU64,
    faults: AtomicU64,
    last_cycle_ns: AtomicU64,
}

impl SharedSizing {
    /// Sizing for rings of `capacity_frames` at the given server settings.
    pub fn new(sample_rate: u32, block_frames: u32, capacity_frames: usize) -> Self {
        Self {
            sample_rate: AtomicU32::new(sample_rate),
            block_frames: AtomicU32::new(block_frames),
            capacity_frames,
            resize_pending: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            last_cycle_ns: AtomicU64::new(0),
        }
    }

    /// Server sample rate in Hertz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    /// Record a server sample-rate change.
    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Release);
    }

    /// Server block size in frames.
    pub fn block_frames(&self) -> u32 {
        self.block_frames.load(Ordering::Acquire)
    }

    /// Record a server block-size change. Returns `true` when the rings no
    /// longer have the required headroom and must be rebuilt.
    pub fn set_block_frames(&self, frames: u32) -> bool {
        self.block_frames.store(frames, Ordering::Release);
        let too_small = (frames as usize).saturating_mul(2) > self.capacity_frames;
        if too_small {
            self.resize_pending.store(true, Ordering::Release);
        }
        too_small
    }

    /// Capacity of each handoff ring in frames.
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Whether a block-size change outgrew the rings.
    pub fn resize_pending(&self) -> bool {
        self.resize_pending.load(Ordering::Acquire)
    }

    /// Whether the callback asked the server to stop calling it.
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Completed capture cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Cycles that degraded to silence because the server handed us
    /// malformed buffers.
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Timestamp of the most recent cycle.
    pub fn last_cycle_ns(&self) -> u64 {
        self.last_cycle_ns.load(Ordering::Relaxed)
    }
}

/// Per-slot connection flags: the realtime view of the port registry.
#[derive(Default)]
pub struct SlotFlags {
    connected: [AtomicBool; MAX_CHANNELS],
}

impl SlotFlags {
    /// Mark `slot` as fed by at least one external port.
    pub fn set_connected(&self, slot: usize, connected: bool) {
        if let Some(flag) = self.connected.get(slot) {
            flag.store(connected, Ordering::Release);
        }
    }

    /// Whether `slot` is fed by at least one external port.
    pub fn is_connected(&self, slot: usize) -> bool {
        self.connected
            .get(slot)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

/// The process handler installed with the server.
pub struct CaptureCallback {
    buffers: Vec<Arc<HandoffBuffer>>,
    flags: Arc<SlotFlags>,
    sizing: Arc<SharedSizing>,
    silence: Vec<f32>,
}

impl CaptureCallback {
    /// Build a callback writing into `buffers`, one per channel slot. The
    /// silence block is preallocated for `max_block_frames`.
    pub fn new(
        buffers: Vec<Arc<HandoffBuffer>>,
        flags: Arc<SlotFlags>,
        sizing: Arc<SharedSizing>,
        max_block_frames: usize,
    ) -> Self {
        Self {
            buffers,
            flags,
            sizing,
            silence: vec![0.0; max_block_frames.max(1)],
        }
    }

    fn write_silence(&self, frames: usize) {
        for buffer in &self.buffers {
            buffer.push_silence(frames, &self.silence);
        }
    }
}

impl ProcessHandler for CaptureCallback {
    fn process(&mut self, frames: usize, inputs: &[&[f32]]) -> Control {
        self.sizing
            .last_cycle_ns
            .store(monotonic_timestamp_ns(), Ordering::Relaxed);
        self.sizing.cycles.fetch_add(1, Ordering::Relaxed);
        if frames == 0 {
            return Control::Continue;
        }

        if inputs.len() != self.buffers.len() {
            self.sizing.faults.fetch_add(1, Ordering::Relaxed);
            self.sizing.stopped.store(true, Ordering::Release);
            self.write_silence(frames);
            return Control::Quit;
        }

        for (slot, (buffer, input)) in self.buffers.iter().zip(inputs).enumerate() {
            if !self.flags.is_connected(slot) {
                buffer.push_silence(frames, &self.silence);
            } else if input.len() < frames {
                self.sizing.faults.fetch_add(1, Ordering::Relaxed);
                buffer.push_silence(frames, &self.silence);
            } else {
                buffer.push(&input[..frames]);
            }
        }
        Control::Continue
    }

    fn buffer_size(&mut self, frames: u32) -> Control {
        self.sizing.set_block_frames(frames);
        Control::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback(channels: usize) -> (CaptureCallback, Vec<Arc<HandoffBuffer>>, Arc<SlotFlags>) {
        let buffers: Vec<_> = (0..channels)
            .map(|_| Arc::new(HandoffBuffer::new(1024)))
            .collect();
        let flags = Arc::new(SlotFlags::default());
        let sizing = Arc::new(SharedSizing::new(48_000, 64, 1024));
        let cb = CaptureCallback::new(buffers.clone(), flags.clone(), sizing, 64);
        (cb, buffers, flags)
    }

    #[test]
    fn connected_slots_copy_and_unconnected_slots_get_silence() {
        let (mut cb, buffers, flags) = callback(2);
        flags.set_connected(0, true);
        let left: Vec<f32> = (0..64).map(|i| i as f32 + 1.0).collect();
        let right = vec![0.75f32; 64];
        assert_eq!(cb.process(64, &[&left, &right]), Control::Continue);
        assert_eq!(cb.sizing.cycles(), 1);
        let first_cycle = cb.sizing.last_cycle_ns();

        let mut out = vec![0.0f32; 64];
        buffers[0].pull(&mut out);
        assert_eq!(out, left);
        buffers[1].pull(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(buffers[1].underruns(), 0);

        std::thread::sleep(std::time::Duration::from_millis(2));
        cb.process(64, &[&left, &right]);
        assert_eq!(cb.sizing.cycles(), 2);
        assert!(cb.sizing.last_cycle_ns() > first_cycle);
    }

    #[test]
    fn short_input_degrades_to_silence() {
        let (mut cb, buffers, flags) = callback(1);
        flags.set_connected(0, true);
        let short = vec![1.0f32; 10];
        assert_eq!(cb.process(64, &[&short]), Control::Continue);
        assert_eq!(buffers[0].available_read(), 64);
        assert_eq!(cb.sizing.faults(), 1);
    }

    #[test]
    fn mismatched_port_table_requests_quit() {
        let (mut cb, buffers, _flags) = callback(2);
        let only = vec![1.0f32; 64];
        assert!(!cb.sizing.stopped());
        assert_eq!(cb.process(64, &[&only]), Control::Quit);
        assert!(cb.sizing.stopped());
        assert_eq!(buffers[0].available_read(), 64);
        assert_eq!(buffers[1].available_read(), 64);
    }

    #[test]
    fn larger_block_than_silence_is_chunked() {
        let (mut cb, buffers, _flags) = callback(1);
        let input = vec![0.0f32; 300];
        cb.process(300, &[&input]);
        assert_eq!(buffers[0].available_read(), 300);
    }

    #[test]
    fn block_growth_beyond_headroom_flags_resize() {
        let sizing = SharedSizing::new(48_000, 256, 1024);
        assert!(!sizing.set_block_frames(512));
        assert!(!sizing.resize_pending());
        assert!(sizing.set_block_frames(1024));
        assert!(sizing.resize_pending());
        assert_eq!(sizing.block_frames(), 1024);
    }
}
