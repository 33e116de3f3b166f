//! Per-port sample ring buffer.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer as _};
use ringbuf::HeapRb;

/// Number of most recent samples [`RingBuffer::rms_level`] looks at.
pub const RMS_WINDOW: usize = 1024;

/// A fixed-capacity sample queue between the process callback and a consumer.
///
/// Writes never block or fail: when the buffer is full the oldest unread
/// samples are dropped to make room, and the number dropped is counted in
/// [`overruns`](Self::overruns). Reads never come up short: missing samples
/// are zero-filled.
///
/// Every operation takes the same short-held lock, so one writer and one
/// reader may run on different threads at different rates.
///
/// # Example
///
/// ```
/// use audio_graph_link::RingBuffer;
///
/// let ring = RingBuffer::new(4);
/// ring.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);
///
/// let mut out = [0.0; 6];
/// assert_eq!(ring.read(&mut out), 4);
/// assert_eq!(out, [2.0, 3.0, 4.0, 5.0, 0.0, 0.0]);
/// assert_eq!(ring.overruns(), 1);
/// ```
pub struct RingBuffer {
    inner: Mutex<HeapRb<f32>>,
    capacity: usize,
    overruns: AtomicU64,
}

impl RingBuffer {
    /// Creates a buffer holding up to `capacity` unread samples (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(HeapRb::new(capacity)),
            capacity,
            overruns: AtomicU64::new(0),
        }
    }

    /// Maximum number of unread samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends samples, discarding the oldest unread ones if full.
    pub fn write(&self, samples: &[f32]) {
        let mut rb = self.inner.lock();
        let dropped = (rb.occupied_len() + samples.len()).saturating_sub(self.capacity);
        rb.push_slice_overwrite(samples);
        drop(rb);

        if dropped > 0 {
            self.overruns.fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }

    /// Fills `out` with the oldest unread samples, zero-filling any shortfall.
    ///
    /// Returns the number of real samples copied.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let copied = self.inner.lock().pop_slice(out);
        out[copied..].fill(0.0);
        copied
    }

    /// Discards all unread samples.
    pub fn clear(&self) {
        Consumer::clear(&mut *self.inner.lock());
    }

    /// Number of unread samples.
    pub fn available_to_read(&self) -> usize {
        self.inner.lock().occupied_len()
    }

    /// RMS over the most recent `min(1024, available)` unread samples.
    ///
    /// Does not consume anything. Returns 0.0 when empty.
    pub fn rms_level(&self) -> f32 {
        let rb = self.inner.lock();
        let available = rb.occupied_len();
        let window = available.min(RMS_WINDOW);
        if window == 0 {
            return 0.0;
        }

        let sum: f64 = rb
            .iter()
            .skip(available - window)
            .map(|&s| f64::from(s) * f64::from(s))
            .sum();
        (sum / window as f64).sqrt() as f32
    }

    /// Total samples discarded by overwrite-on-full since creation.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("available", &self.available_to_read())
            .field("overruns", &self.overruns())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overwrite_keeps_last_capacity_samples() {
        let capacity = 64;
        let ring = RingBuffer::new(capacity);
        let samples: Vec<f32> = (1..=capacity + 5).map(|i| i as f32).collect();

        for chunk in samples.chunks(7) {
            ring.write(chunk);
        }

        assert_eq!(ring.available_to_read(), capacity);
        let mut out = vec![0.0; capacity];
        assert_eq!(ring.read(&mut out), capacity);

        let expected: Vec<f32> = (6..=capacity + 5).map(|i| i as f32).collect();
        assert_eq!(out, expected);
        assert_eq!(ring.overruns(), 5);
    }

    #[test]
    fn test_short_read_zero_fills() {
        let ring = RingBuffer::new(16);
        ring.write(&[0.5, -0.5, 0.25]);

        let mut out = [9.0; 8];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(out, [0.5, -0.5, 0.25, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(ring.available_to_read(), 0);
    }

    #[test]
    fn test_read_empty() {
        let ring = RingBuffer::new(16);
        let mut out = [1.0; 4];
        assert_eq!(ring.read(&mut out), 0);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_interleaved_write_read() {
        let ring = RingBuffer::new(8);
        let mut out = [0.0; 3];

        for round in 0..10 {
            let base = round as f32 * 3.0;
            ring.write(&[base, base + 1.0, base + 2.0]);
            ring.read(&mut out);
            assert_eq!(out, [base, base + 1.0, base + 2.0]);
        }
        assert_eq!(ring.overruns(), 0);
    }

    #[test]
    fn test_rms_empty_and_cleared() {
        let ring = RingBuffer::new(32);
        assert_eq!(ring.rms_level(), 0.0);

        ring.write(&[1.0; 16]);
        assert!(ring.rms_level() > 0.0);

        ring.clear();
        assert_eq!(ring.available_to_read(), 0);
        assert_eq!(ring.rms_level(), 0.0);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let ring = RingBuffer::new(8);
        ring.write(&[1.0; 6]);
        ring.clear();

        ring.write(&[2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        let mut out = [0.0; 8];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        assert_eq!(ring.overruns(), 1);
    }

    #[test]
    fn test_rms_uses_recent_window() {
        let ring = RingBuffer::new(4096);
        ring.write(&[1.0; 2048]);
        ring.write(&[0.5; RMS_WINDOW]);

        assert!((ring.rms_level() - 0.5).abs() < 1e-6);
        // non-consuming
        assert_eq!(ring.available_to_read(), 2048 + RMS_WINDOW);
    }

    #[test]
    fn test_rms_constant_signal() {
        let ring = RingBuffer::new(256);
        ring.write(&[-0.25; 100]);
        assert!((ring.rms_level() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let ring = RingBuffer::new(0);
        assert_eq!(ring.capacity(), 1);
        ring.write(&[1.0, 2.0]);

        let mut out = [0.0; 1];
        ring.read(&mut out);
        assert_eq!(out, [2.0]);
    }

    #[test]
    fn test_concurrent_writer_and_reader() {
        use std::sync::Arc;

        let ring = Arc::new(RingBuffer::new(512));
        let writer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    ring.write(&[0.5; 64]);
                }
            })
        };

        let mut out = [0.0; 64];
        for _ in 0..1000 {
            ring.read(&mut out);
            assert!(out.iter().all(|&s| s == 0.5 || s == 0.0));
        }
        writer.join().unwrap();
        assert!(ring.available_to_read() <= 512);
    }
}
