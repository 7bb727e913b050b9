//! Lock-free SPSC ring buffer for capture samples.
//!
//! Uses the `ringbuf` crate to pass i16 audio samples from the cpal
//! callback thread to the processing loop without locks.

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

/// Default capacity: ~10 seconds of audio at 48 kHz.
const DEFAULT_CAPACITY: usize = 480_000;

/// Producer half — lives in the cpal audio callback thread.
pub struct AudioProducer {
    inner: ringbuf::HeapProd<i16>,
}

/// Consumer half — lives in the processing loop.
pub struct AudioConsumer {
    inner: ringbuf::HeapCons<i16>,
}

/// Create a matched producer/consumer pair backed by a lock-free ring.
pub fn audio_ring_buffer(capacity: Option<usize>) -> (AudioProducer, AudioConsumer) {
    let cap = capacity.unwrap_or(DEFAULT_CAPACITY);
    let rb = HeapRb::<i16>::new(cap);
    let (prod, cons) = rb.split();
    (AudioProducer { inner: prod }, AudioConsumer { inner: cons })
}

impl AudioProducer {
    /// Push a slice of samples. Returns the number actually written
    /// (less than `samples.len()` when the buffer is full).
    pub fn push_slice(&mut self, samples: &[i16]) -> usize {
        self.inner.push_slice(samples)
    }
}

// Safety: the ringbuf producer is designed for single-threaded use and
// cpal callbacks run on one dedicated audio thread.
unsafe impl Send for AudioProducer {}

impl AudioConsumer {
    /// Pop up to `buf.len()` samples into `buf`. Returns the number read.
    pub fn pop_slice(&mut self, buf: &mut [i16]) -> usize {
        self.inner.pop_slice(buf)
    }

    /// Number of samples currently available.
    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }
}

unsafe impl Send for AudioConsumer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trip() {
        let (mut prod, mut cons) = audio_ring_buffer(Some(8));
        assert_eq!(prod.push_slice(&[1, 2, 3]), 3);
        assert_eq!(cons.available(), 3);

        let mut buf = [0i16; 3];
        assert_eq!(cons.pop_slice(&mut buf), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(cons.available(), 0);
    }

    #[test]
    fn full_ring_rejects_overflow() {
        let (mut prod, _cons) = audio_ring_buffer(Some(4));
        assert_eq!(prod.push_slice(&[1, 2, 3, 4, 5]), 4);
    }
}
