//! CD audio PCM transport: a lock-free ring between the emulated
//! drive and the host's 44.1 kHz output stream.

use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Half a second of interleaved stereo at 44.1 kHz.
const RING_CAPACITY: usize = 44_100;

/// The device side of one drive's PCM stream.
pub struct CdAudioOutput {
    producer: HeapProd<i16>,
    consumer: Option<HeapCons<i16>>,
}

impl CdAudioOutput {
    #[must_use]
    pub fn new() -> Self {
        let (producer, consumer) = HeapRb::<i16>::new(RING_CAPACITY).split();
        Self {
            producer,
            consumer: Some(consumer),
        }
    }

    /// Feed interleaved samples; excess beyond the ring capacity is
    /// dropped (the host fell behind).
    pub fn push_samples(&mut self, samples: &[i16]) {
        let _ = self.producer.push_slice(samples);
    }

    /// Hand the read side to the audio collaborator. Can only be taken
    /// once.
    pub fn take_consumer(&mut self) -> Option<HeapCons<i16>> {
        self.consumer.take()
    }
}

impl Default for CdAudioOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::traits::Observer;

    #[test]
    fn samples_flow_through_the_ring() {
        let mut output = CdAudioOutput::new();
        let mut consumer = output.take_consumer().expect("first take");
        assert!(output.take_consumer().is_none(), "consumer moves out once");
        output.push_samples(&[1, 2, 3, 4]);
        assert_eq!(consumer.occupied_len(), 4);
        let mut sink = [0i16; 4];
        assert_eq!(consumer.pop_slice(&mut sink), 4);
        assert_eq!(sink, [1, 2, 3, 4]);
    }
}
