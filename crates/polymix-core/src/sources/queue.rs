//! Gapless playback queue
//!
//! `enqueue` creates the per-play stream up front on the control thread,
//! so the audio thread only ever pops ready-made streams. Finished
//! streams are wrapped in `basedrop::Owned` and their teardown happens on
//! the GC thread, never in the mix callback. The queue's lock is taken
//! with `try_lock` on the audio side; a contended quantum just plays out
//! the current stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use basedrop::Owned;
use parking_lot::Mutex;

use crate::engine::gc::gc_handle;
use crate::error::{EngineError, EngineResult};
use crate::source::{
    AudioSource, AudioStream, SeekFlags, SeekResult, SourceParams, VoiceOutput,
};
use crate::types::Sample;

struct QueueShared {
    pending: Mutex<VecDeque<Owned<Box<dyn AudioStream>>>>,
    count: AtomicUsize,
}

/// Plays enqueued sources back to back as one continuous voice
pub struct QueueSource {
    params: SourceParams,
    shared: Arc<QueueShared>,
}

impl QueueSource {
    /// All enqueued sources must match this format
    pub fn new(sample_rate: f32, channels: usize) -> Self {
        let mut params = SourceParams::new(sample_rate, channels);
        // One timeline, one voice
        params.flags.single_instance = true;
        Self {
            params,
            shared: Arc::new(QueueShared {
                pending: Mutex::new(VecDeque::new()),
                count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn params_mut(&mut self) -> &mut SourceParams {
        &mut self.params
    }

    /// Append a source to the queue. Its stream is created now, so the
    /// handoff at the seam costs nothing on the audio thread.
    pub fn enqueue(&self, source: &dyn AudioSource) -> EngineResult<()> {
        let params = source.params();
        if params.channels != self.params.channels {
            return Err(EngineError::InvalidParameter(
                "queued source channel count does not match the queue",
            ));
        }
        if (params.base_sample_rate - self.params.base_sample_rate).abs() > f32::EPSILON {
            return Err(EngineError::InvalidParameter(
                "queued source sample rate does not match the queue",
            ));
        }
        let stream = match source.create_voice()? {
            VoiceOutput::Stream(stream) => stream,
            VoiceOutput::Bus(_) => {
                return Err(EngineError::InvalidParameter("cannot enqueue a bus"))
            }
        };
        self.shared
            .pending
            .lock()
            .push_back(Owned::new(&gc_handle(), stream));
        self.shared.count.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Streams waiting behind the currently playing one
    pub fn queued(&self) -> usize {
        self.shared.count.load(Ordering::Acquire)
    }
}

impl AudioSource for QueueSource {
    fn params(&self) -> &SourceParams {
        &self.params
    }

    fn create_voice(&self) -> EngineResult<VoiceOutput> {
        Ok(VoiceOutput::Stream(Box::new(QueueStream {
            shared: Arc::clone(&self.shared),
            current: None,
        })))
    }
}

struct QueueStream {
    shared: Arc<QueueShared>,
    current: Option<Owned<Box<dyn AudioStream>>>,
}

impl AudioStream for QueueStream {
    fn get_audio(&mut self, dst: &mut [Sample], samples: usize, stride: usize) -> usize {
        let mut filled = 0;
        while filled < samples {
            if self.current.is_none() {
                let Some(mut pending) = self.shared.pending.try_lock() else {
                    break;
                };
                match pending.pop_front() {
                    Some(next) => {
                        self.shared.count.fetch_sub(1, Ordering::Release);
                        self.current = Some(next);
                    }
                    None => break,
                }
            }
            let Some(current) = self.current.as_mut() else {
                break;
            };
            // Offsetting the slice start shifts every channel row
            let got = current.get_audio(&mut dst[filled..], samples - filled, stride);
            filled += got;
            if current.has_ended() || got == 0 {
                // Deferred drop via Owned
                self.current = None;
            }
        }
        filled
    }

    fn has_ended(&self) -> bool {
        self.current.is_none() && self.shared.count.load(Ordering::Acquire) == 0
    }

    fn can_seek(&self) -> bool {
        false
    }

    fn seek(
        &mut self,
        _position: u64,
        _scratch: &mut [Sample],
        _flags: SeekFlags,
    ) -> EngineResult<SeekResult> {
        Err(EngineError::NotImplemented("queues cannot seek"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::sources::SampleBuffer;

    fn stream_of(queue: &QueueSource) -> Box<dyn AudioStream> {
        match queue.create_voice().unwrap() {
            VoiceOutput::Stream(s) => s,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_plays_across_the_seam() {
        let queue = QueueSource::new(44100.0, 1);
        let a = SampleBuffer::from_planar(vec![1.0; 3], 44100.0, 1).unwrap();
        let b = SampleBuffer::from_planar(vec![2.0; 3], 44100.0, 1).unwrap();
        queue.enqueue(&a).unwrap();
        queue.enqueue(&b).unwrap();
        assert_eq!(queue.queued(), 2);

        let mut stream = stream_of(&queue);
        let mut dst = [0.0; 8];
        // One read crosses from a into b with no gap
        assert_eq!(stream.get_audio(&mut dst, 6, 8), 6);
        assert_eq!(&dst[..6], &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert!(stream.has_ended());
    }

    #[test]
    fn test_empty_queue_reads_nothing_but_can_resume() {
        let queue = QueueSource::new(44100.0, 1);
        let mut stream = stream_of(&queue);
        let mut dst = [0.0; 4];
        assert_eq!(stream.get_audio(&mut dst, 4, 4), 0);
        assert!(stream.has_ended());

        // Enqueue after the drought: the same voice picks it up
        let a = SampleBuffer::from_planar(vec![0.5; 2], 44100.0, 1).unwrap();
        queue.enqueue(&a).unwrap();
        assert!(!stream.has_ended());
        assert_eq!(stream.get_audio(&mut dst, 4, 4), 2);
    }

    #[test]
    fn test_enqueue_rejects_format_mismatch_and_busses() {
        let queue = QueueSource::new(44100.0, 2);
        let mono = SampleBuffer::from_planar(vec![0.0; 4], 44100.0, 1).unwrap();
        assert!(queue.enqueue(&mono).is_err());
        let wrong_rate = SampleBuffer::from_planar(vec![0.0; 4], 48000.0, 2).unwrap();
        assert!(queue.enqueue(&wrong_rate).is_err());
        let bus = Bus::with_channels(44100.0, 2);
        assert!(queue.enqueue(&bus).is_err());
    }
}
