//! In-memory sample source
//!
//! Holds planar float data behind an `Arc`, so any number of concurrent
//! voices read the same allocation. Seeks are exact cursor moves.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::source::{
    AudioSource, AudioStream, SeekFlags, SeekResult, SourceParams, VoiceOutput,
};
use crate::types::{Sample, MAX_CHANNELS};

/// A sound loaded fully into memory
pub struct SampleBuffer {
    params: SourceParams,
    data: Arc<Vec<Sample>>,
    frames: usize,
}

impl SampleBuffer {
    /// Build from planar data: channel `c` occupies
    /// `data[c * frames .. (c + 1) * frames]`
    pub fn from_planar(data: Vec<Sample>, sample_rate: f32, channels: usize) -> EngineResult<Self> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(EngineError::InvalidParameter("unsupported channel count"));
        }
        if sample_rate <= 0.0 {
            return Err(EngineError::InvalidParameter("sample rate must be positive"));
        }
        if data.len() % channels != 0 {
            return Err(EngineError::InvalidParameter(
                "data length is not a whole number of frames",
            ));
        }
        let frames = data.len() / channels;
        Ok(Self {
            params: SourceParams::new(sample_rate, channels),
            data: Arc::new(data),
            frames,
        })
    }

    /// Build from interleaved data, deinterleaving into planar storage
    pub fn from_interleaved(
        data: &[Sample],
        sample_rate: f32,
        channels: usize,
    ) -> EngineResult<Self> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(EngineError::InvalidParameter("unsupported channel count"));
        }
        if data.len() % channels != 0 {
            return Err(EngineError::InvalidParameter(
                "data length is not a whole number of frames",
            ));
        }
        let frames = data.len() / channels;
        let mut planar = vec![0.0; data.len()];
        for (i, frame) in data.chunks_exact(channels).enumerate() {
            for (ch, &s) in frame.iter().enumerate() {
                planar[ch * frames + i] = s;
            }
        }
        Self::from_planar(planar, sample_rate, channels)
    }

    pub fn params_mut(&mut self) -> &mut SourceParams {
        &mut self.params
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Length in seconds
    pub fn duration(&self) -> f64 {
        self.frames as f64 / f64::from(self.params.base_sample_rate)
    }
}

impl AudioSource for SampleBuffer {
    fn params(&self) -> &SourceParams {
        &self.params
    }

    fn create_voice(&self) -> EngineResult<VoiceOutput> {
        Ok(VoiceOutput::Stream(Box::new(SampleBufferStream {
            data: Arc::clone(&self.data),
            frames: self.frames,
            channels: self.params.channels,
            cursor: 0,
        })))
    }
}

struct SampleBufferStream {
    data: Arc<Vec<Sample>>,
    frames: usize,
    channels: usize,
    cursor: usize,
}

impl AudioStream for SampleBufferStream {
    fn get_audio(&mut self, dst: &mut [Sample], samples: usize, stride: usize) -> usize {
        let n = samples.min(self.frames - self.cursor);
        for ch in 0..self.channels {
            let src = &self.data[ch * self.frames + self.cursor..ch * self.frames + self.cursor + n];
            dst[ch * stride..ch * stride + n].copy_from_slice(src);
        }
        self.cursor += n;
        n
    }

    fn has_ended(&self) -> bool {
        self.cursor >= self.frames
    }

    fn seek(
        &mut self,
        position: u64,
        _scratch: &mut [Sample],
        _flags: SeekFlags,
    ) -> EngineResult<SeekResult> {
        let end_of_stream = position >= self.frames as u64;
        self.cursor = (position as usize).min(self.frames);
        Ok(SeekResult {
            position: self.cursor as u64,
            end_of_stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(buffer: &SampleBuffer) -> Box<dyn AudioStream> {
        match buffer.create_voice().unwrap() {
            VoiceOutput::Stream(s) => s,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_from_interleaved_deinterleaves() {
        let buffer =
            SampleBuffer::from_interleaved(&[1.0, -1.0, 2.0, -2.0], 44100.0, 2).unwrap();
        let mut stream = stream_of(&buffer);
        let mut dst = [0.0; 8];
        assert_eq!(stream.get_audio(&mut dst, 2, 4), 2);
        assert_eq!(&dst[0..2], &[1.0, 2.0]);
        assert_eq!(&dst[4..6], &[-1.0, -2.0]);
    }

    #[test]
    fn test_short_read_at_end() {
        let buffer = SampleBuffer::from_planar(vec![0.5; 3], 44100.0, 1).unwrap();
        let mut stream = stream_of(&buffer);
        let mut dst = [0.0; 8];
        assert_eq!(stream.get_audio(&mut dst, 8, 8), 3);
        assert!(stream.has_ended());
        // Reads past the end return nothing
        assert_eq!(stream.get_audio(&mut dst, 8, 8), 0);
    }

    #[test]
    fn test_seek_is_exact_and_flags_past_end() {
        let buffer = SampleBuffer::from_planar(vec![0.0; 10], 44100.0, 1).unwrap();
        let mut stream = stream_of(&buffer);
        let mut scratch = [0.0; 4];
        let r = stream.seek(4, &mut scratch, SeekFlags::default()).unwrap();
        assert_eq!(r.position, 4);
        assert!(!r.end_of_stream);
        let r = stream.seek(99, &mut scratch, SeekFlags::default()).unwrap();
        assert_eq!(r.position, 10);
        assert!(r.end_of_stream);
    }

    #[test]
    fn test_rejects_ragged_data() {
        assert!(SampleBuffer::from_planar(vec![0.0; 5], 44100.0, 2).is_err());
        assert!(SampleBuffer::from_planar(vec![0.0; 4], 44100.0, 0).is_err());
        assert!(SampleBuffer::from_planar(vec![0.0; 4], 0.0, 2).is_err());
    }

    #[test]
    fn test_duration() {
        let buffer = SampleBuffer::from_planar(vec![0.0; 44100], 44100.0, 1).unwrap();
        assert!((buffer.duration() - 1.0).abs() < 1e-9);
    }
}
