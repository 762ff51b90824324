//! Pre-allocated mixing buffers
//!
//! All hot-path buffers are allocated up front and reused across quanta;
//! the audio thread only ever clears and refills them. `AlignedFloatBuffer`
//! guarantees a 32-byte aligned view so the unrolled clip stage can assume
//! SIMD-friendly layout without unsafe allocation tricks: storage is
//! over-allocated and the view starts at the first aligned float.

use crate::types::Sample;

/// Alignment of the buffer view, in bytes
const ALIGN_BYTES: usize = 32;

/// Fixed-size float buffer whose data view is 32-byte aligned.
///
/// The length is fixed at construction; real-time code indexes into
/// `as_mut_slice()` and never grows the buffer.
#[derive(Debug, Default)]
pub(crate) struct AlignedFloatBuffer {
    storage: Vec<Sample>,
    offset: usize,
    len: usize,
}

impl AlignedFloatBuffer {
    /// Allocate a zeroed buffer of `len` floats
    pub fn new(len: usize) -> Self {
        let pad = ALIGN_BYTES / std::mem::size_of::<Sample>();
        let storage = vec![0.0; len + pad];
        let addr = storage.as_ptr() as usize;
        let misalign = addr % ALIGN_BYTES;
        let offset = if misalign == 0 {
            0
        } else {
            (ALIGN_BYTES - misalign) / std::mem::size_of::<Sample>()
        };
        Self { storage, offset, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[Sample] {
        &self.storage[self.offset..self.offset + self.len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Sample] {
        &mut self.storage[self.offset..self.offset + self.len]
    }

    /// Fill the buffer with silence
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0.0);
    }
}

/// Interleave planar channel rows (`src[ch * stride + i]`) into
/// `[c0, c1, .., c0, c1, ..]` output.
pub(crate) fn interleave_f32(
    src: &[Sample],
    dst: &mut [Sample],
    samples: usize,
    stride: usize,
    channels: usize,
) {
    debug_assert!(dst.len() >= samples * channels);
    for ch in 0..channels {
        let row = &src[ch * stride..ch * stride + samples];
        for (i, &s) in row.iter().enumerate() {
            dst[i * channels + ch] = s;
        }
    }
}

/// Interleave planar float rows into signed 16-bit output
pub(crate) fn interleave_i16(
    src: &[Sample],
    dst: &mut [i16],
    samples: usize,
    stride: usize,
    channels: usize,
) {
    debug_assert!(dst.len() >= samples * channels);
    for ch in 0..channels {
        let row = &src[ch * stride..ch * stride + samples];
        for (i, &s) in row.iter().enumerate() {
            dst[i * channels + ch] = (s.clamp(-1.0, 1.0) * i16::MAX as Sample) as i16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_is_aligned() {
        for len in [1, 7, 512, 2048] {
            let mut buf = AlignedFloatBuffer::new(len);
            assert_eq!(buf.len(), len);
            assert_eq!(buf.as_mut_slice().as_ptr() as usize % ALIGN_BYTES, 0);
        }
    }

    #[test]
    fn test_clear_zeroes_contents() {
        let mut buf = AlignedFloatBuffer::new(16);
        buf.as_mut_slice().fill(1.0);
        buf.clear();
        assert!(buf.as_slice().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_interleave_stereo() {
        // Two planar rows with stride 4, interleaving 3 frames
        let src = [1.0, 2.0, 3.0, 0.0, -1.0, -2.0, -3.0, 0.0];
        let mut dst = [0.0; 6];
        interleave_f32(&src, &mut dst, 3, 4, 2);
        assert_eq!(dst, [1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
    }

    #[test]
    fn test_interleave_i16_clamps() {
        let src = [2.0, -2.0];
        let mut dst = [0i16; 2];
        interleave_i16(&src, &mut dst, 2, 2, 1);
        assert_eq!(dst, [i16::MAX, -i16::MAX]);
    }
}
