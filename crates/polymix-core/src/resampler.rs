//! Fixed-point resampling kernels
//!
//! Each voice reads its source in granularity blocks and converts to the
//! bus rate with a 16.16 fixed-point cursor. Kernels that look behind the
//! cursor (linear, Catmull-Rom) reach into the tail of the previous block,
//! which the pool guarantees is silence for freshly assigned voices, so a
//! block boundary never reads out of bounds or produces garbage.

use crate::types::{ResampleMode, Sample, FIXPOINT_FRAC_BITS, FIXPOINT_FRAC_MASK};

/// Fetch a sample relative to the current block.
///
/// Negative indices read the tail of the previous block; indices at or
/// past the block end clamp to the last valid sample.
#[inline]
fn sample_at(prev: &[Sample], cur: &[Sample], prev_frames: usize, cur_frames: usize, index: isize) -> Sample {
    if index < 0 {
        let back = (-index) as usize;
        if back <= prev_frames {
            prev[prev_frames - back]
        } else {
            0.0
        }
    } else if (index as usize) < cur_frames {
        cur[index as usize]
    } else if cur_frames > 0 {
        cur[cur_frames - 1]
    } else {
        0.0
    }
}

/// Resample one channel row into `dst`.
///
/// `pos` is the 16.16 cursor relative to the start of `cur`; it advances
/// by `step` per output sample. The caller guarantees the integer part of
/// the final cursor stays below `cur_frames`.
pub(crate) fn resample(
    mode: ResampleMode,
    prev: &[Sample],
    cur: &[Sample],
    prev_frames: usize,
    cur_frames: usize,
    dst: &mut [Sample],
    mut pos: i64,
    step: i64,
) {
    debug_assert!(pos >= 0);
    match mode {
        ResampleMode::Point => {
            for out in dst.iter_mut() {
                let p = (pos >> FIXPOINT_FRAC_BITS) as isize;
                *out = sample_at(prev, cur, prev_frames, cur_frames, p);
                pos += step;
            }
        }
        ResampleMode::Linear => {
            for out in dst.iter_mut() {
                let p = (pos >> FIXPOINT_FRAC_BITS) as isize;
                let f = (pos & FIXPOINT_FRAC_MASK) as f32 / 65536.0;
                let s0 = sample_at(prev, cur, prev_frames, cur_frames, p);
                let s1 = sample_at(prev, cur, prev_frames, cur_frames, p + 1);
                *out = s0 + (s1 - s0) * f;
                pos += step;
            }
        }
        ResampleMode::CatmullRom => {
            for out in dst.iter_mut() {
                let p = (pos >> FIXPOINT_FRAC_BITS) as isize;
                let t = (pos & FIXPOINT_FRAC_MASK) as f32 / 65536.0;
                let s0 = sample_at(prev, cur, prev_frames, cur_frames, p - 1);
                let s1 = sample_at(prev, cur, prev_frames, cur_frames, p);
                let s2 = sample_at(prev, cur, prev_frames, cur_frames, p + 1);
                let s3 = sample_at(prev, cur, prev_frames, cur_frames, p + 2);
                *out = 0.5
                    * (2.0 * s1
                        + (s2 - s0) * t
                        + (2.0 * s0 - 5.0 * s1 + 4.0 * s2 - s3) * t * t
                        + (3.0 * s1 - s0 - 3.0 * s2 + s3) * t * t * t);
                pos += step;
            }
        }
    }
}
