//! Audibility triage
//!
//! The voice table holds up to 1024 voices but only `max_active_voices`
//! are fully mixed per quantum. Candidates are every unpaused voice that
//! is audible or has inaudible-tick/kill behavior; voices that must be
//! advanced regardless of loudness are swapped into a stable prefix, and
//! the rest is partially quicksorted so the loudest fill the budget. Ties
//! break toward the older voice (lower play index) so equal-volume voices
//! do not churn in and out of the budget between quanta.
//!
//! The resample buffer pool follows the selection: entries freed by dead
//! or triaged-out voices are handed to newly selected ones, whose cursor
//! is reset so the interpolation lookback starts from silence.

use std::cmp::Ordering;

use basedrop::Owned;

use crate::voice::Voice;

use super::engine::EngineInner;

/// Explicit quicksort stack depth; ranges that do not fit fall back to a
/// full sort rather than recursing
const SORT_STACK: usize = 24;

impl EngineInner {
    /// Rebuild the active voice list and remap resample buffers.
    /// Runs at quantum start whenever voice state changed audibility,
    /// pause state or liveness.
    pub(crate) fn calc_active_voices(&mut self) {
        self.active_voice_dirty = false;

        let mut candidates = 0usize;
        let mut must_tick = 0usize;
        for slot in 0..self.highest_voice {
            let Some(voice) = self.voices[slot].as_ref() else {
                continue;
            };
            if voice.flags.paused {
                continue;
            }
            let inaudible = voice.flags.inaudible;
            if !inaudible || voice.flags.tick_when_inaudible || voice.flags.kill_when_inaudible {
                self.active_voices[candidates] = slot;
                candidates += 1;
                if inaudible {
                    // Must be processed regardless of the budget; keep in
                    // a stable prefix ahead of the sorted region
                    self.active_voices[candidates - 1] = self.active_voices[must_tick];
                    self.active_voices[must_tick] = slot;
                    must_tick += 1;
                }
            }
        }

        let sortable = candidates - must_tick;
        if sortable > self.max_active_voices {
            let voices = &self.voices;
            partial_sort_loudest(
                voices,
                &mut self.active_voices[must_tick..candidates],
                self.max_active_voices,
            );
            self.active_voice_count = must_tick + self.max_active_voices;
        } else {
            self.active_voice_count = candidates;
        }

        self.map_resample_buffers();
    }

    /// Keep pool entries with voices still in the mixed window, free the
    /// rest, and hand freed entries to newly selected voices
    fn map_resample_buffers(&mut self) {
        let live = self.active_voice_count.min(self.max_active_voices);
        let window = &self.active_voices[..live];

        for pool in 0..self.pool_owner.len() {
            let Some(owner) = self.pool_owner[pool] else {
                continue;
            };
            let still_mapped = window.contains(&owner)
                && self.voices[owner]
                    .as_ref()
                    .is_some_and(|v| v.pool_slot == Some(pool));
            if !still_mapped {
                if let Some(voice) = self.voices[owner].as_mut() {
                    if voice.pool_slot == Some(pool) {
                        voice.pool_slot = None;
                    }
                }
                self.pool_owner[pool] = None;
            }
        }

        for idx in 0..live {
            let slot = self.active_voices[idx];
            let needs_buffer = self.voices[slot]
                .as_ref()
                .is_some_and(|v| v.pool_slot.is_none());
            if !needs_buffer {
                continue;
            }
            let Some(free) = self.pool_owner.iter().position(Option::is_none) else {
                break;
            };
            // Fresh buffers: silence the lookback and force a refetch
            self.resample_pool[free].clear();
            self.pool_owner[free] = Some(slot);
            if let Some(voice) = self.voices[slot].as_mut() {
                voice.pool_slot = Some(free);
                voice.reset_blocks();
            }
        }
    }
}

/// Loudest-first order: descending overall volume, ties toward the older
/// voice
fn voice_order(voices: &[Option<Owned<Voice>>], a: usize, b: usize) -> Ordering {
    let key = |slot: usize| {
        voices[slot]
            .as_ref()
            .map(|v| (v.overall_volume, v.play_index))
            .unwrap_or((0.0, u32::MAX))
    };
    let (va, pa) = key(a);
    let (vb, pb) = key(b);
    vb.partial_cmp(&va).unwrap_or(Ordering::Equal).then(pa.cmp(&pb))
}

/// Partial quicksort: after this, `list[..k]` holds the k first elements
/// of the fully sorted order (the k loudest). Partitions entirely past
/// the boundary are pruned instead of sorted.
fn partial_sort_loudest(voices: &[Option<Owned<Voice>>], list: &mut [usize], k: usize) {
    if list.len() <= 1 || k == 0 {
        return;
    }
    let mut stack = [(0usize, 0usize); SORT_STACK];
    stack[0] = (0, list.len());
    let mut top = 1;

    while top > 0 {
        top -= 1;
        let (lo, hi) = stack[top];
        if hi - lo <= 1 {
            continue;
        }
        if top + 2 > SORT_STACK {
            // Out of stack: sort the range outright
            list[lo..hi].sort_unstable_by(|&a, &b| voice_order(voices, a, b));
            continue;
        }
        let pivot = list[hi - 1];
        let mut store = lo;
        for i in lo..hi - 1 {
            if voice_order(voices, list[i], pivot) == Ordering::Less {
                list.swap(i, store);
                store += 1;
            }
        }
        list.swap(store, hi - 1);
        stack[top] = (lo, store);
        top += 1;
        if store + 1 < hi && store + 1 < k {
            stack[top] = (store + 1, hi);
            top += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gc::gc_handle;
    use crate::error::EngineResult;
    use crate::handle::Handle;
    use crate::source::{AudioStream, SeekFlags, SeekResult, SourceParams, VoiceOutput};
    use crate::types::Sample;

    struct NullStream;

    impl AudioStream for NullStream {
        fn get_audio(&mut self, dst: &mut [Sample], samples: usize, _stride: usize) -> usize {
            dst[..samples].fill(0.0);
            samples
        }
        fn has_ended(&self) -> bool {
            false
        }
        fn seek(
            &mut self,
            position: u64,
            _scratch: &mut [Sample],
            _flags: SeekFlags,
        ) -> EngineResult<SeekResult> {
            Ok(SeekResult {
                position,
                end_of_stream: false,
            })
        }
    }

    fn voice_with(volume: f32, play_index: u32) -> Option<Owned<Voice>> {
        let params = SourceParams::new(44100.0, 1);
        let mut voice = Voice::new(
            VoiceOutput::Stream(Box::new(NullStream)),
            &params,
            Handle::PRIMARY,
        );
        voice.set_volume = volume;
        voice.play_index = play_index;
        voice.recompute_volume();
        Some(Owned::new(&gc_handle(), voice))
    }

    fn volumes(voices: &[Option<Owned<Voice>>], list: &[usize]) -> Vec<f32> {
        list.iter()
            .map(|&slot| voices[slot].as_ref().map(|v| v.overall_volume).unwrap())
            .collect()
    }

    #[test]
    fn test_partial_sort_selects_loudest_prefix() {
        let vols = [0.3, 0.9, 0.1, 0.7, 0.5, 0.2, 0.8, 0.4];
        let voices: Vec<_> = vols
            .iter()
            .enumerate()
            .map(|(i, &v)| voice_with(v, i as u32))
            .collect();
        let mut list: Vec<usize> = (0..vols.len()).collect();
        partial_sort_loudest(&voices, &mut list, 3);
        assert_eq!(volumes(&voices, &list[..3]), vec![0.9, 0.8, 0.7]);
    }

    #[test]
    fn test_partial_sort_tie_prefers_older_voice() {
        let voices: Vec<_> = (0..6).map(|i| voice_with(0.5, (10 - i) as u32)).collect();
        let mut list: Vec<usize> = (0..6).collect();
        partial_sort_loudest(&voices, &mut list, 2);
        // All volumes equal: the two lowest play indexes win the budget
        let picked: Vec<u32> = list[..2]
            .iter()
            .map(|&slot| voices[slot].as_ref().unwrap().play_index)
            .collect();
        assert_eq!(picked, vec![5, 6]);
    }

    #[test]
    fn test_partial_sort_full_k_sorts_everything() {
        let vols = [0.2, 0.8, 0.5, 0.9];
        let voices: Vec<_> = vols
            .iter()
            .enumerate()
            .map(|(i, &v)| voice_with(v, i as u32))
            .collect();
        let mut list: Vec<usize> = (0..4).collect();
        partial_sort_loudest(&voices, &mut list, 4);
        assert_eq!(volumes(&voices, &list), vec![0.9, 0.8, 0.5, 0.2]);
    }
}
