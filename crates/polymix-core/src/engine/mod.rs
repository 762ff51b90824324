//! The mixing engine
//!
//! Split across focused modules:
//!
//! - `engine`: the `Engine` type, voice table, play/stop lifecycle and the
//!   full control surface
//! - `mixer`: the per-quantum pipeline (bus recursion, resampling,
//!   pan-and-expand, clip, interleave)
//! - `scheduler`: audibility triage and resample buffer pool mapping
//! - `spatial`: the 3D pass (attenuation, doppler, speaker panning)
//! - `gc`: deferred deallocation of voices dropped on the audio thread

#[allow(clippy::module_inception)]
mod engine;
pub(crate) mod gc;
mod mixer;
mod scheduler;
mod spatial;

pub use engine::Engine;
