//! Window geometry: offsets, jitter and fitting to an exact length.

use rand::Rng;

/// Offset value meaning "no known offset, use the whole recording".
pub const SENTINEL_OFFSET: f64 = -1.0;

/// How a decoded recording is forced to the window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitMode {
    /// NumPy `resize` semantics: truncate, or repeat the recording
    /// cyclically. Empty input becomes silence.
    #[default]
    Repeat,
    /// Truncate, or zero-pad at the end.
    ZeroPad,
}

/// Interpreted offset of a clip within its recording.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Offset {
    Whole,
    Seconds(f64),
}

impl Offset {
    /// Interpret a raw metadata value. Returns `None` for anything other
    /// than the sentinel or a finite non-negative number.
    pub fn from_raw(raw: f64) -> Option<Self> {
        if raw == SENTINEL_OFFSET {
            Some(Offset::Whole)
        } else if raw.is_finite() && raw >= 0.0 {
            Some(Offset::Seconds(raw))
        } else {
            None
        }
    }
}

/// Number of samples in a window of `seconds` at `sample_rate`.
pub fn window_len(sample_rate: u32, seconds: f64) -> usize {
    (sample_rate as f64 * seconds).round() as usize
}

/// Shift `offset` by a uniform draw in `[-duration/2, duration/2)`,
/// clamped at zero.
pub fn jitter_offset<R: Rng + ?Sized>(offset: f64, duration: f64, rng: &mut R) -> f64 {
    let u: f64 = rng.gen();
    (offset + (u - 0.5) * duration).max(0.0)
}

/// Force `samples` to exactly `len` elements.
pub fn fit_to_length<T: Copy + Default>(mut samples: Vec<T>, len: usize, mode: FitMode) -> Vec<T> {
    if samples.len() >= len {
        samples.truncate(len);
        return samples;
    }

    match mode {
        FitMode::ZeroPad => {
            samples.resize(len, T::default());
            samples
        }
        FitMode::Repeat if samples.is_empty() => vec![T::default(); len],
        FitMode::Repeat => samples.iter().copied().cycle().take(len).collect(),
    }
}

/// Mix a base seed with an item index into an independent item seed.
pub fn item_seed(seed: u64, index: u64) -> u64 {
    splitmix64(seed ^ index.wrapping_mul(0xD6E8FEB86659FD93))
}

pub(crate) fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
