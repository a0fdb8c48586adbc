//! Window samplers: turn a clip reference into a fixed-length window.
//!
//! Two strategies share the [`WindowSampler`] contract:
//! - [`DirectSampler`] decodes the recording around the clip offset with
//!   random jitter.
//! - [`CachedSampler`] slices a random sub-window out of a pre-extracted
//!   `.npy` array.

use ndarray::Array1;
use ndarray_npy::{read_npy, ReadNpyError};
use rand::rngs::StdRng;
use rand::Rng;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::decode::{decode_file, decode_file_window, DecodeError};
use crate::metadata::ClipRef;
use crate::tensor::Samples;
use crate::window::{fit_to_length, jitter_offset, window_len, FitMode, Offset};

pub const DEFAULT_SAMPLE_RATE: u32 = 32000;
pub const DEFAULT_WINDOW_SECONDS: f64 = 5.0;
pub const DEFAULT_CACHE_SECONDS: u32 = 7;

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("File not found: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("Cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot derive a file name from {0:?}")]
    InvalidPath(String),
    #[error("Invalid offset {0} (expected -1 or a non-negative number of seconds)")]
    InvalidOffset(f64),
    #[error("Failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
    #[error("Failed to read cached window {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },
}

/// Produces one window for a clip reference.
pub trait WindowSampler: Send + Sync {
    /// Length in samples of every window returned by [`sample`](Self::sample).
    fn window_len(&self) -> usize;

    fn sample(&self, clip: &ClipRef, rng: &mut StdRng) -> Result<Samples, SampleError>;
}

fn existing_file(root: &Path, relative: &str) -> Result<PathBuf, SampleError> {
    let path = root.join(relative);
    if path.is_file() {
        Ok(path)
    } else {
        Err(SampleError::MissingFile(path))
    }
}

/// Settings for [`DirectSampler`].
#[derive(Debug, Clone)]
pub struct DirectSamplerConfig {
    pub root: PathBuf,
    pub sample_rate: u32,
    pub window_seconds: f64,
    /// Shift the offset by up to half a window either way.
    pub jitter: bool,
    pub fit: FitMode,
}

impl DirectSamplerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            jitter: true,
            fit: FitMode::default(),
        }
    }
}

/// Decodes audio files under `root` on every call.
#[derive(Debug, Clone)]
pub struct DirectSampler {
    config: DirectSamplerConfig,
}

impl DirectSampler {
    pub fn new(config: DirectSamplerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DirectSamplerConfig {
        &self.config
    }
}

impl WindowSampler for DirectSampler {
    fn window_len(&self) -> usize {
        window_len(self.config.sample_rate, self.config.window_seconds)
    }

    fn sample(&self, clip: &ClipRef, rng: &mut StdRng) -> Result<Samples, SampleError> {
        let offset = Offset::from_raw(clip.offset).ok_or(SampleError::InvalidOffset(clip.offset))?;
        let path = existing_file(&self.config.root, &clip.path)?;
        let decode_err = |source: DecodeError| match source {
            DecodeError::Io(source) => SampleError::Io {
                path: path.clone(),
                source,
            },
            source => SampleError::Decode {
                path: path.clone(),
                source,
            },
        };

        let audio = match offset {
            Offset::Whole => decode_file(&path),
            Offset::Seconds(seconds) => {
                let duration = self.config.window_seconds;
                let start = if self.config.jitter {
                    jitter_offset(seconds, duration, rng)
                } else {
                    seconds
                };
                decode_file_window(&path, start, duration)
            }
        }
        .map_err(decode_err)?;

        let waveform = audio.resample(self.config.sample_rate).map_err(decode_err)?;
        let len = self.window_len();
        if waveform.len() < len {
            tracing::trace!(path = %path.display(), got = waveform.len(), len, "short recording");
        }
        Ok(Samples::F32(fit_to_length(waveform, len, self.config.fit)))
    }
}

/// Settings for [`CachedSampler`].
#[derive(Debug, Clone)]
pub struct CachedSamplerConfig {
    pub root: PathBuf,
    pub sample_rate: u32,
    /// Duration of each cached array, part of its file name.
    pub cache_seconds: u32,
    pub window_seconds: f64,
    pub extension: String,
    pub fit: FitMode,
}

impl CachedSamplerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            cache_seconds: DEFAULT_CACHE_SECONDS,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            extension: "npy".to_string(),
            fit: FitMode::default(),
        }
    }
}

/// Reads pre-extracted windows named `{stem}_{offset}_{duration}.npy`.
#[derive(Debug, Clone)]
pub struct CachedSampler {
    config: CachedSamplerConfig,
}

impl CachedSampler {
    pub fn new(config: CachedSamplerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CachedSamplerConfig {
        &self.config
    }

    /// Cache file name for a clip, relative to the root.
    pub fn cache_file_name(&self, clip: &ClipRef) -> Result<String, SampleError> {
        if !clip.offset.is_finite() {
            return Err(SampleError::InvalidOffset(clip.offset));
        }
        let stem = Path::new(&clip.path)
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.split('.').next())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| SampleError::InvalidPath(clip.path.clone()))?;

        Ok(format!(
            "{}_{}_{}.{}",
            stem,
            clip.offset.trunc() as i64,
            self.config.cache_seconds,
            self.config.extension
        ))
    }

    /// Samples of slack between the cached array and the window.
    fn slack(&self) -> usize {
        let slack_seconds = (self.config.cache_seconds as f64 - self.config.window_seconds).max(0.0);
        window_len(self.config.sample_rate, slack_seconds)
    }
}

impl WindowSampler for CachedSampler {
    fn window_len(&self) -> usize {
        window_len(self.config.sample_rate, self.config.window_seconds)
    }

    fn sample(&self, clip: &ClipRef, rng: &mut StdRng) -> Result<Samples, SampleError> {
        let name = self.cache_file_name(clip)?;
        let path = existing_file(&self.config.root, &name)?;
        let cached = read_cached(&path).map_err(|source| match source {
            ReadNpyError::Io(source) => SampleError::Io {
                path: path.clone(),
                source,
            },
            source => SampleError::Cache {
                path: path.clone(),
                source,
            },
        })?;

        let start = (rng.gen::<f64>() * self.slack() as f64) as usize;
        let len = self.window_len();
        Ok(cached.slice(start, len).fit(len, self.config.fit))
    }
}

/// Load a 1-D array saved as float32, float64 or int16.
fn read_cached(path: &Path) -> Result<Samples, ReadNpyError> {
    match read_npy::<_, Array1<f32>>(path) {
        Ok(arr) => return Ok(Samples::F32(arr.to_vec())),
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        Err(e) => return Err(e),
    }
    match read_npy::<_, Array1<f64>>(path) {
        Ok(arr) => return Ok(Samples::F64(arr.to_vec())),
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        Err(e) => return Err(e),
    }
    read_npy::<_, Array1<i16>>(path).map(|arr| Samples::I16(arr.to_vec()))
}

/// Sampler selection.
#[derive(Debug, Clone)]
pub enum SamplerConfig {
    Direct(DirectSamplerConfig),
    Cached(CachedSamplerConfig),
}

impl SamplerConfig {
    pub fn build(self) -> AnySampler {
        match self {
            SamplerConfig::Direct(config) => AnySampler::Direct(DirectSampler::new(config)),
            SamplerConfig::Cached(config) => AnySampler::Cached(CachedSampler::new(config)),
        }
    }
}

/// Either sampler, chosen at runtime.
#[derive(Debug, Clone)]
pub enum AnySampler {
    Direct(DirectSampler),
    Cached(CachedSampler),
}

impl WindowSampler for AnySampler {
    fn window_len(&self) -> usize {
        match self {
            AnySampler::Direct(s) => s.window_len(),
            AnySampler::Cached(s) => s.window_len(),
        }
    }

    fn sample(&self, clip: &ClipRef, rng: &mut StdRng) -> Result<Samples, SampleError> {
        match self {
            AnySampler::Direct(s) => s.sample(clip, rng),
            AnySampler::Cached(s) => s.sample(clip, rng),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray_npy::write_npy;
    use rand::SeedableRng;

    pub(crate) fn write_wav(path: &Path, sample_rate: u32, seconds: f64) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let frames = (sample_rate as f64 * seconds) as usize;
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let v = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 10000.0;
            writer.write_sample(v as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn direct(root: &Path) -> DirectSampler {
        DirectSampler::new(DirectSamplerConfig::new(root))
    }

    #[test]
    fn test_direct_window_length_for_long_recording() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("long.wav"), 32000, 12.0);
        let sampler = direct(dir.path());
        let mut rng = StdRng::seed_from_u64(1);

        for offset in [0.0, 3.0, 6.5, 11.0] {
            let window = sampler.sample(&ClipRef::new("long.wav", offset), &mut rng).unwrap();
            assert!(matches!(window, Samples::F32(_)));
            assert_eq!(window.len(), 160000);
        }
    }

    #[test]
    fn test_direct_short_recording_is_fitted() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("short.wav"), 32000, 1.5);
        let mut rng = StdRng::seed_from_u64(2);

        for fit in [FitMode::Repeat, FitMode::ZeroPad] {
            let mut config = DirectSamplerConfig::new(dir.path());
            config.fit = fit;
            let sampler = DirectSampler::new(config);
            for offset in [-1.0, 0.0, 1.0] {
                let window = sampler.sample(&ClipRef::new("short.wav", offset), &mut rng).unwrap();
                assert_eq!(window.len(), 160000);
            }
        }
    }

    #[test]
    fn test_direct_resamples_to_target_rate() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("low.wav"), 16000, 2.0);
        let mut config = DirectSamplerConfig::new(dir.path());
        config.fit = FitMode::ZeroPad;
        let sampler = DirectSampler::new(config);

        let window = sampler
            .sample(&ClipRef::new("low.wav", -1.0), &mut StdRng::seed_from_u64(3))
            .unwrap()
            .into_f32();
        assert_eq!(window.len(), 160000);
        // 2 s of audio at 32 kHz, then zero padding.
        assert!(window[..60000].iter().any(|&x| x.abs() > 0.1));
        assert!(window[70000..].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_direct_without_jitter_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("clip.wav"), 32000, 8.0);
        let mut config = DirectSamplerConfig::new(dir.path());
        config.jitter = false;
        let sampler = DirectSampler::new(config);
        let clip = ClipRef::new("clip.wav", 2.0);

        let a = sampler.sample(&clip, &mut StdRng::seed_from_u64(4)).unwrap();
        let b = sampler.sample(&clip, &mut StdRng::seed_from_u64(5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_direct_window_starts_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("clip.wav"), 32000, 10.0);
        let mut config = DirectSamplerConfig::new(dir.path());
        config.jitter = false;
        let sampler = DirectSampler::new(config);

        let window = sampler
            .sample(&ClipRef::new("clip.wav", 3.0), &mut StdRng::seed_from_u64(0))
            .unwrap()
            .into_f32();
        let full = decode_file(dir.path().join("clip.wav")).unwrap().to_mono();
        assert_eq!(window, full[96000..256000]);
    }

    #[test]
    fn test_direct_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = direct(dir.path())
            .sample(&ClipRef::new("nope.ogg", 1.0), &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, SampleError::MissingFile(p) if p.ends_with("nope.ogg")));
    }

    #[test]
    fn test_direct_invalid_offset() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("clip.wav"), 32000, 1.0);
        let err = direct(dir.path())
            .sample(&ClipRef::new("clip.wav", -3.0), &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, SampleError::InvalidOffset(o) if o == -3.0));
    }

    #[test]
    fn test_direct_undecodable_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.wav"), b"not audio at all").unwrap();
        let err = direct(dir.path())
            .sample(&ClipRef::new("junk.wav", -1.0), &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, SampleError::Decode { .. }));
    }

    fn cached(root: &Path) -> CachedSampler {
        CachedSampler::new(CachedSamplerConfig::new(root))
    }

    #[test]
    fn test_cache_file_name() {
        let sampler = cached(Path::new("/tmp"));
        let name = |path: &str, offset: f64| sampler.cache_file_name(&ClipRef::new(path, offset));
        assert_eq!(name("amerob/XC1234.ogg", 15.0).unwrap(), "XC1234_15_7.npy");
        assert_eq!(name("XC99.tar.gz", 2.9).unwrap(), "XC99_2_7.npy");
        assert_eq!(name("a/b/XC5.mp3", -1.0).unwrap(), "XC5_-1_7.npy");
        assert!(matches!(name("", 0.0), Err(SampleError::InvalidPath(_))));
        assert!(matches!(name("x.ogg", f64::NAN), Err(SampleError::InvalidOffset(_))));
    }

    #[test]
    fn test_cached_slice_within_slack() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array1::from_iter((0..224000).map(|i| i as f32));
        write_npy(dir.path().join("XC1_10_7.npy"), &data).unwrap();
        let sampler = cached(dir.path());
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..20 {
            let window = sampler
                .sample(&ClipRef::new("species/XC1.ogg", 10.0), &mut rng)
                .unwrap()
                .into_f32();
            assert_eq!(window.len(), 160000);
            let start = window[0] as usize;
            assert!(start < 64000);
            assert_eq!(window[159999] as usize, start + 159999);
        }
    }

    #[test]
    fn test_cached_reads_other_dtypes() {
        let dir = tempfile::tempdir().unwrap();
        write_npy(dir.path().join("d_0_7.npy"), &Array1::<f64>::zeros(224000)).unwrap();
        write_npy(dir.path().join("i_0_7.npy"), &Array1::<i16>::ones(224000)).unwrap();
        let sampler = cached(dir.path());
        let mut rng = StdRng::seed_from_u64(0);

        let d = sampler.sample(&ClipRef::new("d.wav", 0.0), &mut rng).unwrap();
        assert!(matches!(d, Samples::F64(ref v) if v.len() == 160000));
        let i = sampler.sample(&ClipRef::new("i.wav", 0.0), &mut rng).unwrap();
        assert!(matches!(i, Samples::I16(ref v) if v.len() == 160000));
    }

    #[test]
    fn test_cached_short_array_is_fitted() {
        let dir = tempfile::tempdir().unwrap();
        write_npy(dir.path().join("s_3_7.npy"), &Array1::<f32>::ones(1000)).unwrap();
        let window = cached(dir.path())
            .sample(&ClipRef::new("s.ogg", 3.0), &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(window.len(), 160000);
    }

    #[test]
    fn test_cached_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = cached(dir.path())
            .sample(&ClipRef::new("XC7.ogg", 4.0), &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, SampleError::MissingFile(p) if p.ends_with("XC7_4_7.npy")));
    }

    #[test]
    fn test_sampler_config_selects_strategy() {
        let direct = SamplerConfig::Direct(DirectSamplerConfig::new("/data")).build();
        assert!(matches!(direct, AnySampler::Direct(_)));
        assert_eq!(direct.window_len(), 160000);

        let cached = SamplerConfig::Cached(CachedSamplerConfig::new("/cache")).build();
        assert!(matches!(cached, AnySampler::Cached(_)));
        assert_eq!(cached.window_len(), 160000);
    }
}
