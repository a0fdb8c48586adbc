//! Audio decoding using symphonia.
//!
//! Supports MP3, FLAC, OGG, WAV formats. A window is decoded by seeking near
//! its start and cropping at the native rate, before mono mixdown and
//! resampling.

use rubato::{
    ResampleError, Resampler, ResamplerConstructionError, SincFixedIn,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Symphonia error: {0}")]
    Symphonia(#[from] symphonia::core::errors::Error),
    #[error("No audio track found")]
    NoAudioTrack,
    #[error("Unsupported codec")]
    UnsupportedCodec,
    #[error("Resampler setup failed: {0}")]
    ResamplerSetup(#[from] ResamplerConstructionError),
    #[error("Resampling failed: {0}")]
    Resample(#[from] ResampleError),
}

/// Decoded audio samples, interleaved.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl DecodedAudio {
    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    /// Duration in seconds at the native rate.
    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Keep only `[offset, offset + duration)` seconds.
    ///
    /// Both ends are clamped to the recording, so an offset past the end
    /// yields empty audio.
    pub fn crop(&self, offset_seconds: f64, duration_seconds: f64) -> DecodedAudio {
        let channels = self.channels.max(1);
        let frames = self.frames();
        let rate = self.sample_rate as f64;

        let start = ((offset_seconds.max(0.0) * rate).round() as usize).min(frames);
        let len = (duration_seconds.max(0.0) * rate).round() as usize;
        let end = start.saturating_add(len).min(frames);

        DecodedAudio {
            samples: self.samples[start * channels..end * channels].to_vec(),
            sample_rate: self.sample_rate,
            channels,
        }
    }

    /// Convert to mono by averaging channels.
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels <= 1 {
            return self.samples.clone();
        }

        self.samples
            .chunks_exact(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / self.channels as f32)
            .collect()
    }

    /// Mix down to mono and resample to `target_rate` using sinc
    /// interpolation (rubato).
    pub fn resample(&self, target_rate: u32) -> Result<Vec<f32>, DecodeError> {
        let mono = self.to_mono();
        if self.sample_rate == target_rate || mono.is_empty() {
            return Ok(mono);
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let resample_ratio = target_rate as f64 / self.sample_rate as f64;
        let chunk_size = 1024;

        // max_resample_ratio_relative must cover actual ratio (e.g., 8kHz→32kHz = 4x)
        let max_ratio = resample_ratio.max(1.0 / resample_ratio) * 1.1;

        let mut resampler = SincFixedIn::<f32>::new(resample_ratio, max_ratio, params, chunk_size, 1)?;

        let expected_len = (mono.len() as f64 * resample_ratio).round() as usize;
        let mut output = Vec::with_capacity(expected_len + chunk_size);

        for chunk in mono.chunks(chunk_size) {
            // Last chunk is zero-padded to the fixed input size.
            let mut input = chunk.to_vec();
            input.resize(chunk_size, 0.0);

            let waves = vec![input];
            let resampled = resampler.process(&waves, None)?;
            output.extend_from_slice(&resampled[0]);
        }

        output.truncate(expected_len);
        Ok(output)
    }
}

/// Decode an audio file from disk.
pub fn decode_file<P: AsRef<Path>>(path: P) -> Result<DecodedAudio, DecodeError> {
    let path = path.as_ref();
    let file = File::open(path)?;
    decode_source(Box::new(file), extension_hint(path))
}

/// Decode only `[offset, offset + duration)` seconds of a file.
///
/// Seeks close to the offset first, then keeps the frames whose timestamps
/// fall in the window and stops reading after it. The result equals
/// `decode_file(path)?.crop(offset, duration)`, clamped to the recording.
pub fn decode_file_window<P: AsRef<Path>>(
    path: P,
    offset_seconds: f64,
    duration_seconds: f64,
) -> Result<DecodedAudio, DecodeError> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut track = open_track(Box::new(file), extension_hint(path))?;

    let rate = track.sample_rate as f64;
    let start = (offset_seconds.max(0.0) * rate).round() as u64;
    let end = start + (duration_seconds.max(0.0) * rate).round() as u64;
    let channels = track.channels;

    if start > 0 {
        let target = SeekTo::Time {
            time: Time::from(start as f64 / rate),
            track_id: Some(track.track_id),
        };
        match track.format.seek(SeekMode::Accurate, target) {
            Ok(_) => track.decoder.reset(),
            // Past the end, or not seekable: read from the start instead.
            Err(e) => tracing::trace!(path = %path.display(), error = %e, "seek failed"),
        }
    }

    let mut samples = Vec::new();
    let mut packet_samples = Vec::new();
    while let Some(packet) = next_packet(track.format.as_mut())? {
        if packet.track_id() != track.track_id {
            continue;
        }
        let first = track.frame_at(packet.ts());
        if first >= end {
            break;
        }

        let decoded = track.decoder.decode(&packet)?;
        packet_samples.clear();
        append_samples(&decoded, &mut packet_samples, channels)?;

        let frames = (packet_samples.len() / channels) as u64;
        let lo = start.saturating_sub(first).min(frames) as usize;
        let hi = (end - first).min(frames) as usize;
        if lo < hi {
            samples.extend_from_slice(&packet_samples[lo * channels..hi * channels]);
        }
    }

    Ok(DecodedAudio {
        samples,
        sample_rate: track.sample_rate,
        channels,
    })
}

/// Decode audio from bytes.
pub fn decode_audio(bytes: &[u8]) -> Result<DecodedAudio, DecodeError> {
    let cursor = std::io::Cursor::new(bytes.to_vec());
    decode_source(Box::new(cursor), Hint::new())
}

fn extension_hint(path: &Path) -> Hint {
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    hint
}

/// First audio track of a probed container, with its decoder.
struct AudioTrack {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    time_base: Option<TimeBase>,
}

impl AudioTrack {
    /// Frame index of a packet timestamp.
    fn frame_at(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                ((time.seconds as f64 + time.frac) * self.sample_rate as f64).round() as u64
            }
            None => ts,
        }
    }
}

fn open_track(source: Box<dyn MediaSource>, hint: Hint) -> Result<AudioTrack, DecodeError> {
    let mss = MediaSourceStream::new(source, Default::default());

    let format_opts = FormatOptions::default();
    let metadata_opts = MetadataOptions::default();

    let probed =
        symphonia::default::get_probe().format(&hint, mss, &format_opts, &metadata_opts)?;
    let format = probed.format;

    // Find the first audio track
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;

    let decoder_opts = DecoderOptions::default();
    let decoder = symphonia::default::get_codecs().make(&track.codec_params, &decoder_opts)?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or(DecodeError::UnsupportedCodec)?;
    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);
    let track_id = track.id;
    let time_base = track.codec_params.time_base;

    Ok(AudioTrack {
        format,
        decoder,
        track_id,
        sample_rate,
        channels,
        time_base,
    })
}

/// Next packet, or `None` at end of stream.
fn next_packet(format: &mut dyn FormatReader) -> Result<Option<Packet>, DecodeError> {
    match format.next_packet() {
        Ok(p) => Ok(Some(p)),
        Err(symphonia::core::errors::Error::IoError(e))
            if e.kind() == std::io::ErrorKind::UnexpectedEof =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn decode_source(source: Box<dyn MediaSource>, hint: Hint) -> Result<DecodedAudio, DecodeError> {
    let mut track = open_track(source, hint)?;
    let mut samples = Vec::new();

    while let Some(packet) = next_packet(track.format.as_mut())? {
        if packet.track_id() != track.track_id {
            continue;
        }
        let decoded = track.decoder.decode(&packet)?;
        append_samples(&decoded, &mut samples, track.channels)?;
    }

    if samples.is_empty() {
        return Err(DecodeError::NoAudioTrack);
    }

    Ok(DecodedAudio {
        samples,
        sample_rate: track.sample_rate,
        channels: track.channels,
    })
}

fn append_samples(
    buffer: &AudioBufferRef,
    output: &mut Vec<f32>,
    channels: usize,
) -> Result<(), DecodeError> {
    match buffer {
        AudioBufferRef::F32(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame]);
                }
            }
        }
        AudioBufferRef::F64(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame] as f32);
                }
            }
        }
        AudioBufferRef::S16(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame] as f32 / 32768.0);
                }
            }
        }
        AudioBufferRef::S32(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame] as f32 / 2147483648.0);
                }
            }
        }
        AudioBufferRef::U8(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push((buf.chan(ch)[frame] as f32 - 128.0) / 128.0);
                }
            }
        }
        _ => {
            return Err(DecodeError::UnsupportedCodec);
        }
    }
    Ok(())
}
