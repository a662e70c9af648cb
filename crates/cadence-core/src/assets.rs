use std::{f64::consts::TAU, fs, path::Path};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::model::AudioBuffer;

/// Reads a PCM or float WAV file into an [`AudioBuffer`].
#[instrument(fields(path = %path.display()))]
pub fn read_wav(path: &Path) -> Result<AudioBuffer> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open wav file: {}", path.display()))?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("failed to read float samples: {}", path.display()))?,
        hound::SampleFormat::Int => {
            let scale = 2f32.powi(i32::from(spec.bits_per_sample) - 1);
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 / scale))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("failed to read pcm samples: {}", path.display()))?
        }
    };

    let buffer = AudioBuffer::new(samples, spec.sample_rate, spec.channels);
    debug!(
        frames = buffer.frames(),
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        "wav decoded"
    );
    Ok(buffer)
}

/// Writes interleaved samples as 16-bit PCM.
#[instrument(skip(samples), fields(path = %path.display(), samples = samples.len()))]
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32, channels: u16) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("failed to create wav file: {}", path.display()))?;
    for sample in samples {
        let quantized = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16;
        writer
            .write_sample(quantized)
            .context("failed to write wav sample")?;
    }
    writer.finalize().context("failed to finalize wav file")?;
    info!("wav written");
    Ok(())
}

/// Mono sine tone.
#[must_use]
pub fn tone(frequency_hz: f64, seconds: f64, amplitude: f32, sample_rate: u32) -> AudioBuffer {
    let frames = (seconds.max(0.0) * f64::from(sample_rate)).round() as usize;
    let samples = (0..frames)
        .map(|frame| {
            let phase = TAU * frequency_hz * frame as f64 / f64::from(sample_rate);
            amplitude * phase.sin() as f32
        })
        .collect();
    AudioBuffer::new(samples, sample_rate, 1)
}

/// Mono buffer holding one value; handy for checking gain staging and gaps.
#[must_use]
pub fn constant(value: f32, seconds: f64, sample_rate: u32) -> AudioBuffer {
    let frames = (seconds.max(0.0) * f64::from(sample_rate)).round() as usize;
    AudioBuffer::new(vec![value; frames], sample_rate, 1)
}

#[must_use]
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0, |peak, sample| peak.max(sample.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_has_expected_length_and_level() {
        let buffer = tone(10.0, 0.5, 0.8, 1_000);
        assert_eq!(buffer.frames(), 500);
        let level = peak(buffer.samples());
        assert!(level > 0.79 && level <= 0.8);
    }

    #[test]
    fn wav_round_trip_keeps_shape() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("nested").join("clip.wav");
        let source = constant(0.5, 0.25, 8_000);
        write_wav(&path, source.samples(), 8_000, 1).expect("wav should be written");

        let decoded = read_wav(&path).expect("wav should decode");
        assert_eq!(decoded.frames(), 2_000);
        assert_eq!(decoded.sample_rate(), 8_000);
        assert!((decoded.sample(100, 0) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn missing_files_report_the_path() {
        let error = read_wav(Path::new("/definitely/not/here.wav")).expect_err("should fail");
        assert!(format!("{error:#}").contains("here.wav"));
    }
}
