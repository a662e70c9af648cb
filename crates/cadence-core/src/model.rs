use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// Index of the mix (master) track. Content tracks start at 1.
pub const MIX_TRACK: usize = 0;
pub const DEFAULT_BEATS_PER_MEASURE: u32 = 4;
pub const DEFAULT_TEMPO_BPM: f64 = 120.0;
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Track indices excluded from graph construction.
pub type MutedTracks = BTreeSet<usize>;

/// Per-track `"EFFECT-PARAMETER"` keys whose automation is skipped.
pub type BypassedEffects = BTreeMap<usize, BTreeSet<String>>;

/// Decoded, ready-to-play audio. Cloning only bumps a reference count.
#[derive(Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioBuffer {
    /// Builds a buffer from interleaved samples. A trailing partial frame is dropped.
    #[must_use]
    pub fn new(mut samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        let whole_frames = samples.len() / usize::from(channels);
        samples.truncate(whole_frames * usize::from(channels));
        Self {
            samples: Arc::from(samples),
            sample_rate: sample_rate.max(1),
            channels,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Sample at `frame` for output channel `channel`; mono buffers feed every channel.
    #[must_use]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        let channels = usize::from(self.channels);
        self.samples
            .get(frame * channels + channel % channels)
            .copied()
            .unwrap_or(0.0)
    }
}

impl fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("frames", &self.frames())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub name: String,
    /// Placement in measures (measure numbering starts at 1).
    pub measure: f64,
    pub audio: AudioBuffer,
}

impl Clip {
    #[must_use]
    pub fn new(name: impl Into<String>, measure: f64, audio: AudioBuffer) -> Self {
        Self {
            name: name.into(),
            measure,
            audio,
        }
    }

    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.audio.duration_seconds()
    }
}

/// One automation segment for an effect parameter.
///
/// An `end_measure` of zero means the range has no end: the start value holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectRange {
    pub name: String,
    pub parameter: String,
    pub start_measure: f64,
    #[serde(default)]
    pub end_measure: f64,
    pub start_value: f64,
    #[serde(default)]
    pub end_value: Option<f64>,
}

impl EffectRange {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        parameter: impl Into<String>,
        start_measure: f64,
        start_value: f64,
    ) -> Self {
        Self {
            name: name.into(),
            parameter: parameter.into(),
            start_measure,
            end_measure: 0.0,
            start_value,
            end_value: None,
        }
    }

    #[must_use]
    pub fn ramp_to(mut self, end_measure: f64, end_value: f64) -> Self {
        self.end_measure = end_measure;
        self.end_value = Some(end_value);
        self
    }

    /// `"EFFECT-PARAMETER"`, the key used for bypass lists.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}-{}", self.name, self.parameter)
    }

    #[must_use]
    pub fn has_end(&self) -> bool {
        self.end_measure > 0.0
    }

    #[must_use]
    pub fn final_value(&self) -> f64 {
        self.end_value.unwrap_or(self.start_value)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Track {
    pub label: Option<String>,
    pub clips: Vec<Clip>,
    /// Automation ranges in insertion order; effects are chained in first-appearance order.
    pub effects: Vec<EffectRange>,
}

impl Track {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_clip(mut self, clip: Clip) -> Self {
        self.clips.push(clip);
        self
    }

    #[must_use]
    pub fn with_effect(mut self, range: EffectRange) -> Self {
        self.effects.push(range);
        self
    }

    pub fn automation<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a EffectRange> + 'a {
        self.effects.iter().filter(move |range| range.key() == key)
    }
}

/// Compiled project snapshot. Replaced wholesale, never mutated in place while published.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub title: String,
    /// Length in measures; playback runs up to (not including) measure `length + 1`.
    pub length: u32,
    pub beats_per_measure: u32,
    pub tracks: Vec<Track>,
}

impl Project {
    #[must_use]
    pub fn new(title: impl Into<String>, length: u32) -> Self {
        Self {
            title: title.into(),
            length,
            beats_per_measure: DEFAULT_BEATS_PER_MEASURE,
            tracks: vec![Track::new("Mix")],
        }
    }

    #[must_use]
    pub fn with_track(mut self, track: Track) -> Self {
        self.tracks.push(track);
        self
    }

    /// First measure after the project.
    #[must_use]
    pub fn end_measure(&self) -> f64 {
        f64::from(self.length) + 1.0
    }

    #[must_use]
    pub fn mix_track(&self) -> Option<&Track> {
        self.tracks.get(MIX_TRACK)
    }

    #[must_use]
    pub fn clip_count(&self) -> usize {
        self.tracks.iter().map(|track| track.clips.len()).sum()
    }
}
