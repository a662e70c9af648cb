use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    assets,
    model::{
        BypassedEffects, Clip, DEFAULT_BEATS_PER_MEASURE, EffectRange, MutedTracks, Project, Track,
    },
};

/// On-disk project: clip audio is referenced (WAV paths relative to the document) or
/// synthesized, never embedded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectDocument {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub title: String,
    pub length: u32,
    #[serde(default = "default_beats_per_measure")]
    pub beats_per_measure: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tracks: Vec<TrackDocument>,
    #[serde(default)]
    pub muted_tracks: MutedTracks,
    #[serde(default)]
    pub bypassed_effects: BypassedEffects,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackDocument {
    pub label: Option<String>,
    pub clips: Vec<ClipDocument>,
    pub effects: Vec<EffectRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClipDocument {
    #[serde(default)]
    pub name: String,
    pub measure: f64,
    pub source: ClipSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClipSource {
    Wav {
        path: PathBuf,
    },
    Tone {
        frequency_hz: f64,
        seconds: f64,
        #[serde(default = "default_amplitude")]
        amplitude: f32,
    },
    Constant {
        value: f32,
        seconds: f64,
    },
}

fn default_beats_per_measure() -> u32 {
    DEFAULT_BEATS_PER_MEASURE
}

fn default_amplitude() -> f32 {
    0.5
}

/// A project ready for the transport, plus the playback preferences stored with it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedProject {
    pub project: Project,
    pub muted: MutedTracks,
    pub bypassed: BypassedEffects,
}

impl ProjectDocument {
    #[must_use]
    pub fn new(title: impl Into<String>, length: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            length,
            beats_per_measure: DEFAULT_BEATS_PER_MEASURE,
            saved_at: None,
            tracks: vec![TrackDocument {
                label: Some("Mix".to_string()),
                ..TrackDocument::default()
            }],
            muted_tracks: MutedTracks::new(),
            bypassed_effects: BypassedEffects::new(),
        }
    }

    /// Loads or synthesizes every clip's audio. WAV paths resolve against `base_dir`;
    /// synthesized clips use `sample_rate`.
    #[instrument(skip(self), fields(document = %self.id, base_dir = %base_dir.display()))]
    pub fn resolve(&self, base_dir: &Path, sample_rate: u32) -> Result<LoadedProject> {
        ensure!(!self.tracks.is_empty(), "project has no mix track");
        ensure!(self.beats_per_measure > 0, "beats_per_measure must be positive");

        let mut tracks = Vec::with_capacity(self.tracks.len());
        for (index, document) in self.tracks.iter().enumerate() {
            let mut track = Track {
                label: document.label.clone(),
                clips: Vec::with_capacity(document.clips.len()),
                effects: document.effects.clone(),
            };
            for clip in &document.clips {
                ensure!(
                    clip.measure.is_finite() && clip.measure >= 1.0,
                    "clip '{}' on track {index} starts before measure 1",
                    clip.name
                );
                let audio = match &clip.source {
                    ClipSource::Wav { path } => assets::read_wav(&base_dir.join(path))
                        .with_context(|| format!("failed to load clip '{}'", clip.name))?,
                    ClipSource::Tone {
                        frequency_hz,
                        seconds,
                        amplitude,
                    } => assets::tone(*frequency_hz, *seconds, *amplitude, sample_rate),
                    ClipSource::Constant { value, seconds } => {
                        assets::constant(*value, *seconds, sample_rate)
                    }
                };
                track.clips.push(Clip::new(clip.name.clone(), clip.measure, audio));
            }
            tracks.push(track);
        }

        let project = Project {
            title: self.title.clone(),
            length: self.length,
            beats_per_measure: self.beats_per_measure,
            tracks,
        };
        debug!(
            tracks = project.tracks.len(),
            clips = project.clip_count(),
            "document resolved"
        );
        Ok(LoadedProject {
            project,
            muted: self.muted_tracks.clone(),
            bypassed: self.bypassed_effects.clone(),
        })
    }
}

/// Writes the document atomically, stamping `saved_at`.
#[instrument(skip(document), fields(document = %document.id, path = %path.display()))]
pub fn save_document(path: &Path, document: &ProjectDocument) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf);
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))?;

    let stamped = ProjectDocument {
        saved_at: Some(Utc::now()),
        ..document.clone()
    };
    let json = serde_json::to_vec_pretty(&stamped).context("failed to serialize project")?;
    let mut temp_file = tempfile::NamedTempFile::new_in(&parent)
        .context("failed to create temp project file")?;
    temp_file
        .write_all(&json)
        .context("failed to write temp project file")?;
    temp_file
        .persist(path)
        .map_err(|error| anyhow::anyhow!(error.error))
        .with_context(|| format!("failed to persist project: {}", path.display()))?;

    info!("project saved");
    Ok(())
}

#[instrument(fields(path = %path.display()))]
pub fn load_document(path: &Path) -> Result<ProjectDocument> {
    let content =
        fs::read(path).with_context(|| format!("failed to read project: {}", path.display()))?;
    let document: ProjectDocument =
        serde_json::from_slice(&content).context("invalid project json")?;
    info!(document = %document.id, title = %document.title, "project loaded");
    Ok(document)
}

/// Loads a document and resolves its clips relative to the document's directory.
pub fn load_project(path: &Path, sample_rate: u32) -> Result<LoadedProject> {
    let document = load_document(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    document.resolve(base_dir, sample_rate)
}
