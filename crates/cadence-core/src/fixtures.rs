use uuid::Uuid;

use crate::{
    assets,
    model::{Clip, EffectRange, Project, Track},
    persistence::{ClipDocument, ClipSource, ProjectDocument, TrackDocument},
    tempo::TEMPO_EFFECT,
};

/// Eight measures at the default 120 BPM with one clip of constant 0.5 spanning
/// measures 1 to 5 (eight seconds).
#[must_use]
pub fn single_clip_project(sample_rate: u32) -> Project {
    Project::new("Single clip", 8).with_track(
        Track::new("Pad").with_clip(Clip::new("pad", 1.0, assets::constant(0.5, 8.0, sample_rate))),
    )
}

/// Eight measures, two content tracks holding constants 0.25 and 0.5 for the whole project.
/// Muting either track changes the output level in a way that is easy to assert.
#[must_use]
pub fn two_track_project(sample_rate: u32) -> Project {
    Project::new("Two tracks", 8)
        .with_track(
            Track::new("Low").with_clip(Clip::new("low", 1.0, assets::constant(0.25, 16.0, sample_rate))),
        )
        .with_track(
            Track::new("High").with_clip(Clip::new("high", 1.0, assets::constant(0.5, 16.0, sample_rate))),
        )
}

/// Demo document for the CLI: a tempo ramp on the mix track, a tone bed and a faded lead.
#[must_use]
pub fn demo_document() -> ProjectDocument {
    let mut document = ProjectDocument::new("Cadence Demo", 8);
    document.id = Uuid::from_u128(0x6a1f_3c2e_9b0d_4e57_8c11_2f6e_a4d3_b901);
    document.tracks[0]
        .effects
        .push(EffectRange::new(TEMPO_EFFECT, TEMPO_EFFECT, 1.0, 100.0).ramp_to(5.0, 132.0));

    document.tracks.push(TrackDocument {
        label: Some("Bed".to_string()),
        clips: vec![ClipDocument {
            name: "drone".to_string(),
            measure: 1.0,
            source: ClipSource::Tone {
                frequency_hz: 110.0,
                seconds: 16.0,
                amplitude: 0.3,
            },
        }],
        effects: vec![EffectRange::new("VOLUME", "GAIN", 7.0, 0.0).ramp_to(9.0, -24.0)],
    });
    document.tracks.push(TrackDocument {
        label: Some("Lead".to_string()),
        clips: (0..4)
            .map(|bar| ClipDocument {
                name: format!("lead-{bar}"),
                measure: 2.0 + f64::from(bar) * 1.5,
                source: ClipSource::Tone {
                    frequency_hz: 440.0 * (1.0 + f64::from(bar) * 0.125),
                    seconds: 1.0,
                    amplitude: 0.25,
                },
            })
            .collect(),
        effects: vec![
            EffectRange::new("VOLUME", "GAIN", 1.0, -12.0).ramp_to(3.0, 0.0),
            EffectRange::new("REVERB", "MIX", 1.0, 0.3),
        ],
    });
    document
}
