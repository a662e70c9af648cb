use cadence_core::{EffectRange, Project, TempoMap, Timeline, Track};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct Segment {
    gap: f64,
    length: f64,
    from_bpm: f64,
    to_bpm: f64,
}

fn segment() -> impl Strategy<Value = Segment> {
    (0.0f64..3.0, 0.0f64..4.0, 40.0f64..240.0, 40.0f64..240.0).prop_map(
        |(gap, length, from_bpm, to_bpm)| Segment {
            gap,
            length,
            from_bpm,
            to_bpm,
        },
    )
}

fn tempo_project(segments: &[Segment], beats_per_measure: u32) -> Project {
    let mut mix = Track::new("Mix");
    let mut cursor = 1.0;
    for segment in segments {
        let start = cursor + segment.gap;
        let end = start + segment.length;
        mix = mix.with_effect(
            EffectRange::new("TEMPO", "TEMPO", start, segment.from_bpm).ramp_to(end, segment.to_bpm),
        );
        cursor = end;
    }
    let mut project = Project::new("tempo", 32);
    project.beats_per_measure = beats_per_measure;
    project.tracks[0] = mix;
    project
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn measures_survive_a_round_trip(
        segments in prop::collection::vec(segment(), 0..5),
        beats_per_measure in 2u32..8,
        measure in 1.0f64..32.0,
    ) {
        let timeline = TempoMap::from_project(&tempo_project(&segments, beats_per_measure));
        let seconds = timeline.measure_to_time(measure);
        prop_assert!(seconds.is_finite());
        prop_assert!((timeline.time_to_measure(seconds) - measure).abs() < 1e-6);
    }

    #[test]
    fn time_only_moves_forward(
        segments in prop::collection::vec(segment(), 0..5),
        measure in 1.0f64..31.0,
        step in 0.01f64..1.0,
    ) {
        let timeline = TempoMap::from_project(&tempo_project(&segments, 4));
        prop_assert!(timeline.measure_to_time(measure + step) > timeline.measure_to_time(measure));
    }
}

#[test]
fn measure_one_is_time_zero_at_any_tempo() {
    let segments = [Segment {
        gap: 0.0,
        length: 2.0,
        from_bpm: 72.0,
        to_bpm: 180.0,
    }];
    let timeline = TempoMap::from_project(&tempo_project(&segments, 4));
    assert!(timeline.measure_to_time(1.0).abs() < 1e-12);
    assert!((timeline.tempo_at_measure(2.0) - 126.0).abs() < 1e-9);
}
