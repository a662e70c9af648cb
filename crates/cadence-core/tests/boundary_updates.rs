use std::sync::Arc;

use cadence_core::{
    BypassedEffects, Clip, EffectRange, MutedTracks, OfflineSession, Project, Track,
    TransportEvent, assets, fixtures::two_track_project,
};

const RATE: u32 = 4_000;

fn session_with(project: Project) -> OfflineSession {
    let mut session = OfflineSession::new(RATE, 1).expect("session should build");
    session
        .scheduler_mut()
        .set_rendering_data(Arc::new(project), MutedTracks::new(), BypassedEffects::new())
        .expect("rendering data should install while stopped");
    session
}

fn frame(seconds: f64) -> usize {
    (seconds * f64::from(RATE)).round() as usize
}

fn assert_level(samples: &[f32], level: f32) {
    for (index, sample) in samples.iter().enumerate() {
        assert!(
            (sample - level).abs() < 1e-6,
            "sample {index} was {sample}, expected {level}"
        );
    }
}

#[test]
fn muting_mid_measure_takes_effect_at_the_next_bar() {
    let mut session = session_with(two_track_project(RATE));
    session
        .scheduler_mut()
        .play(1.0, None, 0.0)
        .expect("play should succeed");
    let mut output = session.run_for(2.5).expect("render should succeed");
    assert!((session.scheduler().position() - 2.25).abs() < 1e-9);

    session
        .scheduler_mut()
        .set_muted_tracks(MutedTracks::from([2]))
        .expect("mute should reschedule");
    let refreshed = session
        .scheduler()
        .upcoming_graph()
        .expect("the muted graph should be built ahead of the bar");
    assert!((refreshed.anchor() - 4.0).abs() < 1e-9);
    assert!(refreshed.track(2).is_none());

    output.extend(session.run_for(3.0).expect("render should succeed"));
    assert_level(&output[..frame(4.0)], 0.75);
    assert_level(&output[frame(4.0)..], 0.25);
    assert!((session.scheduler().position() - 3.75).abs() < 1e-9);
    assert_eq!(session.finished_count(), 0);
}

#[test]
fn bypassing_automation_applies_at_the_next_bar() {
    let project = Project::new("Bypass", 8).with_track(
        Track::new("Lead")
            .with_clip(Clip::new("lead", 1.0, assets::constant(0.5, 16.0, RATE)))
            .with_effect(EffectRange::new("VOLUME", "GAIN", 1.0, -20.0)),
    );
    let mut session = session_with(project);
    session
        .scheduler_mut()
        .play(1.0, None, 0.0)
        .expect("play should succeed");
    let mut output = session.run_for(1.0).expect("render should succeed");

    let bypassed = BypassedEffects::from([(1, ["VOLUME-GAIN".to_string()].into())]);
    session
        .scheduler_mut()
        .set_bypassed_effects(bypassed)
        .expect("bypass should reschedule");
    output.extend(session.run_for(2.0).expect("render should succeed"));

    assert_level(&output[..frame(2.0)], 0.05);
    assert_level(&output[frame(2.0)..], 0.5);
}

#[test]
fn automation_ramps_follow_the_window() {
    let project = Project::new("Fade", 8).with_track(
        Track::new("Lead")
            .with_clip(Clip::new("lead", 1.0, assets::constant(0.5, 16.0, RATE)))
            .with_effect(EffectRange::new("VOLUME", "GAIN", 2.0, 0.0).ramp_to(3.0, -20.0)),
    );
    let mut session = session_with(project);
    session
        .scheduler_mut()
        .play(1.0, None, 0.0)
        .expect("play should succeed");
    let output = session.run_for(6.0).expect("render should succeed");

    assert!((output[frame(1.0)] - 0.5).abs() < 1e-6);
    let mid_db = -10.0_f32;
    assert!((output[frame(3.0)] - 0.5 * 10f32.powf(mid_db / 20.0)).abs() < 1e-4);
    assert!((output[frame(5.0)] - 0.05).abs() < 1e-6);
}

#[test]
fn seeking_while_playing_jumps_at_the_next_bar() {
    let project = Project::new("Seek", 8).with_track(
        Track::new("Lead")
            .with_clip(Clip::new("intro", 1.0, assets::constant(0.5, 2.0, RATE)))
            .with_clip(Clip::new("verse", 5.0, assets::constant(0.25, 2.0, RATE))),
    );
    let mut session = session_with(project);
    session
        .scheduler_mut()
        .play(1.0, None, 0.0)
        .expect("play should succeed");
    let mut output = session.run_for(1.0).expect("render should succeed");

    session
        .scheduler_mut()
        .set_position(5.0)
        .expect("seek should reschedule");
    assert!(session.scheduler().is_playing());
    output.extend(session.run_for(2.0).expect("render should succeed"));

    assert_level(&output[..frame(2.0)], 0.5);
    assert_level(&output[frame(2.0)..], 0.25);
    assert!((session.scheduler().position() - 5.5).abs() < 1e-9);
}

#[test]
fn boundary_updates_keep_a_queued_seek() {
    let project = Project::new("Seek", 8).with_track(
        Track::new("Lead")
            .with_clip(Clip::new("intro", 1.0, assets::constant(0.5, 6.0, RATE)))
            .with_clip(Clip::new("bridge", 6.0, assets::constant(0.25, 4.0, RATE))),
    );
    let mut session = session_with(project);
    session
        .scheduler_mut()
        .play(1.0, None, 0.0)
        .expect("play should succeed");
    let mut output = session.run_for(3.0).expect("render should succeed");

    session
        .scheduler_mut()
        .set_position(6.0)
        .expect("seek should reschedule");
    session
        .scheduler_mut()
        .set_muted_tracks(MutedTracks::new())
        .expect("mute update should reschedule");
    output.extend(session.run_for(2.0).expect("render should succeed"));

    let starts: Vec<f64> = session
        .events()
        .iter()
        .filter_map(|(_, event)| match event {
            TransportEvent::Started { start_measure, .. } => Some(*start_measure),
            TransportEvent::Finished => None,
        })
        .collect();
    assert_eq!(starts, vec![1.0, 6.0]);
    assert_level(&output[..frame(4.0)], 0.5);
    assert_level(&output[frame(4.0)..], 0.25);
    assert!((session.scheduler().position() - 6.5).abs() < 1e-9);
}

#[test]
fn new_project_data_is_heard_from_the_next_bar() {
    let mut session = session_with(two_track_project(RATE));
    session
        .scheduler_mut()
        .play(1.0, None, 0.0)
        .expect("play should succeed");
    let mut output = session.run_for(0.5).expect("render should succeed");

    let quieter = Project::new("Quieter", 8).with_track(
        Track::new("Only").with_clip(Clip::new("only", 1.0, assets::constant(0.1, 16.0, RATE))),
    );
    session
        .scheduler_mut()
        .set_rendering_data(Arc::new(quieter), MutedTracks::new(), BypassedEffects::new())
        .expect("new data should reschedule");
    output.extend(session.run_for(2.0).expect("render should succeed"));

    assert_level(&output[..frame(2.0)], 0.75);
    assert_level(&output[frame(2.0)..], 0.1);
    assert_eq!(session.scheduler().project().map(|project| project.title.as_str()), Some("Quieter"));
}

#[test]
fn updates_while_stopped_touch_only_the_data() {
    let mut session = session_with(two_track_project(RATE));
    session
        .scheduler_mut()
        .set_muted_tracks(MutedTracks::from([1]))
        .expect("mute should succeed");

    assert_eq!(session.scheduler().armed_timers(), 0);
    assert!(session.scheduler().upcoming_graph().is_none());
    assert_eq!(session.context().live_node_count(), 1);

    session
        .scheduler_mut()
        .play(1.0, None, 0.0)
        .expect("play should succeed");
    let output = session.run_for(0.5).expect("render should succeed");
    assert_level(&output, 0.5);
}

#[test]
fn updates_in_the_last_bar_let_the_window_play_out() {
    let mut session = session_with(two_track_project(RATE));
    session
        .scheduler_mut()
        .play(1.0, Some(3.0), 0.0)
        .expect("play should succeed");
    let mut output = session.run_for(3.0).expect("render should succeed");

    session
        .scheduler_mut()
        .set_muted_tracks(MutedTracks::from([2]))
        .expect("mute should succeed");
    assert!(session.scheduler().upcoming_graph().is_none());

    output.extend(session.run_for(2.0).expect("render should succeed"));
    assert_level(&output[..frame(4.0)], 0.75);
    assert!(output[frame(4.0)..].iter().all(|sample| sample.abs() < 1e-9));
    assert_eq!(session.finished_count(), 1);
}
