use tracing::trace;

use crate::{
    graph::{AudioContext, GraphError, NodeId, NodeLabel, NodeRole},
    model::Clip,
    tempo::Timeline,
};

/// A slice of the timeline mapped onto the render clock.
///
/// `start_time` and `end_time` are timeline seconds; `anchor` is the render-clock
/// instant at which `start_time` is heard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackWindow {
    pub start_time: f64,
    pub end_time: f64,
    pub anchor: f64,
}

impl PlaybackWindow {
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Render-clock instant for a timeline position inside this window.
    #[must_use]
    pub fn to_render_time(&self, timeline_seconds: f64) -> f64 {
        self.anchor + (timeline_seconds - self.start_time)
    }
}

/// When and how much of a clip to play for a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipPlan {
    /// Render-clock start.
    pub start_at: f64,
    /// Seconds into the clip's audio.
    pub offset: f64,
    /// Seconds to play.
    pub duration: f64,
}

/// Plans playback of a clip spanning `clip_start..clip_start + clip_length` (timeline
/// seconds). Returns `None` when the clip does not overlap the window.
#[must_use]
pub fn plan_clip(clip_start: f64, clip_length: f64, window: &PlaybackWindow) -> Option<ClipPlan> {
    let clip_end = clip_start + clip_length;
    if window.start_time >= clip_end || window.end_time <= clip_start {
        return None;
    }
    let audible_end = clip_end.min(window.end_time);

    let plan = if window.start_time >= clip_start {
        ClipPlan {
            start_at: window.anchor,
            offset: window.start_time - clip_start,
            duration: audible_end - window.start_time,
        }
    } else {
        ClipPlan {
            start_at: window.anchor + (clip_start - window.start_time),
            offset: 0.0,
            duration: audible_end - clip_start,
        }
    };
    (plan.duration > 0.0).then_some(plan)
}

/// A started clip: its buffer source and the gain it plays through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledClip {
    pub clip_index: usize,
    pub source: NodeId,
    /// Per-clip gain between the source and the track gain; teardown silences it.
    pub gain: NodeId,
}

/// Creates and starts a buffer source for `clip` feeding `track_gain` through its own
/// clip gain, if the clip is audible in the window.
pub fn schedule_clip(
    context: &mut dyn AudioContext,
    track_index: usize,
    clip_index: usize,
    clip: &Clip,
    track_gain: NodeId,
    timeline: &dyn Timeline,
    window: &PlaybackWindow,
) -> Result<Option<ScheduledClip>, GraphError> {
    let clip_start = timeline.measure_to_time(clip.measure);
    let Some(plan) = plan_clip(clip_start, clip.duration_seconds(), window) else {
        trace!(track = track_index, clip = clip_index, "clip outside window");
        return Ok(None);
    };

    let source = context.create_buffer_source(
        clip.audio.clone(),
        NodeLabel::for_track(NodeRole::ClipSource, track_index),
    );
    let gain = context.create_gain(NodeLabel::for_track(NodeRole::ClipGain, track_index));
    let scheduled = ScheduledClip {
        clip_index,
        source,
        gain,
    };
    if let Err(error) = context
        .connect(source, gain)
        .and_then(|()| context.connect(gain, track_gain))
        .and_then(|()| context.start_source(source, plan.start_at, plan.offset, plan.duration))
    {
        let now = context.current_time();
        for node in [source, gain] {
            if let Err(release_error) = context.release_at(node, now) {
                trace!(%release_error, "release after failed clip start");
            }
        }
        return Err(error);
    }
    trace!(
        track = track_index,
        clip = clip_index,
        start_at = plan.start_at,
        offset = plan.offset,
        duration = plan.duration,
        "clip scheduled"
    );
    Ok(Some(scheduled))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start_time: f64, end_time: f64) -> PlaybackWindow {
        PlaybackWindow {
            start_time,
            end_time,
            anchor: 10.0,
        }
    }

    #[test]
    fn window_starting_inside_clip_skips_into_it() {
        let plan = plan_clip(1.0, 4.0, &window(2.0, 8.0)).expect("clip overlaps");
        assert_eq!(plan.start_at, 10.0);
        assert_eq!(plan.offset, 1.0);
        assert_eq!(plan.duration, 3.0);
    }

    #[test]
    fn later_clip_waits_for_its_start() {
        let plan = plan_clip(3.0, 10.0, &window(2.0, 8.0)).expect("clip overlaps");
        assert_eq!(plan.start_at, 11.0);
        assert_eq!(plan.offset, 0.0);
        assert_eq!(plan.duration, 5.0);
    }

    #[test]
    fn clips_outside_or_touching_the_window_are_skipped() {
        assert_eq!(plan_clip(0.0, 2.0, &window(2.0, 8.0)), None);
        assert_eq!(plan_clip(8.0, 2.0, &window(2.0, 8.0)), None);
        assert_eq!(plan_clip(9.0, 2.0, &window(2.0, 8.0)), None);
        assert_eq!(plan_clip(4.0, 0.0, &window(2.0, 8.0)), None);
    }
}
