use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    clip::PlaybackWindow,
    graph::{AudioContext, GraphError, NodeId, NodeLabel, NodeRole, db_to_gain},
    model::{EffectRange, Track},
    tempo::{TEMPO_EFFECT, Timeline},
};

pub const BYPASS_PARAM: &str = "BYPASS";
pub const VOLUME_GAIN_PARAM: &str = "GAIN";

/// Effects a track can automate. Names match the `EFFECT` half of `"EFFECT-PARAMETER"` keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Volume,
    Delay,
    Filter,
    Compressor,
    Pan,
    Bandpass,
    Eq3Band,
    Chorus,
    Flanger,
    Phaser,
    Tremolo,
    Distortion,
    Pitchshift,
    Ringmod,
    Wah,
    Reverb,
}

impl EffectKind {
    pub const ALL: [Self; 16] = [
        Self::Volume,
        Self::Delay,
        Self::Filter,
        Self::Compressor,
        Self::Pan,
        Self::Bandpass,
        Self::Eq3Band,
        Self::Chorus,
        Self::Flanger,
        Self::Phaser,
        Self::Tremolo,
        Self::Distortion,
        Self::Pitchshift,
        Self::Ringmod,
        Self::Wah,
        Self::Reverb,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Volume => "VOLUME",
            Self::Delay => "DELAY",
            Self::Filter => "FILTER",
            Self::Compressor => "COMPRESSOR",
            Self::Pan => "PAN",
            Self::Bandpass => "BANDPASS",
            Self::Eq3Band => "EQ3BAND",
            Self::Chorus => "CHORUS",
            Self::Flanger => "FLANGER",
            Self::Phaser => "PHASER",
            Self::Tremolo => "TREMOLO",
            Self::Distortion => "DISTORTION",
            Self::Pitchshift => "PITCHSHIFT",
            Self::Ringmod => "RINGMOD",
            Self::Wah => "WAH",
            Self::Reverb => "REVERB",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Value a parameter holds before any automation reaches it.
    #[must_use]
    pub fn default_value(self, param: &str) -> f64 {
        match (self, param) {
            (Self::Delay | Self::Distortion, "MIX") => 0.5,
            (_, "MIX") => 1.0,
            _ => 0.0,
        }
    }

    /// Offline processing: `VOLUME` applies its `GAIN` (dB); every other effect passes
    /// audio through unchanged. A `BYPASS` value of 0.5 or more sends the dry signal.
    pub fn process(self, input: f32, param: impl Fn(&str) -> Option<f64>) -> f32 {
        let bypass = param(BYPASS_PARAM).unwrap_or(0.0);
        if bypass >= 0.5 {
            return input;
        }
        match self {
            Self::Volume => {
                let db = param(VOLUME_GAIN_PARAM).unwrap_or(0.0);
                input * db_to_gain(db) as f32
            }
            _ => input,
        }
    }
}

#[derive(Debug, Error)]
pub enum EffectError {
    #[error("unknown effect '{name}' on track {track}")]
    UnknownEffect { track: usize, name: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// A linear chain of effect nodes. Audio enters at `input` and leaves at `output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectChain {
    pub input: NodeId,
    pub output: NodeId,
    pub nodes: Vec<NodeId>,
}

/// Everything a chain builder needs to know about one track in one playback window.
pub struct ChainRequest<'a> {
    pub track_index: usize,
    pub track: &'a Track,
    pub bypassed: &'a BTreeSet<String>,
    pub window: PlaybackWindow,
    pub timeline: &'a dyn Timeline,
}

/// Builds a track's effect chain with its automation scheduled relative to the window.
pub trait EffectChainBuilder {
    /// Returns `None` when the track has no effects to apply.
    fn build(
        &self,
        context: &mut dyn AudioContext,
        request: &ChainRequest<'_>,
    ) -> Result<Option<EffectChain>, EffectError>;
}

/// Default builder: one node per effect name, chained in first-appearance order.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutomationChainBuilder;

impl AutomationChainBuilder {
    fn effect_order(request: &ChainRequest<'_>) -> Result<Vec<EffectKind>, EffectError> {
        let mut order = Vec::new();
        for range in &request.track.effects {
            if range.name == TEMPO_EFFECT {
                continue;
            }
            let kind = EffectKind::from_name(&range.name).ok_or_else(|| {
                EffectError::UnknownEffect {
                    track: request.track_index,
                    name: range.name.clone(),
                }
            })?;
            if request.bypassed.contains(&range.key()) {
                continue;
            }
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        Ok(order)
    }

    fn wire(
        context: &mut dyn AudioContext,
        request: &ChainRequest<'_>,
        order: &[EffectKind],
        nodes: &mut Vec<NodeId>,
    ) -> Result<(), GraphError> {
        for kind in order {
            let node =
                context.create_effect(*kind, NodeLabel::for_track(NodeRole::Effect, request.track_index));
            if let Some(previous) = nodes.last().copied() {
                context.connect(previous, node)?;
            }
            nodes.push(node);
            for range in request
                .track
                .effects
                .iter()
                .filter(|range| range.name == kind.name())
            {
                if request.bypassed.contains(&range.key()) {
                    debug!(track = request.track_index, key = %range.key(), "automation bypassed");
                    continue;
                }
                schedule_range(context, node, range, &request.window, request.timeline)?;
            }
        }
        Ok(())
    }
}

impl EffectChainBuilder for AutomationChainBuilder {
    #[instrument(skip(self, context, request), fields(track = request.track_index))]
    fn build(
        &self,
        context: &mut dyn AudioContext,
        request: &ChainRequest<'_>,
    ) -> Result<Option<EffectChain>, EffectError> {
        let order = Self::effect_order(request)?;
        if order.is_empty() {
            return Ok(None);
        }

        let mut nodes = Vec::with_capacity(order.len());
        if let Err(error) = Self::wire(context, request, &order, &mut nodes) {
            let now = context.current_time();
            for node in &nodes {
                if let Err(release_error) = context.release_at(*node, now) {
                    debug!(%release_error, "release after failed chain build");
                }
            }
            return Err(error.into());
        }

        debug!(effects = nodes.len(), "effect chain built");
        match (nodes.first().copied(), nodes.last().copied()) {
            (Some(input), Some(output)) => Ok(Some(EffectChain {
                input,
                output,
                nodes,
            })),
            _ => Ok(None),
        }
    }
}

/// Schedules one automation range on the render clock.
///
/// Range times are taken relative to the window start and shifted onto the anchor.
/// Anything that would land before the anchor is applied at the anchor instead.
fn schedule_range(
    context: &mut dyn AudioContext,
    node: NodeId,
    range: &EffectRange,
    window: &PlaybackWindow,
    timeline: &dyn Timeline,
) -> Result<(), GraphError> {
    let param = range.parameter.as_str();
    let start = timeline.measure_to_time(range.start_measure);

    if !range.has_end() {
        let at = window.to_render_time(start).max(window.anchor);
        return context.set_param_at(node, param, range.start_value, at);
    }

    let end = timeline.measure_to_time(range.end_measure);
    let end_value = range.final_value();
    if end <= window.start_time {
        return context.set_param_at(node, param, end_value, window.anchor);
    }

    if start < window.start_time {
        let progress = (window.start_time - start) / (end - start);
        let value = range.start_value + (end_value - range.start_value) * progress;
        context.set_param_at(node, param, value, window.anchor)?;
    } else {
        context.set_param_at(node, param, range.start_value, window.to_render_time(start))?;
    }
    context.ramp_param_to(node, param, end_value, window.to_render_time(end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{EffectRange, Track},
        offline::OfflineContext,
        tempo::TempoMap,
    };

    fn request<'a>(
        track: &'a Track,
        bypassed: &'a BTreeSet<String>,
        timeline: &'a TempoMap,
        start_time: f64,
    ) -> ChainRequest<'a> {
        ChainRequest {
            track_index: 1,
            track,
            bypassed,
            window: PlaybackWindow {
                start_time,
                end_time: 16.0,
                anchor: 1.0,
            },
            timeline,
        }
    }

    #[test]
    fn chains_effects_in_first_appearance_order() {
        let track = Track::new("Lead")
            .with_effect(EffectRange::new("REVERB", "MIX", 1.0, 0.3))
            .with_effect(EffectRange::new("VOLUME", "GAIN", 1.0, -6.0))
            .with_effect(EffectRange::new("REVERB", "REVERB_TIME", 1.0, 1200.0));
        let bypassed = BTreeSet::new();
        let timeline = TempoMap::default();
        let mut context = OfflineContext::new(100, 1);

        let chain = AutomationChainBuilder
            .build(&mut context, &request(&track, &bypassed, &timeline, 0.0))
            .expect("chain should build")
            .expect("track has effects");
        assert_eq!(chain.nodes.len(), 2);
        assert_eq!(chain.input, chain.nodes[0]);
        assert_eq!(context.inputs(chain.output), vec![chain.input]);
        assert_eq!(context.param_value_at(chain.output, "GAIN", 1.0), Some(-6.0));
    }

    #[test]
    fn tempo_only_tracks_have_no_chain() {
        let track = Track::new("Mix").with_effect(EffectRange::new("TEMPO", "TEMPO", 1.0, 90.0));
        let bypassed = BTreeSet::new();
        let timeline = TempoMap::default();
        let mut context = OfflineContext::new(100, 1);
        let chain = AutomationChainBuilder
            .build(&mut context, &request(&track, &bypassed, &timeline, 0.0))
            .expect("chain should build");
        assert!(chain.is_none());
        assert_eq!(context.live_node_count(), 0);
    }

    #[test]
    fn unknown_effects_fail_before_creating_nodes() {
        let track = Track::new("Lead").with_effect(EffectRange::new("GRANULATOR", "SIZE", 1.0, 0.3));
        let bypassed = BTreeSet::new();
        let timeline = TempoMap::default();
        let mut context = OfflineContext::new(100, 1);
        let error = AutomationChainBuilder
            .build(&mut context, &request(&track, &bypassed, &timeline, 0.0))
            .expect_err("unknown effect should fail");
        assert!(matches!(error, EffectError::UnknownEffect { track: 1, .. }));
        assert_eq!(context.live_node_count(), 0);
    }

    #[test]
    fn ramps_are_shifted_onto_the_anchor() {
        // 120 BPM: measure 2 is at 2s, measure 4 at 6s. Window starts at 2s, anchored at 1s.
        let track = Track::new("Lead")
            .with_effect(EffectRange::new("VOLUME", "GAIN", 2.0, -12.0).ramp_to(4.0, 0.0));
        let bypassed = BTreeSet::new();
        let timeline = TempoMap::default();
        let mut context = OfflineContext::new(100, 1);
        let chain = AutomationChainBuilder
            .build(&mut context, &request(&track, &bypassed, &timeline, 2.0))
            .expect("chain should build")
            .expect("track has effects");
        let node = chain.input;
        assert_eq!(context.param_value_at(node, "GAIN", 1.0), Some(-12.0));
        let midway = context.param_value_at(node, "GAIN", 3.0).expect("param exists");
        assert!((midway + 6.0).abs() < 1e-9);
        assert_eq!(context.param_value_at(node, "GAIN", 5.0), Some(0.0));
    }

    #[test]
    fn in_progress_ramp_starts_from_the_interpolated_value() {
        let track = Track::new("Lead")
            .with_effect(EffectRange::new("VOLUME", "GAIN", 1.0, -12.0).ramp_to(3.0, 0.0));
        let bypassed = BTreeSet::new();
        let timeline = TempoMap::default();
        let mut context = OfflineContext::new(100, 1);
        let chain = AutomationChainBuilder
            .build(&mut context, &request(&track, &bypassed, &timeline, 2.0))
            .expect("chain should build")
            .expect("track has effects");
        let at_anchor = context
            .param_value_at(chain.input, "GAIN", 1.0)
            .expect("param exists");
        assert!((at_anchor + 6.0).abs() < 1e-9);
        assert_eq!(context.param_value_at(chain.input, "GAIN", 3.0), Some(0.0));
    }

    #[test]
    fn finished_ranges_apply_their_end_value_at_the_anchor() {
        let track = Track::new("Lead")
            .with_effect(EffectRange::new("VOLUME", "GAIN", 1.0, -12.0).ramp_to(2.0, -3.0));
        let bypassed = BTreeSet::new();
        let timeline = TempoMap::default();
        let mut context = OfflineContext::new(100, 1);
        let chain = AutomationChainBuilder
            .build(&mut context, &request(&track, &bypassed, &timeline, 4.0))
            .expect("chain should build")
            .expect("track has effects");
        assert_eq!(context.param_value_at(chain.input, "GAIN", 1.0), Some(-3.0));
    }

    #[test]
    fn bypassed_keys_keep_their_defaults() {
        let track = Track::new("Lead")
            .with_effect(EffectRange::new("VOLUME", "GAIN", 1.0, -12.0))
            .with_effect(EffectRange::new("VOLUME", "BYPASS", 1.0, 0.0));
        let bypassed = BTreeSet::from(["VOLUME-GAIN".to_string()]);
        let timeline = TempoMap::default();
        let mut context = OfflineContext::new(100, 1);
        let chain = AutomationChainBuilder
            .build(&mut context, &request(&track, &bypassed, &timeline, 0.0))
            .expect("chain should build")
            .expect("node still exists");
        assert_eq!(context.param_value_at(chain.input, "GAIN", 2.0), Some(0.0));
    }

    #[test]
    fn fully_bypassed_effects_build_no_chain() {
        let track = Track::new("Lead").with_effect(EffectRange::new("REVERB", "MIX", 1.0, 0.8));
        let bypassed = BTreeSet::from(["REVERB-MIX".to_string()]);
        let timeline = TempoMap::default();
        let mut context = OfflineContext::new(100, 1);
        let chain = AutomationChainBuilder
            .build(&mut context, &request(&track, &bypassed, &timeline, 0.0))
            .expect("bypassed chain should build");
        assert!(chain.is_none());
        assert!(context.nodes_with_role(NodeRole::Effect).is_empty());
    }

    #[test]
    fn volume_processing_and_bypass() {
        let gain = EffectKind::Volume.process(1.0, |param| (param == "GAIN").then_some(-20.0));
        assert!((gain - 0.1).abs() < 1e-6);
        let dry = EffectKind::Volume.process(1.0, |param| match param {
            "GAIN" => Some(-20.0),
            "BYPASS" => Some(1.0),
            _ => None,
        });
        assert_eq!(dry, 1.0);
        assert_eq!(EffectKind::Reverb.process(0.4, |_| None), 0.4);
        assert_eq!(EffectKind::from_name("EQ3BAND"), Some(EffectKind::Eq3Band));
    }
}
