use std::collections::BTreeSet;

use tracing::{debug, instrument};

use crate::{
    clip::{PlaybackWindow, ScheduledClip, schedule_clip},
    effects::{ChainRequest, EffectChainBuilder, EffectError},
    graph::{AudioContext, GAIN_PARAM, NodeId, NodeLabel, NodeRole},
    model::{MIX_TRACK, Track},
    tempo::Timeline,
};

/// Nodes built for one track within one signal graph.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackGraph {
    pub index: usize,
    /// Track gain node; clip gains feed it and teardown silences it.
    pub output: NodeId,
    pub analyser: NodeId,
    pub effects: Vec<NodeId>,
    pub clips: Vec<ScheduledClip>,
}

impl TrackGraph {
    /// Every node owned by this track, sources first.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.clips
            .iter()
            .flat_map(|clip| [clip.source, clip.gain])
            .chain([self.output])
            .chain(self.effects.iter().copied())
            .chain([self.analyser])
    }
}

/// Where a track's signal goes once it leaves its chain.
#[derive(Debug, Clone, Copy)]
pub struct TrackTargets {
    /// The graph's mix bus, fed by every content track and by nothing else.
    pub mix_bus: NodeId,
    /// Master output, fed by the mix track.
    pub master: NodeId,
}

pub struct TrackRequest<'a> {
    pub index: usize,
    pub track: &'a Track,
    pub bypassed: &'a BTreeSet<String>,
    pub timeline: &'a dyn Timeline,
    pub window: PlaybackWindow,
    pub targets: TrackTargets,
}

/// Builds gain, effect chain, analyser and clip sources for one track.
///
/// Content tracks route `clips -> clip gains -> gain -> effects -> analyser -> mix bus`.
/// The mix track (index 0) additionally takes the mix bus as input and routes to the master output.
/// On failure every node this call created is released before returning.
#[instrument(skip_all, fields(track = request.index))]
pub fn build_track(
    context: &mut dyn AudioContext,
    effects: &dyn EffectChainBuilder,
    request: &TrackRequest<'_>,
) -> Result<TrackGraph, EffectError> {
    let index = request.index;
    let output = context.create_gain(NodeLabel::for_track(NodeRole::TrackGain, index));
    let analyser = context.create_analyser(NodeLabel::for_track(NodeRole::Analyser, index));
    let mut graph = TrackGraph {
        index,
        output,
        analyser,
        effects: Vec::new(),
        clips: Vec::new(),
    };

    match populate(context, effects, request, &mut graph) {
        Ok(()) => {
            debug!(
                clips = graph.clips.len(),
                effects = graph.effects.len(),
                "track graph built"
            );
            Ok(graph)
        }
        Err(error) => {
            let now = context.current_time();
            for node in graph.nodes() {
                if let Err(release_error) = context.release_at(node, now) {
                    debug!(%release_error, "release after failed track build");
                }
            }
            Err(error)
        }
    }
}

fn populate(
    context: &mut dyn AudioContext,
    effects: &dyn EffectChainBuilder,
    request: &TrackRequest<'_>,
    graph: &mut TrackGraph,
) -> Result<(), EffectError> {
    let now = context.current_time();
    context.set_param_at(graph.output, GAIN_PARAM, 1.0, now)?;

    let chain = effects.build(
        context,
        &ChainRequest {
            track_index: request.index,
            track: request.track,
            bypassed: request.bypassed,
            window: request.window,
            timeline: request.timeline,
        },
    )?;

    match &chain {
        Some(chain) => {
            graph.effects.clone_from(&chain.nodes);
            context.connect(graph.output, chain.input)?;
            context.connect(chain.output, graph.analyser)?;
        }
        None => context.connect(graph.output, graph.analyser)?,
    }

    if request.index == MIX_TRACK {
        context.connect(request.targets.mix_bus, graph.output)?;
        context.connect(graph.analyser, request.targets.master)?;
    } else {
        context.connect(graph.analyser, request.targets.mix_bus)?;
    }

    for (clip_index, clip) in request.track.clips.iter().enumerate() {
        if let Some(scheduled) = schedule_clip(
            context,
            request.index,
            clip_index,
            clip,
            graph.output,
            request.timeline,
            &request.window,
        )? {
            graph.clips.push(scheduled);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        effects::AutomationChainBuilder,
        model::{AudioBuffer, Clip, EffectRange},
        offline::OfflineContext,
        tempo::TempoMap,
    };

    fn targets(context: &mut OfflineContext) -> TrackTargets {
        TrackTargets {
            mix_bus: context.create_gain(NodeLabel::new(NodeRole::MixBus)),
            master: context.create_gain(NodeLabel::new(NodeRole::Master)),
        }
    }

    fn window() -> PlaybackWindow {
        PlaybackWindow {
            start_time: 0.0,
            end_time: 8.0,
            anchor: 0.0,
        }
    }

    #[test]
    fn content_track_routes_into_the_mix_bus() {
        let mut context = OfflineContext::new(100, 1);
        let targets = targets(&mut context);
        let track = Track::new("Keys")
            .with_clip(Clip::new("a", 1.0, AudioBuffer::new(vec![0.5; 200], 100, 1)))
            .with_clip(Clip::new("late", 9.0, AudioBuffer::new(vec![0.5; 200], 100, 1)))
            .with_effect(EffectRange::new("VOLUME", "GAIN", 1.0, -6.0));
        let timeline = TempoMap::default();
        let bypassed = BTreeSet::new();

        let graph = build_track(
            &mut context,
            &AutomationChainBuilder,
            &TrackRequest {
                index: 2,
                track: &track,
                bypassed: &bypassed,
                timeline: &timeline,
                window: window(),
                targets,
            },
        )
        .expect("track should build");

        assert_eq!(graph.clips.len(), 1);
        assert_eq!(graph.effects.len(), 1);
        assert_eq!(context.inputs(targets.mix_bus), vec![graph.analyser]);
        assert_eq!(context.inputs(graph.analyser), vec![graph.effects[0]]);
        assert_eq!(context.inputs(graph.output), vec![graph.clips[0].gain]);
        assert_eq!(context.inputs(graph.clips[0].gain), vec![graph.clips[0].source]);
    }

    #[test]
    fn mix_track_sits_between_mix_bus_and_master() {
        let mut context = OfflineContext::new(100, 1);
        let targets = targets(&mut context);
        let track = Track::new("Mix");
        let timeline = TempoMap::default();
        let bypassed = BTreeSet::new();

        let graph = build_track(
            &mut context,
            &AutomationChainBuilder,
            &TrackRequest {
                index: MIX_TRACK,
                track: &track,
                bypassed: &bypassed,
                timeline: &timeline,
                window: window(),
                targets,
            },
        )
        .expect("mix track should build");

        assert_eq!(context.inputs(graph.output), vec![targets.mix_bus]);
        assert_eq!(context.inputs(targets.master), vec![graph.analyser]);
    }

    #[test]
    fn failed_build_releases_its_nodes() {
        let mut context = OfflineContext::new(100, 1);
        let targets = targets(&mut context);
        let track = Track::new("Broken")
            .with_clip(Clip::new("a", 1.0, AudioBuffer::new(vec![0.5; 200], 100, 1)))
            .with_effect(EffectRange::new("WARBLE", "DEPTH", 1.0, 1.0));
        let timeline = TempoMap::default();
        let bypassed = BTreeSet::new();

        let result = build_track(
            &mut context,
            &AutomationChainBuilder,
            &TrackRequest {
                index: 1,
                track: &track,
                bypassed: &bypassed,
                timeline: &timeline,
                window: window(),
                targets,
            },
        );
        assert!(result.is_err());
        context.render(1);
        assert_eq!(context.live_node_count(), 2);
    }
}
