use std::fmt;

use tracing::{debug, info, trace};

use crate::{
    graph::{AudioContext, GAIN_PARAM, NodeId},
    track::TrackGraph,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(pub u64);

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph#{}", self.0)
    }
}

/// All nodes built for one playback window.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalGraph {
    id: GraphId,
    mix: NodeId,
    anchor: f64,
    tracks: Vec<TrackGraph>,
    teardown_at: Option<f64>,
}

impl SignalGraph {
    #[must_use]
    pub fn new(id: GraphId, mix: NodeId, anchor: f64) -> Self {
        Self {
            id,
            mix,
            anchor,
            tracks: Vec::new(),
            teardown_at: None,
        }
    }

    pub fn push_track(&mut self, track: TrackGraph) {
        self.tracks.push(track);
    }

    #[must_use]
    pub fn id(&self) -> GraphId {
        self.id
    }

    /// The graph's mix bus; gated closed until the anchor.
    #[must_use]
    pub fn mix(&self) -> NodeId {
        self.mix
    }

    /// Render-clock instant at which this graph becomes audible.
    #[must_use]
    pub fn anchor(&self) -> f64 {
        self.anchor
    }

    #[must_use]
    pub fn tracks(&self) -> &[TrackGraph] {
        &self.tracks
    }

    #[must_use]
    pub fn track(&self, index: usize) -> Option<&TrackGraph> {
        self.tracks.iter().find(|track| track.index == index)
    }

    #[must_use]
    pub fn source_count(&self) -> usize {
        self.tracks.iter().map(|track| track.clips.len()).sum()
    }

    /// Render-clock instant the graph is silenced at, once a teardown was requested.
    #[must_use]
    pub fn teardown_at(&self) -> Option<f64> {
        self.teardown_at
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.tracks
            .iter()
            .flat_map(TrackGraph::nodes)
            .chain([self.mix])
    }
}

/// Silences `graph` at `now + delay` and releases its nodes `margin` seconds later.
///
/// Sources stop; clip gains, track gains and the mix bus drop to zero. Clearing again is
/// a no-op unless it asks for an earlier instant. Nodes that are already gone are skipped.
pub fn clear_graph(context: &mut dyn AudioContext, graph: &mut SignalGraph, delay: f64, margin: f64) {
    let at = context.current_time() + delay.max(0.0);
    if graph.teardown_at.is_some_and(|existing| existing <= at) {
        trace!(graph = %graph.id, "graph already cleared");
        return;
    }
    graph.teardown_at = Some(at);

    for track in &graph.tracks {
        for clip in &track.clips {
            if let Err(error) = context.stop_source(clip.source, at) {
                debug!(graph = %graph.id, %error, "stop skipped");
            }
            if let Err(error) = context.set_param_at(clip.gain, GAIN_PARAM, 0.0, at) {
                debug!(graph = %graph.id, %error, "clip mute skipped");
            }
        }
        if let Err(error) = context.set_param_at(track.output, GAIN_PARAM, 0.0, at) {
            debug!(graph = %graph.id, %error, "track mute skipped");
        }
    }
    if let Err(error) = context.set_param_at(graph.mix, GAIN_PARAM, 0.0, at) {
        debug!(graph = %graph.id, %error, "mix mute skipped");
    }

    let release = at + margin.max(0.0);
    for node in graph.nodes() {
        if let Err(error) = context.release_at(node, release) {
            trace!(graph = %graph.id, %error, "release skipped");
        }
    }
    debug!(graph = %graph.id, at, release, "graph cleared");
}

/// The live graph (audible or about to be) and the upcoming graph (built ahead and
/// gated until its anchor). At most one of them is audible at any render instant.
#[derive(Debug)]
pub struct GraphSlots {
    live: Option<SignalGraph>,
    upcoming: Option<SignalGraph>,
    teardown_margin: f64,
}

impl GraphSlots {
    #[must_use]
    pub fn new(teardown_margin: f64) -> Self {
        Self {
            live: None,
            upcoming: None,
            teardown_margin,
        }
    }

    #[must_use]
    pub fn live(&self) -> Option<&SignalGraph> {
        self.live.as_ref()
    }

    #[must_use]
    pub fn upcoming(&self) -> Option<&SignalGraph> {
        self.upcoming.as_ref()
    }

    /// Stores a freshly built graph as upcoming, replacing (and clearing) any previous one.
    /// The live graph's outputs are closed at the new graph's anchor.
    pub fn install_upcoming(&mut self, context: &mut dyn AudioContext, graph: SignalGraph) {
        self.clear_upcoming(context, 0.0);
        if let Some(live) = &self.live {
            gate(context, live, 0.0, graph.anchor);
        }
        trace!(graph = %graph.id, anchor = graph.anchor, "upcoming graph installed");
        self.upcoming = Some(graph);
    }

    /// Makes the upcoming graph live if its id matches, clearing the old live graph at the
    /// new graph's anchor. Returns `false` for a stale promotion.
    pub fn promote(&mut self, context: &mut dyn AudioContext, id: GraphId) -> bool {
        if self.upcoming.as_ref().map(SignalGraph::id) != Some(id) {
            debug!(graph = %id, "stale promotion ignored");
            return false;
        }
        let Some(next) = self.upcoming.take() else {
            return false;
        };
        let delay = (next.anchor - context.current_time()).max(0.0);
        if let Some(mut previous) = self.live.take() {
            clear_graph(context, &mut previous, delay, self.teardown_margin);
        }
        info!(graph = %next.id, anchor = next.anchor, "graph promoted");
        self.live = Some(next);
        true
    }

    /// Clears the live graph after `delay`; the graph stays in its slot until replaced.
    pub fn clear_live(&mut self, context: &mut dyn AudioContext, delay: f64) {
        if let Some(live) = &mut self.live {
            clear_graph(context, live, delay, self.teardown_margin);
        }
    }

    /// Drops the upcoming graph without promoting it. The live graph's outputs, closed
    /// for the handoff, open again unless the live graph is itself being torn down by then.
    pub fn clear_upcoming(&mut self, context: &mut dyn AudioContext, delay: f64) {
        let Some(mut upcoming) = self.upcoming.take() else {
            return;
        };
        clear_graph(context, &mut upcoming, delay, self.teardown_margin);
        if let Some(live) = &self.live {
            if live
                .teardown_at
                .is_none_or(|teardown| teardown > upcoming.anchor)
            {
                gate(context, live, 1.0, upcoming.anchor);
            }
        }
    }

    /// Clears and drops both graphs.
    pub fn clear_all(&mut self, context: &mut dyn AudioContext, delay: f64) {
        if let Some(mut live) = self.live.take() {
            clear_graph(context, &mut live, delay, self.teardown_margin);
        }
        self.clear_upcoming(context, delay);
    }
}

/// Sets the mix bus and every track output of `graph` to `value` at `at`.
fn gate(context: &mut dyn AudioContext, graph: &SignalGraph, value: f64, at: f64) {
    let outputs = graph.tracks.iter().map(|track| track.output).chain([graph.mix]);
    for node in outputs {
        if let Err(error) = context.set_param_at(node, GAIN_PARAM, value, at) {
            debug!(graph = %graph.id, %error, "handoff gate skipped");
        }
    }
}
