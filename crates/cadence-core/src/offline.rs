//! Pull-based offline renderer implementing [`AudioContext`].
//!
//! Every scheduling time is snapped to the nearest sample frame, so two events
//! scheduled for the same instant always land on the same frame.

use std::collections::BTreeMap;

use tracing::trace;

use crate::{
    effects::EffectKind,
    graph::{AudioContext, GAIN_PARAM, GraphError, NodeId, NodeLabel, NodeRole},
    model::AudioBuffer,
};

const MAX_GRAPH_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParamEvent {
    Set { at: f64, value: f64 },
    Ramp { at: f64, value: f64 },
}

impl ParamEvent {
    fn at(self) -> f64 {
        match self {
            Self::Set { at, .. } | Self::Ramp { at, .. } => at,
        }
    }

    fn value(self) -> f64 {
        match self {
            Self::Set { value, .. } | Self::Ramp { value, .. } => value,
        }
    }
}

/// Automation timeline for one parameter: step and linear-ramp events ordered by time.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamTimeline {
    initial: f64,
    events: Vec<ParamEvent>,
}

impl ParamTimeline {
    #[must_use]
    pub fn new(initial: f64) -> Self {
        Self {
            initial,
            events: Vec::new(),
        }
    }

    pub fn set_at(&mut self, value: f64, at: f64) {
        self.insert(ParamEvent::Set { at, value });
    }

    pub fn ramp_to(&mut self, value: f64, at: f64) {
        self.insert(ParamEvent::Ramp { at, value });
    }

    fn insert(&mut self, event: ParamEvent) {
        let index = self.events.partition_point(|existing| existing.at() <= event.at());
        self.events.insert(index, event);
    }

    #[must_use]
    pub fn value_at(&self, time: f64) -> f64 {
        let mut value = self.initial;
        let mut since = None;
        for event in &self.events {
            if event.at() <= time {
                value = event.value();
                since = Some(event.at());
                continue;
            }
            if let (ParamEvent::Ramp { at, value: target }, Some(from)) = (*event, since) {
                let span = at - from;
                if span > 0.0 {
                    return value + (target - value) * (time - from) / span;
                }
            }
            break;
        }
        value
    }
}

/// Where a started source sits on the render clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceWindow {
    pub start: f64,
    pub offset: f64,
    pub duration: f64,
    pub stop: Option<f64>,
}

#[derive(Debug)]
struct SourceNode {
    buffer: AudioBuffer,
    window: Option<SourceWindow>,
    start_frame: u64,
    end_frame: u64,
    stop_frame: Option<u64>,
}

impl SourceNode {
    fn sample(&self, frame: u64, channel: usize, sample_rate: u32) -> f32 {
        let Some(window) = self.window else {
            return 0.0;
        };
        let end = self
            .stop_frame
            .map_or(self.end_frame, |stop| stop.min(self.end_frame));
        if frame < self.start_frame || frame >= end {
            return 0.0;
        }
        let elapsed = (frame - self.start_frame) as f64 / f64::from(sample_rate);
        let position = (window.offset + elapsed) * f64::from(self.buffer.sample_rate());
        self.buffer
            .sample((position + 1e-6).floor() as usize, channel)
    }
}

#[derive(Debug)]
enum NodeKind {
    Destination,
    Gain(ParamTimeline),
    Source(SourceNode),
    Effect {
        kind: EffectKind,
        params: BTreeMap<String, ParamTimeline>,
    },
    Analyser {
        peak: f32,
    },
}

#[derive(Debug)]
struct Node {
    label: NodeLabel,
    kind: NodeKind,
    inputs: Vec<NodeId>,
    release_frame: Option<u64>,
}

#[derive(Debug)]
pub struct OfflineContext {
    sample_rate: u32,
    channels: usize,
    frame: u64,
    nodes: Vec<Option<Node>>,
    releases: BTreeMap<u64, Vec<NodeId>>,
    destination: NodeId,
}

impl OfflineContext {
    #[must_use]
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        let destination = Node {
            label: NodeLabel::new(NodeRole::Destination),
            kind: NodeKind::Destination,
            inputs: Vec::new(),
            release_frame: None,
        };
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            frame: 0,
            nodes: vec![Some(destination)],
            releases: BTreeMap::new(),
            destination: NodeId(0),
        }
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[must_use]
    pub fn frame_position(&self) -> u64 {
        self.frame
    }

    /// Renders `frames` interleaved frames from the destination and advances the clock.
    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        let mut output = Vec::with_capacity(frames * self.channels);
        let mut levels = Vec::new();
        for _ in 0..frames {
            self.collect_released();
            let time = self.frame_time(self.frame);
            for channel in 0..self.channels {
                let sample = self.pull(self.destination, self.frame, time, channel, 0, &mut levels);
                output.push(sample);
            }
            for (id, level) in levels.drain(..) {
                if let Some(Some(Node {
                    kind: NodeKind::Analyser { peak },
                    ..
                })) = self.nodes.get_mut(id.0)
                {
                    *peak = peak.max(level);
                }
            }
            self.frame += 1;
        }
        output
    }

    /// Live nodes, not counting the destination.
    #[must_use]
    pub fn live_node_count(&self) -> usize {
        self.nodes.iter().flatten().count() - 1
    }

    #[must_use]
    pub fn nodes_with_role(&self, role: NodeRole) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| {
                node.as_ref()
                    .filter(|node| node.label.role == role)
                    .map(|_| NodeId(index))
            })
            .collect()
    }

    #[must_use]
    pub fn label(&self, id: NodeId) -> Option<NodeLabel> {
        self.node(id).ok().map(|node| node.label)
    }

    #[must_use]
    pub fn is_alive(&self, id: NodeId) -> bool {
        self.node(id).is_ok()
    }

    #[must_use]
    pub fn inputs(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id)
            .map(|node| node.inputs.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn param_value_at(&self, id: NodeId, param: &str, time: f64) -> Option<f64> {
        match &self.node(id).ok()?.kind {
            NodeKind::Gain(timeline) if param == GAIN_PARAM => Some(timeline.value_at(time)),
            NodeKind::Effect { kind, params } => Some(
                params
                    .get(param)
                    .map_or_else(|| kind.default_value(param), |timeline| timeline.value_at(time)),
            ),
            _ => None,
        }
    }

    #[must_use]
    pub fn source_window(&self, id: NodeId) -> Option<SourceWindow> {
        match &self.node(id).ok()?.kind {
            NodeKind::Source(source) => source.window.map(|window| SourceWindow {
                stop: source.stop_frame.map(|frame| self.frame_time(frame)),
                ..window
            }),
            _ => None,
        }
    }

    #[must_use]
    pub fn pending_release(&self, id: NodeId) -> Option<f64> {
        let frame = self.node(id).ok()?.release_frame?;
        Some(self.frame_time(frame))
    }

    fn frame_time(&self, frame: u64) -> f64 {
        frame as f64 / f64::from(self.sample_rate)
    }

    fn frame_at(&self, when: f64) -> u64 {
        (when.max(0.0) * f64::from(self.sample_rate)).round() as u64
    }

    fn snap(&self, when: f64) -> f64 {
        self.frame_time(self.frame_at(when))
    }

    fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(GraphError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(GraphError::UnknownNode(id))
    }

    fn add(&mut self, label: NodeLabel, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        trace!(node = %id, ?label, "node created");
        self.nodes.push(Some(Node {
            label,
            kind,
            inputs: Vec::new(),
            release_frame: None,
        }));
        id
    }

    fn collect_released(&mut self) {
        while let Some(entry) = self.releases.first_entry() {
            if *entry.key() > self.frame {
                break;
            }
            for id in entry.remove() {
                if self.nodes.get(id.0).is_some_and(Option::is_some) {
                    self.nodes[id.0] = None;
                    for node in self.nodes.iter_mut().flatten() {
                        node.inputs.retain(|input| *input != id);
                    }
                    trace!(node = %id, frame = self.frame, "node released");
                }
            }
        }
    }

    fn pull(
        &self,
        id: NodeId,
        frame: u64,
        time: f64,
        channel: usize,
        depth: usize,
        levels: &mut Vec<(NodeId, f32)>,
    ) -> f32 {
        let Ok(node) = self.node(id) else {
            return 0.0;
        };
        if depth > MAX_GRAPH_DEPTH {
            return 0.0;
        }
        if let NodeKind::Source(source) = &node.kind {
            return source.sample(frame, channel, self.sample_rate);
        }

        let input: f32 = node
            .inputs
            .iter()
            .map(|input| self.pull(*input, frame, time, channel, depth + 1, levels))
            .sum();
        match &node.kind {
            NodeKind::Gain(gain) => input * gain.value_at(time) as f32,
            NodeKind::Effect { kind, params } => kind.process(input, |param| {
                params.get(param).map(|timeline| timeline.value_at(time))
            }),
            NodeKind::Analyser { .. } => {
                levels.push((id, input.abs()));
                input
            }
            NodeKind::Destination | NodeKind::Source(_) => input,
        }
    }

    fn param_timeline(&mut self, id: NodeId, param: &str) -> Result<&mut ParamTimeline, GraphError> {
        let node = self.node_mut(id)?;
        match &mut node.kind {
            NodeKind::Gain(timeline) if param == GAIN_PARAM => Ok(timeline),
            NodeKind::Effect { kind, params } => {
                let default = kind.default_value(param);
                Ok(params
                    .entry(param.to_string())
                    .or_insert_with(|| ParamTimeline::new(default)))
            }
            _ => Err(GraphError::UnknownParam {
                node: id,
                param: param.to_string(),
            }),
        }
    }

    fn source_mut(&mut self, id: NodeId) -> Result<&mut SourceNode, GraphError> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Source(source) => Ok(source),
            _ => Err(GraphError::NotASource(id)),
        }
    }
}

impl AudioContext for OfflineContext {
    fn current_time(&self) -> f64 {
        self.frame_time(self.frame)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn destination(&self) -> NodeId {
        self.destination
    }

    fn create_gain(&mut self, label: NodeLabel) -> NodeId {
        self.add(label, NodeKind::Gain(ParamTimeline::new(1.0)))
    }

    fn create_buffer_source(&mut self, buffer: AudioBuffer, label: NodeLabel) -> NodeId {
        self.add(
            label,
            NodeKind::Source(SourceNode {
                buffer,
                window: None,
                start_frame: 0,
                end_frame: 0,
                stop_frame: None,
            }),
        )
    }

    fn create_effect(&mut self, kind: EffectKind, label: NodeLabel) -> NodeId {
        self.add(
            label,
            NodeKind::Effect {
                kind,
                params: BTreeMap::new(),
            },
        )
    }

    fn create_analyser(&mut self, label: NodeLabel) -> NodeId {
        self.add(label, NodeKind::Analyser { peak: 0.0 })
    }

    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.node(from)?;
        let target = self.node_mut(to)?;
        if matches!(target.kind, NodeKind::Source(_)) {
            return Err(GraphError::InvalidSchedule {
                node: to,
                reason: "buffer sources take no inputs",
            });
        }
        if !target.inputs.contains(&from) {
            target.inputs.push(from);
        }
        Ok(())
    }

    fn start_source(
        &mut self,
        source: NodeId,
        when: f64,
        offset: f64,
        duration: f64,
    ) -> Result<(), GraphError> {
        if offset < 0.0 || duration < 0.0 {
            return Err(GraphError::InvalidSchedule {
                node: source,
                reason: "offset and duration must be non-negative",
            });
        }
        let start = self.snap(when);
        let start_frame = self.frame_at(when);
        let end_frame = self.frame_at(when + duration);
        let node = self.source_mut(source)?;
        if node.window.is_some() {
            return Err(GraphError::AlreadyStarted(source));
        }
        node.window = Some(SourceWindow {
            start,
            offset,
            duration,
            stop: None,
        });
        node.start_frame = start_frame;
        node.end_frame = end_frame;
        Ok(())
    }

    fn stop_source(&mut self, source: NodeId, when: f64) -> Result<(), GraphError> {
        let frame = self.frame_at(when);
        let node = self.source_mut(source)?;
        node.stop_frame = Some(node.stop_frame.map_or(frame, |existing| existing.min(frame)));
        Ok(())
    }

    fn set_param_at(
        &mut self,
        node: NodeId,
        param: &str,
        value: f64,
        when: f64,
    ) -> Result<(), GraphError> {
        let at = self.snap(when);
        self.param_timeline(node, param)?.set_at(value, at);
        Ok(())
    }

    fn ramp_param_to(
        &mut self,
        node: NodeId,
        param: &str,
        value: f64,
        when: f64,
    ) -> Result<(), GraphError> {
        let at = self.snap(when);
        self.param_timeline(node, param)?.ramp_to(value, at);
        Ok(())
    }

    fn release_at(&mut self, node: NodeId, when: f64) -> Result<(), GraphError> {
        if node == self.destination {
            return Err(GraphError::InvalidSchedule {
                node,
                reason: "the destination cannot be released",
            });
        }
        let frame = self.frame_at(when).max(self.frame);
        let entry = self.node_mut(node)?;
        if entry.release_frame.is_some_and(|existing| existing <= frame) {
            return Ok(());
        }
        entry.release_frame = Some(frame);
        self.releases.entry(frame).or_default().push(node);
        Ok(())
    }

    fn peak_level(&self, analyser: NodeId) -> Option<f32> {
        match &self.node(analyser).ok()?.kind {
            NodeKind::Analyser { peak } => Some(*peak),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 100;

    fn dc(value: f32, frames: usize) -> AudioBuffer {
        AudioBuffer::new(vec![value; frames], RATE, 1)
    }

    #[test]
    fn ramps_interpolate_from_the_previous_event() {
        let mut timeline = ParamTimeline::new(1.0);
        timeline.set_at(0.0, 1.0);
        timeline.ramp_to(1.0, 2.0);
        assert_eq!(timeline.value_at(0.5), 1.0);
        assert_eq!(timeline.value_at(1.0), 0.0);
        assert!((timeline.value_at(1.5) - 0.5).abs() < 1e-12);
        assert_eq!(timeline.value_at(3.0), 1.0);
    }

    #[test]
    fn source_plays_only_inside_its_window() {
        let mut context = OfflineContext::new(RATE, 1);
        let source = context.create_buffer_source(dc(0.5, 500), NodeLabel::new(NodeRole::ClipSource));
        let destination = context.destination();
        context.connect(source, destination).expect("connect should succeed");
        context
            .start_source(source, 0.1, 0.0, 0.2)
            .expect("start should succeed");

        let output = context.render(40);
        assert!(output[..10].iter().all(|sample| *sample == 0.0));
        assert!(output[10..30].iter().all(|sample| (*sample - 0.5).abs() < 1e-6));
        assert!(output[30..].iter().all(|sample| *sample == 0.0));
    }

    #[test]
    fn source_offset_skips_into_the_buffer() {
        let mut context = OfflineContext::new(RATE, 1);
        let ramp: Vec<f32> = (0..100).map(|index| index as f32).collect();
        let source = context.create_buffer_source(
            AudioBuffer::new(ramp, RATE, 1),
            NodeLabel::new(NodeRole::ClipSource),
        );
        let destination = context.destination();
        context.connect(source, destination).expect("connect should succeed");
        context
            .start_source(source, 0.0, 0.25, 0.1)
            .expect("start should succeed");
        let output = context.render(12);
        assert_eq!(&output[..3], &[25.0, 26.0, 27.0]);
        assert_eq!(output[10], 0.0);
    }

    #[test]
    fn earliest_stop_wins_and_double_start_fails() {
        let mut context = OfflineContext::new(RATE, 1);
        let source = context.create_buffer_source(dc(1.0, 100), NodeLabel::new(NodeRole::ClipSource));
        context
            .start_source(source, 0.0, 0.0, 1.0)
            .expect("start should succeed");
        assert_eq!(
            context.start_source(source, 0.0, 0.0, 1.0),
            Err(GraphError::AlreadyStarted(source))
        );
        context.stop_source(source, 0.5).expect("stop should succeed");
        context.stop_source(source, 0.8).expect("stop should succeed");
        let window = context.source_window(source).expect("source should be started");
        assert_eq!(window.stop, Some(0.5));
    }

    #[test]
    fn gain_automation_scales_input() {
        let mut context = OfflineContext::new(RATE, 2);
        let source = context.create_buffer_source(dc(1.0, 100), NodeLabel::new(NodeRole::ClipSource));
        let gain = context.create_gain(NodeLabel::new(NodeRole::TrackGain));
        let destination = context.destination();
        context.connect(source, gain).expect("connect should succeed");
        context.connect(gain, destination).expect("connect should succeed");
        context
            .start_source(source, 0.0, 0.0, 1.0)
            .expect("start should succeed");
        context
            .set_param_at(gain, GAIN_PARAM, 0.25, 0.05)
            .expect("set should succeed");

        let output = context.render(10);
        assert_eq!(output[0], 1.0);
        assert_eq!(output[1], 1.0);
        assert_eq!(output[10], 0.25);
        assert_eq!(output[11], 0.25);
    }

    #[test]
    fn released_nodes_disappear_and_detach() {
        let mut context = OfflineContext::new(RATE, 1);
        let gain = context.create_gain(NodeLabel::new(NodeRole::MixBus));
        let destination = context.destination();
        context.connect(gain, destination).expect("connect should succeed");
        context.release_at(gain, 0.05).expect("release should succeed");
        assert_eq!(context.pending_release(gain), Some(0.05));
        assert_eq!(context.live_node_count(), 1);

        context.render(4);
        assert!(context.is_alive(gain));
        context.render(2);
        assert!(!context.is_alive(gain));
        assert_eq!(context.live_node_count(), 0);
        assert!(context.inputs(destination).is_empty());
        assert_eq!(
            context.set_param_at(gain, GAIN_PARAM, 0.0, 0.0),
            Err(GraphError::UnknownNode(gain))
        );
    }

    #[test]
    fn analyser_tracks_peak_level() {
        let mut context = OfflineContext::new(RATE, 1);
        let source = context.create_buffer_source(dc(-0.75, 100), NodeLabel::new(NodeRole::ClipSource));
        let analyser = context.create_analyser(NodeLabel::new(NodeRole::Analyser));
        let destination = context.destination();
        context.connect(source, analyser).expect("connect should succeed");
        context.connect(analyser, destination).expect("connect should succeed");
        context
            .start_source(source, 0.0, 0.0, 0.1)
            .expect("start should succeed");
        context.render(20);
        assert_eq!(context.peak_level(analyser), Some(0.75));
        assert_eq!(context.peak_level(source), None);
    }

    #[test]
    fn gain_nodes_reject_unknown_params() {
        let mut context = OfflineContext::new(RATE, 1);
        let gain = context.create_gain(NodeLabel::new(NodeRole::TrackGain));
        assert!(matches!(
            context.set_param_at(gain, "frequency", 1.0, 0.0),
            Err(GraphError::UnknownParam { .. })
        ));
    }
}
