//! The node-graph seam between the scheduler and whatever renders audio.

use std::fmt;

use thiserror::Error;

use crate::{effects::EffectKind, model::AudioBuffer};

/// Name of the single parameter every gain node exposes.
pub const GAIN_PARAM: &str = "gain";

/// Opaque handle to a node owned by an [`AudioContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Destination,
    Master,
    MixBus,
    TrackGain,
    ClipSource,
    ClipGain,
    Effect,
    Analyser,
}

/// Describes what a node is for. Used for logging and for inspecting rendered graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeLabel {
    pub role: NodeRole,
    pub track: Option<usize>,
}

impl NodeLabel {
    #[must_use]
    pub const fn new(role: NodeRole) -> Self {
        Self { role, track: None }
    }

    #[must_use]
    pub const fn for_track(role: NodeRole, track: usize) -> Self {
        Self {
            role,
            track: Some(track),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("{0} is not a buffer source")]
    NotASource(NodeId),
    #[error("{0} was already started")]
    AlreadyStarted(NodeId),
    #[error("{node} has no parameter '{param}'")]
    UnknownParam { node: NodeId, param: String },
    #[error("invalid schedule for {node}: {reason}")]
    InvalidSchedule { node: NodeId, reason: &'static str },
}

/// Minimal audio node graph: gain, buffer source, effect and analyser nodes with
/// sample-accurate start/stop and parameter automation on the context's render clock.
///
/// All `when` arguments are render-clock seconds (see [`AudioContext::current_time`]).
pub trait AudioContext {
    /// Render-clock position in seconds.
    fn current_time(&self) -> f64;
    fn sample_rate(&self) -> u32;
    /// The final output node.
    fn destination(&self) -> NodeId;

    fn create_gain(&mut self, label: NodeLabel) -> NodeId;
    fn create_buffer_source(&mut self, buffer: AudioBuffer, label: NodeLabel) -> NodeId;
    fn create_effect(&mut self, kind: EffectKind, label: NodeLabel) -> NodeId;
    fn create_analyser(&mut self, label: NodeLabel) -> NodeId;

    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError>;

    /// Plays `duration` seconds of the buffer starting `offset` seconds in, beginning at `when`.
    fn start_source(
        &mut self,
        source: NodeId,
        when: f64,
        offset: f64,
        duration: f64,
    ) -> Result<(), GraphError>;

    /// Silences a source from `when`. The earliest stop wins.
    fn stop_source(&mut self, source: NodeId, when: f64) -> Result<(), GraphError>;

    fn set_param_at(
        &mut self,
        node: NodeId,
        param: &str,
        value: f64,
        when: f64,
    ) -> Result<(), GraphError>;

    /// Linear ramp from the previous scheduled value to `value`, arriving at `when`.
    fn ramp_param_to(
        &mut self,
        node: NodeId,
        param: &str,
        value: f64,
        when: f64,
    ) -> Result<(), GraphError>;

    /// Disconnects and drops the node once the render clock reaches `when`.
    fn release_at(&mut self, node: NodeId, when: f64) -> Result<(), GraphError>;

    /// Peak absolute level an analyser has observed, if the node is a live analyser.
    fn peak_level(&self, analyser: NodeId) -> Option<f32>;
}

/// Converts decibels to linear amplitude.
#[must_use]
pub fn db_to_gain(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}
