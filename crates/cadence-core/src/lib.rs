pub mod assets;
pub mod clip;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod effects;
pub mod fixtures;
pub mod graph;
pub mod lifecycle;
pub mod model;
pub mod offline;
pub mod persistence;
pub mod tempo;
pub mod timers;
pub mod track;
pub mod transport;

pub use clip::{ClipPlan, PlaybackWindow, ScheduledClip, plan_clip, schedule_clip};
pub use config::PlayerConfig;
pub use diagnostics::{TelemetryGuard, init_tracing};
pub use driver::{OfflineScheduler, OfflineSession};
pub use effects::{
    AutomationChainBuilder, ChainRequest, EffectChain, EffectChainBuilder, EffectError, EffectKind,
};
pub use graph::{AudioContext, GraphError, NodeId, NodeLabel, NodeRole};
pub use lifecycle::{GraphId, GraphSlots, SignalGraph, clear_graph};
pub use model::{
    AudioBuffer, BypassedEffects, Clip, EffectRange, MIX_TRACK, MutedTracks, Project, Track,
};
pub use offline::OfflineContext;
pub use persistence::{LoadedProject, ProjectDocument};
pub use tempo::{TempoMap, Timeline};
pub use timers::{ManualClock, TimerPurpose, WallClock};
pub use track::{TrackGraph, build_track};
pub use transport::{
    LoopConfig, PlaybackState, SchedulerOptions, TransportError, TransportEvent, TransportScheduler,
};
