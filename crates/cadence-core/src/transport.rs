//! Transport state machine: owns playback state, the two graph slots and the wall timers.

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        mpsc::{self, Receiver, Sender},
    },
};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    clip::PlaybackWindow,
    config::PlayerConfig,
    effects::{AutomationChainBuilder, EffectChainBuilder, EffectError},
    graph::{AudioContext, GAIN_PARAM, GraphError, NodeId, NodeLabel, NodeRole, db_to_gain},
    lifecycle::{GraphId, GraphSlots, SignalGraph, clear_graph},
    model::{BypassedEffects, MutedTracks, Project},
    tempo::{TempoMap, Timeline, time_till_next_bar},
    timers::{TimerPurpose, TimerSlots, WallClock},
    track::{TrackRequest, TrackTargets, build_track},
};

const MEASURE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopConfig {
    pub on: bool,
    /// Loop `start..end` instead of the whole project.
    pub selection: bool,
    pub start: f64,
    pub end: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            on: false,
            selection: false,
            start: 1.0,
            end: 1.0,
        }
    }
}

impl LoopConfig {
    #[must_use]
    pub fn off() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn whole_project() -> Self {
        Self {
            on: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn selection(start: f64, end: f64) -> Self {
        Self {
            on: true,
            selection: true,
            start,
            end,
        }
    }

    #[must_use]
    pub fn is_selection(&self) -> bool {
        self.on && self.selection
    }

    fn restart_measure(&self) -> f64 {
        if self.is_selection() { self.start } else { 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportEvent {
    Started { start_measure: f64, end_measure: f64 },
    Finished,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot change position while a loop selection is active")]
    LoopSelectionSeek,
    #[error("invalid loop range {start}..{end}")]
    InvalidLoopRange { start: f64, end: f64 },
    #[error(transparent)]
    Effect(#[from] EffectError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackState {
    pub playing: bool,
    pub start_measure: f64,
    pub end_measure: f64,
    /// Position reported while stopped.
    pub playhead: f64,
    /// Render-clock instant at which `start_measure` was heard.
    pub anchor: f64,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            playing: false,
            start_measure: 1.0,
            end_measure: 1.0,
            playhead: 1.0,
            anchor: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerOptions {
    pub teardown_margin_seconds: f64,
    pub volume_db: f64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&PlayerConfig::default())
    }
}

impl From<&PlayerConfig> for SchedulerOptions {
    fn from(config: &PlayerConfig) -> Self {
        Self {
            teardown_margin_seconds: config.scheduling.teardown_margin_seconds,
            volume_db: config.audio.default_volume_db,
        }
    }
}

#[derive(Debug)]
struct RenderingData {
    project: Arc<Project>,
    timeline: TempoMap,
    muted: MutedTracks,
    bypassed: BypassedEffects,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Promotion {
    graph: GraphId,
    start_measure: f64,
    end_measure: f64,
    anchor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TimerAction {
    Promote(Promotion),
    Finish,
}

/// What a loop change does to the running window.
enum Reschedule {
    Play {
        start: f64,
        end: Option<f64>,
        delay: f64,
    },
    FinishIn(f64),
}

pub struct TransportScheduler<C, W, E = AutomationChainBuilder> {
    context: C,
    clock: W,
    effects: E,
    options: SchedulerOptions,
    master: NodeId,
    volume_db: f64,
    data: Option<RenderingData>,
    state: PlaybackState,
    loop_config: LoopConfig,
    graphs: GraphSlots,
    timers: TimerSlots<TimerAction>,
    next_graph: u64,
    events: Sender<TransportEvent>,
}

impl<C: AudioContext, W: WallClock, E: EffectChainBuilder> TransportScheduler<C, W, E> {
    /// Creates the master bus on `context` and connects it to the destination.
    pub fn new(
        mut context: C,
        clock: W,
        effects: E,
        options: SchedulerOptions,
    ) -> Result<Self, TransportError> {
        let master = context.create_gain(NodeLabel::new(NodeRole::Master));
        let destination = context.destination();
        context.connect(master, destination)?;
        let now = context.current_time();
        context.set_param_at(master, GAIN_PARAM, db_to_gain(options.volume_db), now)?;
        let (events, _) = mpsc::channel();

        Ok(Self {
            context,
            clock,
            effects,
            options,
            master,
            volume_db: options.volume_db,
            data: None,
            state: PlaybackState::default(),
            loop_config: LoopConfig::default(),
            graphs: GraphSlots::new(options.teardown_margin_seconds),
            timers: TimerSlots::default(),
            next_graph: 1,
            events,
        })
    }

    /// Subscribes to transport events. A new subscription replaces the previous one.
    pub fn events(&mut self) -> Receiver<TransportEvent> {
        let (sender, receiver) = mpsc::channel();
        self.events = sender;
        receiver
    }

    #[must_use]
    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    #[must_use]
    pub fn clock(&self) -> &W {
        &self.clock
    }

    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.state.playing
    }

    /// A window has been scheduled and its promotion has not fired yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.timers.is_armed(TimerPurpose::PlayStart)
    }

    #[must_use]
    pub fn loop_config(&self) -> LoopConfig {
        self.loop_config
    }

    #[must_use]
    pub fn live_graph(&self) -> Option<&SignalGraph> {
        self.graphs.live()
    }

    #[must_use]
    pub fn upcoming_graph(&self) -> Option<&SignalGraph> {
        self.graphs.upcoming()
    }

    #[must_use]
    pub fn project(&self) -> Option<&Arc<Project>> {
        self.data.as_ref().map(|data| &data.project)
    }

    #[must_use]
    pub fn timeline(&self) -> Option<&TempoMap> {
        self.data.as_ref().map(|data| &data.timeline)
    }

    #[must_use]
    pub fn master(&self) -> NodeId {
        self.master
    }

    #[must_use]
    pub fn volume_db(&self) -> f64 {
        self.volume_db
    }

    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.timers.armed_count()
    }

    /// Peak level seen by a track's analysis tap in the live graph.
    #[must_use]
    pub fn track_meter(&self, track: usize) -> Option<f32> {
        let analyser = self.graphs.live()?.track(track)?.analyser;
        self.context.peak_level(analyser)
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<f64> {
        self.timers.next().map(|(_, deadline)| deadline)
    }

    /// Fires every timer whose deadline has passed on the wall clock.
    pub fn fire_due(&mut self) -> Result<usize, TransportError> {
        let mut fired = 0;
        while self
            .next_deadline()
            .is_some_and(|deadline| deadline <= self.clock.now())
        {
            self.fire_next()?;
            fired += 1;
        }
        Ok(fired)
    }

    /// Fires the earliest pending timer regardless of its deadline.
    pub fn fire_next(&mut self) -> Result<Option<TimerPurpose>, TransportError> {
        let Some((purpose, action)) = self.timers.take_next() else {
            return Ok(None);
        };
        match action {
            TimerAction::Promote(promotion) => self.promote(promotion)?,
            TimerAction::Finish => self.finish(),
        }
        Ok(Some(purpose))
    }

    /// Schedules playback of `start_measure..end_measure` beginning `delay` seconds from now.
    ///
    /// The graph is built immediately and gated until its anchor; a wall timer promotes
    /// it to live and a second one ends the window.
    #[instrument(skip(self))]
    pub fn play(
        &mut self,
        start_measure: f64,
        end_measure: Option<f64>,
        delay: f64,
    ) -> Result<(), TransportError> {
        let Some(data) = &self.data else {
            debug!("play ignored: no project loaded");
            return Ok(());
        };

        let project_end = data.project.end_measure();
        let (min_start, end) = if self.loop_config.is_selection() {
            (self.loop_config.start, self.loop_config.end)
        } else if self.loop_config.on {
            (1.0, project_end)
        } else {
            (1.0, end_measure.unwrap_or(project_end))
        };
        let start = if start_measure < min_start || start_measure >= end {
            min_start
        } else {
            start_measure
        };

        let delay = delay.max(0.0);
        let window = PlaybackWindow {
            start_time: data.timeline.measure_to_time(start),
            end_time: data.timeline.measure_to_time(end),
            anchor: self.context.current_time() + delay,
        };
        let id = GraphId(self.next_graph);
        self.next_graph += 1;

        let graph = assemble_graph(
            &mut self.context,
            &self.effects,
            data,
            self.master,
            id,
            &window,
            self.options.teardown_margin_seconds,
        )?;
        self.graphs.install_upcoming(&mut self.context, graph);

        let now = self.clock.now();
        self.timers.arm(
            TimerPurpose::PlayStart,
            now + delay,
            TimerAction::Promote(Promotion {
                graph: id,
                start_measure: start,
                end_measure: end,
                anchor: window.anchor,
            }),
        );
        self.timers.arm(
            TimerPurpose::PlayEnd,
            now + delay + window.duration(),
            TimerAction::Finish,
        );
        debug!(graph = %id, start, end, anchor = window.anchor, "playback window scheduled");
        Ok(())
    }

    /// Stops everything now: both graphs are cleared and all timers cancelled.
    #[instrument(skip(self))]
    pub fn pause(&mut self) {
        if self.state.playing {
            self.state.playhead = self.position();
        }
        self.graphs.clear_all(&mut self.context, 0.0);
        self.timers.cancel_all();
        self.state.playing = false;
        debug!(playhead = self.state.playhead, "transport paused");
    }

    /// Pauses and forgets the window and playhead.
    pub fn reset(&mut self) {
        self.pause();
        self.state = PlaybackState::default();
    }

    /// Current playhead in measures.
    #[must_use]
    pub fn position(&self) -> f64 {
        match &self.data {
            Some(data) if self.state.playing => {
                let timeline = &data.timeline;
                let elapsed = (self.context.current_time() - self.state.anchor).max(0.0);
                timeline.time_to_measure(timeline.measure_to_time(self.state.start_measure) + elapsed)
            }
            _ => self.state.playhead,
        }
    }

    /// Moves the playhead. While playing, the jump happens at the next bar.
    #[instrument(skip(self))]
    pub fn set_position(&mut self, measure: f64) -> Result<(), TransportError> {
        let Some(data) = &self.data else {
            debug!("set_position ignored: no project loaded");
            return Ok(());
        };

        if !self.state.playing {
            self.cancel_pending();
            self.state.playhead = measure;
            return Ok(());
        }
        if self.loop_config.is_selection() {
            warn!("position change rejected while a loop selection is active");
            return Err(TransportError::LoopSelectionSeek);
        }

        let end = if self.loop_config.on {
            data.project.end_measure()
        } else {
            self.state.end_measure
        };
        let current = self.position();
        let till_bar = time_till_next_bar(&data.timeline, current);

        self.play(measure, Some(end), till_bar)?;
        self.graphs.clear_live(&mut self.context, till_bar);
        Ok(())
    }

    /// Replaces the loop configuration, rescheduling the running window if playing.
    #[instrument(skip(self))]
    pub fn set_loop(&mut self, config: LoopConfig) -> Result<(), TransportError> {
        if config.is_selection() && config.start >= config.end {
            warn!(start = config.start, end = config.end, "invalid loop range");
            return Err(TransportError::InvalidLoopRange {
                start: config.start,
                end: config.end,
            });
        }
        let was_on = self.loop_config.on;
        self.loop_config = config;
        if !self.state.playing || (!was_on && !config.on) {
            return Ok(());
        }
        let Some(data) = &self.data else {
            return Ok(());
        };
        let project_end = data.project.end_measure();

        if let Some(queued) = self.queued_replacement() {
            let delay = queued.anchor - self.context.current_time();
            let end = (!config.on).then_some(project_end);
            debug!(start = queued.start_measure, delay, "loop change replans the queued window");
            return self.play(queued.start_measure, end, delay);
        }

        let timeline = &data.timeline;
        let window_end = self.state.end_measure;
        let current = self.position();
        let current_time = timeline.measure_to_time(current);
        let till_bar = time_till_next_bar(timeline, current);
        let next_bar = (current + 1.0).floor();

        let plan = if config.is_selection() {
            if current >= config.start && current < config.end {
                if current < config.end - 1.0 {
                    Reschedule::Play {
                        start: next_bar,
                        end: None,
                        delay: till_bar,
                    }
                } else {
                    Reschedule::Play {
                        start: config.start,
                        end: None,
                        delay: timeline.measure_to_time(config.end) - current_time,
                    }
                }
            } else {
                Reschedule::Play {
                    start: config.start,
                    end: None,
                    delay: till_bar,
                }
            }
        } else if config.on {
            if window_end < project_end - MEASURE_EPSILON {
                Reschedule::Play {
                    start: window_end,
                    end: None,
                    delay: timeline.measure_to_time(window_end) - current_time,
                }
            } else {
                Reschedule::Play {
                    start: 1.0,
                    end: None,
                    delay: timeline.measure_to_time(project_end) - current_time,
                }
            }
        } else if window_end < project_end - MEASURE_EPSILON {
            Reschedule::Play {
                start: window_end,
                end: Some(project_end),
                delay: timeline.measure_to_time(window_end) - current_time,
            }
        } else {
            Reschedule::FinishIn(timeline.measure_to_time(window_end) - current_time)
        };

        match plan {
            Reschedule::Play { start, end, delay } => {
                debug!(start, delay, "loop change rescheduled playback");
                self.play(start, end, delay)
            }
            Reschedule::FinishIn(delay) => {
                self.cancel_pending();
                let deadline = self.clock.now() + delay.max(0.0);
                self.timers
                    .arm(TimerPurpose::PlayEnd, deadline, TimerAction::Finish);
                debug!(delay, "looping off; window finishes naturally");
                Ok(())
            }
        }
    }

    /// Installs a new project snapshot. While playing, the new data is heard from the
    /// next bar on; while stopped only the data changes.
    #[instrument(skip_all, fields(tracks = project.tracks.len(), muted = muted.len()))]
    pub fn set_rendering_data(
        &mut self,
        project: Arc<Project>,
        muted: MutedTracks,
        bypassed: BypassedEffects,
    ) -> Result<(), TransportError> {
        let boundary = match &self.data {
            Some(data) if self.state.playing => {
                let current = self.position();
                let timeline = &data.timeline;
                Some(Boundary {
                    current,
                    till_bar: time_till_next_bar(timeline, current),
                    till_window_end: timeline.measure_to_time(self.state.end_measure)
                        - timeline.measure_to_time(current),
                })
            }
            _ => None,
        };

        let timeline = TempoMap::from_project(&project);
        self.data = Some(RenderingData {
            project,
            timeline,
            muted,
            bypassed,
        });

        match boundary {
            Some(boundary) => self.refresh(boundary),
            None => Ok(()),
        }
    }

    pub fn set_muted_tracks(&mut self, muted: MutedTracks) -> Result<(), TransportError> {
        let Some(data) = &self.data else {
            debug!("set_muted_tracks ignored: no project loaded");
            return Ok(());
        };
        let project = Arc::clone(&data.project);
        let bypassed = data.bypassed.clone();
        self.set_rendering_data(project, muted, bypassed)
    }

    pub fn set_bypassed_effects(&mut self, bypassed: BypassedEffects) -> Result<(), TransportError> {
        let Some(data) = &self.data else {
            debug!("set_bypassed_effects ignored: no project loaded");
            return Ok(());
        };
        let project = Arc::clone(&data.project);
        let muted = data.muted.clone();
        self.set_rendering_data(project, muted, bypassed)
    }

    /// Sets the master level in decibels, effective immediately.
    #[instrument(skip(self))]
    pub fn set_volume(&mut self, db: f64) -> Result<(), TransportError> {
        let now = self.context.current_time();
        self.context
            .set_param_at(self.master, GAIN_PARAM, db_to_gain(db), now)?;
        self.volume_db = db;
        Ok(())
    }

    fn promote(&mut self, promotion: Promotion) -> Result<(), TransportError> {
        if !self.graphs.promote(&mut self.context, promotion.graph) {
            return Ok(());
        }
        self.state.playing = true;
        self.state.start_measure = promotion.start_measure;
        self.state.end_measure = promotion.end_measure;
        self.state.anchor = promotion.anchor;
        info!(
            start = promotion.start_measure,
            end = promotion.end_measure,
            "playback started"
        );
        self.emit(TransportEvent::Started {
            start_measure: promotion.start_measure,
            end_measure: promotion.end_measure,
        });

        if !self.loop_config.on {
            return Ok(());
        }
        let Some(data) = &self.data else {
            return Ok(());
        };
        let duration = data.timeline.measure_to_time(promotion.end_measure)
            - data.timeline.measure_to_time(promotion.start_measure);
        if duration <= 0.0 {
            warn!("empty loop window; not continuing");
            return Ok(());
        }
        let elapsed = self.context.current_time() - promotion.anchor;
        let restart = self.loop_config.restart_measure();
        debug!(restart, delay = duration - elapsed, "scheduling loop continuation");
        self.play(restart, None, duration - elapsed)
    }

    fn finish(&mut self) {
        info!(end = self.state.end_measure, "playback finished");
        self.reset();
        self.emit(TransportEvent::Finished);
    }

    fn refresh(&mut self, boundary: Boundary) -> Result<(), TransportError> {
        let Some(data) = &self.data else {
            return Ok(());
        };
        let project_end = data.project.end_measure();
        if let Some(queued) = self.queued_replacement() {
            let delay = queued.anchor - self.context.current_time();
            debug!(start = queued.start_measure, delay, "rebuilding the queued window");
            return self.play(queued.start_measure, Some(queued.end_measure.min(project_end)), delay);
        }

        let next_bar = (boundary.current + 1.0).floor();
        let window_end = self.state.end_measure;
        let (start, delay) = if next_bar < window_end - MEASURE_EPSILON {
            (next_bar, boundary.till_bar)
        } else if self.loop_config.on {
            (self.loop_config.restart_measure(), boundary.till_window_end)
        } else {
            debug!("window ends before the next bar; live graph plays out");
            return Ok(());
        };
        let end = window_end.min(project_end);

        debug!(start, delay, "refreshing graph at the next boundary");
        self.play(start, Some(end), delay)?;
        self.graphs.clear_live(&mut self.context, delay);
        Ok(())
    }

    /// The window a seek or refresh has queued to replace the live graph. The live graph
    /// is already torn down at its anchor, so plans must start from this window instead.
    fn queued_replacement(&self) -> Option<Promotion> {
        if self.graphs.live()?.teardown_at().is_none() {
            return None;
        }
        match self.timers.action(TimerPurpose::PlayStart)? {
            TimerAction::Promote(promotion) => Some(*promotion),
            TimerAction::Finish => None,
        }
    }

    /// Cancels both timers and drops the graph they would have promoted.
    fn cancel_pending(&mut self) {
        self.timers.cancel_all();
        self.graphs.clear_upcoming(&mut self.context, 0.0);
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!(?event, "no event subscriber");
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Boundary {
    current: f64,
    till_bar: f64,
    till_window_end: f64,
}

/// Builds one graph for `window`: a gated mix bus plus a track graph per unmuted track.
/// A failure tears the partial graph down and leaves nothing behind.
fn assemble_graph(
    context: &mut dyn AudioContext,
    effects: &dyn EffectChainBuilder,
    data: &RenderingData,
    master: NodeId,
    id: GraphId,
    window: &PlaybackWindow,
    margin: f64,
) -> Result<SignalGraph, TransportError> {
    let mix = context.create_gain(NodeLabel::new(NodeRole::MixBus));
    let mut graph = SignalGraph::new(id, mix, window.anchor);
    if let Err(error) = populate_graph(context, effects, data, master, &mut graph, window) {
        warn!(graph = %id, %error, "graph build failed");
        clear_graph(context, &mut graph, 0.0, margin);
        return Err(error);
    }
    debug!(graph = %id, tracks = graph.tracks().len(), sources = graph.source_count(), "graph built");
    Ok(graph)
}

fn populate_graph(
    context: &mut dyn AudioContext,
    effects: &dyn EffectChainBuilder,
    data: &RenderingData,
    master: NodeId,
    graph: &mut SignalGraph,
    window: &PlaybackWindow,
) -> Result<(), TransportError> {
    let now = context.current_time();
    context.set_param_at(graph.mix(), GAIN_PARAM, 0.0, now)?;
    context.set_param_at(graph.mix(), GAIN_PARAM, 1.0, window.anchor)?;

    let targets = TrackTargets {
        mix_bus: graph.mix(),
        master,
    };
    let unbypassed = BTreeSet::new();
    for (index, track) in data.project.tracks.iter().enumerate() {
        if data.muted.contains(&index) {
            debug!(track = index, "muted track skipped");
            continue;
        }
        let track_graph = build_track(
            context,
            effects,
            &TrackRequest {
                index,
                track,
                bypassed: data.bypassed.get(&index).unwrap_or(&unbypassed),
                timeline: &data.timeline,
                window: *window,
                targets,
            },
        )?;
        graph.push_track(track_graph);
    }
    Ok(())
}
