use std::sync::mpsc::Receiver;

use tracing::{debug, instrument};

use crate::{
    config::PlayerConfig,
    effects::{AutomationChainBuilder, EffectChainBuilder},
    graph::AudioContext,
    offline::OfflineContext,
    timers::{ManualClock, WallClock},
    transport::{SchedulerOptions, TransportError, TransportEvent, TransportScheduler},
};

pub type OfflineScheduler<E = AutomationChainBuilder> =
    TransportScheduler<OfflineContext, ManualClock, E>;

/// Runs a scheduler against the offline renderer, with wall time following render time.
///
/// Timers fire between blocks, `timer_jitter` seconds after their deadline, which models a
/// control thread that wakes up late.
pub struct OfflineSession<E = AutomationChainBuilder> {
    scheduler: OfflineScheduler<E>,
    clock: ManualClock,
    events: Receiver<TransportEvent>,
    log: Vec<(f64, TransportEvent)>,
    block_frames: usize,
    timer_jitter: f64,
}

impl OfflineSession<AutomationChainBuilder> {
    pub fn new(sample_rate: u32, channels: usize) -> Result<Self, TransportError> {
        Self::with_builder(
            sample_rate,
            channels,
            AutomationChainBuilder,
            SchedulerOptions::default(),
        )
    }

    pub fn from_config(config: &PlayerConfig) -> Result<Self, TransportError> {
        let session = Self::with_builder(
            config.audio.sample_rate,
            usize::from(config.audio.channels),
            AutomationChainBuilder,
            SchedulerOptions::from(config),
        )?;
        Ok(session
            .with_block_frames(config.simulation.block_frames)
            .with_timer_jitter(config.simulation.timer_jitter_seconds))
    }
}

impl<E: EffectChainBuilder> OfflineSession<E> {
    pub fn with_builder(
        sample_rate: u32,
        channels: usize,
        effects: E,
        options: SchedulerOptions,
    ) -> Result<Self, TransportError> {
        let clock = ManualClock::default();
        let context = OfflineContext::new(sample_rate, channels);
        let mut scheduler = TransportScheduler::new(context, clock.clone(), effects, options)?;
        let events = scheduler.events();
        Ok(Self {
            scheduler,
            clock,
            events,
            log: Vec::new(),
            block_frames: 256,
            timer_jitter: 0.0,
        })
    }

    #[must_use]
    pub fn with_block_frames(mut self, frames: usize) -> Self {
        self.block_frames = frames.max(1);
        self
    }

    #[must_use]
    pub fn with_timer_jitter(mut self, seconds: f64) -> Self {
        self.timer_jitter = seconds.max(0.0);
        self
    }

    #[must_use]
    pub fn scheduler(&self) -> &OfflineScheduler<E> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut OfflineScheduler<E> {
        &mut self.scheduler
    }

    #[must_use]
    pub fn context(&self) -> &OfflineContext {
        self.scheduler.context()
    }

    #[must_use]
    pub fn render_time(&self) -> f64 {
        self.scheduler.context().current_time()
    }

    /// Events received so far, stamped with the render time at which they were observed.
    #[must_use]
    pub fn events(&self) -> &[(f64, TransportEvent)] {
        &self.log
    }

    #[must_use]
    pub fn finished_count(&self) -> usize {
        self.log
            .iter()
            .filter(|(_, event)| matches!(event, TransportEvent::Finished))
            .count()
    }

    #[must_use]
    pub fn started_count(&self) -> usize {
        self.log
            .iter()
            .filter(|(_, event)| matches!(event, TransportEvent::Started { .. }))
            .count()
    }

    /// Renders `seconds` of audio, firing timers between blocks. Returns interleaved samples.
    #[instrument(skip(self))]
    pub fn run_for(&mut self, seconds: f64) -> Result<Vec<f32>, TransportError> {
        let sample_rate = f64::from(self.scheduler.context().sample_rate());
        let mut remaining = (seconds.max(0.0) * sample_rate).round() as usize;
        let mut output = Vec::with_capacity(remaining * self.scheduler.context().channels());

        while remaining > 0 {
            self.fire_due_timers()?;
            let frames = remaining.min(self.block_frames);
            output.extend(self.scheduler.context_mut().render(frames));
            remaining -= frames;
            self.clock.set(self.render_time());
        }
        self.fire_due_timers()?;
        debug!(frames = output.len(), time = self.render_time(), "offline run complete");
        Ok(output)
    }

    /// Fires timers that are due at the current wall time, honouring the jitter.
    pub fn fire_due_timers(&mut self) -> Result<usize, TransportError> {
        let mut fired = 0;
        while let Some(deadline) = self.scheduler.next_deadline() {
            if self.clock.now() + 1e-12 < deadline + self.timer_jitter {
                break;
            }
            self.scheduler.fire_next()?;
            fired += 1;
            self.collect_events();
        }
        Ok(fired)
    }

    fn collect_events(&mut self) {
        let now = self.render_time();
        self.log
            .extend(self.events.try_iter().map(|event| (now, event)));
    }
}
