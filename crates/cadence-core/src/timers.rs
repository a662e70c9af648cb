use std::{cell::Cell, rc::Rc};

use tracing::trace;

/// Source of wall-clock seconds for timer deadlines.
pub trait WallClock {
    fn now(&self) -> f64;
}

/// Clock advanced by hand; clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<f64>>);

impl ManualClock {
    #[must_use]
    pub fn new(start: f64) -> Self {
        Self(Rc::new(Cell::new(start)))
    }

    pub fn set(&self, seconds: f64) {
        self.0.set(seconds);
    }

    pub fn advance(&self, seconds: f64) {
        self.0.set(self.0.get() + seconds);
    }
}

impl WallClock for ManualClock {
    fn now(&self) -> f64 {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    /// Promotes the upcoming graph once its window begins.
    PlayStart,
    /// Ends playback once the window has elapsed.
    PlayEnd,
}

#[derive(Debug, Clone, PartialEq)]
struct Timer<A> {
    deadline: f64,
    action: A,
}

/// One pending timer per purpose. Arming a purpose cancels whatever it held.
#[derive(Debug)]
pub struct TimerSlots<A> {
    play_start: Option<Timer<A>>,
    play_end: Option<Timer<A>>,
}

impl<A> Default for TimerSlots<A> {
    fn default() -> Self {
        Self {
            play_start: None,
            play_end: None,
        }
    }
}

impl<A> TimerSlots<A> {
    fn slot(&mut self, purpose: TimerPurpose) -> &mut Option<Timer<A>> {
        match purpose {
            TimerPurpose::PlayStart => &mut self.play_start,
            TimerPurpose::PlayEnd => &mut self.play_end,
        }
    }

    pub fn arm(&mut self, purpose: TimerPurpose, deadline: f64, action: A) {
        let replaced = self.slot(purpose).replace(Timer { deadline, action });
        trace!(?purpose, deadline, replaced = replaced.is_some(), "timer armed");
    }

    pub fn cancel(&mut self, purpose: TimerPurpose) -> Option<A> {
        self.slot(purpose).take().map(|timer| timer.action)
    }

    pub fn cancel_all(&mut self) {
        self.play_start = None;
        self.play_end = None;
    }

    #[must_use]
    pub fn is_armed(&self, purpose: TimerPurpose) -> bool {
        match purpose {
            TimerPurpose::PlayStart => self.play_start.is_some(),
            TimerPurpose::PlayEnd => self.play_end.is_some(),
        }
    }

    #[must_use]
    pub fn armed_count(&self) -> usize {
        usize::from(self.play_start.is_some()) + usize::from(self.play_end.is_some())
    }

    #[must_use]
    pub fn action(&self, purpose: TimerPurpose) -> Option<&A> {
        match purpose {
            TimerPurpose::PlayStart => self.play_start.as_ref(),
            TimerPurpose::PlayEnd => self.play_end.as_ref(),
        }
        .map(|timer| &timer.action)
    }

    /// Earliest deadline and its purpose. `PlayStart` wins ties.
    #[must_use]
    pub fn next(&self) -> Option<(TimerPurpose, f64)> {
        let start = self
            .play_start
            .as_ref()
            .map(|timer| (TimerPurpose::PlayStart, timer.deadline));
        let end = self
            .play_end
            .as_ref()
            .map(|timer| (TimerPurpose::PlayEnd, timer.deadline));
        match (start, end) {
            (Some(start), Some(end)) if end.1 < start.1 => Some(end),
            (Some(start), _) => Some(start),
            (None, end) => end,
        }
    }

    /// Disarms and returns the earliest timer.
    pub fn take_next(&mut self) -> Option<(TimerPurpose, A)> {
        let (purpose, _) = self.next()?;
        self.cancel(purpose).map(|action| (purpose, action))
    }
}
