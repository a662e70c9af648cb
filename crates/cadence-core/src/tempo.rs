use tracing::debug;

use crate::model::{DEFAULT_TEMPO_BPM, MIX_TRACK, Project};

pub const TEMPO_EFFECT: &str = "TEMPO";
pub const TEMPO_AUTOMATION_KEY: &str = "TEMPO-TEMPO";

const EPSILON: f64 = 1e-9;

/// Conversion between musical position (measures, 1-based) and timeline seconds.
pub trait Timeline {
    fn measure_to_time(&self, measure: f64) -> f64;
    fn time_to_measure(&self, seconds: f64) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TempoPoint {
    measure: f64,
    tempo: f64,
}

const ORIGIN: TempoPoint = TempoPoint {
    measure: 1.0,
    tempo: DEFAULT_TEMPO_BPM,
};

/// Piecewise tempo curve. Between two points the tempo ramps linearly in measures;
/// two points on the same measure form a step. Past the last point the tempo holds.
#[derive(Debug, Clone, PartialEq)]
pub struct TempoMap {
    points: Vec<TempoPoint>,
    beats_per_measure: f64,
}

impl TempoMap {
    #[must_use]
    pub fn constant(bpm: f64, beats_per_measure: u32) -> Self {
        Self {
            points: vec![TempoPoint {
                measure: 1.0,
                tempo: bpm,
            }],
            beats_per_measure: f64::from(beats_per_measure.max(1)),
        }
    }

    /// Reads `TEMPO-TEMPO` automation from the mix track. Without any, the tempo is 120 BPM.
    ///
    /// A range ramps between its start and end; between ranges the previous tempo holds
    /// until the next range starts.
    #[must_use]
    pub fn from_project(project: &Project) -> Self {
        let mut ranges: Vec<_> = project
            .tracks
            .get(MIX_TRACK)
            .map(|mix| mix.automation(TEMPO_AUTOMATION_KEY).collect())
            .unwrap_or_default();
        ranges.sort_by(|a, b| a.start_measure.total_cmp(&b.start_measure));

        let mut points: Vec<TempoPoint> = Vec::new();
        for range in ranges {
            if range.start_value <= 0.0 {
                debug!(measure = range.start_measure, "ignoring non-positive tempo");
                continue;
            }
            if let Some(last) = points.last().copied() {
                if last.measure < range.start_measure
                    && (last.tempo - range.start_value).abs() > EPSILON
                {
                    points.push(TempoPoint {
                        measure: range.start_measure,
                        tempo: last.tempo,
                    });
                }
            }
            points.push(TempoPoint {
                measure: range.start_measure,
                tempo: range.start_value,
            });
            let end_tempo = range.final_value();
            if range.has_end() && range.end_measure > range.start_measure && end_tempo > 0.0 {
                points.push(TempoPoint {
                    measure: range.end_measure,
                    tempo: end_tempo,
                });
            }
        }

        Self {
            points,
            beats_per_measure: f64::from(project.beats_per_measure.max(1)),
        }
    }

    #[must_use]
    pub fn beats_per_measure(&self) -> f64 {
        self.beats_per_measure
    }

    #[must_use]
    pub fn is_constant(&self) -> bool {
        let first = self.points.first().copied().unwrap_or(ORIGIN);
        self.points
            .iter()
            .all(|point| (point.tempo - first.tempo).abs() < EPSILON)
    }

    /// Instantaneous tempo in BPM at `measure`.
    #[must_use]
    pub fn tempo_at_measure(&self, measure: f64) -> f64 {
        let mut previous = ORIGIN;
        for &point in &self.points {
            if measure < point.measure {
                if (point.measure - previous.measure).abs() < EPSILON {
                    return previous.tempo;
                }
                let slope = (point.tempo - previous.tempo) / (point.measure - previous.measure);
                return previous.tempo + slope * (measure - previous.measure);
            }
            previous = point;
        }
        previous.tempo
    }

    #[must_use]
    pub fn tempo_at_time(&self, seconds: f64) -> f64 {
        self.tempo_at_measure(self.time_to_measure(seconds))
    }

    fn seconds_per_measure(&self, tempo: f64) -> f64 {
        60.0 * self.beats_per_measure / tempo
    }

    /// Seconds from `start` to `measure` on the segment `start..end`.
    fn segment_seconds(&self, start: TempoPoint, end: TempoPoint, measure: f64) -> f64 {
        if (start.measure - end.measure).abs() < EPSILON {
            return (measure - end.measure) * self.seconds_per_measure(end.tempo);
        }
        if (start.tempo - end.tempo).abs() < EPSILON {
            return (measure - start.measure) * self.seconds_per_measure(start.tempo);
        }
        let slope = (end.tempo - start.tempo) / (end.measure - start.measure);
        let tempo = start.tempo + slope * (measure - start.measure);
        60.0 * self.beats_per_measure / slope * (tempo / start.tempo).ln()
    }

    /// Inverse of [`Self::segment_seconds`].
    fn segment_measure(&self, start: TempoPoint, end: TempoPoint, seconds: f64) -> f64 {
        if (start.measure - end.measure).abs() < EPSILON {
            return end.measure + seconds / self.seconds_per_measure(end.tempo);
        }
        if (start.tempo - end.tempo).abs() < EPSILON {
            return start.measure + seconds / self.seconds_per_measure(start.tempo);
        }
        let slope = (end.tempo - start.tempo) / (end.measure - start.measure);
        let growth = (seconds / self.beats_per_measure / 60.0 * slope).exp();
        start.measure + (growth * start.tempo - start.tempo) / slope
    }
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::constant(DEFAULT_TEMPO_BPM, crate::model::DEFAULT_BEATS_PER_MEASURE)
    }
}

impl Timeline for TempoMap {
    fn measure_to_time(&self, measure: f64) -> f64 {
        let mut seconds = 0.0;
        let mut previous = ORIGIN;
        let mut current = ORIGIN;
        for &point in &self.points {
            current = point;
            if measure < point.measure {
                break;
            }
            seconds += self.segment_seconds(previous, point, point.measure);
            previous = point;
        }
        seconds + self.segment_seconds(previous, current, measure)
    }

    fn time_to_measure(&self, seconds: f64) -> f64 {
        let mut elapsed = 0.0;
        let mut boundary = 0.0;
        let mut previous = ORIGIN;
        let mut current = ORIGIN;
        for &point in &self.points {
            current = point;
            boundary += self.segment_seconds(previous, point, point.measure);
            if seconds < boundary {
                break;
            }
            elapsed = boundary;
            previous = point;
        }
        self.segment_measure(previous, current, seconds - elapsed)
    }
}

/// Seconds from `current` (a measure position) to the next whole bar.
#[must_use]
pub fn time_till_next_bar(timeline: &dyn Timeline, current: f64) -> f64 {
    let next_bar = (current + 1.0).floor();
    (timeline.measure_to_time(next_bar) - timeline.measure_to_time(current)).max(0.0)
}
