//! Tempo estimation from external MIDI clock pulses.
use std::collections::VecDeque;

/// MIDI clock pulses per quarter note.
pub const PULSES_PER_QUARTER: f64 = 24.0;

/// Intervals kept for the moving average (one quarter note of pulses).
const WINDOW: usize = 24;

#[derive(Debug, Clone)]
pub struct TempoTracker {
    initial_tempo: f64,
    tempo: f64,
    last_pulse: Option<f64>,
    intervals: VecDeque<f64>,
}

impl TempoTracker {
    pub fn new(tempo: f64) -> Self {
        Self {
            initial_tempo: tempo,
            tempo,
            last_pulse: None,
            intervals: VecDeque::with_capacity(WINDOW),
        }
    }

    /// Feed a pulse arrival time in milliseconds.
    pub fn next(&mut self, time_ms: f64) {
        if let Some(last) = self.last_pulse {
            let interval = time_ms - last;
            if interval > 0.0 {
                if self.intervals.len() == WINDOW {
                    self.intervals.pop_front();
                }
                self.intervals.push_back(interval);
                let mean = self.intervals.iter().sum::<f64>() / self.intervals.len() as f64;
                self.tempo = 60_000.0 / (mean * PULSES_PER_QUARTER);
            }
        }
        self.last_pulse = Some(time_ms);
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn reset(&mut self) {
        self.tempo = self.initial_tempo;
        self.last_pulse = None;
        self.intervals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse_ms(bpm: f64) -> f64 {
        60_000.0 / (bpm * PULSES_PER_QUARTER)
    }

    #[test]
    fn test_initial_tempo_until_two_pulses() {
        let mut tracker = TempoTracker::new(120.0);
        assert_eq!(tracker.tempo(), 120.0);
        tracker.next(1000.0);
        assert_eq!(tracker.tempo(), 120.0);
    }

    #[test]
    fn test_steady_clock() {
        let mut tracker = TempoTracker::new(120.0);
        let step = pulse_ms(90.0);
        for i in 0..48 {
            tracker.next(i as f64 * step);
        }
        assert!((tracker.tempo() - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_follows_tempo_change() {
        let mut tracker = TempoTracker::new(120.0);
        let mut t = 0.0;
        for _ in 0..30 {
            tracker.next(t);
            t += pulse_ms(100.0);
        }
        for _ in 0..WINDOW + 1 {
            tracker.next(t);
            t += pulse_ms(140.0);
        }
        assert!((tracker.tempo() - 140.0).abs() < 1e-6);
    }

    #[test]
    fn test_ignores_non_positive_intervals() {
        let mut tracker = TempoTracker::new(120.0);
        tracker.next(10.0);
        tracker.next(10.0);
        assert_eq!(tracker.tempo(), 120.0);
    }

    #[test]
    fn test_reset() {
        let mut tracker = TempoTracker::new(120.0);
        tracker.next(0.0);
        tracker.next(pulse_ms(60.0));
        assert!((tracker.tempo() - 60.0).abs() < 1e-6);
        tracker.reset();
        assert_eq!(tracker.tempo(), 120.0);
        tracker.next(500.0);
        assert_eq!(tracker.tempo(), 120.0);
    }
}
