use std::time::Duration;

const STEPS: u32 = 10;

/// Polling interval that eases from `min` to `max` as rounds stay idle.
///
/// `touch` snaps back to `min`; `backoff` moves one step towards `max` along
/// an ease-in-out curve, so the interval stays short for a few idle rounds,
/// then grows quickly, then flattens near the ceiling.
#[derive(Debug, Clone)]
pub struct AdaptiveTimer {
    min: Duration,
    max: Duration,
    step: u32,
}

impl AdaptiveTimer {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            step: 0,
        }
    }

    pub fn next_delay(&self) -> Duration {
        let t = f64::from(self.step) / f64::from(STEPS);
        let span = (self.max - self.min).as_secs_f64();
        self.min + Duration::from_secs_f64(span * ease_in_out(t))
    }

    /// Activity: poll at the fastest rate again.
    pub fn touch(&mut self) {
        self.step = 0;
    }

    /// Idle round or failure: slow down one step.
    pub fn backoff(&mut self) {
        self.step = (self.step + 1).min(STEPS);
    }
}

fn ease_in_out(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 {
        2.0 * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
    }
}
