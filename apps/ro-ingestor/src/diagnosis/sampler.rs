use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowStats {
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub n: u64,
}

/// Fixed-length window opened by the first accepted sample.
///
/// Only running aggregates are kept, so a long window costs the same as a short one.
#[derive(Debug, Clone)]
pub struct WindowSampler {
    window: ChronoDuration,
    started_at: Option<DateTime<Utc>>,
    sum: f64,
    min: f64,
    max: f64,
    n: u64,
}

impl WindowSampler {
    pub fn new(window: ChronoDuration) -> Self {
        Self {
            window,
            started_at: None,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            n: 0,
        }
    }

    pub fn window(&self) -> ChronoDuration {
        self.window
    }

    pub fn reset(&mut self) {
        self.started_at = None;
        self.sum = 0.0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
        self.n = 0;
    }

    pub fn add(&mut self, ts: DateTime<Utc>, value: Option<f64>) {
        let Some(value) = value.filter(|v| v.is_finite()) else {
            return;
        };
        if self.started_at.is_none() {
            self.started_at = Some(ts);
        }
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.n += 1;
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> ChronoDuration {
        match self.started_at {
            Some(start) if now > start => now - start,
            _ => ChronoDuration::zero(),
        }
    }

    pub fn done(&self, now: DateTime<Utc>) -> bool {
        self.elapsed(now) >= self.window
    }

    pub fn stats(&self) -> WindowStats {
        if self.n == 0 {
            return WindowStats {
                avg: None,
                min: None,
                max: None,
                n: 0,
            };
        }
        WindowStats {
            avg: Some(self.sum / self.n as f64),
            min: Some(self.min),
            max: Some(self.max),
            n: self.n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn done_flips_exactly_at_window_end() {
        let mut sampler = WindowSampler::new(ChronoDuration::seconds(30));
        assert!(!sampler.done(at(0)));
        sampler.add(at(0), Some(1.0));
        for t in 0..30 {
            assert!(!sampler.done(at(t)), "done too early at t={t}");
        }
        assert!(sampler.done(at(30)));
        assert!(sampler.done(at(95)));
    }

    #[test]
    fn ignores_missing_and_non_finite_values() {
        let mut sampler = WindowSampler::new(ChronoDuration::seconds(10));
        sampler.add(at(0), None);
        sampler.add(at(1), Some(f64::NAN));
        assert_eq!(sampler.elapsed(at(5)), ChronoDuration::zero());

        sampler.add(at(2), Some(2.0));
        sampler.add(at(3), Some(f64::INFINITY));
        sampler.add(at(4), Some(4.0));
        let stats = sampler.stats();
        assert_eq!(stats.n, 2);
        assert_eq!(stats.avg, Some(3.0));
        assert_eq!(stats.min, Some(2.0));
        assert_eq!(stats.max, Some(4.0));
        assert_eq!(sampler.elapsed(at(7)), ChronoDuration::seconds(5));
    }

    #[test]
    fn elapsed_never_negative_and_reset_clears() {
        let mut sampler = WindowSampler::new(ChronoDuration::seconds(10));
        sampler.add(at(10), Some(1.0));
        assert_eq!(sampler.elapsed(at(5)), ChronoDuration::zero());

        sampler.reset();
        assert_eq!(sampler.stats().n, 0);
        assert_eq!(sampler.stats().avg, None);
        assert!(!sampler.done(at(100)));
    }
}
