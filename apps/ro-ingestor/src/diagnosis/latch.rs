use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Debounce: a condition must hold continuously for `required` before `hit` reports it.
///
/// Once past the threshold it keeps returning true until the condition drops.
#[derive(Debug, Clone, Default)]
pub struct PersistenceLatch {
    first_true: Option<DateTime<Utc>>,
}

impl PersistenceLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.first_true = None;
    }

    pub fn hit(&mut self, condition: bool, now: DateTime<Utc>, required: ChronoDuration) -> bool {
        if !condition {
            self.first_true = None;
            return false;
        }
        match self.first_true {
            None => {
                self.first_true = Some(now);
                false
            }
            Some(first) => now - first >= required,
        }
    }

    pub fn pending_since(&self) -> Option<DateTime<Utc>> {
        self.first_true
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
    fn fires_only_after_condition_held_for_duration() {
        let required = ChronoDuration::seconds(120);
        let mut latch = PersistenceLatch::new();
        for t in (0..120).step_by(5) {
            assert!(!latch.hit(true, at(t), required), "fired early at t={t}");
        }
        assert!(latch.hit(true, at(120), required));
        assert!(latch.hit(true, at(125), required));
        assert!(latch.hit(true, at(600), required));
    }

    #[test]
    fn single_false_restarts_the_clock() {
        let required = ChronoDuration::seconds(60);
        let mut latch = PersistenceLatch::new();
        assert!(!latch.hit(true, at(0), required));
        assert!(!latch.hit(true, at(50), required));
        assert!(!latch.hit(false, at(55), required));
        assert_eq!(latch.pending_since(), None);
        assert!(!latch.hit(true, at(60), required));
        assert!(!latch.hit(true, at(110), required));
        assert!(latch.hit(true, at(120), required));
    }

    #[test]
    fn reset_behaves_like_false() {
        let required = ChronoDuration::seconds(10);
        let mut latch = PersistenceLatch::new();
        latch.hit(true, at(0), required);
        latch.reset();
        assert!(!latch.hit(true, at(20), required));
        assert!(latch.hit(true, at(30), required));
    }
}
