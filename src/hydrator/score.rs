//! "What's hot" score
//!
//! ```text
//! raw   = likes + 2 * replies + 3 * reposts
//! score = 100 * raw / (age_hours + 2) ^ 1.5
//! ```
//!
//! Ages are offset by two hours so brand new posts do not divide by ~0.

use chrono::{DateTime, Utc};

/// Engagement counters for one post
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Engagement {
    pub likes: u64,
    pub replies: u64,
    pub reposts: u64,
}

impl Engagement {
    pub fn raw(&self) -> f64 {
        self.likes as f64 + 2.0 * self.replies as f64 + 3.0 * self.reposts as f64
    }
}

/// Score for `engagement` at `age_hours` (negative ages count as 0)
pub fn hot_score(engagement: &Engagement, age_hours: f64) -> f64 {
    let age = age_hours.max(0.0);
    100.0 * engagement.raw() / (age + 2.0).powf(1.5)
}

/// Score as stored: truncated toward zero
pub fn stored_score(engagement: &Engagement, indexed_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let age_hours = (now - indexed_at).num_milliseconds() as f64 / 3_600_000.0;
    hot_score(engagement, age_hours) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reference_values() {
        let engagement = Engagement {
            likes: 10,
            replies: 5,
            reposts: 2,
        };
        assert_eq!(engagement.raw(), 26.0);

        let score = hot_score(&engagement, 3.0);
        assert!((score - 232.55).abs() < 0.01, "score was {}", score);

        let now = Utc::now();
        assert_eq!(stored_score(&engagement, now - Duration::hours(3), now), 232);
    }

    #[test]
    fn test_future_timestamps_clamp_to_zero_age() {
        let engagement = Engagement {
            likes: 2,
            replies: 0,
            reposts: 0,
        };
        let now = Utc::now();
        let expected = (100.0 * 2.0 / 2f64.powf(1.5)) as i64;
        assert_eq!(stored_score(&engagement, now + Duration::hours(5), now), expected);
    }

    #[test]
    fn test_score_decays_with_age() {
        let engagement = Engagement {
            likes: 100,
            replies: 10,
            reposts: 10,
        };
        assert!(hot_score(&engagement, 1.0) > hot_score(&engagement, 10.0));
        assert_eq!(hot_score(&Engagement::default(), 0.0), 0.0);
    }
}
