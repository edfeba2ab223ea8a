//! Health classification with hysteresis
//!
//! A HealthRecord only changes classification after a run of consecutive
//! probe results reaches the configured threshold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health classification of an instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthClassification {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl fmt::Display for HealthClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthClassification::Healthy => write!(f, "healthy"),
            HealthClassification::Unhealthy => write!(f, "unhealthy"),
            HealthClassification::Unknown => write!(f, "unknown"),
        }
    }
}

/// Consecutive-result thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub failure: u32,
    pub success: u32,
}

impl Thresholds {
    pub fn new(failure: u32, success: u32) -> Self {
        Self {
            failure: failure.max(1),
            success: success.max(1),
        }
    }
}

/// Rolling health state for one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub classification: HealthClassification,
    pub last_probe_at: Option<DateTime<Utc>>,

    /// Message from the most recent probe
    pub last_message: Option<String>,
}

impl HealthRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one probe result into the record.
    ///
    /// Returns `(old, new)` when the classification changed.
    pub fn observe(
        &mut self,
        success: bool,
        thresholds: Thresholds,
    ) -> Option<(HealthClassification, HealthClassification)> {
        self.last_probe_at = Some(Utc::now());
        let old = self.classification;

        if success {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;
            if old != HealthClassification::Healthy
                && self.consecutive_successes >= thresholds.success
            {
                self.classification = HealthClassification::Healthy;
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;
            if old != HealthClassification::Unhealthy
                && self.consecutive_failures >= thresholds.failure
            {
                self.classification = HealthClassification::Unhealthy;
            }
        }

        (old != self.classification).then_some((old, self.classification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_failure_threshold() {
        let t = Thresholds::new(3, 1);
        let mut record = HealthRecord::new();
        assert_eq!(
            record.observe(true, t),
            Some((HealthClassification::Unknown, HealthClassification::Healthy))
        );
        assert_eq!(record.observe(false, t), None);
        assert_eq!(record.observe(false, t), None);
        assert_eq!(
            record.observe(false, t),
            Some((HealthClassification::Healthy, HealthClassification::Unhealthy))
        );
        assert_eq!(record.observe(false, t), None);
        assert_eq!(record.consecutive_failures, 4);
    }

    #[test]
    fn test_success_threshold() {
        let t = Thresholds::new(1, 2);
        let mut record = HealthRecord::new();
        record.observe(false, t);
        assert_eq!(record.classification, HealthClassification::Unhealthy);
        assert_eq!(record.observe(true, t), None);
        assert_eq!(
            record.observe(true, t),
            Some((HealthClassification::Unhealthy, HealthClassification::Healthy))
        );
    }

    #[test]
    fn test_zero_thresholds_clamped() {
        let t = Thresholds::new(0, 0);
        assert_eq!(t.failure, 1);
        assert_eq!(t.success, 1);
    }

    proptest! {
        #[test]
        fn prop_short_failure_runs_never_flip_unhealthy(
            failure_threshold in 2u32..6,
            runs in prop::collection::vec(1u32..6, 1..40),
        ) {
            let t = Thresholds::new(failure_threshold, 1);
            let mut record = HealthRecord::new();
            for run in runs {
                let run = run.min(failure_threshold - 1);
                for _ in 0..run {
                    record.observe(false, t);
                }
                record.observe(true, t);
                prop_assert_ne!(record.classification, HealthClassification::Unhealthy);
            }
        }

        #[test]
        fn prop_classification_matches_trailing_run(
            failure_threshold in 1u32..5,
            success_threshold in 1u32..5,
            results in prop::collection::vec(any::<bool>(), 0..60),
        ) {
            let t = Thresholds::new(failure_threshold, success_threshold);
            let mut record = HealthRecord::new();
            for &r in &results {
                record.observe(r, t);
            }
            match record.classification {
                HealthClassification::Unhealthy => {
                    prop_assert_eq!(record.consecutive_successes < success_threshold, true);
                }
                HealthClassification::Healthy => {
                    prop_assert_eq!(record.consecutive_failures < failure_threshold, true);
                }
                HealthClassification::Unknown => {
                    let max_fail_run = longest_run(&results, false);
                    let max_ok_run = longest_run(&results, true);
                    prop_assert!(max_fail_run < failure_threshold);
                    prop_assert!(max_ok_run < success_threshold);
                }
            }
        }
    }

    fn longest_run(results: &[bool], value: bool) -> u32 {
        let mut best = 0;
        let mut current = 0;
        for &r in results {
            if r == value {
                current += 1;
                best = best.max(current);
            } else {
                current = 0;
            }
        }
        best
    }
}
