//! Debounce / idempotency gate for campaign triggers
//!
//! A vehicle flapping across a zone boundary produces a burst of zone-change
//! events. The gate rate-limits triggers per vehicle using the last trigger
//! time stored on its device record:
//! - no recorded trigger: always allowed
//! - `now - last > threshold`: allowed
//! - otherwise: suppressed
//!
//! This is a time window, not a sequence number; duplicate or out-of-order
//! delivery is rate-limited, not excluded. `is_duplicate` collapses a trigger
//! for the campaign already recorded on the vehicle into a heartbeat.

use crate::domain::device::VehicleCampaignState;
use std::time::Duration;

/// Outcome of evaluating the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Trigger may fire; `age_secs` is `None` when no trigger was recorded
    Allow { age_secs: Option<i64> },
    /// Last trigger is too recent
    Suppress { age_secs: i64 },
}

impl GateDecision {
    pub fn allows(&self) -> bool {
        matches!(self, GateDecision::Allow { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DebounceGate {
    threshold_secs: i64,
}

impl DebounceGate {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold_secs: i64::try_from(threshold.as_secs()).unwrap_or(i64::MAX) }
    }

    pub fn threshold_secs(&self) -> i64 {
        self.threshold_secs
    }

    /// Evaluate the gate for a vehicle at unix time `now`
    pub fn evaluate(&self, state: &VehicleCampaignState, now: i64) -> GateDecision {
        match state.last_trigger_time {
            None => GateDecision::Allow { age_secs: None },
            Some(last) => {
                // A timestamp in the future yields a negative age and stays suppressed
                let age_secs = now.saturating_sub(last);
                if age_secs > self.threshold_secs {
                    GateDecision::Allow { age_secs: Some(age_secs) }
                } else {
                    GateDecision::Suppress { age_secs }
                }
            }
        }
    }

    pub fn should_trigger(&self, state: &VehicleCampaignState, now: i64) -> bool {
        self.evaluate(state, now).allows()
    }

    /// True when `campaign_id` is already the campaign recorded on the vehicle
    pub fn is_duplicate(state: &VehicleCampaignState, campaign_id: &str) -> bool {
        state.current_campaign.as_deref() == Some(campaign_id)
    }
}

impl Default for DebounceGate {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn state_at(last: Option<i64>) -> VehicleCampaignState {
        VehicleCampaignState { last_trigger_time: last, ..Default::default() }
    }

    #[test]
    fn test_recent_trigger_suppressed() {
        let gate = DebounceGate::new(Duration::from_secs(60));
        assert!(!gate.should_trigger(&state_at(Some(NOW - 10)), NOW));
        assert_eq!(
            gate.evaluate(&state_at(Some(NOW - 10)), NOW),
            GateDecision::Suppress { age_secs: 10 }
        );
    }

    #[test]
    fn test_old_trigger_allowed() {
        let gate = DebounceGate::new(Duration::from_secs(60));
        assert!(gate.should_trigger(&state_at(Some(NOW - 120)), NOW));
    }

    #[test]
    fn test_no_recorded_trigger_allowed() {
        let gate = DebounceGate::default();
        assert_eq!(gate.evaluate(&state_at(None), NOW), GateDecision::Allow { age_secs: None });
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let gate = DebounceGate::new(Duration::from_secs(60));
        assert!(!gate.should_trigger(&state_at(Some(NOW - 60)), NOW));
        assert!(gate.should_trigger(&state_at(Some(NOW - 61)), NOW));
    }

    #[test]
    fn test_future_timestamp_suppressed() {
        let gate = DebounceGate::new(Duration::from_secs(60));
        assert!(!gate.should_trigger(&state_at(Some(NOW + 3600)), NOW));
    }

    #[test]
    fn test_zero_threshold_allows_any_elapsed_second() {
        let gate = DebounceGate::new(Duration::ZERO);
        assert!(!gate.should_trigger(&state_at(Some(NOW)), NOW));
        assert!(gate.should_trigger(&state_at(Some(NOW - 1)), NOW));
    }

    #[test]
    fn test_is_duplicate() {
        let state = VehicleCampaignState {
            current_campaign: Some("C1".to_string()),
            ..Default::default()
        };
        assert!(DebounceGate::is_duplicate(&state, "C1"));
        assert!(!DebounceGate::is_duplicate(&state, "C2"));
        assert!(!DebounceGate::is_duplicate(&VehicleCampaignState::default(), "C1"));
    }
}
