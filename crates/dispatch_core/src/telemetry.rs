//! Telemetry / KPIs: dispatch counters and finished-ride records.

use std::collections::VecDeque;

use bevy_ecs::prelude::Resource;

use crate::ecs::{CancellationOutcome, RidePid, RideStatus};

const MAX_RIDE_OUTCOMES: usize = 1_024;

/// One ride that reached a terminal status on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RideOutcomeRecord {
    pub ride: RidePid,
    pub status: RideStatus,
    pub cancellation: Option<CancellationOutcome>,
    pub requested_at: u64,
    pub accepted_at: Option<u64>,
    pub finished_at: u64,
    /// Offers sent for this ride, all iterations included.
    pub offers: u32,
}

impl RideOutcomeRecord {
    /// Time from dispatch start to driver acceptance.
    pub fn time_to_accept(&self) -> Option<u64> {
        self.accepted_at
            .map(|at| at.saturating_sub(self.requested_at))
    }
}

#[derive(Debug, Default, Resource)]
pub struct DispatchTelemetry {
    pub offers_sent: u64,
    pub offers_declined: u64,
    pub offers_timed_out: u64,
    pub delivery_failures: u64,
    pub rides_accepted: u64,
    pub rides_exhausted: u64,
    pub rides_canceled_safe: u64,
    pub rides_canceled_with_pendency: u64,
    pub rides_completed: u64,
    /// Decisions from a driver that was not the current offeree.
    pub stale_decisions: u64,
    pub rejected_commands: u64,
    pub protocol_errors: u64,
    pub transport_failures: u64,
    /// Own envelopes dropped on receipt.
    pub envelopes_suppressed: u64,
    pub requests_acked: u64,
    pub requests_timed_out: u64,
    ride_outcomes: VecDeque<RideOutcomeRecord>,
}

impl DispatchTelemetry {
    pub fn record_outcome(&mut self, record: RideOutcomeRecord) {
        if self.ride_outcomes.len() == MAX_RIDE_OUTCOMES {
            self.ride_outcomes.pop_front();
        }
        self.ride_outcomes.push_back(record);
    }

    /// Most recent terminal rides, oldest first.
    pub fn ride_outcomes(&self) -> impl Iterator<Item = &RideOutcomeRecord> {
        self.ride_outcomes.iter()
    }

    pub fn outcome_for(&self, ride: RidePid) -> Option<&RideOutcomeRecord> {
        self.ride_outcomes.iter().rev().find(|r| r.ride == ride)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_log_is_bounded() {
        let mut telemetry = DispatchTelemetry::default();
        for i in 0..(MAX_RIDE_OUTCOMES as u64 + 5) {
            telemetry.record_outcome(RideOutcomeRecord {
                ride: RidePid(i),
                status: RideStatus::Completed,
                cancellation: None,
                requested_at: 0,
                accepted_at: Some(10),
                finished_at: 20,
                offers: 1,
            });
        }
        assert_eq!(telemetry.ride_outcomes().count(), MAX_RIDE_OUTCOMES);
        assert!(telemetry.outcome_for(RidePid(0)).is_none());
        assert_eq!(
            telemetry.outcome_for(RidePid(7)).and_then(|r| r.time_to_accept()),
            Some(10)
        );
    }
}
