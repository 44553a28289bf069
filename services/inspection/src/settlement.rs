//! Settlement window for closed cycles.
//!
//! Photo files land in staging some time after the PLC reports the falling
//! edge. A closed cycle becomes eligible for correlation once its end
//! timestamp plus the wait time is at or before the current time.

use crate::cycle_detector::{Cycle, CycleState};
use crate::fields::PlcTimestamp;
use chrono::{DateTime, Duration, FixedOffset, Utc};

/// Answer for a single closed cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementDecision {
    /// Window elapsed; proceed to correlation
    Settled,
    /// Still inside the window
    Wait { remaining: Duration },
}

#[derive(Debug, Clone)]
pub struct SettlementGate {
    wait: Duration,
    offset: FixedOffset,
}

impl SettlementGate {
    pub fn new(wait: Duration, offset: FixedOffset) -> Self {
        Self { wait, offset }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Decide whether a cycle ending at `ended_at` has settled by `now`.
    /// The boundary is inclusive.
    pub fn decide_at(&self, ended_at: DateTime<Utc>, now: DateTime<Utc>) -> SettlementDecision {
        let ready_at = ended_at + self.wait;
        if ready_at <= now {
            SettlementDecision::Settled
        } else {
            SettlementDecision::Wait {
                remaining: ready_at - now,
            }
        }
    }

    /// Like [`decide_at`](Self::decide_at) with timestamps of either
    /// flavour, normalized through the plant offset before comparison
    pub fn decide_plc(&self, ended_at: PlcTimestamp, now: PlcTimestamp) -> SettlementDecision {
        self.decide_at(ended_at.normalize(self.offset), now.normalize(self.offset))
    }

    /// Open cycles never settle
    pub fn decide(&self, cycle: &Cycle, now: DateTime<Utc>) -> Option<SettlementDecision> {
        cycle.ended_at().map(|ended| self.decide_at(ended, now))
    }

    pub fn is_settled(&self, cycle: &Cycle, now: DateTime<Utc>) -> bool {
        matches!(self.decide(cycle, now), Some(SettlementDecision::Settled))
    }

    /// Split closed cycles into those ready to correlate (moved to
    /// `Settling`) and those still waiting. Order is preserved.
    pub fn partition(&self, cycles: Vec<Cycle>, now: DateTime<Utc>) -> (Vec<Cycle>, Vec<Cycle>) {
        let mut ready = Vec::new();
        let mut waiting = Vec::new();

        for mut cycle in cycles {
            if self.is_settled(&cycle, now) {
                cycle.state = CycleState::Settling;
                ready.push(cycle);
            } else {
                waiting.push(cycle);
            }
        }

        (ready, waiting)
    }
}
