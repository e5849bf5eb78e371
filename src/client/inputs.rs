//! Input Tracking
//!
//! Assigns sequences to local inputs and tracks them until the server
//! acknowledges them. The pending table is keyed by sequence; cancelling an
//! input removes its entry.

use std::collections::BTreeMap;

use crate::core::buffer::{mean, RollingHistory};
use crate::core::time::Millis;
use crate::game::input::{InputLog, PredictiveInput};
use crate::game::state::{PlayerId, Sequence};
use crate::network::protocol::InputAcknowledgment;

/// Bookkeeping for an unacknowledged input.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInput {
    /// Input sequence
    pub sequence: u64,
    /// Prediction made for it
    pub correlation_id: Option<u64>,
    /// Client time it was sent (ms)
    pub sent_at: Millis,
}

/// How an acknowledgment resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// Server accepted the input
    Accepted {
        /// Resolved entry
        pending: PendingInput,
        /// Round trip (ms)
        rtt_ms: f32,
    },
    /// Server rejected the input; its prediction must be retracted
    Rejected {
        /// Resolved entry
        pending: PendingInput,
        /// The input itself, if still logged
        input: Option<PredictiveInput>,
        /// Server's reason
        reason: String,
    },
    /// Ack for an input not pending (duplicate, expired, or another player's)
    Unknown,
}

/// Per-player input sequencing and ack tracking.
#[derive(Debug, Clone)]
pub struct InputTracker {
    player_id: PlayerId,
    next_sequence: u64,
    pending: BTreeMap<u64, PendingInput>,
    log: InputLog,
    applied_after: BTreeMap<u64, Sequence>,
    last_acknowledged: u64,
    rtt: RollingHistory<f32>,
    capacity: usize,
}

impl InputTracker {
    /// Create a tracker holding up to `capacity` unacknowledged inputs.
    pub fn new(player_id: PlayerId, capacity: usize) -> Self {
        Self {
            player_id,
            next_sequence: 1,
            pending: BTreeMap::new(),
            log: InputLog::new(player_id, capacity),
            applied_after: BTreeMap::new(),
            last_acknowledged: 0,
            rtt: RollingHistory::new(32),
            capacity: capacity.max(1),
        }
    }

    /// Player this tracker sequences for.
    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    /// Sequence the next input will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Start tracking a sent input.
    pub fn track(&mut self, input: PredictiveInput, correlation_id: Option<u64>, now: Millis) {
        self.next_sequence = self.next_sequence.max(input.sequence + 1);
        self.pending.insert(
            input.sequence,
            PendingInput {
                sequence: input.sequence,
                correlation_id,
                sent_at: now,
            },
        );
        self.log.record(input);
    }

    /// Stop tracking an input.
    pub fn cancel(&mut self, sequence: u64) -> Option<PendingInput> {
        self.log.remove(sequence);
        self.pending.remove(&sequence)
    }

    /// Resolve an acknowledgment.
    ///
    /// `last_applied` is the newest snapshot sequence held when the ack
    /// arrived; any later snapshot reflects an accepted input.
    pub fn resolve(&mut self, ack: &InputAcknowledgment, now: Millis, last_applied: Sequence) -> AckOutcome {
        if ack.player_id != self.player_id {
            return AckOutcome::Unknown;
        }
        let Some(pending) = self.pending.remove(&ack.acknowledged_sequence) else {
            return AckOutcome::Unknown;
        };
        let input = self.log.remove(ack.acknowledged_sequence);

        if ack.accepted {
            self.last_acknowledged = self.last_acknowledged.max(ack.acknowledged_sequence);
            self.applied_after.insert(ack.acknowledged_sequence, last_applied);
            while self.applied_after.len() > self.capacity {
                self.applied_after.pop_first();
            }
            let rtt_ms = now.saturating_sub(pending.sent_at) as f32;
            self.rtt.push(rtt_ms);
            AckOutcome::Accepted { pending, rtt_ms }
        } else {
            AckOutcome::Rejected {
                pending,
                input,
                reason: ack.rejection_reason.clone().unwrap_or_default(),
            }
        }
    }

    /// Whether a snapshot with `snapshot_sequence` already reflects an
    /// accepted input.
    pub fn applied_in(&self, input_sequence: u64, snapshot_sequence: Sequence) -> bool {
        self.applied_after
            .get(&input_sequence)
            .is_some_and(|after| snapshot_sequence > *after)
    }

    /// Forget the applied marker once the input's prediction is validated.
    pub fn forget_applied(&mut self, input_sequence: u64) {
        self.applied_after.remove(&input_sequence);
    }

    /// The most recent unacknowledged inputs, oldest first.
    pub fn recent_unacknowledged(&self, n: usize) -> Vec<PredictiveInput> {
        self.log.last_n(n).to_vec()
    }

    /// Remove inputs unacknowledged for longer than `timeout_ms`.
    pub fn expire(&mut self, now: Millis, timeout_ms: Millis) -> Vec<PendingInput> {
        let expired: Vec<u64> = self
            .pending
            .values()
            .filter(|p| now.saturating_sub(p.sent_at) > timeout_ms)
            .map(|p| p.sequence)
            .collect();
        expired.into_iter().filter_map(|seq| self.cancel(seq)).collect()
    }

    /// Pending entry by sequence.
    pub fn pending(&self, sequence: u64) -> Option<&PendingInput> {
        self.pending.get(&sequence)
    }

    /// Number of unacknowledged inputs.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Highest accepted sequence.
    pub fn last_acknowledged(&self) -> u64 {
        self.last_acknowledged
    }

    /// Mean round trip over recent acks (ms).
    pub fn average_rtt(&self) -> Option<f32> {
        mean(self.rtt.iter())
    }
}

// =============================================================================
// TESTS
// =============================================================================
