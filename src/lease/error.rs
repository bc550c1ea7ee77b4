use serde::{Deserialize, Serialize};

/// Structured lease outcomes returned to agents.
///
/// Serialized with a stable `kind` tag so the RPC client rebuilds the exact
/// variant the leader produced.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeaseError {
    /// Every range this agent has not seen is leased to someone else
    #[error("No unleased range available for agent {agent_id}")]
    NoRangesAvailable { agent_id: String },
    /// This agent has already completed every range
    #[error("Agent {agent_id} has already probed every range")]
    Exhausted { agent_id: String },
    #[error("Range {range_id} is leased to another agent")]
    NotLeaseHolder { range_id: usize },
    #[error("Lease on range {range_id} expired before results arrived")]
    LeaseExpired { range_id: usize },
    #[error("Unknown range {range_id}")]
    UnknownRange { range_id: usize },
    #[error("Rejected results for range {range_id}: {reason}")]
    InvalidSubmission { range_id: usize, reason: String },
}

impl LeaseError {
    /// Worth asking again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoRangesAvailable { .. })
    }

    /// The submission was discarded because the lease moved on
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::NotLeaseHolder { .. } | Self::LeaseExpired { .. })
    }
}
