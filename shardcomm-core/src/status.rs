//! Operation status lifecycle.
//!
//! ```text
//! Submitted ──► Sending ──► Sent ──► Received
//!     │            │          │
//!     └────────────┴──────────┴──► Timeout | Error | BackendUnavailable | Dropped
//! ```
//!
//! Statuses only move forward. Once a terminal status is reached the record
//! never changes again.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpStatus {
    /// Registered, not yet handed to the transport.
    Submitted,
    /// Handed to the transport, send in progress.
    Sending,
    /// Send completed, waiting for an out-of-band answer.
    Sent,
    /// No answer within the deadline.
    Timeout,
    /// Answer available.
    Received,
    /// The transport reported a protocol-level failure.
    Error,
    /// The caller abandoned interest, or no record exists.
    Dropped,
    /// The destination could not be resolved or connected to.
    BackendUnavailable,
}

/// Error code associated with a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// In progress or answered.
    NoError,
    /// Timed out.
    ClusterTimeout,
    /// Protocol error or dropped.
    Internal,
    /// Destination unavailable.
    BackendUnavailable,
}

impl OpStatus {
    /// Position along the in-progress chain, `None` for alternates.
    const fn progress_rank(&self) -> Option<u8> {
        match self {
            OpStatus::Submitted => Some(0),
            OpStatus::Sending => Some(1),
            OpStatus::Sent => Some(2),
            OpStatus::Received => Some(3),
            _ => None,
        }
    }

    /// Whether the operation has reached its final outcome.
    pub const fn is_terminal(&self) -> bool {
        !matches!(
            self,
            OpStatus::Submitted | OpStatus::Sending | OpStatus::Sent
        )
    }

    /// Whether moving from `self` to `next` follows the lifecycle graph.
    ///
    /// Terminal statuses accept no transition. In-progress statuses may
    /// advance along the chain or jump to any terminal alternate.
    pub fn can_transition_to(&self, next: OpStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.progress_rank(), next.progress_rank()) {
            (Some(from), Some(to)) => to > from,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Error code reported for this status.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            OpStatus::Submitted | OpStatus::Sending | OpStatus::Sent | OpStatus::Received => {
                ErrorCode::NoError
            }
            OpStatus::Timeout => ErrorCode::ClusterTimeout,
            OpStatus::Error | OpStatus::Dropped => ErrorCode::Internal,
            OpStatus::BackendUnavailable => ErrorCode::BackendUnavailable,
        }
    }

    /// Lower-case human readable name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Submitted => "submitted",
            OpStatus::Sending => "sending",
            OpStatus::Sent => "sent",
            OpStatus::Timeout => "timeout",
            OpStatus::Received => "received",
            OpStatus::Error => "error",
            OpStatus::Dropped => "dropped",
            OpStatus::BackendUnavailable => "backend unavailable",
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
