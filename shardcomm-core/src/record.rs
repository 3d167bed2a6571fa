//! Operation record: the tracked state of one request.

use std::time::{Duration, Instant};

use crate::deadline::deadline_after;
use crate::status::{ErrorCode, OpStatus};
use crate::types::{
    ClientTransactionId, CoordTransactionId, Response, ServerId, ShardId, Ticket, is_success_code,
};

/// Tracked state of one request.
///
/// Owned by the registry while tracked; callers always receive clones.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    /// Operation identity.
    pub ticket: Ticket,
    /// Caller-supplied correlation string.
    pub client_transaction_id: ClientTransactionId,
    /// Caller-supplied correlation number.
    pub coord_transaction_id: CoordTransactionId,
    /// Shard named by the destination, empty otherwise.
    pub shard_id: ShardId,
    /// Resolved server, empty for raw endpoints.
    pub server_id: ServerId,
    /// Resolved endpoint, e.g. `tcp://10.0.0.1:8529`.
    pub endpoint: String,
    /// Complete after one round trip instead of awaiting an out-of-band answer.
    pub single: bool,
    /// Current status.
    pub status: OpStatus,
    /// When the operation was created.
    pub submitted_at: Instant,
    /// When the operation times out.
    pub deadline: Instant,
    /// Diagnostic for failed operations.
    pub error_message: String,
    /// The answer, set once received (and for HTTP-level errors).
    pub answer: Option<Response>,
    /// Whether the request fully left the local side before a timeout.
    pub send_was_complete: bool,
}

impl OperationRecord {
    /// Create a fresh `Submitted` record.
    pub fn new(ticket: Ticket, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            ticket,
            client_transaction_id: String::new(),
            coord_transaction_id: 0,
            shard_id: String::new(),
            server_id: String::new(),
            endpoint: String::new(),
            single: false,
            status: OpStatus::Submitted,
            submitted_at: now,
            deadline: deadline_after(now, timeout),
            error_message: String::new(),
            answer: None,
            send_was_complete: false,
        }
    }

    /// Synthetic record reporting that nothing is known about `ticket`.
    pub fn dropped(ticket: Ticket) -> Self {
        let mut record = Self::new(ticket, Duration::ZERO);
        record.status = OpStatus::Dropped;
        record
    }

    /// Synthetic record reporting that a wait ran out of time.
    pub fn wait_timed_out() -> Self {
        let mut record = Self::new(Ticket::NONE, Duration::ZERO);
        record.status = OpStatus::Timeout;
        record.error_message = "timeout".to_string();
        record
    }

    /// Status code of the answer, if any.
    pub fn answer_code(&self) -> Option<u16> {
        self.answer.as_ref().map(|answer| answer.code)
    }

    /// Received with an answer in the success class.
    pub fn is_good(&self) -> bool {
        self.status == OpStatus::Received && self.answer_code().is_some_and(is_success_code)
    }

    /// Error code for the current status.
    pub fn error_code(&self) -> ErrorCode {
        self.status.error_code()
    }

    /// Whether the record is past its deadline at `now`.
    pub fn is_overdue(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Human readable summary of status and destination.
    ///
    /// ```
    /// use std::time::Duration;
    /// use shardcomm_core::{OpStatus, OperationRecord, Ticket};
    ///
    /// let mut record = OperationRecord::new(Ticket::new(1), Duration::from_secs(1));
    /// record.status = OpStatus::BackendUnavailable;
    /// record.shard_id = "s100".to_string();
    /// assert_eq!(record.describe_error(), "backend unavailable, shard: 's100'");
    /// ```
    pub fn describe_error(&self) -> String {
        let mut out = String::from(self.status.as_str());
        let parts = [
            ("cluster node", &self.server_id),
            ("shard", &self.shard_id),
            ("endpoint", &self.endpoint),
            ("error", &self.error_message),
        ];
        for (label, value) in parts {
            if !value.is_empty() {
                out.push_str(&format!(", {label}: '{value}'"));
            }
        }
        out
    }
}
