//! OperationRegistry: ticket-keyed store of tracked operations.
//!
//! A single mutex/condvar monitor guards every record. Completions mutate
//! records under the lock and then either hand the settled record to the
//! operation's continuation or broadcast on the condvar so that blocked
//! [`wait`](OperationRegistry::wait) calls re-scan.
//!
//! ```text
//! register ──► [Submitted] ──advance──► [Sending] ──complete──► terminal
//!                                                                  │
//!                                  continuation? ──yes──► run, true ⇒ remove
//!                                        │
//!                                        no ──► notify_all ──► wait removes
//! ```
//!
//! The lock is never held while a continuation runs.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::CommError;
use crate::outcome::Outcome;
use crate::{
    ClientTransactionId, CoordTransactionId, OpStatus, OperationRecord, ShardId, Ticket,
    deadline_after,
};

/// Continuation run with the settled record of an asynchronous request.
///
/// Return `true` once the result is fully processed, which removes the
/// record. Returning `false` leaves it resident for a later wait or drop.
pub type RequestCallback = Box<dyn FnOnce(&OperationRecord) -> bool + Send>;

/// Selection predicate for [`wait`](crate::CommEngine::wait) and
/// [`drop_matching`](crate::CommEngine::drop_matching).
///
/// A nonzero ticket selects that operation only. Otherwise every field acts
/// as a filter where the empty string and 0 match anything.
///
/// ```
/// use shardcomm::{MatchCriteria, Ticket};
///
/// let batch = MatchCriteria::coord_transaction(42).with_shard("s1");
/// assert_eq!(batch.coord_transaction_id, 42);
/// assert!(MatchCriteria::any().ticket.is_none());
/// assert_eq!(MatchCriteria::ticket(Ticket::new(3)).ticket, Ticket::new(3));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchCriteria {
    /// Client transaction id, empty for any.
    pub client_transaction_id: ClientTransactionId,
    /// Coordinator transaction id, 0 for any.
    pub coord_transaction_id: CoordTransactionId,
    /// Specific ticket, [`Ticket::NONE`] for any.
    pub ticket: Ticket,
    /// Shard id, empty for any.
    pub shard_id: ShardId,
}

impl MatchCriteria {
    /// Match every operation.
    pub fn any() -> Self {
        Self::default()
    }

    /// Match exactly one ticket.
    pub fn ticket(ticket: Ticket) -> Self {
        Self {
            ticket,
            ..Self::default()
        }
    }

    /// Match every operation of a coordinator transaction.
    pub fn coord_transaction(coord_transaction_id: CoordTransactionId) -> Self {
        Self {
            coord_transaction_id,
            ..Self::default()
        }
    }

    /// Restrict to a client transaction id.
    pub fn with_client_transaction(mut self, client_transaction_id: impl Into<String>) -> Self {
        self.client_transaction_id = client_transaction_id.into();
        self
    }

    /// Restrict to a shard.
    pub fn with_shard(mut self, shard_id: impl Into<String>) -> Self {
        self.shard_id = shard_id.into();
        self
    }

    /// Whether `record` is selected.
    pub fn matches(&self, record: &OperationRecord) -> bool {
        if !self.ticket.is_none() {
            return record.ticket == self.ticket;
        }
        (self.client_transaction_id.is_empty()
            || self.client_transaction_id == record.client_transaction_id)
            && (self.coord_transaction_id == 0
                || self.coord_transaction_id == record.coord_transaction_id)
            && (self.shard_id.is_empty() || self.shard_id == record.shard_id)
    }
}

/// A continuation claimed for a settled record, run outside the lock.
type Settlement = (RequestCallback, OperationRecord);

struct Entry {
    record: OperationRecord,
    continuation: Option<RequestCallback>,
    /// A continuation is running on a snapshot of this record.
    settling: bool,
}

impl Entry {
    /// Settled and owned by nobody: a wait may take it.
    fn is_ready(&self) -> bool {
        self.record.status.is_terminal() && self.continuation.is_none() && !self.settling
    }

    /// Claim the continuation of a settled record.
    ///
    /// Must be called under the same lock that made the record terminal.
    fn claim_continuation(&mut self) -> Option<Settlement> {
        if !self.record.status.is_terminal() {
            return None;
        }
        let continuation = self.continuation.take()?;
        self.settling = true;
        Some((continuation, self.record.clone()))
    }
}

/// Concurrent store of tracked operations.
pub(crate) struct OperationRegistry {
    entries: Mutex<BTreeMap<Ticket, Entry>>,
    changed: Condvar,
    wait_poll_interval: Duration,
}

impl OperationRegistry {
    pub(crate) fn new(wait_poll_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            changed: Condvar::new(),
            wait_poll_interval,
        }
    }

    /// Start tracking `record`.
    pub(crate) fn register(
        &self,
        record: OperationRecord,
        continuation: Option<RequestCallback>,
    ) -> Result<(), CommError> {
        let ticket = record.ticket;
        let terminal = record.status.is_terminal();
        let settlement = {
            let mut entries = self.entries.lock();
            if entries.contains_key(&ticket) {
                return Err(CommError::DuplicateTicket { ticket });
            }
            let mut entry = Entry {
                record,
                continuation,
                settling: false,
            };
            let settlement = entry.claim_continuation();
            entries.insert(ticket, entry);
            settlement
        };
        if terminal {
            // Already settled (resolution failure): run the completion path now.
            self.settle(ticket, settlement);
        }
        Ok(())
    }

    /// Snapshot of `ticket`, or a synthetic `Dropped` record.
    pub(crate) fn enquire(&self, ticket: Ticket) -> OperationRecord {
        self.entries
            .lock()
            .get(&ticket)
            .map(|entry| entry.record.clone())
            .unwrap_or_else(|| OperationRecord::dropped(ticket))
    }

    /// Block until an operation selected by `criteria` is settled, then
    /// remove and return it.
    ///
    /// Returns a `Dropped` record at once when nothing matches, and a
    /// `Timeout` record with [`Ticket::NONE`] when `timeout` expires first.
    pub(crate) fn wait(
        &self,
        criteria: &MatchCriteria,
        timeout: Option<Duration>,
    ) -> OperationRecord {
        let deadline = timeout.map(|timeout| deadline_after(Instant::now(), timeout));
        let mut entries = self.entries.lock();
        loop {
            let mut selected = None;
            let mut any_match = false;
            for (ticket, entry) in entries.iter() {
                if criteria.matches(&entry.record) {
                    any_match = true;
                    if entry.is_ready() {
                        selected = Some(*ticket);
                        break;
                    }
                }
            }

            if let Some(ticket) = selected {
                if let Some(entry) = entries.remove(&ticket) {
                    tracing::debug!(
                        ticket = %ticket,
                        status = %entry.record.status,
                        "wait matched"
                    );
                    return entry.record;
                }
            }
            if !any_match {
                return OperationRecord::dropped(criteria.ticket);
            }

            let now = Instant::now();
            let mut wake_at = deadline_after(now, self.wait_poll_interval);
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return OperationRecord::wait_timed_out();
                }
                wake_at = wake_at.min(deadline);
            }
            let _ = self.changed.wait_until(&mut entries, wake_at);
        }
    }

    /// Stop tracking every operation selected by `criteria`.
    ///
    /// Later completions of removed operations are discarded. Returns the
    /// number of operations removed.
    pub(crate) fn drop_matching(&self, criteria: &MatchCriteria) -> usize {
        let removed = {
            let mut entries = self.entries.lock();
            if !criteria.ticket.is_none() {
                usize::from(entries.remove(&criteria.ticket).is_some())
            } else {
                let before = entries.len();
                entries.retain(|_, entry| !criteria.matches(&entry.record));
                before - entries.len()
            }
        };
        if removed > 0 {
            tracing::debug!(?criteria, removed, "dropped operations");
            self.changed.notify_all();
        }
        removed
    }

    /// Move `ticket` to an in-progress `status`.
    pub(crate) fn advance(&self, ticket: Ticket, status: OpStatus) -> bool {
        let (advanced, settlement) = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&ticket) {
                Some(entry) if entry.record.status.can_transition_to(status) => {
                    entry.record.status = status;
                    (true, entry.claim_continuation())
                }
                Some(entry) => {
                    tracing::debug!(
                        ticket = %ticket,
                        from = %entry.record.status,
                        to = %status,
                        "status not advanced"
                    );
                    (false, None)
                }
                None => (false, None),
            }
        };
        if advanced && status.is_terminal() {
            self.settle(ticket, settlement);
        }
        advanced
    }

    /// Apply a completion to `ticket`.
    ///
    /// Completions of unknown (dropped) tickets are discarded and updates
    /// that would move a record backwards are ignored. Returns whether the
    /// record was updated.
    pub(crate) fn complete(&self, ticket: Ticket, outcome: Outcome) -> bool {
        let (terminal, settlement) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&ticket) else {
                tracing::debug!(
                    ticket = %ticket,
                    status = %outcome.status,
                    "completion for dropped operation discarded"
                );
                return false;
            };
            if !entry.record.status.can_transition_to(outcome.status) {
                tracing::warn!(
                    ticket = %ticket,
                    from = %entry.record.status,
                    to = %outcome.status,
                    "ignoring stale completion"
                );
                return false;
            }
            outcome.apply_to(&mut entry.record);
            (entry.record.status.is_terminal(), entry.claim_continuation())
        };
        if terminal {
            self.settle(ticket, settlement);
        } else {
            self.changed.notify_all();
        }
        true
    }

    /// Time out every in-progress operation that is past its deadline plus
    /// `slack` at `now`. Returns how many were timed out.
    pub(crate) fn expire_overdue(&self, now: Instant, slack: Duration) -> usize {
        let overdue: Vec<(Ticket, bool)> = self
            .entries
            .lock()
            .values()
            .filter(|entry| {
                !entry.record.status.is_terminal()
                    && entry
                        .record
                        .deadline
                        .checked_add(slack)
                        .is_some_and(|limit| now >= limit)
            })
            .map(|entry| (entry.record.ticket, entry.record.status == OpStatus::Sent))
            .collect();

        let mut expired = 0;
        for (ticket, send_was_complete) in overdue {
            tracing::debug!(ticket = %ticket, send_was_complete, "operation overdue");
            if self.complete(ticket, Outcome::timed_out(send_was_complete)) {
                expired += 1;
            }
        }
        expired
    }

    /// Number of tracked operations.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is tracked.
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run the claimed continuation of a terminal record, then wake waiters.
    fn settle(&self, ticket: Ticket, settlement: Option<Settlement>) {
        if let Some((continuation, record)) = settlement {
            let processed = continuation(&record);
            let mut entries = self.entries.lock();
            if processed {
                entries.remove(&ticket);
            } else if let Some(entry) = entries.get_mut(&ticket) {
                entry.settling = false;
            }
        }
        self.changed.notify_all();
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("tracked", &self.len())
            .field("wait_poll_interval", &self.wait_poll_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;
    use crate::Response;

    fn record(ticket: u64, client: &str, coord: u64, shard: &str) -> OperationRecord {
        let mut record = OperationRecord::new(Ticket::new(ticket), Duration::from_secs(60));
        record.client_transaction_id = client.to_string();
        record.coord_transaction_id = coord;
        record.shard_id = shard.to_string();
        record
    }

    fn registry() -> OperationRegistry {
        OperationRegistry::new(Duration::from_millis(50))
    }

    #[test]
    fn test_enquire_unknown_is_dropped() {
        let registry = registry();
        let snapshot = registry.enquire(Ticket::new(5));
        assert_eq!(snapshot.status, OpStatus::Dropped);
        assert_eq!(snapshot.ticket, Ticket::new(5));
    }

    #[test]
    fn test_enquire_does_not_remove() {
        let registry = registry();
        registry.register(record(1, "", 0, ""), None).expect("register");
        assert_eq!(registry.enquire(Ticket::new(1)).status, OpStatus::Submitted);
        assert_eq!(registry.enquire(Ticket::new(1)).status, OpStatus::Submitted);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let registry = registry();
        registry.register(record(1, "", 0, ""), None).expect("register");
        let err = registry.register(record(1, "", 0, ""), None);
        assert!(matches!(err, Err(CommError::DuplicateTicket { .. })));
    }

    #[test]
    fn test_wait_returns_received_and_removes() {
        let registry = registry();
        registry.register(record(1, "", 7, ""), None).expect("register");
        registry.complete(Ticket::new(1), Outcome::received(Response::new(200)));

        let result = registry.wait(&MatchCriteria::ticket(Ticket::new(1)), None);
        assert_eq!(result.status, OpStatus::Received);
        assert_eq!(result.answer_code(), Some(200));
        assert!(registry.is_empty());
        assert_eq!(registry.enquire(Ticket::new(1)).status, OpStatus::Dropped);
    }

    #[test]
    fn test_wait_unknown_returns_dropped_immediately() {
        let registry = registry();
        let started = Instant::now();
        let result = registry.wait(&MatchCriteria::coord_transaction(9), None);
        assert_eq!(result.status, OpStatus::Dropped);
        assert!(result.ticket.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_timeout_leaves_record() {
        let registry = registry();
        registry.register(record(1, "", 7, ""), None).expect("register");
        let result = registry.wait(
            &MatchCriteria::coord_transaction(7),
            Some(Duration::from_millis(30)),
        );
        assert_eq!(result.status, OpStatus::Timeout);
        assert!(result.ticket.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_wait_wakes_on_completion() {
        let registry = Arc::new(registry());
        registry.register(record(1, "", 7, ""), None).expect("register");

        let completer = registry.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete(Ticket::new(1), Outcome::received(Response::new(201)));
        });

        let result = registry.wait(
            &MatchCriteria::coord_transaction(7),
            Some(Duration::from_secs(5)),
        );
        handle.join().expect("completer");
        assert_eq!(result.ticket, Ticket::new(1));
        assert_eq!(result.status, OpStatus::Received);
    }

    #[test]
    fn test_wildcard_wait_takes_any_settled_match() {
        let registry = registry();
        registry.register(record(1, "", 7, ""), None).expect("register");
        registry.register(record(2, "", 7, ""), None).expect("register");
        registry.complete(Ticket::new(2), Outcome::received(Response::new(200)));

        let result = registry.wait(&MatchCriteria::coord_transaction(7), None);
        assert_eq!(result.ticket, Ticket::new(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drop_twice_is_noop() {
        let registry = registry();
        registry.register(record(1, "", 0, ""), None).expect("register");
        assert_eq!(registry.drop_matching(&MatchCriteria::ticket(Ticket::new(1))), 1);
        assert_eq!(registry.drop_matching(&MatchCriteria::ticket(Ticket::new(1))), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_completion_after_drop_discarded() {
        let registry = registry();
        registry.register(record(1, "", 0, ""), None).expect("register");
        registry.drop_matching(&MatchCriteria::ticket(Ticket::new(1)));
        assert!(!registry.complete(Ticket::new(1), Outcome::received(Response::new(200))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_terminal_record_never_overwritten() {
        let registry = registry();
        registry.register(record(1, "", 0, ""), None).expect("register");
        assert!(registry.complete(Ticket::new(1), Outcome::timed_out(false)));
        assert!(!registry.complete(Ticket::new(1), Outcome::received(Response::new(200))));
        assert_eq!(registry.enquire(Ticket::new(1)).status, OpStatus::Timeout);
    }

    #[test]
    fn test_continuation_true_removes() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry
            .register(
                record(1, "", 0, ""),
                Some(Box::new(move |record: &OperationRecord| {
                    assert_eq!(record.status, OpStatus::Received);
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                })),
            )
            .expect("register");

        registry.complete(Ticket::new(1), Outcome::received(Response::new(200)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_continuation_false_keeps_record() {
        let registry = registry();
        registry
            .register(record(1, "", 3, ""), Some(Box::new(|_: &OperationRecord| false)))
            .expect("register");
        registry.complete(Ticket::new(1), Outcome::received(Response::new(202)));

        let result = registry.wait(&MatchCriteria::coord_transaction(3), None);
        assert_eq!(result.ticket, Ticket::new(1));
        assert_eq!(result.answer_code(), Some(202));
    }

    #[test]
    fn test_wait_never_takes_record_owned_by_continuation() {
        const RECORDS: u64 = 5_000;
        let registry = Arc::new(registry());
        let stop = Arc::new(AtomicBool::new(false));

        let waiter = {
            let registry = registry.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut taken = 0usize;
                while !stop.load(Ordering::SeqCst) {
                    let result =
                        registry.wait(&MatchCriteria::any(), Some(Duration::from_millis(1)));
                    if result.status == OpStatus::BackendUnavailable {
                        taken += 1;
                    }
                }
                taken
            })
        };

        let calls = Arc::new(AtomicUsize::new(0));
        for ticket in 1..=RECORDS {
            let mut unavailable = record(ticket, "", 0, "");
            unavailable.status = OpStatus::BackendUnavailable;
            let counter = calls.clone();
            registry
                .register(
                    unavailable,
                    Some(Box::new(move |_: &OperationRecord| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        true
                    })),
                )
                .expect("register");
        }

        stop.store(true, Ordering::SeqCst);
        let taken = waiter.join().expect("waiter");
        assert_eq!(taken, 0);
        assert_eq!(calls.load(Ordering::SeqCst), RECORDS as usize);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_wait_with_unbounded_timeout() {
        let registry = Arc::new(registry());
        registry.register(record(1, "", 4, ""), None).expect("register");

        let completer = registry.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete(Ticket::new(1), Outcome::received(Response::new(200)));
        });

        let result = registry.wait(&MatchCriteria::coord_transaction(4), Some(Duration::MAX));
        handle.join().expect("completer");
        assert_eq!(result.ticket, Ticket::new(1));
        assert_eq!(result.status, OpStatus::Received);
    }

    #[test]
    fn test_sent_is_not_settled() {
        let registry = registry();
        registry.register(record(1, "", 3, ""), None).expect("register");
        registry.advance(Ticket::new(1), OpStatus::Sending);
        registry.advance(Ticket::new(1), OpStatus::Sent);

        let result = registry.wait(
            &MatchCriteria::ticket(Ticket::new(1)),
            Some(Duration::from_millis(20)),
        );
        assert_eq!(result.status, OpStatus::Timeout);
        assert_eq!(registry.enquire(Ticket::new(1)).status, OpStatus::Sent);
    }

    #[test]
    fn test_expire_overdue() {
        let registry = registry();
        let mut short = record(1, "", 0, "");
        short.deadline = short.submitted_at;
        short.status = OpStatus::Sent;
        registry.register(short, None).expect("register");
        registry.register(record(2, "", 0, ""), None).expect("register");

        let later = Instant::now() + Duration::from_millis(10);
        let expired = registry.expire_overdue(later, Duration::ZERO);
        assert_eq!(expired, 1);

        let timed_out = registry.enquire(Ticket::new(1));
        assert_eq!(timed_out.status, OpStatus::Timeout);
        assert!(timed_out.send_was_complete);
        assert_eq!(registry.enquire(Ticket::new(2)).status, OpStatus::Submitted);
    }

    #[test]
    fn test_expire_overdue_respects_slack() {
        let registry = registry();
        let mut short = record(1, "", 0, "");
        short.deadline = short.submitted_at;
        registry.register(short, None).expect("register");

        assert_eq!(registry.expire_overdue(Instant::now(), Duration::from_secs(60)), 0);
        assert_eq!(registry.enquire(Ticket::new(1)).status, OpStatus::Submitted);
    }

    proptest! {
        #[test]
        fn drop_removes_exactly_the_matches(
            records in prop::collection::vec(
                (
                    prop::sample::select(vec!["", "a", "b"]),
                    0u64..3,
                    prop::sample::select(vec!["", "s1", "s2"]),
                ),
                1..12,
            ),
            client in prop::sample::select(vec!["", "a", "b"]),
            coord in 0u64..3,
            shard in prop::sample::select(vec!["", "s1", "s2"]),
        ) {
            let registry = registry();
            for (i, (rec_client, rec_coord, rec_shard)) in records.iter().enumerate() {
                registry
                    .register(record(i as u64 + 1, rec_client, *rec_coord, rec_shard), None)
                    .expect("register");
            }
            let criteria = MatchCriteria::coord_transaction(coord)
                .with_client_transaction(client)
                .with_shard(shard);

            let expected = records
                .iter()
                .filter(|(rec_client, rec_coord, rec_shard)| {
                    (client.is_empty() || client == *rec_client)
                        && (coord == 0 || coord == *rec_coord)
                        && (shard.is_empty() || shard == *rec_shard)
                })
                .count();

            prop_assert_eq!(registry.drop_matching(&criteria), expected);
            prop_assert_eq!(registry.len(), records.len() - expected);
            prop_assert_eq!(registry.drop_matching(&criteria), 0);
        }

        #[test]
        fn wildcard_wait_returns_lowest_settled_match(
            coords in prop::collection::vec(0u64..3, 1..10),
            wanted in 1u64..3,
        ) {
            let registry = registry();
            for (i, coord) in coords.iter().enumerate() {
                let ticket = Ticket::new(i as u64 + 1);
                registry
                    .register(record(ticket.get(), "", *coord, ""), None)
                    .expect("register");
                registry.complete(ticket, Outcome::received(Response::new(200)));
            }

            let result = registry.wait(&MatchCriteria::coord_transaction(wanted), None);
            match coords.iter().position(|coord| *coord == wanted) {
                Some(index) => prop_assert_eq!(result.ticket, Ticket::new(index as u64 + 1)),
                None => prop_assert_eq!(result.status, OpStatus::Dropped),
            }
        }
    }
}
