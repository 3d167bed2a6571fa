//! Batch coordinator: fan out independent requests under one deadline.
//!
//! Every request of a batch shares a fresh coordinator transaction id. The
//! coordinator sends whatever is due, then waits on the registry for any
//! completion of that transaction until the next request becomes due again.
//!
//! ```text
//! outcome                                   action
//! ──────────────────────────────────────    ───────────────────────────────
//! Received                                  done (good on 200/201/202)
//! BackendUnavailable                        resend at now + backoff(elapsed)
//! Timeout, send incomplete                  resend at now + backoff(elapsed)
//! anything else                             done
//! resend time past the deadline             done
//! ```
//!
//! When the deadline passes first, every remaining operation of the
//! transaction is dropped and the summary reports what completed.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::dispatcher::{Dispatcher, OutboundRequest, effective_timeout};
use crate::registry::MatchCriteria;
use crate::{
    CoordTransactionId, Directory, Method, OpStatus, OperationRecord, Ticket, Transport,
    deadline_after, is_success_code,
};

/// One request of a batch.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// `shard:<id>`, `server:<id>` or a raw endpoint.
    pub destination: String,
    /// Request method.
    pub method: Method,
    /// Path below the endpoint.
    pub path: String,
    /// Request body.
    pub body: Bytes,
    /// Header fields.
    pub headers: HashMap<String, String>,
    /// Set once the request needs no further attempts.
    pub done: bool,
    /// Last observed outcome.
    pub result: Option<OperationRecord>,
}

impl BatchRequest {
    /// Create a request with no body and no headers.
    pub fn new(destination: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            method,
            path: path.into(),
            body: Bytes::new(),
            headers: HashMap::new(),
            done: false,
            result: None,
        }
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header field.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Status of the last observed outcome.
    pub fn status(&self) -> Option<OpStatus> {
        self.result.as_ref().map(|result| result.status)
    }

    fn outbound(&self, coord_transaction_id: CoordTransactionId) -> OutboundRequest {
        OutboundRequest::new(self.destination.clone(), self.method, self.path.clone())
            .with_body(self.body.clone())
            .with_headers(self.headers.clone())
            .with_transaction("", coord_transaction_id)
    }
}

/// Counts reported by a batch.
///
/// `done < requests.len()` means the deadline passed first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Requests answered with 200, 201 or 202.
    pub good: usize,
    /// Requests that need no further attempts.
    pub done: usize,
}

/// Run a batch to completion or deadline.
pub(crate) fn perform_requests<T: Transport, D: Directory>(
    dispatcher: &Dispatcher<T, D>,
    requests: &mut [BatchRequest],
    timeout: Duration,
) -> BatchSummary {
    if requests.is_empty() {
        return BatchSummary::default();
    }
    if requests.len() == 1 && dispatcher.config().single_request_fast_path {
        return perform_single_request(dispatcher, &mut requests[0], timeout);
    }

    for request in requests.iter_mut() {
        request.done = false;
        request.result = None;
    }

    let coord_transaction_id = dispatcher.next_transaction_id();
    let mut summary = BatchSummary::default();
    let timeout = effective_timeout(timeout);
    let finished = catch_unwind(AssertUnwindSafe(|| {
        run_batch(dispatcher, requests, coord_transaction_id, timeout, &mut summary)
    }));

    match finished {
        Ok(true) => {
            tracing::debug!(coord_transaction_id, ?summary, "batch complete");
            return summary;
        }
        Ok(false) => {
            tracing::debug!(coord_transaction_id, ?summary, "batch deadline reached");
        }
        Err(_) => {
            tracing::error!(coord_transaction_id, ?summary, "batch aborted by panic, ignoring");
        }
    }

    dispatcher
        .registry()
        .drop_matching(&MatchCriteria::coord_transaction(coord_transaction_id));
    summary
}

/// Returns `true` when every request is done before the deadline.
fn run_batch<T: Transport, D: Directory>(
    dispatcher: &Dispatcher<T, D>,
    requests: &mut [BatchRequest],
    coord_transaction_id: CoordTransactionId,
    timeout: Duration,
    summary: &mut BatchSummary,
) -> bool {
    let retry = &dispatcher.config().retry;
    let drop_nap = dispatcher.config().drop_nap;
    let criteria = MatchCriteria::coord_transaction(coord_transaction_id);

    let start = Instant::now();
    let end = deadline_after(start, timeout);
    let mut due = vec![start; requests.len()];
    let mut by_ticket: HashMap<Ticket, usize> = HashMap::new();
    let mut now = start;

    while now <= end {
        if summary.done >= requests.len() {
            return true;
        }

        // Send whatever is due.
        for (index, request) in requests.iter().enumerate() {
            if request.done || now < due[index] {
                continue;
            }
            let elapsed = now.saturating_duration_since(start);
            let remaining = end
                .saturating_duration_since(now)
                .max(Duration::from_millis(1));
            let connect_timeout = retry.connect_timeout(elapsed, remaining);
            due[index] = deadline_after(end, retry.resend_guard);

            tracing::trace!(
                destination = %request.destination,
                path = %request.path,
                "sending batch request"
            );
            let ticket = dispatcher.async_request(
                request
                    .outbound(coord_transaction_id)
                    .with_timeout(remaining)
                    .with_init_timeout(connect_timeout),
                None,
            );
            by_ticket.insert(ticket, index);
        }

        let mut action_needed = requests
            .iter()
            .zip(&due)
            .filter(|(request, _)| !request.done)
            .map(|(_, due)| *due)
            .min()
            .map_or(end, |due| due.min(end));

        loop {
            now = Instant::now();
            if now >= action_needed {
                break;
            }
            let result = dispatcher
                .registry()
                .wait(&criteria, Some(action_needed - now));

            if result.status == OpStatus::Timeout && result.ticket.is_none() {
                break;
            }
            if result.status == OpStatus::Dropped {
                // Nothing of ours in flight.
                now = Instant::now();
                if now >= action_needed {
                    break;
                }
                std::thread::sleep(drop_nap.min(action_needed - now));
                continue;
            }

            let Some(&index) = by_ticket.get(&result.ticket) else {
                tracing::error!(
                    ticket = %result.ticket,
                    "received response for a request we did not send"
                );
                continue;
            };

            now = Instant::now();
            let request = &mut requests[index];
            match result.status {
                OpStatus::Received => {
                    let code = result.answer_code();
                    request.done = true;
                    summary.done += 1;
                    if code.is_some_and(is_success_code) {
                        summary.good += 1;
                    }
                    tracing::trace!(destination = %request.destination, ?code, "batch answer");
                }
                OpStatus::BackendUnavailable | OpStatus::Timeout if !result.send_was_complete => {
                    let elapsed = now.saturating_duration_since(start);
                    due[index] = deadline_after(now, retry.backoff(elapsed));
                    if due[index] >= end {
                        request.done = true;
                        summary.done += 1;
                    }
                    action_needed = action_needed.min(due[index]);
                    tracing::trace!(
                        destination = %request.destination,
                        status = %result.status,
                        "batch request will be retried"
                    );
                }
                status => {
                    request.done = true;
                    summary.done += 1;
                    tracing::trace!(
                        destination = %request.destination,
                        %status,
                        "batch request failed"
                    );
                }
            }
            request.result = Some(result);

            if summary.done >= requests.len() {
                return true;
            }
        }
    }
    false
}

/// One-entry batch served by a synchronous request.
///
/// Unreachable destinations, including an HTTP 503, leave the request not
/// done so the caller can retry it.
pub(crate) fn perform_single_request<T: Transport, D: Directory>(
    dispatcher: &Dispatcher<T, D>,
    request: &mut BatchRequest,
    timeout: Duration,
) -> BatchSummary {
    let coord_transaction_id = dispatcher.next_transaction_id();
    let mut result = dispatcher.sync_request(
        request
            .outbound(coord_transaction_id)
            .with_timeout(timeout)
            .single(true),
    );
    request.done = false;

    let unavailable = result.status == OpStatus::BackendUnavailable
        || (result.status == OpStatus::Error && result.answer_code() == Some(503));
    if unavailable {
        result.status = OpStatus::BackendUnavailable;
        request.result = Some(result);
        return BatchSummary::default();
    }

    result.status = OpStatus::Received;
    let good = usize::from(result.answer_code().is_some_and(is_success_code));
    request.done = true;
    request.result = Some(result);
    BatchSummary { good, done: 1 }
}
