//! CommEngine: explicitly owned coordination engine.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► with_token_source() ──► start() ──► ... ──► shutdown() / drop
//! ```
//!
//! Requests may be issued before `start`, but nothing reaches the network
//! until the pump drives the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::answer::{ANSWER_PATH, CoordinatorHeader, answer_from_parts, answer_headers};
use crate::batch::{self, BatchRequest, BatchSummary};
use crate::config::CommConfig;
use crate::dispatcher::{Dispatcher, OutboundRequest};
use crate::error::CommError;
use crate::outcome::Outcome;
use crate::pump::BackgroundPump;
use crate::registry::{MatchCriteria, OperationRegistry, RequestCallback};
use crate::resolver::report_connection_problem;
use crate::{Directory, Method, OpStatus, OperationRecord, Response, Ticket, TokenSource, Transport};

/// The coordination engine.
///
/// Owns the operation registry, the dispatcher and the pump thread. All
/// methods take `&self`; share the engine with `Arc` across threads.
pub struct CommEngine<T: Transport, D: Directory> {
    dispatcher: Dispatcher<T, D>,
    transport: Arc<T>,
    registry: Arc<OperationRegistry>,
    pump: Mutex<Option<BackgroundPump>>,
}

impl<T: Transport, D: Directory> CommEngine<T, D> {
    /// Create an engine. Call [`start`](Self::start) to run the pump.
    pub fn new(config: CommConfig, transport: Arc<T>, directory: Arc<D>) -> Self {
        let registry = Arc::new(OperationRegistry::new(config.wait_poll_interval));
        let dispatcher = Dispatcher::new(config, transport.clone(), directory, registry.clone());
        Self {
            dispatcher,
            transport,
            registry,
            pump: Mutex::new(None),
        }
    }

    /// Attach authorization headers from `tokens` to every request.
    pub fn with_token_source(mut self, tokens: impl TokenSource) -> Self {
        self.dispatcher.set_token_source(Arc::new(tokens));
        self
    }

    /// Start the pump thread. Starting a running engine does nothing.
    pub fn start(&self) -> Result<(), CommError> {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return Ok(());
        }
        let config = self.dispatcher.config();
        *pump = Some(BackgroundPump::spawn(
            self.transport.clone(),
            self.registry.clone(),
            config.idle_interval,
            config.timeout_slack,
        )?);
        tracing::info!(originator = %config.originator_id, "engine started");
        Ok(())
    }

    /// Stop the pump thread and wait for it. Tracked operations stay in the
    /// registry.
    pub fn shutdown(&self) {
        if let Some(mut pump) = self.pump.lock().take() {
            pump.shutdown();
            tracing::info!("engine stopped");
        }
    }

    /// Whether the pump is running.
    pub fn is_running(&self) -> bool {
        self.pump.lock().is_some()
    }

    /// Active configuration.
    pub fn config(&self) -> &CommConfig {
        self.dispatcher.config()
    }

    /// Number of operations currently tracked.
    pub fn pending_operations(&self) -> usize {
        self.registry.len()
    }

    /// Whether no operation is tracked.
    pub fn is_idle(&self) -> bool {
        self.registry.is_empty()
    }

    /// Submit a request without blocking.
    ///
    /// Without a callback the caller must eventually [`wait`](Self::wait)
    /// for, [`enquire`](Self::enquire) and drop, or
    /// [`drop_matching`](Self::drop_matching) the returned ticket. A callback
    /// returning `true` removes the operation itself.
    pub fn async_request(
        &self,
        request: OutboundRequest,
        callback: Option<RequestCallback>,
    ) -> Ticket {
        self.dispatcher.async_request(request, callback)
    }

    /// Submit a single round-trip request and block until it settles.
    pub fn sync_request(&self, request: OutboundRequest) -> OperationRecord {
        self.dispatcher.sync_request(request)
    }

    /// Current state of `ticket` without removing it.
    pub fn enquire(&self, ticket: Ticket) -> OperationRecord {
        self.registry.enquire(ticket)
    }

    /// Block until an operation selected by `criteria` settles, then remove
    /// and return it.
    ///
    /// Returns a `Dropped` record at once if nothing matches. With a
    /// `timeout`, returns a `Timeout` record with [`Ticket::NONE`] when it
    /// expires; without one, waits as long as it takes.
    pub fn wait(&self, criteria: &MatchCriteria, timeout: Option<Duration>) -> OperationRecord {
        self.registry.wait(criteria, timeout)
    }

    /// Stop tracking every operation selected by `criteria`. Idempotent.
    ///
    /// In-flight operations still run to completion but their results are
    /// discarded. Returns the number of operations removed.
    pub fn drop_matching(&self, criteria: &MatchCriteria) -> usize {
        self.registry.drop_matching(criteria)
    }

    /// Run a batch of independent requests under one deadline, retrying
    /// unreachable destinations with capped exponential backoff.
    pub fn perform_requests(
        &self,
        requests: &mut [BatchRequest],
        timeout: Duration,
    ) -> BatchSummary {
        batch::perform_requests(&self.dispatcher, requests, timeout)
    }

    /// Route an out-of-band answer to the operation named by
    /// `coordinator_header`, returning its ticket.
    pub fn process_answer(
        &self,
        coordinator_header: &str,
        headers: HashMap<String, String>,
        body: Bytes,
    ) -> Result<Ticket, CommError> {
        let correlation = CoordinatorHeader::parse(coordinator_header)?;
        let ticket = correlation.ticket;
        let answer = answer_from_parts(headers, body)?;
        tracing::debug!(ticket = %ticket, code = answer.code, "out-of-band answer");

        if self.registry.complete(ticket, Outcome::received(answer)) {
            Ok(ticket)
        } else {
            Err(CommError::UnknownOperation { ticket })
        }
    }

    /// Deliver `response` to the originator named by `coordinator_header`.
    pub fn async_answer(
        &self,
        coordinator_header: &str,
        response: &Response,
    ) -> Result<(), CommError> {
        let correlation = CoordinatorHeader::parse(coordinator_header)?;
        let log_connection_errors = self.config().log_connection_errors;

        let endpoint = self
            .dispatcher
            .directory()
            .server_endpoint(&correlation.originator)
            .ok_or_else(|| {
                report_connection_problem(
                    log_connection_errors,
                    &format!(
                        "cannot find endpoint for server '{}' to send answer",
                        correlation.originator
                    ),
                );
                CommError::EndpointNotFound {
                    server: correlation.originator.clone(),
                }
            })?;

        tracing::debug!(
            originator = %correlation.originator,
            ticket = %correlation.ticket,
            "sending answer"
        );
        let request = OutboundRequest::new(endpoint, Method::Put, ANSWER_PATH)
            .with_body(response.body.clone())
            .with_headers(answer_headers(coordinator_header, response))
            .with_timeout(self.config().answer_timeout)
            .single(true);

        let record = self.dispatcher.sync_request(request);
        if record.status == OpStatus::Received {
            return Ok(());
        }
        let message = record.describe_error();
        report_connection_problem(
            log_connection_errors,
            &format!("cannot deliver answer to '{}': {message}", correlation.originator),
        );
        Err(CommError::AnswerDelivery { message })
    }
}

impl<T: Transport, D: Directory> Drop for CommEngine<T, D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Transport, D: Directory> std::fmt::Debug for CommEngine<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommEngine")
            .field("originator", &self.config().originator_id)
            .field("running", &self.is_running())
            .field("registry", &self.registry)
            .finish()
    }
}
