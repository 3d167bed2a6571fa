//! Request dispatch: asynchronous (registry tracked) and synchronous.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::answer::{
    ASYNC_HEADER, ASYNC_STORE, AUTHORIZATION_HEADER, COORDINATOR_HEADER, CoordinatorHeader,
};
use crate::config::CommConfig;
use crate::outcome::Outcome;
use crate::registry::{OperationRegistry, RequestCallback};
use crate::resolver::{DestinationResolver, endpoint_url, report_connection_problem};
use crate::ticket::TicketGenerator;
use crate::{
    ClientTransactionId, CoordTransactionId, Directory, Method, NO_TIMEOUT, OpStatus,
    OperationRecord, ReplyPromise, Request, Submission, Ticket, TokenSource, Transport,
    TransportOptions, reply_channel,
};

/// A request to dispatch.
///
/// ```
/// use std::time::Duration;
/// use shardcomm::{Method, OutboundRequest};
///
/// let request = OutboundRequest::new("shard:s1", Method::Put, "/_api/document/c/1")
///     .with_body(r#"{"a":1}"#)
///     .with_header("Content-Type", "application/json")
///     .with_transaction("trx-1", 42)
///     .with_timeout(Duration::from_secs(10));
/// assert_eq!(request.coord_transaction_id, 42);
/// assert!(!request.single);
/// ```
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Client transaction id, may be empty.
    pub client_transaction_id: ClientTransactionId,
    /// Coordinator transaction id, 0 if none.
    pub coord_transaction_id: CoordTransactionId,
    /// `shard:<id>`, `server:<id>`, `tcp://…` or `ssl://…`.
    pub destination: String,
    /// Request method.
    pub method: Method,
    /// Path below the endpoint.
    pub path: String,
    /// Request body.
    pub body: Bytes,
    /// Additional header fields.
    pub headers: HashMap<String, String>,
    /// Overall timeout. Zero means no timeout.
    pub timeout: Duration,
    /// Connection timeout, defaults to `timeout`.
    pub init_timeout: Option<Duration>,
    /// Complete after one round trip instead of awaiting an out-of-band answer.
    pub single: bool,
}

impl OutboundRequest {
    /// Create a request with no body, no headers and no timeout.
    pub fn new(destination: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            client_transaction_id: String::new(),
            coord_transaction_id: 0,
            destination: destination.into(),
            method,
            path: path.into(),
            body: Bytes::new(),
            headers: HashMap::new(),
            timeout: Duration::ZERO,
            init_timeout: None,
            single: false,
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

    /// Replace all header fields.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Set client and coordinator transaction ids.
    pub fn with_transaction(
        mut self,
        client_transaction_id: impl Into<String>,
        coord_transaction_id: CoordTransactionId,
    ) -> Self {
        self.client_transaction_id = client_transaction_id.into();
        self.coord_transaction_id = coord_transaction_id;
        self
    }

    /// Set the overall timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connection timeout.
    pub fn with_init_timeout(mut self, init_timeout: Duration) -> Self {
        self.init_timeout = Some(init_timeout);
        self
    }

    /// Mark as a single round-trip request.
    pub fn single(mut self, single: bool) -> Self {
        self.single = single;
        self
    }
}

/// Zero means "no timeout".
pub(crate) fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() { NO_TIMEOUT } else { timeout }
}

/// Builds records, resolves destinations and hands requests to the transport.
pub(crate) struct Dispatcher<T: Transport, D: Directory> {
    config: CommConfig,
    transport: Arc<T>,
    directory: Arc<D>,
    registry: Arc<OperationRegistry>,
    tickets: TicketGenerator,
    tokens: Option<Arc<dyn TokenSource>>,
}

impl<T: Transport, D: Directory> Dispatcher<T, D> {
    pub(crate) fn new(
        config: CommConfig,
        transport: Arc<T>,
        directory: Arc<D>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            config,
            transport,
            directory,
            registry,
            tickets: TicketGenerator::new(),
            tokens: None,
        }
    }

    pub(crate) fn set_token_source(&mut self, tokens: Arc<dyn TokenSource>) {
        self.tokens = Some(tokens);
    }

    pub(crate) fn config(&self) -> &CommConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub(crate) fn directory(&self) -> &D {
        &self.directory
    }

    /// Fresh coordinator transaction id, never equal to an issued ticket.
    pub(crate) fn next_transaction_id(&self) -> CoordTransactionId {
        self.tickets.next_id()
    }

    /// Submit without blocking and track the operation in the registry.
    ///
    /// The caller must eventually wait for, or drop, the returned ticket
    /// unless `callback` returns `true`.
    pub(crate) fn async_request(
        &self,
        request: OutboundRequest,
        callback: Option<RequestCallback>,
    ) -> Ticket {
        let ticket = self.tickets.next_ticket();
        let timeout = effective_timeout(request.timeout);
        let init_timeout = request
            .init_timeout
            .filter(|init| !init.is_zero())
            .map_or(timeout, |init| init.min(timeout));

        let mut record = self.new_record(ticket, &request, timeout);
        record.single = request.single;

        if record.status.is_terminal() {
            // Unresolvable destination: settle through the registry without
            // touching the network.
            if let Err(err) = self.registry.register(record, callback) {
                tracing::error!(ticket = %ticket, error = %err, "failed to register operation");
            }
            return ticket;
        }

        let submission = self.submission(&record, &request, timeout, init_timeout);
        let server = record.server_id.clone();
        let endpoint = record.endpoint.clone();
        let single = record.single;

        if let Err(err) = self.registry.register(record, callback) {
            tracing::error!(ticket = %ticket, error = %err, "failed to register operation");
            return ticket;
        }
        self.registry.advance(ticket, OpStatus::Sending);

        let registry = self.registry.clone();
        let log_connection_errors = self.config.log_connection_errors;
        let promise = ReplyPromise::new(ticket, move |result| {
            let outcome = Outcome::from_transport(result, single);
            if outcome.is_connection_failure() {
                report_connection_problem(
                    log_connection_errors,
                    &format!(
                        "cannot create connection to server '{server}' at endpoint '{endpoint}'"
                    ),
                );
            }
            registry.complete(ticket, outcome);
        });

        tracing::debug!(ticket = %ticket, url = %submission.url, "submitting request");
        self.transport.submit(submission, promise);
        ticket
    }

    /// Submit and block until the transport answers or the timeout passes.
    ///
    /// The operation is never registered.
    pub(crate) fn sync_request(&self, request: OutboundRequest) -> OperationRecord {
        let ticket = self.tickets.next_ticket();
        let timeout = effective_timeout(request.timeout);

        let mut record = self.new_record(ticket, &request, timeout);
        record.single = true;
        if record.status.is_terminal() {
            return record;
        }

        let submission = self.submission(&record, &request, timeout, timeout);
        let (promise, reply) = reply_channel(ticket);
        tracing::debug!(ticket = %ticket, url = %submission.url, "submitting synchronous request");
        self.transport.submit(submission, promise);
        record.status = OpStatus::Sending;

        let outcome = match reply.wait_timeout(timeout.saturating_add(self.config.timeout_slack)) {
            Some(result) => Outcome::from_transport(result, true),
            None => {
                tracing::debug!(ticket = %ticket, "synchronous request timed out");
                Outcome::timed_out(false)
            }
        };
        if outcome.is_connection_failure() {
            report_connection_problem(
                self.config.log_connection_errors,
                &format!(
                    "cannot create connection to server '{}' at endpoint '{}'",
                    record.server_id, record.endpoint
                ),
            );
        }
        outcome.apply_to(&mut record);
        record
    }

    fn new_record(
        &self,
        ticket: Ticket,
        request: &OutboundRequest,
        timeout: Duration,
    ) -> OperationRecord {
        let mut record = OperationRecord::new(ticket, timeout);
        record.client_transaction_id = request.client_transaction_id.clone();
        record.coord_transaction_id = request.coord_transaction_id;
        DestinationResolver::new(&*self.directory, self.config.log_connection_errors)
            .resolve(&request.destination)
            .apply_to(&mut record);
        record
    }

    fn submission(
        &self,
        record: &OperationRecord,
        request: &OutboundRequest,
        timeout: Duration,
        init_timeout: Duration,
    ) -> Submission {
        Submission {
            ticket: record.ticket,
            url: endpoint_url(&record.endpoint, &request.path),
            request: self.prepare(record, request),
            options: TransportOptions {
                connect_timeout: init_timeout,
                request_timeout: timeout,
            },
        }
    }

    /// Copy the request and add authorization and correlation headers.
    fn prepare(&self, record: &OperationRecord, request: &OutboundRequest) -> Request {
        let mut prepared =
            Request::new(request.method, request.path.clone()).with_body(request.body.clone());
        for (name, value) in &request.headers {
            prepared = prepared.with_header(name, value.clone());
        }
        let authorization = self.tokens.as_ref().and_then(|tokens| tokens.authorization());
        if let Some(authorization) = authorization {
            prepared = prepared.with_header(AUTHORIZATION_HEADER, authorization);
        }
        if !record.single {
            let correlation = CoordinatorHeader {
                originator: self.config.originator_id.clone(),
                ticket: record.ticket,
                client_transaction_id: record.client_transaction_id.clone(),
                coord_transaction_id: record.coord_transaction_id,
            };
            prepared = prepared
                .with_header(ASYNC_HEADER, ASYNC_STORE)
                .with_header(COORDINATOR_HEADER, correlation.to_string());
        }
        prepared
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::{Response, StaticDirectory, TransportFailure};

    /// Transport that records submissions and answers from a script.
    struct ScriptedTransport {
        submitted: Mutex<Vec<Submission>>,
        reply: Mutex<Option<Result<Response, TransportFailure>>>,
    }

    impl ScriptedTransport {
        fn answering(reply: Option<Result<Response, TransportFailure>>) -> Arc<Self> {
            Arc::new(Self {
                submitted: Mutex::new(Vec::new()),
                reply: Mutex::new(reply),
            })
        }
    }

    impl Transport for ScriptedTransport {
        fn submit(&self, submission: Submission, reply: ReplyPromise) {
            self.submitted.lock().push(submission);
            match self.reply.lock().clone() {
                Some(Ok(response)) => reply.succeed(response),
                Some(Err(failure)) => reply.fail(failure),
                // Keep the promise alive so the caller times out.
                None => std::mem::forget(reply),
            }
        }

        fn drive_once(&self) -> usize {
            0
        }

        fn wait_for_activity(&self, _max_wait: Duration) {}

        fn wake(&self) {}
    }

    fn dispatcher(
        transport: Arc<ScriptedTransport>,
    ) -> Dispatcher<ScriptedTransport, StaticDirectory> {
        let directory = StaticDirectory::new();
        directory.assign_shard("s1", "dbserver-1");
        directory.set_endpoint("dbserver-1", "tcp://h:1");
        let registry = Arc::new(OperationRegistry::new(Duration::from_millis(50)));
        Dispatcher::new(
            CommConfig::local().with_originator_id("crdn-1"),
            transport,
            Arc::new(directory),
            registry,
        )
    }

    #[test]
    fn test_effective_timeout() {
        assert_eq!(effective_timeout(Duration::ZERO), NO_TIMEOUT);
        assert_eq!(effective_timeout(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn test_async_request_prepares_headers() {
        let transport = ScriptedTransport::answering(Some(Ok(Response::new(200))));
        let mut dispatcher = dispatcher(transport.clone());
        dispatcher.set_token_source(Arc::new(|| Some("bearer t".to_string())));

        let ticket = dispatcher.async_request(
            OutboundRequest::new("shard:s1", Method::Get, "/_api/version")
                .with_transaction("trx", 9)
                .with_timeout(Duration::from_secs(5))
                .with_init_timeout(Duration::from_secs(1)),
            None,
        );

        let submitted = transport.submitted.lock();
        let submission = &submitted[0];
        assert_eq!(submission.ticket, ticket);
        assert_eq!(submission.url, "http://h:1/_api/version");
        assert_eq!(submission.options.connect_timeout, Duration::from_secs(1));
        assert_eq!(submission.options.request_timeout, Duration::from_secs(5));
        assert_eq!(submission.request.header("authorization"), Some("bearer t"));
        assert_eq!(submission.request.header(ASYNC_HEADER), Some(ASYNC_STORE));
        assert_eq!(
            submission.request.header(COORDINATOR_HEADER).map(str::to_string),
            Some(format!("crdn-1:{ticket}:trx:9"))
        );

        let record = dispatcher.registry().enquire(ticket);
        assert_eq!(record.status, OpStatus::Received);
        assert_eq!(record.shard_id, "s1");
        assert_eq!(record.server_id, "dbserver-1");
    }

    #[test]
    fn test_single_request_has_no_correlation_header() {
        let transport = ScriptedTransport::answering(Some(Ok(Response::new(200))));
        let dispatcher = dispatcher(transport.clone());
        dispatcher.async_request(
            OutboundRequest::new("server:dbserver-1", Method::Get, "/x").single(true),
            None,
        );
        let submitted = transport.submitted.lock();
        assert_eq!(submitted[0].request.header(COORDINATOR_HEADER), None);
        assert_eq!(submitted[0].request.header(AUTHORIZATION_HEADER), None);
    }

    #[test]
    fn test_unresolvable_destination_never_submits() {
        let transport = ScriptedTransport::answering(Some(Ok(Response::new(200))));
        let dispatcher = dispatcher(transport.clone());
        let ticket =
            dispatcher.async_request(OutboundRequest::new("bogus:foo", Method::Get, "/x"), None);

        assert!(transport.submitted.lock().is_empty());
        let record = dispatcher.registry().enquire(ticket);
        assert_eq!(record.status, OpStatus::BackendUnavailable);

        let sync = dispatcher.sync_request(OutboundRequest::new("shard:nope", Method::Get, "/x"));
        assert_eq!(sync.status, OpStatus::BackendUnavailable);
        assert!(transport.submitted.lock().is_empty());
    }

    #[test]
    fn test_connect_failure_is_backend_unavailable() {
        let transport = ScriptedTransport::answering(Some(Err(TransportFailure::ConnectFailed {
            message: "refused".to_string(),
        })));
        let dispatcher = dispatcher(transport);
        let record = dispatcher.sync_request(OutboundRequest::new("shard:s1", Method::Get, "/x"));
        assert_eq!(record.status, OpStatus::BackendUnavailable);
        assert!(!record.send_was_complete);
    }

    #[test]
    fn test_sync_request_times_out() {
        let transport = ScriptedTransport::answering(None);
        let dispatcher = dispatcher(transport);
        let record = dispatcher.sync_request(
            OutboundRequest::new("shard:s1", Method::Get, "/x")
                .with_timeout(Duration::from_millis(30)),
        );
        assert_eq!(record.status, OpStatus::Timeout);
        assert!(record.answer.is_none());
    }

    #[test]
    fn test_tickets_are_unique() {
        let transport = ScriptedTransport::answering(Some(Ok(Response::new(200))));
        let dispatcher = dispatcher(transport);
        let request = || OutboundRequest::new("shard:s1", Method::Get, "/x");
        let first = dispatcher.async_request(request(), None);
        let second = dispatcher.async_request(request(), None);
        let third = dispatcher.sync_request(request()).ticket;
        assert!(first < second && second < third);
        assert_ne!(dispatcher.next_transaction_id(), third.get());
    }
}
