//! Transport collaborator abstraction.
//!
//! The engine never touches sockets. It hands fully prepared requests to a
//! [`Transport`] and lets a background thread drive the transport's event
//! loop. Results come back through the [`ReplyPromise`] attached to each
//! submission.

use std::time::Duration;

use thiserror::Error;

use crate::reply::ReplyPromise;
use crate::types::{Request, Response, Ticket};

/// Result delivered through a [`ReplyPromise`].
pub type TransportResult = Result<Response, TransportFailure>;

/// Ways a submitted request can fail inside the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFailure {
    /// No connection could be established.
    #[error("cannot connect: {message}")]
    ConnectFailed {
        /// Details from the transport.
        message: String,
    },

    /// The request was abandoned by the transport (shutdown, broken promise).
    #[error("request aborted")]
    Aborted,

    /// No answer arrived within the allotted time.
    #[error("request timed out (send complete: {send_complete})")]
    Timeout {
        /// Whether the request fully left the local side.
        send_complete: bool,
    },

    /// The peer answered with an HTTP-level error.
    #[error("HTTP error, status {}", .0.code)]
    Http(Response),

    /// The exchange failed at the protocol level.
    #[error("protocol error: {message}")]
    Protocol {
        /// Details from the transport.
        message: String,
    },
}

/// Per-request limits passed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// How long establishing the connection and sending may take.
    pub connect_timeout: Duration,
    /// How long the whole round trip may take.
    pub request_timeout: Duration,
}

/// A request ready for the transport.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Operation the request belongs to.
    pub ticket: Ticket,
    /// Absolute URL, e.g. `http://10.0.0.1:8529/_api/document/c/1`.
    pub url: String,
    /// The request itself.
    pub request: Request,
    /// Timeouts.
    pub options: TransportOptions,
}

/// Transport collaborator performing the actual I/O.
///
/// Implementations must be safe to call from caller threads (`submit`) and
/// the pump thread (`drive_once`, `wait_for_activity`) concurrently.
pub trait Transport: Send + Sync + 'static {
    /// Queue a request. Never blocks on I/O.
    ///
    /// The transport fulfils `reply` exactly once, from whatever thread
    /// completes the request.
    fn submit(&self, submission: Submission, reply: ReplyPromise);

    /// Perform one iteration of the event loop.
    ///
    /// Returns the number of requests completed during this iteration.
    fn drive_once(&self) -> usize;

    /// Block until there is work to do or `max_wait` elapses.
    fn wait_for_activity(&self, max_wait: Duration);

    /// Wake a thread blocked in [`Transport::wait_for_activity`].
    fn wake(&self);
}

/// Source of the `authorization` header value attached to outbound requests.
pub trait TokenSource: Send + Sync + 'static {
    /// Current authorization value, `None` to send no header.
    fn authorization(&self) -> Option<String>;
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn authorization(&self) -> Option<String> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        assert_eq!(
            TransportFailure::ConnectFailed {
                message: "refused".to_string()
            }
            .to_string(),
            "cannot connect: refused"
        );
        assert_eq!(
            TransportFailure::Http(Response::new(503)).to_string(),
            "HTTP error, status 503"
        );
        assert_eq!(TransportFailure::Aborted.to_string(), "request aborted");
    }

    #[test]
    fn test_closure_token_source() {
        let source = || Some("bearer abc".to_string());
        assert_eq!(source.authorization().as_deref(), Some("bearer abc"));
    }
}
