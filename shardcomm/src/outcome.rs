//! Mapping of transport results onto record updates.

use crate::answer::{ASYNC_HEADER, ASYNC_STORE};
use crate::{OpStatus, OperationRecord, Response, TransportFailure, TransportResult};

/// Update produced by a completion, applied to a record under the
/// registry lock (or directly by the synchronous path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub(crate) status: OpStatus,
    pub(crate) answer: Option<Response>,
    pub(crate) error_message: String,
    pub(crate) send_was_complete: bool,
}

impl Outcome {
    /// Map a transport result for a request with the given `single` flag.
    ///
    /// A non-single request whose response acknowledges storage only moves
    /// to `Sent`; its real answer arrives out-of-band.
    pub(crate) fn from_transport(result: TransportResult, single: bool) -> Self {
        match result {
            Ok(response) => {
                if !single && response.header(ASYNC_HEADER) == Some(ASYNC_STORE) {
                    Self {
                        status: OpStatus::Sent,
                        answer: None,
                        error_message: String::new(),
                        send_was_complete: true,
                    }
                } else {
                    Self::received(response)
                }
            }
            Err(failure) => Self::failed(failure),
        }
    }

    /// Answer available.
    pub(crate) fn received(answer: Response) -> Self {
        Self {
            status: OpStatus::Received,
            answer: Some(answer),
            error_message: String::new(),
            send_was_complete: true,
        }
    }

    /// No answer within the deadline.
    pub(crate) fn timed_out(send_was_complete: bool) -> Self {
        Self {
            status: OpStatus::Timeout,
            answer: None,
            error_message: "timeout".to_string(),
            send_was_complete,
        }
    }

    pub(crate) fn failed(failure: TransportFailure) -> Self {
        let error_message = failure.to_string();
        match failure {
            TransportFailure::ConnectFailed { .. } | TransportFailure::Aborted => Self {
                status: OpStatus::BackendUnavailable,
                answer: None,
                error_message,
                send_was_complete: false,
            },
            TransportFailure::Timeout { send_complete } => Self {
                status: OpStatus::Timeout,
                answer: None,
                error_message,
                send_was_complete: send_complete,
            },
            TransportFailure::Http(response) => Self {
                status: OpStatus::Error,
                answer: Some(response),
                error_message,
                send_was_complete: true,
            },
            TransportFailure::Protocol { .. } => Self {
                status: OpStatus::Error,
                answer: None,
                error_message,
                send_was_complete: true,
            },
        }
    }

    /// Whether the destination could not be reached at all.
    pub(crate) fn is_connection_failure(&self) -> bool {
        self.status == OpStatus::BackendUnavailable
    }

    pub(crate) fn apply_to(self, record: &mut OperationRecord) {
        record.status = self.status;
        if self.answer.is_some() {
            record.answer = self.answer;
        }
        if !self.error_message.is_empty() {
            record.error_message = self.error_message;
        }
        record.send_was_complete = self.send_was_complete;
    }
}
