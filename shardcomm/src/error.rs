//! Error types for the shardcomm engine.
//!
//! Request outcomes are never errors: they are reported as statuses on the
//! returned [`OperationRecord`](crate::OperationRecord). These errors cover
//! misuse, malformed out-of-band traffic and engine lifecycle failures.

use crate::Ticket;

/// Errors that can occur in the engine.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// A ticket was registered twice.
    #[error("ticket already registered: {ticket}")]
    DuplicateTicket {
        /// The duplicated ticket.
        ticket: Ticket,
    },

    /// A correlation header could not be parsed.
    #[error("malformed coordinator header '{header}': {reason}")]
    MalformedCoordinatorHeader {
        /// The offending header value.
        header: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// An out-of-band answer carried no usable response code.
    #[error("answer carries no valid response code")]
    MissingResponseCode,

    /// An out-of-band answer referred to an operation nobody tracks.
    #[error("operation {ticket} was already dropped by sender")]
    UnknownOperation {
        /// The ticket from the correlation header.
        ticket: Ticket,
    },

    /// No endpoint is known for a server.
    #[error("cannot find endpoint for server '{server}'")]
    EndpointNotFound {
        /// The server id.
        server: String,
    },

    /// An out-of-band answer could not be delivered.
    #[error("answer delivery failed: {message}")]
    AnswerDelivery {
        /// Summary of the failed delivery.
        message: String,
    },

    /// The background pump thread could not be spawned.
    #[error("failed to spawn pump thread: {0}")]
    PumpSpawn(#[source] std::io::Error),

    /// A configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}
