//! # shardcomm-core
//!
//! Core abstractions for the shardcomm coordination engine.
//!
//! This crate provides the types and traits shared between the engine and
//! the collaborators it drives:
//!
//! - **Operation model**: [`Ticket`], [`OpStatus`], [`OperationRecord`]
//! - **Wire-neutral messages**: [`Request`], [`Response`], [`Method`]
//! - **Collaborator traits**: [`Transport`], [`Directory`], [`TokenSource`]
//! - **Completion primitive**: [`ReplyPromise`] / [`ReplyFuture`]
//!
//! ## Collaborators
//!
//! The engine never performs socket I/O or cluster lookups itself. It
//! consumes them through narrow traits:
//!
//! - [`Transport`]: submits requests and drives the I/O event loop
//! - [`Directory`]: maps shards to servers and servers to endpoints
//! - [`TokenSource`]: supplies the authorization header value
//!
//! [`StaticDirectory`] is an in-memory [`Directory`] for single-process
//! deployments and tests.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod deadline;
mod directory;
mod record;
mod reply;
mod status;
mod transport;
mod types;

// Deadline exports
pub use deadline::{NO_TIMEOUT, deadline_after};

// Directory exports
pub use directory::{Directory, StaticDirectory};

// Operation model exports
pub use record::OperationRecord;
pub use status::{ErrorCode, OpStatus};
pub use types::{
    ClientTransactionId, CoordTransactionId, Method, ParseMethodError, Request, Response,
    ServerId, ShardId, Ticket, is_success_code,
};

// Completion primitive exports
pub use reply::{ReplyFuture, ReplyPromise, reply_channel};

// Transport exports
pub use transport::{
    Submission, TokenSource, Transport, TransportFailure, TransportOptions, TransportResult,
};
