//! # shardcomm
//!
//! Operation correlation and batch-retry engine for inter-node requests in a
//! sharded cluster.
//!
//! This crate provides:
//! - **Destination resolution**: `shard:`, `server:` and raw endpoints
//! - **Operation registry**: ticket-keyed tracking with poll, wait and drop
//! - **Dispatch**: asynchronous and synchronous requests over a [`Transport`]
//! - **Batches**: fan-out under one deadline with capped exponential backoff
//! - **Out-of-band answers**: correlation header and answer routing
//!
//! Everything hangs off an explicitly started [`CommEngine`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use shardcomm::{
//!     CommConfig, CommEngine, HandlerAction, LoopbackTransport, Method, OpStatus,
//!     OutboundRequest, Response, StaticDirectory,
//! };
//!
//! let directory = Arc::new(StaticDirectory::new());
//! directory.assign_shard("s1", "dbserver-1");
//! directory.set_endpoint("dbserver-1", "tcp://h:1");
//!
//! let transport = Arc::new(LoopbackTransport::new());
//! transport.register_handler("tcp://h:1", |_request| {
//!     HandlerAction::Respond(Response::new(200).with_body("{}"))
//! });
//!
//! let engine = CommEngine::new(CommConfig::local(), transport, directory);
//! engine.start().expect("pump thread starts");
//!
//! let record = engine.sync_request(
//!     OutboundRequest::new("shard:s1", Method::Get, "/_api/document/c/1")
//!         .with_timeout(Duration::from_secs(5)),
//! );
//! assert_eq!(record.status, OpStatus::Received);
//! assert_eq!(record.answer_code(), Some(200));
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use shardcomm_core::{
    ClientTransactionId, CoordTransactionId, Directory, ErrorCode, Method, NO_TIMEOUT, OpStatus,
    OperationRecord, ParseMethodError, ReplyFuture, ReplyPromise, Request, Response, ServerId,
    ShardId, StaticDirectory, Submission, Ticket, TokenSource, Transport, TransportFailure,
    TransportOptions, TransportResult, deadline_after, is_success_code, reply_channel,
};

// =============================================================================
// Modules
// =============================================================================

/// Out-of-band answers and the correlation header.
pub mod answer;

/// Batch fan-out with retry.
pub mod batch;

/// Engine and retry configuration.
pub mod config;

/// The engine owning registry, dispatcher and pump.
pub mod engine;

/// Error types.
pub mod error;

/// In-process transport.
pub mod loopback;

/// Destination resolution.
pub mod resolver;

/// Ticket-keyed operation registry.
pub mod registry;

mod dispatcher;
mod outcome;
mod pump;
mod ticket;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use answer::{
    ANSWER_PATH, ASYNC_HEADER, ASYNC_STORE, AUTHORIZATION_HEADER, COORDINATOR_HEADER,
    CoordinatorHeader, RESPONSE_CODE_HEADER,
};
pub use batch::{BatchRequest, BatchSummary};
pub use config::{CommConfig, RetryPolicy};
pub use dispatcher::OutboundRequest;
pub use engine::CommEngine;
pub use error::CommError;
pub use loopback::{HandlerAction, LoopbackTransport};
pub use registry::{MatchCriteria, RequestCallback};
pub use resolver::{Destination, DestinationResolver, Resolution, endpoint_url};
