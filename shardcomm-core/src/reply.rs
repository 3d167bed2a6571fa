//! ReplyPromise / ReplyFuture: one-shot completion for a submitted request.
//!
//! The transport receives a [`ReplyPromise`] with every submission and must
//! fulfil it exactly once with [`ReplyPromise::succeed`] or
//! [`ReplyPromise::fail`]. If the promise is dropped unfulfilled, an
//! [`TransportFailure::Aborted`] is delivered automatically.
//!
//! The receiving side is either a continuation passed to
//! [`ReplyPromise::new`] or a [`ReplyFuture`] obtained from
//! [`reply_channel`]. A `ReplyFuture` can be waited on from a blocking
//! thread or awaited as a [`Future`].
//!
//! # Example
//!
//! ```
//! use shardcomm_core::{Response, Ticket, reply_channel};
//!
//! let (promise, future) = reply_channel(Ticket::new(7));
//! std::thread::spawn(move || promise.succeed(Response::new(200)));
//! let result = future.wait();
//! assert_eq!(result.map(|r| r.code), Ok(200));
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::deadline::deadline_after;
use crate::transport::{TransportFailure, TransportResult};
use crate::types::{Response, Ticket};

type ReplySender = Box<dyn FnOnce(TransportResult) + Send>;

/// Sending half of a request's completion.
///
/// Consumed on fulfilment, so a result is delivered at most once.
pub struct ReplyPromise {
    ticket: Ticket,
    sender: Option<ReplySender>,
}

impl ReplyPromise {
    /// Create a promise that hands its result to `sender`.
    pub fn new<F>(ticket: Ticket, sender: F) -> Self
    where
        F: FnOnce(TransportResult) + Send + 'static,
    {
        Self {
            ticket,
            sender: Some(Box::new(sender)),
        }
    }

    /// Ticket of the operation this promise completes.
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Deliver a response.
    pub fn succeed(mut self, response: Response) {
        self.fulfil(Ok(response));
    }

    /// Deliver a failure.
    pub fn fail(mut self, failure: TransportFailure) {
        self.fulfil(Err(failure));
    }

    fn fulfil(&mut self, result: TransportResult) {
        if let Some(sender) = self.sender.take() {
            sender(result);
        }
    }
}

impl std::fmt::Debug for ReplyPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyPromise")
            .field("ticket", &self.ticket)
            .field("fulfilled", &self.sender.is_none())
            .finish()
    }
}

impl Drop for ReplyPromise {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            tracing::warn!(
                ticket = %self.ticket,
                "ReplyPromise dropped without fulfillment - reporting Aborted"
            );
            sender(Err(TransportFailure::Aborted));
        }
    }
}

struct SlotState {
    value: Option<TransportResult>,
    waker: Option<Waker>,
}

struct ReplySlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl ReplySlot {
    fn put(&self, result: TransportResult) {
        let waker = {
            let mut state = self.state.lock();
            state.value = Some(result);
            state.waker.take()
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Receiving half of a request's completion.
pub struct ReplyFuture {
    ticket: Ticket,
    slot: Arc<ReplySlot>,
}

impl ReplyFuture {
    /// Ticket of the operation this future observes.
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Take the result if it has already arrived.
    pub fn try_take(&self) -> Option<TransportResult> {
        self.slot.state.lock().value.take()
    }

    /// Block until the result arrives.
    ///
    /// Always returns: an unfulfilled promise reports `Aborted` when dropped.
    pub fn wait(self) -> TransportResult {
        let mut state = self.slot.state.lock();
        loop {
            if let Some(result) = state.value.take() {
                return result;
            }
            self.slot.ready.wait(&mut state);
        }
    }

    /// Block until the result arrives or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TransportResult> {
        let deadline = deadline_after(Instant::now(), timeout);
        let mut state = self.slot.state.lock();
        loop {
            if let Some(result) = state.value.take() {
                return Some(result);
            }
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                return state.value.take();
            }
        }
    }
}

impl Future for ReplyFuture {
    type Output = TransportResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.state.lock();
        match state.value.take() {
            Some(result) => Poll::Ready(result),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Create a connected promise/future pair for `ticket`.
pub fn reply_channel(ticket: Ticket) -> (ReplyPromise, ReplyFuture) {
    let slot = Arc::new(ReplySlot {
        state: Mutex::new(SlotState {
            value: None,
            waker: None,
        }),
        ready: Condvar::new(),
    });
    let sink = slot.clone();
    let promise = ReplyPromise::new(ticket, move |result| sink.put(result));
    (promise, ReplyFuture { ticket, slot })
}
