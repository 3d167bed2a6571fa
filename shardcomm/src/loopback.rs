//! LoopbackTransport: in-process [`Transport`] backed by handler closures.
//!
//! Requests are queued by [`submit`](Transport::submit) and delivered to the
//! handler registered for their endpoint when the pump calls
//! [`drive_once`](Transport::drive_once). A handler either responds, fails
//! the request, or ignores it; ignored requests time out once their
//! request timeout passes.
//!
//! ```text
//! submit ──► queue ──drive_once──► handler(endpoint) ──► Respond / Fail
//!                                        │
//!                                        └─► Ignore ──► parked until timeout
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::resolver::endpoint_url;
use crate::{
    ReplyPromise, Request, Response, Submission, Transport, TransportFailure, deadline_after,
};

/// What a loopback handler does with a request.
#[derive(Debug, Clone)]
pub enum HandlerAction {
    /// Answer with this response.
    Respond(Response),
    /// Fail the request.
    Fail(TransportFailure),
    /// Never answer. The request times out after its request timeout.
    Ignore,
}

type Handler = Arc<dyn Fn(&Request) -> HandlerAction + Send + Sync>;

struct Pending {
    submission: Submission,
    reply: ReplyPromise,
    accepted_at: Instant,
}

struct Parked {
    reply: ReplyPromise,
    expires_at: Instant,
}

#[derive(Default)]
struct LoopbackState {
    handlers: HashMap<String, Handler>,
    queue: VecDeque<Pending>,
    parked: Vec<Parked>,
    woken: bool,
    submitted: u64,
}

/// In-process transport for single-process clusters and tests.
///
/// # Example
///
/// ```
/// use shardcomm::{HandlerAction, LoopbackTransport, Response, TransportFailure};
///
/// let transport = LoopbackTransport::new();
/// transport.register_handler("tcp://h:1", |request| {
///     if request.path == "/down" {
///         HandlerAction::Fail(TransportFailure::Http(Response::new(503)))
///     } else {
///         HandlerAction::Respond(Response::new(200))
///     }
/// });
/// assert_eq!(transport.submitted(), 0);
/// ```
#[derive(Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    activity: Condvar,
}

impl LoopbackTransport {
    /// Create a transport with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve requests for `endpoint` (`tcp://…` or `ssl://…`) with `handler`,
    /// replacing any previous handler.
    pub fn register_handler<F>(&self, endpoint: &str, handler: F)
    where
        F: Fn(&Request) -> HandlerAction + Send + Sync + 'static,
    {
        self.state
            .lock()
            .handlers
            .insert(endpoint_url(endpoint, ""), Arc::new(handler));
    }

    /// Stop serving `endpoint`. Later requests fail to connect.
    pub fn remove_handler(&self, endpoint: &str) -> bool {
        self.state
            .lock()
            .handlers
            .remove(&endpoint_url(endpoint, ""))
            .is_some()
    }

    /// Number of requests submitted so far.
    pub fn submitted(&self) -> u64 {
        self.state.lock().submitted
    }

    fn expire_parked(&self, now: Instant) -> usize {
        let expired: Vec<Parked> = {
            let mut state = self.state.lock();
            let (expired, waiting): (Vec<Parked>, Vec<Parked>) = std::mem::take(&mut state.parked)
                .into_iter()
                .partition(|parked| now >= parked.expires_at);
            state.parked = waiting;
            expired
        };
        let count = expired.len();
        for parked in expired {
            parked.reply.fail(TransportFailure::Timeout {
                send_complete: true,
            });
        }
        count
    }
}

/// `scheme://authority` part of a URL.
fn url_base(url: &str) -> &str {
    let authority_start = url.find("://").map_or(0, |pos| pos + 3);
    match url[authority_start..].find('/') {
        Some(pos) => &url[..authority_start + pos],
        None => url,
    }
}

impl Transport for LoopbackTransport {
    fn submit(&self, submission: Submission, reply: ReplyPromise) {
        {
            let mut state = self.state.lock();
            state.submitted += 1;
            state.queue.push_back(Pending {
                submission,
                reply,
                accepted_at: Instant::now(),
            });
        }
        self.activity.notify_all();
    }

    fn drive_once(&self) -> usize {
        let batch: Vec<(Pending, Option<Handler>)> = {
            let mut state = self.state.lock();
            let queued: Vec<Pending> = state.queue.drain(..).collect();
            queued
                .into_iter()
                .map(|pending| {
                    let handler = state
                        .handlers
                        .get(url_base(&pending.submission.url))
                        .cloned();
                    (pending, handler)
                })
                .collect()
        };

        let mut completed = 0;
        for (pending, handler) in batch {
            let Some(handler) = handler else {
                let message = format!("no listener at {}", url_base(&pending.submission.url));
                pending.reply.fail(TransportFailure::ConnectFailed { message });
                completed += 1;
                continue;
            };
            match handler(&pending.submission.request) {
                HandlerAction::Respond(response) => {
                    pending.reply.succeed(response);
                    completed += 1;
                }
                HandlerAction::Fail(failure) => {
                    pending.reply.fail(failure);
                    completed += 1;
                }
                HandlerAction::Ignore => {
                    let expires_at = deadline_after(
                        pending.accepted_at,
                        pending.submission.options.request_timeout,
                    );
                    self.state.lock().parked.push(Parked {
                        reply: pending.reply,
                        expires_at,
                    });
                }
            }
        }
        completed + self.expire_parked(Instant::now())
    }

    fn wait_for_activity(&self, max_wait: Duration) {
        let mut state = self.state.lock();
        if !state.queue.is_empty() || state.woken {
            state.woken = false;
            return;
        }
        let mut wake_at = deadline_after(Instant::now(), max_wait);
        if let Some(earliest) = state.parked.iter().map(|parked| parked.expires_at).min() {
            wake_at = wake_at.min(earliest);
        }
        let _ = self.activity.wait_until(&mut state, wake_at);
        state.woken = false;
    }

    fn wake(&self) {
        self.state.lock().woken = true;
        self.activity.notify_all();
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackTransport")
            .field("handlers", &state.handlers.len())
            .field("queued", &state.queue.len())
            .field("parked", &state.parked.len())
            .field("submitted", &state.submitted)
            .finish()
    }
}
