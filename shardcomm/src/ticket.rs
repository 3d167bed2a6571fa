//! Process-unique ticket issuance.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::Ticket;

/// Monotonic source of tickets and coordinator transaction ids.
///
/// Starts at 1 so that 0 stays reserved for "no ticket".
#[derive(Debug)]
pub(crate) struct TicketGenerator {
    next: AtomicU64,
}

impl TicketGenerator {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_ticket(&self) -> Ticket {
        Ticket::new(self.next_id())
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TicketGenerator {
    fn default() -> Self {
        Self::new()
    }
}
