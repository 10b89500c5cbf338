use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How long an issued ticket stays redeemable.
pub const TICKET_TTL: Duration = Duration::from_secs(30);

/// Maximum number of issued, unredeemed tickets.
const MAX_PENDING_TICKETS: usize = 1024;

/// Single-use tickets that stand in for the bearer token on WebSocket URLs.
///
/// Browsers cannot set an `Authorization` header on a WebSocket handshake,
/// and anything in the URL ends up in access logs. A client holding the
/// token asks `POST /auth/ws-ticket` for a ticket and connects with
/// `?ticket=<ticket>`; the ticket is consumed by that upgrade and expires
/// after [`TICKET_TTL`] either way.
#[derive(Debug, Default)]
pub struct TicketStore {
    inner: Mutex<HashMap<String, Instant>>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a ticket, or `None` when too many are outstanding.
    pub fn issue(&self) -> Option<String> {
        let mut map = self.inner.lock();

        let now = Instant::now();
        map.retain(|_, issued| now.duration_since(*issued) < TICKET_TTL);
        if map.len() >= MAX_PENDING_TICKETS {
            return None;
        }

        let ticket = uuid::Uuid::new_v4().simple().to_string();
        map.insert(ticket.clone(), now);
        Some(ticket)
    }

    /// Consume a ticket. True only for a ticket that was issued, has not
    /// been redeemed before and has not expired.
    pub fn redeem(&self, ticket: &str) -> bool {
        match self.inner.lock().remove(ticket) {
            Some(issued) => issued.elapsed() < TICKET_TTL,
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().len()
    }
}
