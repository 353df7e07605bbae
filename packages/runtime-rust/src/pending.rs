//! Pending-request table for request/reply correlation.
//!
//! Every `request` mints a unique reply address and parks a oneshot sender
//! under it. The entry is claimed by removing it from the map: whichever of
//! reply delivery or timeout removes it first wins, the other finds nothing.

use std::time::Instant;

use dashmap::DashMap;
use relay_core::clock::round_millis;
use relay_core::Envelope;
use tokio::sync::oneshot;

/// Reply addresses start with this prefix. It cannot appear in a valid route name.
pub(crate) const REPLY_PREFIX: &str = "r:";

pub(crate) fn is_reply_address(address: &str) -> bool {
    address.starts_with(REPLY_PREFIX)
}

struct PendingRequest {
    route: String,
    correlation_id: Option<String>,
    sent_at: Instant,
    sender: oneshot::Sender<Envelope>,
}

/// Outstanding calls keyed by reply address.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: DashMap<String, PendingRequest>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Parks a waiter for a call to `route`. Returns its reply address.
    pub(crate) fn register(
        &self,
        route: &str,
        correlation_id: Option<String>,
    ) -> (String, oneshot::Receiver<Envelope>) {
        let address = format!("{REPLY_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let (sender, receiver) = oneshot::channel();
        self.entries.insert(
            address.clone(),
            PendingRequest {
                route: route.to_string(),
                correlation_id,
                sent_at: Instant::now(),
                sender,
            },
        );
        (address, receiver)
    }

    /// Hands `reply` to the waiter at `address`.
    ///
    /// Returns `false` when the entry was already claimed (late reply).
    pub(crate) fn complete(&self, address: &str, mut reply: Envelope) -> bool {
        let Some((_, pending)) = self.entries.remove(address) else {
            tracing::debug!(address, "late reply discarded");
            return false;
        };
        reply.round_trip = round_millis(pending.sent_at.elapsed());
        if reply.correlation_id.is_none() {
            reply.correlation_id = pending.correlation_id;
        }
        if pending.sender.send(reply).is_err() {
            tracing::debug!(address, route = %pending.route, "waiter dropped before reply");
        }
        true
    }

    /// Claims the entry on deadline. Returns `false` if a reply claimed it first.
    pub(crate) fn expire(&self, address: &str) -> bool {
        self.entries.remove(address).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops every waiter; their receivers resolve with a closed error.
    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}
