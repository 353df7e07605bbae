//! Route pool lifecycle and slot bookkeeping.
//!
//! A route pool moves `Starting -> Ready -> Draining -> Released`. Work is
//! counted from the moment the manager assigns an envelope to a slot until the
//! slot drops its [`WorkTicket`], so an envelope parked in a slot's channel
//! still holds the route open during a release.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::watch;

/// Route pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    /// Slots are being spawned.
    Starting,
    /// Accepting work.
    Ready,
    /// Removed from the registry; assigned work may still finish.
    Draining,
    /// Every assigned envelope has been processed.
    Released,
}

/// State of one worker slot.
///
/// `Idle -> Busy -> Idle` once the slot signals ready; `Released` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
    /// Crashed, waiting out the restart grace.
    Restarting,
    Released,
}

#[derive(Debug)]
pub struct RouteLifecycle {
    state: ArcSwap<RouteState>,
    stop: watch::Sender<bool>,
    assigned: watch::Sender<usize>,
    slots: Mutex<Vec<SlotState>>,
}

impl RouteLifecycle {
    #[must_use]
    pub fn new(pool_size: usize) -> Self {
        Self {
            state: ArcSwap::from_pointee(RouteState::Starting),
            stop: watch::Sender::new(false),
            assigned: watch::Sender::new(0),
            slots: Mutex::new(vec![SlotState::Idle; pool_size]),
        }
    }

    #[must_use]
    pub fn state(&self) -> RouteState {
        **self.state.load()
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(RouteState::Ready));
    }

    /// Receiver the pool manager watches for the stop order.
    #[must_use]
    pub fn stop_receiver(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Refuses new work and tells the manager to stop.
    pub fn begin_drain(&self) {
        self.state.store(Arc::new(RouteState::Draining));
        self.stop.send_replace(true);
    }

    /// Marks slot `instance` busy and counts the envelope handed to it.
    #[must_use]
    pub fn assign(self: &Arc<Self>, instance: usize) -> WorkTicket {
        self.set_slot(instance, SlotState::Busy);
        self.assigned.send_modify(|n| *n += 1);
        WorkTicket {
            lifecycle: Arc::clone(self),
        }
    }

    /// Envelopes assigned to slots and not yet finished.
    #[must_use]
    pub fn assigned_count(&self) -> usize {
        *self.assigned.borrow()
    }

    pub fn set_slot(&self, instance: usize, state: SlotState) {
        let mut slots = self.slots.lock();
        if let Some(slot) = instance.checked_sub(1).and_then(|i| slots.get_mut(i)) {
            *slot = state;
        }
    }

    /// Marks every slot `Released`.
    pub fn release_slots(&self) {
        self.slots.lock().fill(SlotState::Released);
    }

    /// Slot states, first instance first.
    #[must_use]
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.slots.lock().clone()
    }

    /// Waits until no assigned work remains, up to `timeout`.
    ///
    /// Returns `true` and moves to `Released` when drained.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut assigned = self.assigned.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, assigned.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        if drained {
            self.state.store(Arc::new(RouteState::Released));
        }
        drained
    }
}

/// One assigned envelope. Dropping it, after processing or on a panic,
/// uncounts the work.
#[derive(Debug)]
pub struct WorkTicket {
    lifecycle: Arc<RouteLifecycle>,
}

impl Drop for WorkTicket {
    fn drop(&mut self) {
        self.lifecycle
            .assigned
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_moves_to_draining() {
        let lifecycle = RouteLifecycle::new(1);
        assert_eq!(lifecycle.state(), RouteState::Starting);
        lifecycle.set_ready();
        assert_eq!(lifecycle.state(), RouteState::Ready);
        lifecycle.begin_drain();
        assert_eq!(lifecycle.state(), RouteState::Draining);
    }

    #[test]
    fn tickets_count_assigned_work() {
        let lifecycle = Arc::new(RouteLifecycle::new(2));
        let first = lifecycle.assign(1);
        let second = lifecycle.assign(2);
        assert_eq!(lifecycle.assigned_count(), 2);
        assert_eq!(lifecycle.slot_states(), vec![SlotState::Busy, SlotState::Busy]);
        drop(first);
        assert_eq!(lifecycle.assigned_count(), 1);
        drop(second);
        assert_eq!(lifecycle.assigned_count(), 0);
    }

    #[test]
    fn slot_updates_ignore_unknown_instances() {
        let lifecycle = RouteLifecycle::new(1);
        lifecycle.set_slot(0, SlotState::Busy);
        lifecycle.set_slot(5, SlotState::Busy);
        assert_eq!(lifecycle.slot_states(), vec![SlotState::Idle]);
        lifecycle.release_slots();
        assert_eq!(lifecycle.slot_states(), vec![SlotState::Released]);
    }

    #[tokio::test]
    async fn stop_receiver_sees_drain() {
        let lifecycle = RouteLifecycle::new(1);
        let mut rx = lifecycle.stop_receiver();
        assert!(!*rx.borrow());
        lifecycle.begin_drain();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn drain_wakes_when_last_ticket_drops() {
        let lifecycle = Arc::new(RouteLifecycle::new(1));
        lifecycle.set_ready();
        let ticket = lifecycle.assign(1);
        lifecycle.begin_drain();

        let dropper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(ticket);
        });

        assert!(lifecycle.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(lifecycle.state(), RouteState::Released);
        dropper.await.unwrap();
    }

    #[tokio::test]
    async fn drain_gives_up_with_outstanding_ticket() {
        let lifecycle = Arc::new(RouteLifecycle::new(1));
        let _ticket = lifecycle.assign(1);
        lifecycle.begin_drain();
        assert!(!lifecycle.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(lifecycle.state(), RouteState::Draining);
    }
}
