//! Per-route worker pools.
//!
//! Each route owns one manager task and `pool_size` slot tasks, all on the
//! shared tokio runtime. The manager holds the route inbox, a FIFO of
//! buffered envelopes and a FIFO of idle slots. A slot receives one envelope
//! at a time over a capacity-1 channel and reports `Ready` when it has fully
//! finished with it; the manager never hands work to a slot that has not
//! signalled ready.
//!
//! ```text
//!   inbox ──► manager ──(one envelope)──► slot 1 ─┐
//!               ▲     ──(one envelope)──► slot 2 ─┤
//!               └──────── Ready / Crashed ────────┘
//! ```

mod slot;

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use relay_core::Envelope;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::lifecycle::{RouteLifecycle, SlotState, WorkTicket};
use crate::platform::Shared;
use crate::registry::{RouteHandle, ServiceDef};

/// How crashed slots are brought back.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RestartPolicy {
    pub(crate) grace: Duration,
    pub(crate) max_restarts: u32,
}

/// Everything a slot needs to process envelopes for its route.
pub(crate) struct SlotContext {
    pub(crate) route: String,
    pub(crate) def: Arc<ArcSwap<ServiceDef>>,
    pub(crate) lifecycle: Arc<RouteLifecycle>,
    pub(crate) shared: Weak<Shared>,
}

/// An envelope handed to a slot, counted until the slot drops the ticket.
pub(crate) struct Assignment {
    pub(crate) envelope: Envelope,
    pub(crate) ticket: WorkTicket,
}

/// Flow-control messages from slots (and the restart timer) to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotSignal {
    /// The slot finished its envelope and can take another.
    Ready(usize),
    /// The slot task ended without finishing cleanly.
    Crashed(usize),
    /// Restart grace elapsed; spawn the slot again.
    Respawn(usize),
}

/// Builds a pool for `def` and returns its live handle.
///
/// Must be called from within a tokio runtime.
pub(crate) fn spawn_route(def: ServiceDef, shared: Weak<Shared>, policy: RestartPolicy) -> Arc<RouteHandle> {
    let route = def.route().to_string();
    let pool_size = def.pool_size().unwrap_or(1).max(1);
    let def = Arc::new(ArcSwap::from_pointee(def));
    let lifecycle = Arc::new(RouteLifecycle::new(pool_size));
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

    let ctx = Arc::new(SlotContext {
        route: route.clone(),
        def: Arc::clone(&def),
        lifecycle: Arc::clone(&lifecycle),
        shared,
    });
    let mut manager = RouteManager::new(ctx, pool_size, inbox_rx, policy);
    for instance in 1..=pool_size {
        manager.spawn_slot(instance);
    }
    lifecycle.set_ready();
    info!(route = %route, pool_size, "route started");

    let task = tokio::spawn(manager.run());
    Arc::new(RouteHandle {
        def,
        inbox: inbox_tx,
        lifecycle,
        manager: Mutex::new(Some(task)),
    })
}

struct RouteManager {
    ctx: Arc<SlotContext>,
    /// Work channel per slot; index is `instance - 1`. `None` while a slot is down.
    slots: Vec<Option<mpsc::Sender<Assignment>>>,
    idle: VecDeque<usize>,
    buffer: VecDeque<Envelope>,
    restarts: Vec<u32>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    signal_tx: mpsc::UnboundedSender<SlotSignal>,
    signal_rx: mpsc::UnboundedReceiver<SlotSignal>,
    stop: watch::Receiver<bool>,
    policy: RestartPolicy,
}

impl RouteManager {
    fn new(
        ctx: Arc<SlotContext>,
        pool_size: usize,
        inbox: mpsc::UnboundedReceiver<Envelope>,
        policy: RestartPolicy,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let stop = ctx.lifecycle.stop_receiver();
        Self {
            ctx,
            slots: vec![None; pool_size],
            idle: VecDeque::with_capacity(pool_size),
            buffer: VecDeque::new(),
            restarts: vec![0; pool_size],
            inbox,
            signal_tx,
            signal_rx,
            stop,
            policy,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                Some(signal) = self.signal_rx.recv() => self.on_signal(signal),
                envelope = self.inbox.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope),
                    None => break,
                },
            }
        }
        self.finish();
    }

    fn spawn_slot(&mut self, instance: usize) {
        let (tx, rx) = mpsc::channel(1);
        slot::spawn(Arc::clone(&self.ctx), instance, rx, self.signal_tx.clone());
        self.slots[instance - 1] = Some(tx);
        self.ctx.lifecycle.set_slot(instance, SlotState::Idle);
        self.idle.push_back(instance);
    }

    fn on_signal(&mut self, signal: SlotSignal) {
        match signal {
            SlotSignal::Ready(instance) => match self.buffer.pop_front() {
                Some(envelope) => self.hand(instance, envelope),
                None => {
                    self.ctx.lifecycle.set_slot(instance, SlotState::Idle);
                    self.idle.push_back(instance);
                }
            },
            SlotSignal::Crashed(instance) => self.on_crash(instance),
            SlotSignal::Respawn(instance) => {
                self.spawn_slot(instance);
                self.pump();
            }
        }
    }

    fn on_crash(&mut self, instance: usize) {
        self.slots[instance - 1] = None;
        self.ctx.lifecycle.set_slot(instance, SlotState::Restarting);
        self.idle.retain(|&i| i != instance);
        self.restarts[instance - 1] += 1;
        let restarts = self.restarts[instance - 1];
        metrics::counter!("relay_slot_restarts_total", "route" => self.ctx.route.clone())
            .increment(1);
        if restarts > self.policy.max_restarts {
            error!(
                route = %self.ctx.route,
                instance,
                restarts,
                "worker slot keeps crashing"
            );
        } else {
            warn!(route = %self.ctx.route, instance, "worker slot crashed, restarting");
        }
        let tx = self.signal_tx.clone();
        let grace = self.policy.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(SlotSignal::Respawn(instance));
        });
    }

    fn dispatch(&mut self, envelope: Envelope) {
        match self.idle.pop_front() {
            Some(instance) => self.hand(instance, envelope),
            None => self.buffer.push_back(envelope),
        }
    }

    fn pump(&mut self) {
        while !self.buffer.is_empty() {
            let Some(instance) = self.idle.pop_front() else {
                break;
            };
            if let Some(envelope) = self.buffer.pop_front() {
                self.hand(instance, envelope);
            }
        }
    }

    /// Gives `envelope` to a slot that signalled ready.
    fn hand(&mut self, instance: usize, envelope: Envelope) {
        let Some(tx) = &self.slots[instance - 1] else {
            self.buffer.push_front(envelope);
            return;
        };
        let ticket = self.ctx.lifecycle.assign(instance);
        match tx.try_send(Assignment { envelope, ticket }) {
            Ok(()) => {}
            // Closed: the slot died; its Crashed signal is on the way.
            Err(TrySendError::Full(assignment) | TrySendError::Closed(assignment)) => {
                self.buffer.push_front(assignment.envelope);
            }
        }
    }

    /// Stops the slots and moves undelivered work to the route's new pool, if any.
    fn finish(mut self) {
        self.slots.clear();
        self.ctx.lifecycle.release_slots();
        self.inbox.close();
        let mut leftover: Vec<Envelope> = self.buffer.drain(..).collect();
        while let Ok(envelope) = self.inbox.try_recv() {
            leftover.push(envelope);
        }
        if leftover.is_empty() {
            return;
        }
        let successor = self
            .ctx
            .shared
            .upgrade()
            .and_then(|shared| shared.registry.get(&self.ctx.route))
            .filter(|handle| !Arc::ptr_eq(&handle.lifecycle, &self.ctx.lifecycle));
        match successor {
            Some(handle) => {
                for envelope in leftover {
                    if let Err(e) = handle.deliver(envelope) {
                        warn!(route = %self.ctx.route, "undelivered envelope dropped: {e}");
                    }
                }
            }
            None => warn!(
                route = %self.ctx.route,
                dropped = leftover.len(),
                "route released with pending envelopes"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, Output};

    fn manager(pool_size: usize, grace_ms: u64) -> (RouteManager, mpsc::UnboundedSender<Envelope>) {
        let def = ServiceDef::new(
            "hello.world",
            handler_fn(|_, _, _| async { Ok(Output::none()) }),
        )
        .with_pool_size(pool_size);
        let ctx = Arc::new(SlotContext {
            route: "hello.world".to_string(),
            def: Arc::new(ArcSwap::from_pointee(def)),
            lifecycle: Arc::new(RouteLifecycle::new(pool_size)),
            shared: Weak::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let policy = RestartPolicy {
            grace: Duration::from_millis(grace_ms),
            max_restarts: 1,
        };
        (RouteManager::new(ctx, pool_size, rx, policy), tx)
    }

    #[tokio::test]
    async fn slots_start_idle_in_order() {
        let (mut m, _tx) = manager(3, 10);
        for instance in 1..=3 {
            m.spawn_slot(instance);
        }
        assert_eq!(m.idle.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(m.slots.iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn work_waits_in_buffer_without_idle_slots() {
        let (mut m, _tx) = manager(1, 10);
        m.dispatch(Envelope::new());
        assert_eq!(m.buffer.len(), 1);
        assert!(m.idle.is_empty());
    }

    #[tokio::test]
    async fn crashed_slot_is_respawned_after_grace() {
        let (mut m, _tx) = manager(2, 20);
        m.spawn_slot(1);
        m.spawn_slot(2);

        m.on_signal(SlotSignal::Crashed(1));
        assert!(m.slots[0].is_none());
        assert_eq!(m.idle.iter().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(m.restarts[0], 1);

        let signal = tokio::time::timeout(Duration::from_secs(1), m.signal_rx.recv())
            .await
            .unwrap();
        assert_eq!(signal, Some(SlotSignal::Respawn(1)));
        m.on_signal(SlotSignal::Respawn(1));
        assert!(m.slots[0].is_some());
        assert!(m.idle.contains(&1));
    }

    #[tokio::test]
    async fn ready_slot_takes_buffered_work_first() {
        let (mut m, _tx) = manager(1, 10);
        m.buffer.push_back(Envelope::new().with_body(1));
        m.buffer.push_back(Envelope::new().with_body(2));
        let (slot_tx, mut slot_rx) = mpsc::channel(1);
        m.slots[0] = Some(slot_tx);

        m.on_signal(SlotSignal::Ready(1));
        assert_eq!(m.buffer.len(), 1);
        assert!(m.idle.is_empty());
        let assignment = slot_rx.recv().await.unwrap();
        assert_eq!(assignment.envelope.body, relay_core::Value::from(1));
        assert_eq!(m.ctx.lifecycle.assigned_count(), 1);
        assert_eq!(m.ctx.lifecycle.slot_states(), vec![SlotState::Busy]);
        drop(assignment);
        assert_eq!(m.ctx.lifecycle.assigned_count(), 0);
    }

    #[tokio::test]
    async fn parked_envelope_counts_until_processed() {
        let (mut m, _tx) = manager(1, 10);
        let (slot_tx, mut slot_rx) = mpsc::channel(1);
        m.slots[0] = Some(slot_tx);
        m.idle.push_back(1);

        m.dispatch(Envelope::new().with_body(1));
        // Still sitting in the slot channel, not yet picked up.
        assert_eq!(m.ctx.lifecycle.assigned_count(), 1);
        let drained = m.ctx.lifecycle.wait_for_drain(Duration::from_millis(30)).await;
        assert!(!drained);

        drop(slot_rx.recv().await.unwrap());
        assert!(m.ctx.lifecycle.wait_for_drain(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn unsendable_work_returns_to_buffer_uncounted() {
        let (mut m, _tx) = manager(1, 10);
        let (slot_tx, slot_rx) = mpsc::channel(1);
        drop(slot_rx);
        m.slots[0] = Some(slot_tx);

        m.hand(1, Envelope::new().with_body(7));
        assert_eq!(m.buffer.len(), 1);
        assert_eq!(m.ctx.lifecycle.assigned_count(), 0);
    }

    #[tokio::test]
    async fn slot_states_follow_signals() {
        let (mut m, _tx) = manager(2, 10);
        m.spawn_slot(1);
        m.spawn_slot(2);
        assert_eq!(m.ctx.lifecycle.slot_states(), vec![SlotState::Idle; 2]);

        m.on_signal(SlotSignal::Crashed(2));
        assert_eq!(
            m.ctx.lifecycle.slot_states(),
            vec![SlotState::Idle, SlotState::Restarting]
        );
        m.on_signal(SlotSignal::Respawn(2));
        assert_eq!(m.ctx.lifecycle.slot_states(), vec![SlotState::Idle; 2]);

        let lifecycle = Arc::clone(&m.ctx.lifecycle);
        m.finish();
        assert_eq!(lifecycle.slot_states(), vec![SlotState::Released; 2]);
    }
}
