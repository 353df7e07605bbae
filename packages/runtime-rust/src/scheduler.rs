//! Delayed sends.
//!
//! Each scheduled event owns a sleeping task. Firing and cancellation both
//! claim the event by removing it from the table, so an event is either
//! delivered or cancelled, never both.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::task::AbortHandle;

struct ScheduledEvent {
    route: String,
    fire_time: SystemTime,
    token: u64,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
pub(crate) struct Scheduler {
    events: DashMap<String, ScheduledEvent>,
    next_token: AtomicU64,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedules `fire` to run at `fire_time` under `id`.
    ///
    /// `fire` receives the claim token; it must call [`Scheduler::claim`] with
    /// it before delivering. An existing event with the same id is replaced.
    pub(crate) fn schedule<F, Fut>(&self, id: &str, route: &str, fire_time: SystemTime, fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(id);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.events.insert(
            id.to_string(),
            ScheduledEvent {
                route: route.to_string(),
                fire_time,
                token,
                abort: None,
            },
        );
        let delay = fire_time
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(token).await;
        });
        if let Some(mut event) = self.events.get_mut(id) {
            if event.token == token {
                event.abort = Some(task.abort_handle());
            }
        }
    }

    /// Removes the event if it is still the one identified by `token`.
    pub(crate) fn claim(&self, id: &str, token: u64) -> bool {
        self.events
            .remove_if(id, |_, event| event.token == token)
            .is_some()
    }

    /// Cancels a pending event. Returns `false` if it already fired or never existed.
    pub(crate) fn cancel(&self, id: &str) -> bool {
        match self.events.remove(id) {
            Some((_, event)) => {
                if let Some(abort) = event.abort {
                    abort.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Ids of pending events for `route`, sorted.
    pub(crate) fn events_for(&self, route: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .events
            .iter()
            .filter(|entry| entry.route == route)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Routes with at least one pending event, sorted and unique.
    pub(crate) fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.events.iter().map(|e| e.route.clone()).collect();
        routes.sort();
        routes.dedup();
        routes
    }

    pub(crate) fn fire_time(&self, id: &str) -> Option<SystemTime> {
        self.events.get(id).map(|e| e.fire_time)
    }

    pub(crate) fn cancel_all(&self) {
        let ids: Vec<String> = self.events.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
    }
}
