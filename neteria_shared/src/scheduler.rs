//! Cooperative retry scheduler.
//!
//! A single logical task holds a list of deferred callbacks and wakes on a
//! fixed tick to fire anything whose deadline has passed, using
//! `tokio::time::Instant` (monotonic) rather than wall-clock time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub type BoxedCall = Pin<Box<dyn Future<Output = ()> + Send>>;

struct ScheduledCall {
    deadline: Instant,
    callback: Box<dyn FnOnce() -> BoxedCall + Send>,
}

/// Default wake interval.
pub const TICK: Duration = Duration::from_millis(200);

/// Holds and fires deferred callbacks in deadline order, with same-tick
/// ties broken by insertion order.
#[derive(Clone)]
pub struct Scheduler {
    calls: Arc<Mutex<Vec<ScheduledCall>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Schedules `callback` to run no sooner than `delay` from now.
    pub async fn call_later<F, Fut>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut calls = self.calls.lock().await;
        calls.push(ScheduledCall {
            deadline: Instant::now() + delay,
            callback: Box::new(move || Box::pin(callback())),
        });
    }

    /// Drains and runs every callback whose deadline has passed, in the
    /// order they were inserted among those that fired this tick.
    async fn fire_due(&self) {
        let due = {
            let mut calls = self.calls.lock().await;
            let now = Instant::now();
            let mut due = Vec::new();
            let mut remaining = Vec::with_capacity(calls.len());
            for call in calls.drain(..) {
                if call.deadline <= now {
                    due.push(call.callback);
                } else {
                    remaining.push(call);
                }
            }
            *calls = remaining;
            due
        };
        for callback in due {
            callback().await;
        }
    }

    /// Runs the scheduler loop forever, waking every `TICK`. Intended to be
    /// driven from a dedicated `tokio::spawn`ed task -- this is the
    /// scheduler "thread" of the concurrency model, folded into a
    /// cooperative async task.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(TICK);
        loop {
            interval.tick().await;
            self.fire_due().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fires_due_callbacks_in_insertion_order() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            scheduler
                .call_later(Duration::from_millis(0), move || async move {
                    order.lock().await.push(i);
                })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(1)).await;
        scheduler.fire_due().await;

        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn leaves_not_yet_due_callbacks_pending() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        scheduler
            .call_later(Duration::from_secs(60), move || async move {
                fired_clone.fetch_add(1, Ordering::Relaxed);
            })
            .await;

        scheduler.fire_due().await;
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }
}
