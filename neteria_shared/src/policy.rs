//! The adjudication hook the server engine calls into for every `EVENT`.
//!
//! A pure legality check with a deny-nothing default, and an asynchronous
//! side-effecting executor the server never waits on.

use async_trait::async_trait;
use serde_json::Value;

use crate::ids::{ClientId, EventId};

#[async_trait]
pub trait Policy: Send + Sync {
    /// Decides whether `event_data` from `cuuid` is legal. Must not have
    /// side effects -- the server may call this more than once for the
    /// same event under implementation-defined circumstances (it currently
    /// does not, but nothing guarantees it in the future).
    fn event_legal(&self, cuuid: ClientId, euuid: EventId, event_data: &Value) -> bool {
        let _ = (cuuid, euuid, event_data);
        true
    }

    /// Performs the side effects of a legal event. Runs on a background
    /// task; the server does not observe its completion or its return
    /// value.
    async fn event_execute(&self, cuuid: ClientId, euuid: EventId, event_data: Value);
}

/// A policy that accepts everything and does nothing -- useful for tests
/// and as a minimal example.
pub struct NoopPolicy;

#[async_trait]
impl Policy for NoopPolicy {
    async fn event_execute(&self, _cuuid: ClientId, _euuid: EventId, _event_data: Value) {}
}
