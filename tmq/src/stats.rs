//! Broker counters.
//!
//! Every field is a [`Counter`] (current value plus high-water mark) updated lock-free
//! from the hot paths:
//! - `connections` / `sessions`: attached transports and live sessions
//! - `subscriptions`: subscription relations held by sessions
//! - `out_inflights` / `in_inflights`: outbound QoS 1/2 window and inbound QoS 2 ids
//! - `message_queues`: deliveries waiting behind a full window or a detached transport
//! - `forwards`, `dropped`, `acked`: message flow
//!
//! Retained entries and the registry's topic/route counts live with their owners and
//! are merged in by [`Stats::to_json`].

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::registry::Registry;
use crate::retain::RetainStorage;
use crate::utils::Counter;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Stats {
    pub connections: Counter,
    pub sessions: Counter,
    pub subscriptions: Counter,
    pub out_inflights: Counter,
    pub in_inflights: Counter,
    pub message_queues: Counter,
    pub forwards: Counter,
    pub dropped: Counter,
    pub acked: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn to_json(&self, registry: &Registry, retain: &dyn RetainStorage) -> serde_json::Value {
        json!({
            "connections.count": self.connections.count(),
            "connections.max": self.connections.max(),
            "sessions.count": self.sessions.count(),
            "sessions.max": self.sessions.max(),
            "subscriptions.count": self.subscriptions.count(),
            "subscriptions.max": self.subscriptions.max(),
            "retaineds.count": retain.count(),
            "retaineds.max": retain.max(),

            "message_queues.count": self.message_queues.count(),
            "message_queues.max": self.message_queues.max(),
            "out_inflights.count": self.out_inflights.count(),
            "out_inflights.max": self.out_inflights.max(),
            "in_inflights.count": self.in_inflights.count(),
            "in_inflights.max": self.in_inflights.max(),
            "forwards.count": self.forwards.count(),
            "forwards.max": self.forwards.max(),
            "dropped.count": self.dropped.count(),
            "acked.count": self.acked.count(),

            "topics.count": registry.topics().count(),
            "topics.max": registry.topics().max(),
            "routes.count": registry.routes().count(),
            "routes.max": registry.routes().max(),
        })
    }
}
