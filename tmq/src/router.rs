use std::sync::Arc;

use crate::registry::Registry;
use crate::retain::RetainStorage;
use crate::session::{Session, Sessions};
use crate::topic::Topic;
use crate::types::{ClientId, Publish, TimestampMillis};
use crate::{MqttError, Reason};

/// Outcome of one fan-out.
#[derive(Debug, Default)]
pub struct Routed {
    ///Sessions that accepted the message
    pub accepted: usize,
    ///Deliveries refused by their session, e.g. on a full queue
    pub dropped: Vec<(ClientId, Publish, Reason)>,
}

/// Publish fan-out over the subscription registry and the retained store.
pub struct Router {
    registry: Registry,
    retain: Box<dyn RetainStorage>,
}

impl Router {
    pub fn new(retain: Box<dyn RetainStorage>) -> Self {
        Self { registry: Registry::new(), retain }
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub fn retain(&self) -> &dyn RetainStorage {
        self.retain.as_ref()
    }

    /// Stores a retained message first, then hands a copy to every matching session
    /// at `min(publish QoS, granted QoS)`. Forwarded copies never carry the retain
    /// flag. A session refusing its copy affects no other.
    pub fn route(&self, sessions: &Sessions, publish: &Publish, now: TimestampMillis) -> Result<Routed, MqttError> {
        let topic = Topic::name(&publish.topic)?;
        if publish.retain && self.retain.enable() {
            if let Err(e) = self.retain.set(&publish.topic, publish.clone()) {
                log::warn!("retain message error, topic: {}, {:?}", publish.topic, e);
            }
        }

        let mut routed = Routed::default();
        for (client_id, qos) in self.registry.matches(&topic) {
            //clone the Arc out, the shard guard must not be held while the session is locked
            let session: Option<Arc<Session>> = sessions.get(&client_id).map(|s| s.value().clone());
            let Some(session) = session else {
                log::warn!("{:?} subscribed but no session, topic: {}", client_id, publish.topic);
                continue;
            };
            let forward = Publish {
                dup: false,
                retain: false,
                qos: publish.qos.less_value(qos),
                topic: publish.topic.clone(),
                packet_id: None,
                payload: publish.payload.clone(),
            };
            match session.deliver(forward.clone(), now) {
                Ok(()) => routed.accepted += 1,
                Err(reason) => routed.dropped.push((client_id, forward, reason)),
            }
        }
        log::debug!("routed {:?}, accepted: {}, dropped: {}", publish, routed.accepted, routed.dropped.len());
        Ok(routed)
    }

    /// Retained messages matching `topic_filter`, retain flag set, capped to `qos`.
    pub fn retained(&self, topic_filter: &Topic, qos: crate::QoS) -> Vec<Publish> {
        if !self.retain.enable() {
            return Vec::new();
        }
        match self.retain.get(topic_filter) {
            Ok(retaineds) => retaineds
                .into_iter()
                .map(|(_, p)| Publish {
                    dup: false,
                    retain: true,
                    qos: p.qos.less_value(qos),
                    topic: p.topic,
                    packet_id: None,
                    payload: p.payload,
                })
                .collect(),
            Err(e) => {
                log::warn!("get retain messages error, topic_filter: {}, {:?}", topic_filter, e);
                Vec::new()
            }
        }
    }
}
