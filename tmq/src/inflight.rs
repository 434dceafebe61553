use std::collections::BTreeSet;
use std::num::NonZeroU16;
use std::sync::Arc;

use anyhow::anyhow;
use itertools::Itertools;
use rust_box::dequemap::DequeBTreeMap as DequeMap;
use serde::{Deserialize, Serialize};

use crate::error::MqttError;
use crate::queue::OnEventFn;
use crate::types::{PacketId, Publish, TimestampMillis};
use crate::{Reason, Result};

type OutQueues = DequeMap<PacketId, OutInflightMessage>;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub enum MomentStatus {
    ///QoS 1, waiting for PUBACK
    UnAck,
    ///QoS 2, waiting for PUBREC
    UnReceived,
    ///QoS 2, PUBREL sent, waiting for PUBCOMP
    UnComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutInflightMessage {
    pub publish: Publish,
    pub status: MomentStatus,
    pub retry_count: usize,
    ///None while the session has no transport
    pub deadline: Option<TimestampMillis>,
}

impl OutInflightMessage {
    #[inline]
    pub fn new(status: MomentStatus, publish: Publish) -> Self {
        Self { publish, status, retry_count: 0, deadline: None }
    }

    #[inline]
    pub fn packet_id(&self) -> Option<NonZeroU16> {
        self.publish.packet_id
    }
}

/// Outbound QoS 1/2 window of a session, in dispatch order, with a time-ordered
/// retry index next to it.
pub struct OutInflight {
    cap: usize,
    next: PacketId,
    queues: OutQueues,
    deadlines: BTreeSet<(TimestampMillis, PacketId)>,
    on_push_fn: Option<Arc<dyn OnEventFn>>,
    on_pop_fn: Option<Arc<dyn OnEventFn>>,
}

impl Drop for OutInflight {
    fn drop(&mut self) {
        if let Some(f) = self.on_pop_fn.as_ref() {
            (0..self.queues.len()).for_each(|_| f());
        }
    }
}

impl OutInflight {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            next: 1,
            queues: OutQueues::default(),
            deadlines: BTreeSet::default(),
            on_push_fn: None,
            on_pop_fn: None,
        }
    }

    #[inline]
    pub fn on_push<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_push_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn on_pop<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_pop_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn get(&self, packet_id: PacketId) -> Option<&OutInflightMessage> {
        self.queues.get(&packet_id)
    }

    #[inline]
    pub fn front(&self) -> Option<(&PacketId, &OutInflightMessage)> {
        self.queues.front()
    }

    #[inline]
    pub fn push_back(&mut self, m: OutInflightMessage) -> Result<()> {
        let packet_id = m.packet_id().ok_or_else(|| anyhow!("packet_id is None, inflight message: {:?}", m))?;
        if self.queues.contains_key(&packet_id.get()) {
            return Err(MqttError::PacketIdInUse(packet_id).into());
        }
        if let Some(deadline) = m.deadline {
            self.deadlines.insert((deadline, packet_id.get()));
        }
        if let Some(f) = self.on_push_fn.as_ref() {
            f();
        }
        self.queues.insert(packet_id.get(), m);
        Ok(())
    }

    #[inline]
    pub fn remove(&mut self, packet_id: &PacketId) -> Option<OutInflightMessage> {
        let msg = self.queues.remove(packet_id)?;
        if let Some(deadline) = msg.deadline {
            self.deadlines.remove(&(deadline, *packet_id));
        }
        if let Some(f) = self.on_pop_fn.as_ref() {
            f();
        }
        Some(msg)
    }

    ///Moves the message to a new status and retry deadline, returns the updated message.
    #[inline]
    pub fn update(
        &mut self,
        packet_id: &PacketId,
        status: MomentStatus,
        deadline: Option<TimestampMillis>,
    ) -> Option<&OutInflightMessage> {
        let m = self.queues.get_mut(packet_id)?;
        if let Some(old) = m.deadline.take() {
            self.deadlines.remove(&(old, *packet_id));
        }
        if let Some(deadline) = deadline {
            self.deadlines.insert((deadline, *packet_id));
        }
        m.deadline = deadline;
        if m.status != status {
            m.retry_count = 0;
        }
        m.status = status;
        Some(m)
    }

    ///Marks the message as retransmitted: dup flag on, one more retry, new deadline.
    #[inline]
    pub fn retried(
        &mut self,
        packet_id: &PacketId,
        deadline: Option<TimestampMillis>,
    ) -> Option<&OutInflightMessage> {
        let m = self.queues.get_mut(packet_id)?;
        if let Some(old) = m.deadline.take() {
            self.deadlines.remove(&(old, *packet_id));
        }
        if let Some(deadline) = deadline {
            self.deadlines.insert((deadline, *packet_id));
        }
        m.deadline = deadline;
        m.retry_count += 1;
        m.publish.dup = true;
        Some(m)
    }

    ///Packet ids whose retry deadline is at or before `now`, earliest first.
    #[inline]
    pub fn expired(&self, now: TimestampMillis) -> Vec<PacketId> {
        self.deadlines.iter().take_while(|(deadline, _)| *deadline <= now).map(|(_, pid)| *pid).collect_vec()
    }

    ///Earliest pending retry deadline
    #[inline]
    pub fn next_deadline(&self) -> Option<TimestampMillis> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    ///Cancels every retry timer, messages stay in the window.
    #[inline]
    pub fn clear_deadlines(&mut self) {
        for (_, pid) in std::mem::take(&mut self.deadlines) {
            if let Some(m) = self.queues.get_mut(&pid) {
                m.deadline = None;
            }
        }
    }

    #[inline]
    pub fn packet_ids(&self) -> Vec<PacketId> {
        self.queues.iter().map(|(pid, _)| *pid).collect_vec()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[inline]
    pub fn exist(&self, packet_id: &PacketId) -> bool {
        self.queues.contains_key(packet_id)
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.queues.len() < self.cap
    }

    #[inline]
    pub fn next_id(&mut self) -> Result<NonZeroU16> {
        for _ in 0..u16::MAX {
            let packet_id = self.next;
            self.next = self.next.wrapping_add(1);
            if let Some(pid) = NonZeroU16::new(packet_id) {
                if !self.queues.contains_key(&packet_id) {
                    return Ok(pid);
                }
            }
        }
        Err(anyhow!("no packet_id available, should unreachable!()"))
    }

    #[inline]
    pub fn clear(&mut self) -> Vec<OutInflightMessage> {
        self.deadlines.clear();
        let mut inflight_messages = Vec::new();
        while let Some((_, msg)) = self.queues.pop_front() {
            if let Some(f) = self.on_pop_fn.as_ref() {
                f();
            }
            inflight_messages.push(msg);
        }
        inflight_messages
    }
}

/// Packet ids of inbound QoS 2 publishes still waiting for PUBREL.
pub struct InInflight {
    cached: BTreeSet<NonZeroU16>,
    max_inflight: usize,
    on_push_fn: Option<Arc<dyn OnEventFn>>,
    on_pop_fn: Option<Arc<dyn OnEventFn>>,
}

impl Drop for InInflight {
    fn drop(&mut self) {
        if let Some(f) = self.on_pop_fn.as_ref() {
            self.cached.iter().for_each(|_| f());
        }
    }
}

impl InInflight {
    pub fn new(max_inflight: usize) -> Self {
        Self { cached: BTreeSet::default(), max_inflight, on_push_fn: None, on_pop_fn: None }
    }

    #[inline]
    pub fn on_push<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_push_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn on_pop<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_pop_fn = Some(Arc::new(f));
        self
    }

    ///Ok(true) for a new id, Ok(false) for a retransmission of a stored one.
    #[inline]
    pub fn add(&mut self, pid: NonZeroU16, dup: bool) -> std::result::Result<bool, Reason> {
        if self.cached.contains(&pid) {
            return if dup { Ok(false) } else { Err(MqttError::PacketIdInUse(pid).into()) };
        }
        if self.cached.len() >= self.max_inflight {
            return Err(Reason::InflightWindowFull);
        }
        self.cached.insert(pid);
        if let Some(f) = self.on_push_fn.as_ref() {
            f();
        }
        Ok(true)
    }

    #[inline]
    pub fn remove(&mut self, pid: &NonZeroU16) -> bool {
        if self.cached.remove(pid) {
            if let Some(f) = self.on_pop_fn.as_ref() {
                f();
            }
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cached.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }
}
