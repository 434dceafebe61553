//! Per-session QoS delivery engine.
//!
//! Outbound messages enter the in-flight window in arrival order; once the window
//! is full, or while the session has no transport, they wait in the backlog.
//! Acknowledgments are matched per packet id, so they may arrive in any order.
//! Retransmission is driven from the outside by [`Delivery::tick`]; no task ever
//! waits for an ack. Nothing new is handed to a connection whose outbound channel
//! is full, it waits in the backlog instead, so a slow reader fills its own queue.
//!
//! ```text
//! QoS 1:  PUBLISH ──PUBACK──> done
//! QoS 2:  PUBLISH ──PUBREC──> PUBREL ──PUBCOMP──> done
//! ```

use std::num::NonZeroU16;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;

use crate::conf::Mqtt;
use crate::inflight::{MomentStatus, OutInflight, OutInflightMessage};
use crate::queue::Queue;
use crate::stats::Stats;
use crate::types::{Outgoing, Packet, Publish, TimestampMillis, Tx};
use crate::{QoS, Reason};

/// Acknowledgment packets a subscriber returns for our deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    PublishAck,
    PublishReceived,
    PublishComplete,
}

pub struct Delivery {
    inflight: OutInflight,
    queue: Queue<Publish>,
    max_mqueue_len: usize,
    retry_interval: TimestampMillis,
    max_retries: usize,
}

impl Delivery {
    pub fn new(mqtt: &Mqtt, stats: &Arc<Stats>) -> Self {
        let (s1, s2, s3, s4) = (stats.clone(), stats.clone(), stats.clone(), stats.clone());
        let inflight = OutInflight::new(mqtt.max_inflight.get() as usize)
            .on_push(move || s1.out_inflights.inc())
            .on_pop(move || s2.out_inflights.dec());
        let queue = Queue::new(mqtt.max_mqueue_len)
            .on_push(move || s3.message_queues.inc())
            .on_pop(move || s4.message_queues.dec());
        Self {
            inflight,
            queue,
            max_mqueue_len: mqtt.max_mqueue_len,
            retry_interval: mqtt.retry_interval.as_millis() as TimestampMillis,
            max_retries: mqtt.max_retries,
        }
    }

    #[inline]
    pub fn inflight(&self) -> &OutInflight {
        &self.inflight
    }

    #[inline]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    ///In-flight plus queued
    #[inline]
    pub fn len(&self) -> usize {
        self.inflight.len() + self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn deadline(&self, now: TimestampMillis) -> Option<TimestampMillis> {
        if self.retry_interval > 0 {
            Some(now + self.retry_interval)
        } else {
            None
        }
    }

    /// Accepts one message for this session, `tx` is `None` while detached.
    ///
    /// QoS 0 goes out at once only when nothing is queued ahead of it, so per-session
    /// order holds across QoS levels. With the outbound channel full every QoS is
    /// queued and counts against `max_mqueue_len`.
    pub fn enqueue(&mut self, tx: Option<&Tx>, publish: Publish, now: TimestampMillis) -> Result<(), Reason> {
        let writable = match tx {
            Some(tx) if self.queue.is_empty() && tx.capacity() > 0 => Some(tx),
            _ => None,
        };
        if let Some(tx) = writable {
            if publish.qos == QoS::AtMostOnce {
                send(tx, Packet::Publish(publish));
                return Ok(());
            }
        }

        if self.len() >= self.max_mqueue_len {
            return Err(Reason::MessageQueueFull);
        }

        match writable {
            Some(tx) if self.inflight.has_credit() => self.dispatch(tx, publish, now),
            _ => self.queue.push(publish).map_err(|_| Reason::MessageQueueFull),
        }
    }

    fn dispatch(&mut self, tx: &Tx, mut publish: Publish, now: TimestampMillis) -> Result<(), Reason> {
        let packet_id = self.inflight.next_id().map_err(|e| {
            log::warn!("{e}");
            Reason::InflightWindowFull
        })?;
        publish.packet_id = Some(packet_id);
        publish.dup = false;
        let status =
            if publish.qos == QoS::ExactlyOnce { MomentStatus::UnReceived } else { MomentStatus::UnAck };
        let mut m = OutInflightMessage::new(status, publish.clone());
        m.deadline = self.deadline(now);
        if let Err(e) = self.inflight.push_back(m) {
            log::warn!("push inflight message error, {e}");
            return Err(Reason::InflightWindowFull);
        }
        send(tx, Packet::Publish(publish));
        Ok(())
    }

    /// Moves queued messages into free window slots while the channel has room.
    fn drain(&mut self, tx: &Tx, now: TimestampMillis) {
        while tx.capacity() > 0 {
            let qos = match self.queue.front() {
                Some(p) => p.qos,
                None => break,
            };
            if qos != QoS::AtMostOnce && !self.inflight.has_credit() {
                break;
            }
            let publish = match self.queue.pop() {
                Some(p) => p,
                None => break,
            };
            if qos == QoS::AtMostOnce {
                send(tx, Packet::Publish(publish));
            } else if let Err(r) = self.dispatch(tx, publish, now) {
                log::warn!("drain dispatch failed, {r}");
                break;
            }
        }
    }

    /// Advances the handshake of one delivery, returns the publish when it completed.
    /// Unknown and duplicate acks are logged and ignored.
    pub fn on_ack(
        &mut self,
        tx: Option<&Tx>,
        packet_id: NonZeroU16,
        ack: AckType,
        now: TimestampMillis,
    ) -> Option<Publish> {
        let pid = packet_id.get();
        let status = match self.inflight.get(pid) {
            Some(m) => m.status,
            None => {
                log::debug!("{ack:?} for unknown packet id {pid}, ignored");
                return None;
            }
        };

        match (ack, status) {
            (AckType::PublishAck, MomentStatus::UnAck)
            | (AckType::PublishComplete, MomentStatus::UnComplete) => {
                let acked = self.inflight.remove(&pid).map(|m| m.publish);
                if let Some(tx) = tx {
                    self.drain(tx, now);
                }
                acked
            }
            (AckType::PublishReceived, MomentStatus::UnReceived)
            | (AckType::PublishReceived, MomentStatus::UnComplete) => {
                if status == MomentStatus::UnComplete {
                    log::debug!("duplicate PUBREC for packet id {pid}, PUBREL re-sent");
                }
                let deadline = if tx.is_some() { self.deadline(now) } else { None };
                self.inflight.update(&pid, MomentStatus::UnComplete, deadline);
                if let Some(tx) = tx {
                    send(tx, Packet::PublishRelease { packet_id });
                }
                None
            }
            _ => {
                log::debug!("{ack:?} does not match {status:?} of packet id {pid}, ignored");
                None
            }
        }
    }

    /// Retransmits every delivery whose retry deadline has passed, returns the ones
    /// dropped because they reached the retry limit. The backlog drains afterwards,
    /// so it moves again once a slow reader catches up.
    pub fn tick(&mut self, tx: &Tx, now: TimestampMillis) -> Vec<Publish> {
        let mut dropped = Vec::new();
        for pid in self.inflight.expired(now) {
            let retry_count = match self.inflight.get(pid) {
                Some(m) => m.retry_count,
                None => continue,
            };
            if self.max_retries > 0 && retry_count >= self.max_retries {
                if let Some(m) = self.inflight.remove(&pid) {
                    log::info!("packet id {pid} dropped after {retry_count} retransmissions");
                    dropped.push(m.publish);
                }
                continue;
            }
            let deadline = self.deadline(now);
            if let Some(m) = self.inflight.retried(&pid, deadline) {
                log::debug!("retransmit {:?}, retry count {}", m.publish, m.retry_count);
                resend(tx, m);
            }
        }
        self.drain(tx, now);
        dropped
    }

    /// A transport was attached: re-send the whole window with dup set, in dispatch
    /// order, then drain the backlog.
    pub fn resume(&mut self, tx: &Tx, now: TimestampMillis) {
        let deadline = self.deadline(now);
        for pid in self.inflight.packet_ids() {
            if let Some(m) = self.inflight.retried(&pid, deadline) {
                resend(tx, m);
            }
        }
        self.drain(tx, now);
    }

    /// The transport is gone: cancel retry timers, keep everything else.
    #[inline]
    pub fn suspend(&mut self) {
        self.inflight.clear_deadlines();
    }

    /// Discards all state, returning what was still undelivered.
    pub fn clear(&mut self) -> Vec<Publish> {
        let mut out = self.inflight.clear().into_iter().map(|m| m.publish).collect::<Vec<_>>();
        out.extend(self.queue.clear());
        out
    }
}

#[inline]
fn resend(tx: &Tx, m: &OutInflightMessage) {
    match (m.status, m.publish.packet_id) {
        (MomentStatus::UnComplete, Some(packet_id)) => send(tx, Packet::PublishRelease { packet_id }),
        _ => send(tx, Packet::Publish(m.publish.clone())),
    }
}

/// A packet refused by a full channel is dropped, an in-flight one is retransmitted
/// on its next deadline.
#[inline]
pub(crate) fn send(tx: &Tx, packet: Packet) -> bool {
    match tx.try_send(Outgoing::Packet(packet)) {
        Ok(()) => true,
        Err(TrySendError::Full(o)) => {
            log::warn!("outbound channel is full, dropped {:?}", o);
            false
        }
        Err(TrySendError::Closed(o)) => {
            log::debug!("send packet error, connection is gone, {:?}", o);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::types::Rx;

    fn mqtt(max_inflight: u16, max_mqueue_len: usize, max_retries: usize) -> Mqtt {
        Mqtt {
            max_inflight: NonZeroU16::new(max_inflight).unwrap(),
            max_mqueue_len,
            retry_interval: Duration::from_millis(100),
            max_retries,
            ..Default::default()
        }
    }

    fn sent(rx: &mut Rx) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Ok(Outgoing::Packet(p)) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    fn publish(topic: &str, qos: QoS) -> Publish {
        Publish::new(topic.to_owned(), "payload", qos)
    }

    fn pid(p: &Packet) -> u16 {
        match p {
            Packet::Publish(p) => p.packet_id.map(|id| id.get()).unwrap_or(0),
            Packet::PublishRelease { packet_id } => packet_id.get(),
            _ => 0,
        }
    }

    #[test]
    fn test_window_and_backlog() {
        let stats = Arc::new(Stats::new());
        let mut d = Delivery::new(&mqtt(2, 4, 0), &stats);
        let (tx, mut rx) = mpsc::channel(64);

        for i in 0..4 {
            assert_eq!(d.enqueue(Some(&tx), publish(&format!("t/{i}"), QoS::AtLeastOnce), 0), Ok(()));
        }
        assert_eq!(d.enqueue(Some(&tx), publish("t/4", QoS::AtLeastOnce), 0), Err(Reason::MessageQueueFull));
        assert_eq!(d.inflight().len(), 2);
        assert_eq!(d.queue_len(), 2);
        assert_eq!(stats.out_inflights.count(), 2);
        assert_eq!(stats.message_queues.count(), 2);
        assert_eq!(sent(&mut rx).iter().map(pid).collect::<Vec<_>>(), vec![1, 2]);

        //QoS 0 waits behind the backlog
        assert_eq!(d.enqueue(Some(&tx), publish("t/q0", QoS::AtMostOnce), 0), Err(Reason::MessageQueueFull));

        let acked = d.on_ack(Some(&tx), NonZeroU16::new(2).unwrap(), AckType::PublishAck, 10);
        assert_eq!(acked.map(|p| p.topic), Some("t/1".into()));
        let out = sent(&mut rx);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Packet::Publish(p) if p.topic == "t/2"));
        assert!(d.inflight().len() <= 2);

        assert!(d.on_ack(Some(&tx), NonZeroU16::new(2).unwrap(), AckType::PublishAck, 10).is_none());
        assert!(d.on_ack(Some(&tx), NonZeroU16::new(99).unwrap(), AckType::PublishAck, 10).is_none());
    }

    #[test]
    fn test_qos0_passthrough() {
        let stats = Arc::new(Stats::new());
        let mut d = Delivery::new(&mqtt(1, 1, 0), &stats);
        let (tx, mut rx) = mpsc::channel(64);
        assert!(d.enqueue(Some(&tx), publish("a", QoS::AtMostOnce), 0).is_ok());
        assert!(d.enqueue(Some(&tx), publish("b", QoS::AtMostOnce), 0).is_ok());
        assert!(d.is_empty());
        assert_eq!(sent(&mut rx).len(), 2);
    }

    #[test]
    fn test_qos2_handshake() {
        let stats = Arc::new(Stats::new());
        let mut d = Delivery::new(&mqtt(2, 10, 0), &stats);
        let (tx, mut rx) = mpsc::channel(64);
        d.enqueue(Some(&tx), publish("x", QoS::ExactlyOnce), 0).unwrap();
        let id = NonZeroU16::new(pid(&sent(&mut rx)[0])).unwrap();

        assert!(d.on_ack(Some(&tx), id, AckType::PublishComplete, 1).is_none());
        assert!(d.on_ack(Some(&tx), id, AckType::PublishReceived, 1).is_none());
        assert_eq!(sent(&mut rx), vec![Packet::PublishRelease { packet_id: id }]);
        //duplicate PUBREC re-sends PUBREL
        assert!(d.on_ack(Some(&tx), id, AckType::PublishReceived, 2).is_none());
        assert_eq!(sent(&mut rx), vec![Packet::PublishRelease { packet_id: id }]);
        assert!(d.on_ack(Some(&tx), id, AckType::PublishAck, 3).is_none());

        //PUBREL is what gets retransmitted now
        d.tick(&tx, 200);
        assert_eq!(sent(&mut rx), vec![Packet::PublishRelease { packet_id: id }]);

        assert!(d.on_ack(Some(&tx), id, AckType::PublishComplete, 4).is_some());
        assert!(d.is_empty());
        assert_eq!(stats.out_inflights.count(), 0);
    }

    #[test]
    fn test_retransmit_and_retry_limit() {
        let stats = Arc::new(Stats::new());
        let mut d = Delivery::new(&mqtt(2, 10, 2), &stats);
        let (tx, mut rx) = mpsc::channel(64);
        d.enqueue(Some(&tx), publish("a", QoS::AtLeastOnce), 0).unwrap();
        d.enqueue(Some(&tx), publish("b", QoS::AtLeastOnce), 50).unwrap();
        d.enqueue(Some(&tx), publish("c", QoS::AtLeastOnce), 50).unwrap();
        assert_eq!(sent(&mut rx).len(), 2);

        assert!(d.tick(&tx, 99).is_empty());
        assert!(sent(&mut rx).is_empty());

        assert!(d.tick(&tx, 100).is_empty());
        let out = sent(&mut rx);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Packet::Publish(p) if p.dup && p.topic == "a"));

        assert!(d.tick(&tx, 200).is_empty());
        assert_eq!(sent(&mut rx).len(), 2);

        //third expiry of "a" exceeds the limit, "c" takes its slot
        let dropped = d.tick(&tx, 300);
        assert_eq!(dropped.iter().map(|p| p.topic.to_string()).collect::<Vec<_>>(), vec!["a"]);
        let out = sent(&mut rx);
        assert!(out.iter().any(|p| matches!(p, Packet::Publish(p) if p.topic == "c" && !p.dup)));
        assert_eq!(d.inflight().len(), 2);
        assert_eq!(d.queue_len(), 0);
    }

    #[test]
    fn test_suspend_and_resume() {
        let stats = Arc::new(Stats::new());
        let mut d = Delivery::new(&mqtt(1, 10, 0), &stats);
        let (tx, mut rx) = mpsc::channel(64);
        d.enqueue(Some(&tx), publish("a", QoS::AtLeastOnce), 0).unwrap();
        assert_eq!(sent(&mut rx).len(), 1);

        d.suspend();
        assert!(d.inflight().next_deadline().is_none());
        d.enqueue(None, publish("b", QoS::AtLeastOnce), 10).unwrap();
        d.enqueue(None, publish("c", QoS::AtMostOnce), 10).unwrap();
        assert_eq!(d.queue_len(), 2);

        let (tx2, mut rx2) = mpsc::channel(64);
        d.resume(&tx2, 1000);
        let out = sent(&mut rx2);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Packet::Publish(p) if p.dup && p.topic == "a"));
        assert_eq!(d.inflight().next_deadline(), Some(1100));

        let id = NonZeroU16::new(pid(&out[0])).unwrap();
        d.on_ack(Some(&tx2), id, AckType::PublishAck, 1001);
        let out = sent(&mut rx2);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Packet::Publish(p) if p.topic == "b" && !p.dup));
        assert!(matches!(&out[1], Packet::Publish(p) if p.topic == "c" && p.qos == QoS::AtMostOnce));

        assert_eq!(d.clear().len(), 1);
        assert_eq!(stats.out_inflights.count(), 0);
        assert_eq!(stats.message_queues.count(), 0);
    }

    #[test]
    fn test_qos2_retransmit_before_pubrec() {
        let stats = Arc::new(Stats::new());
        let mut d = Delivery::new(&mqtt(2, 10, 0), &stats);
        let (tx, mut rx) = mpsc::channel(64);
        d.enqueue(Some(&tx), publish("x", QoS::ExactlyOnce), 0).unwrap();
        let id = pid(&sent(&mut rx)[0]);

        assert!(d.tick(&tx, 99).is_empty());
        assert!(sent(&mut rx).is_empty());

        assert!(d.tick(&tx, 100).is_empty());
        let out = sent(&mut rx);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Packet::Publish(p) if p.dup && p.qos == QoS::ExactlyOnce && p.topic == "x"));
        assert_eq!(pid(&out[0]), id);

        let id = NonZeroU16::new(id).unwrap();
        assert!(d.on_ack(Some(&tx), id, AckType::PublishReceived, 150).is_none());
        assert_eq!(sent(&mut rx), vec![Packet::PublishRelease { packet_id: id }]);
    }

    #[test]
    fn test_full_channel_fills_queue() {
        let stats = Arc::new(Stats::new());
        let mut d = Delivery::new(&mqtt(2, 4, 0), &stats);
        let (tx, mut rx) = mpsc::channel(2);

        d.enqueue(Some(&tx), publish("a", QoS::AtMostOnce), 0).unwrap();
        d.enqueue(Some(&tx), publish("b", QoS::AtMostOnce), 0).unwrap();
        assert_eq!(tx.capacity(), 0);

        //the reader is behind, everything waits in the backlog
        d.enqueue(Some(&tx), publish("c", QoS::AtMostOnce), 0).unwrap();
        d.enqueue(Some(&tx), publish("d", QoS::AtLeastOnce), 0).unwrap();
        d.enqueue(Some(&tx), publish("e", QoS::AtMostOnce), 0).unwrap();
        d.enqueue(Some(&tx), publish("f", QoS::AtMostOnce), 0).unwrap();
        assert_eq!(d.enqueue(Some(&tx), publish("g", QoS::AtMostOnce), 0), Err(Reason::MessageQueueFull));
        assert_eq!(d.queue_len(), 4);
        assert!(d.inflight().is_empty());
        assert_eq!(stats.message_queues.count(), 4);

        let topics = |out: Vec<Packet>| {
            out.into_iter()
                .map(|p| match p {
                    Packet::Publish(p) => p.topic.to_string(),
                    p => p.name().to_owned(),
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(topics(sent(&mut rx)), vec!["a", "b"]);

        //the writer caught up, the next tick refills the channel in order
        assert!(d.tick(&tx, 10).is_empty());
        assert_eq!(d.queue_len(), 2);
        assert_eq!(d.inflight().len(), 1);
        assert_eq!(topics(sent(&mut rx)), vec!["c", "d"]);

        assert!(d.tick(&tx, 20).is_empty());
        assert_eq!(topics(sent(&mut rx)), vec!["e", "f"]);
        assert!(d.enqueue(Some(&tx), publish("h", QoS::AtMostOnce), 30).is_ok());
        assert_eq!(d.queue_len(), 0);
    }
}
