use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU16;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::conf::Mqtt;
use crate::delivery::{self, AckType, Delivery};
use crate::inflight::InInflight;
use crate::registry::Registry;
use crate::stats::Stats;
use crate::types::{ClientId, ConnId, LastWill, Outgoing, Packet, Publish, TimestampMillis, TopicFilter, Tx};
use crate::utils::{format_timestamp_millis, timestamp_millis};
use crate::{MqttError, QoS, Reason};

///Live sessions by client id
pub type Sessions = DashMap<ClientId, Arc<Session>>;

/// State of one client, shared between its connection task, the router and the
/// broker's periodic tick. Every mutation happens under the session's own lock.
/// The only lock ever taken while holding it is the registry's, so a subscription
/// change and the connection check it depends on are one step.
pub struct Session {
    pub id: ClientId,
    ///Fixed for the session's lifetime, a CONNECT changing it starts a new session
    pub clean_session: bool,
    pub created_at: TimestampMillis,
    stats: Arc<Stats>,
    state: Mutex<SessionState>,
}

struct SessionState {
    keep_alive: u16,
    keep_alive_timeout: Option<TimestampMillis>,
    conn_id: Option<ConnId>,
    tx: Option<Tx>,
    subscriptions: BTreeMap<TopicFilter, QoS>,
    last_will: Option<LastWill>,
    last_activity: TimestampMillis,
    delivery: Delivery,
    in_inflight: InInflight,
}

/// What is left to do after a transport went away.
#[derive(Debug, Default)]
pub struct Detached {
    ///Published on the client's behalf
    pub last_will: Option<LastWill>,
    ///Set when the session state is gone
    pub terminated: Option<Terminated>,
}

#[derive(Debug, Default)]
pub struct Terminated {
    pub subscriptions: Vec<TopicFilter>,
    pub undelivered: Vec<Publish>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({}, clean: {})", self.id, self.clean_session)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stats.sessions.dec();
        let state = self.state.get_mut();
        self.stats.subscriptions.decs(state.subscriptions.len() as isize);
        if state.tx.is_some() {
            self.stats.connections.dec();
        }
    }
}

impl Session {
    pub fn new(id: ClientId, clean_session: bool, mqtt: &Mqtt, stats: &Arc<Stats>) -> Self {
        let (s1, s2) = (stats.clone(), stats.clone());
        let in_inflight = InInflight::new(mqtt.max_inflight.get() as usize)
            .on_push(move || s1.in_inflights.inc())
            .on_pop(move || s2.in_inflights.dec());
        stats.sessions.inc();
        let now = timestamp_millis();
        Self {
            id,
            clean_session,
            created_at: now,
            stats: stats.clone(),
            state: Mutex::new(SessionState {
                keep_alive: 0,
                keep_alive_timeout: None,
                conn_id: None,
                tx: None,
                subscriptions: BTreeMap::default(),
                last_will: None,
                last_activity: now,
                delivery: Delivery::new(mqtt, stats),
                in_inflight,
            }),
        }
    }

    /// Binds a live transport. A transport still attached is closed with
    /// [`Reason::ConnectTakenOver`] and its leftovers are returned.
    /// Unacknowledged deliveries are re-sent with dup set, then the backlog drains.
    pub fn attach(
        &self,
        conn_id: ConnId,
        tx: Tx,
        keep_alive: u16,
        keep_alive_timeout: Option<TimestampMillis>,
        last_will: Option<LastWill>,
        now: TimestampMillis,
    ) -> Option<Detached> {
        let mut state = self.state.lock();
        let prev = state
            .conn_id
            .and_then(|prev| state.unbind(&self.stats, prev, Reason::ConnectTakenOver))
            .map(|last_will| Detached { last_will, terminated: None });
        state.conn_id = Some(conn_id);
        state.keep_alive = keep_alive;
        state.keep_alive_timeout = keep_alive_timeout;
        state.last_will = last_will;
        state.last_activity = now;
        state.delivery.resume(&tx, now);
        state.tx = Some(tx);
        self.stats.connections.inc();
        log::debug!("{:?} attached, conn_id: {}", self.id, conn_id);
        prev
    }

    /// Unbinds the transport of `conn_id`. A persistent session keeps everything
    /// and cancels its retry timers; a clean one discards its state.
    /// Returns `None` when `conn_id` is no longer the attached connection.
    pub fn detach(&self, conn_id: ConnId, reason: Reason, registry: &Registry) -> Option<Detached> {
        let mut state = self.state.lock();
        let last_will = state.unbind(&self.stats, conn_id, reason)?;
        let terminated =
            if self.clean_session { Some(state.terminate(&self.id, &self.stats, registry)) } else { None };
        log::debug!("{:?} detached, conn_id: {}", self.id, conn_id);
        Some(Detached { last_will, terminated })
    }

    /// Ends the session whatever its kind: closes the attached transport, if any,
    /// and discards every subscription and pending delivery.
    pub fn kick(&self, reason: Reason, registry: &Registry) -> Detached {
        let mut state = self.state.lock();
        let last_will = state.conn_id.and_then(|c| state.unbind(&self.stats, c, reason)).flatten();
        let terminated = Some(state.terminate(&self.id, &self.stats, registry));
        log::debug!("{:?} kicked", self.id);
        Detached { last_will, terminated }
    }

    /// Any inbound packet resets the keepalive deadline.
    #[inline]
    pub fn touch(&self, now: TimestampMillis) {
        self.state.lock().last_activity = now;
    }

    /// True when an attached session stayed silent longer than
    /// `keepalive * keepalive_backoff`.
    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.state.lock().is_expired(now)
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.state.lock().tx.is_some()
    }

    #[inline]
    pub fn conn_id(&self) -> Option<ConnId> {
        self.state.lock().conn_id
    }

    #[inline]
    pub fn keep_alive(&self) -> u16 {
        self.state.lock().keep_alive
    }

    #[inline]
    pub fn subscriptions(&self) -> Vec<(TopicFilter, QoS)> {
        self.state.lock().subscriptions.iter().map(|(f, q)| (f.clone(), *q)).collect()
    }

    /// Subscribes on behalf of connection `conn_id`, in the session and the registry.
    /// Returns the previously granted QoS. Fails with [`MqttError::ConnectionClosed`]
    /// once `conn_id` no longer owns the session.
    pub fn subscribe(
        &self,
        conn_id: ConnId,
        registry: &Registry,
        topic_filter: TopicFilter,
        qos: QoS,
    ) -> Result<Option<QoS>, MqttError> {
        let mut state = self.state.lock();
        if state.conn_id != Some(conn_id) {
            return Err(MqttError::ConnectionClosed);
        }
        registry.subscribe(&self.id, &topic_filter, qos)?;
        let prev = state.subscriptions.insert(topic_filter, qos);
        if prev.is_none() {
            self.stats.subscriptions.inc();
        }
        Ok(prev)
    }

    ///Returns the QoS the removed subscription had
    pub fn unsubscribe(
        &self,
        conn_id: ConnId,
        registry: &Registry,
        topic_filter: &TopicFilter,
    ) -> Result<Option<QoS>, MqttError> {
        let mut state = self.state.lock();
        if state.conn_id != Some(conn_id) {
            return Err(MqttError::ConnectionClosed);
        }
        registry.unsubscribe(&self.id, topic_filter);
        let removed = state.subscriptions.remove(topic_filter);
        if removed.is_some() {
            self.stats.subscriptions.dec();
        }
        Ok(removed)
    }

    #[inline]
    pub fn inflight_len(&self) -> usize {
        self.state.lock().delivery.inflight().len()
    }

    #[inline]
    pub fn queue_len(&self) -> usize {
        self.state.lock().delivery.queue_len()
    }

    ///Discards the last will of connection `conn_id`, e.g. on DISCONNECT
    #[inline]
    pub fn discard_last_will(&self, conn_id: ConnId) -> Option<LastWill> {
        let mut state = self.state.lock();
        if state.conn_id == Some(conn_id) {
            state.last_will.take()
        } else {
            None
        }
    }

    /// Sends a control packet to the attached transport of `conn_id`.
    #[inline]
    pub fn send(&self, conn_id: ConnId, packet: Packet) -> bool {
        let state = self.state.lock();
        match state.tx.as_ref() {
            Some(tx) if state.conn_id == Some(conn_id) => delivery::send(tx, packet),
            _ => false,
        }
    }

    /// Hands one message to the delivery engine.
    #[inline]
    pub fn deliver(&self, publish: Publish, now: TimestampMillis) -> Result<(), Reason> {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.delivery.enqueue(state.tx.as_ref(), publish, now)
    }

    #[inline]
    pub fn on_ack(&self, packet_id: NonZeroU16, ack: AckType, now: TimestampMillis) -> Option<Publish> {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.delivery.on_ack(state.tx.as_ref(), packet_id, ack, now)
    }

    /// Records an inbound QoS 2 packet id, see [`InInflight::add`].
    #[inline]
    pub fn incoming_add(&self, packet_id: NonZeroU16, dup: bool) -> Result<bool, Reason> {
        self.state.lock().in_inflight.add(packet_id, dup)
    }

    #[inline]
    pub fn incoming_remove(&self, packet_id: &NonZeroU16) -> bool {
        self.state.lock().in_inflight.remove(packet_id)
    }

    /// Drives retransmission, returns the deliveries dropped at the retry limit.
    #[inline]
    pub fn tick(&self, now: TimestampMillis) -> Vec<Publish> {
        let mut state = self.state.lock();
        let state = &mut *state;
        match state.tx.as_ref() {
            Some(tx) => state.delivery.tick(tx, now),
            None => Vec::new(),
        }
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        let state = self.state.lock();
        serde_json::json!({
            "client_id": self.id,
            "created_at": format_timestamp_millis(self.created_at),
            "clean_session": self.clean_session,
            "connected": state.tx.is_some(),
            "keep_alive": state.keep_alive,
            "subscriptions": state.subscriptions.len(),
            "inflight": state.delivery.inflight().len(),
            "mqueue": state.delivery.queue_len(),
            "last_activity": format_timestamp_millis(state.last_activity),
        })
    }
}

impl SessionState {
    ///Closes the transport of `conn_id`, `None` if it is not the attached one.
    fn unbind(&mut self, stats: &Stats, conn_id: ConnId, reason: Reason) -> Option<Option<LastWill>> {
        if self.conn_id != Some(conn_id) {
            return None;
        }
        self.conn_id = None;
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.try_send(Outgoing::Close(reason)) {
                log::debug!("close of conn_id {} not queued, {}", conn_id, e);
            }
            stats.connections.dec();
        }
        self.delivery.suspend();
        Some(self.last_will.take())
    }

    fn terminate(&mut self, id: &ClientId, stats: &Stats, registry: &Registry) -> Terminated {
        let subscriptions: Vec<TopicFilter> = std::mem::take(&mut self.subscriptions).into_keys().collect();
        for topic_filter in subscriptions.iter() {
            registry.unsubscribe(id, topic_filter);
        }
        stats.subscriptions.decs(subscriptions.len() as isize);
        Terminated { subscriptions, undelivered: self.delivery.clear() }
    }

    #[inline]
    fn is_expired(&self, now: TimestampMillis) -> bool {
        match (self.tx.as_ref(), self.keep_alive_timeout) {
            (Some(_), Some(timeout)) => now > self.last_activity.saturating_add(timeout),
            _ => false,
        }
    }
}
