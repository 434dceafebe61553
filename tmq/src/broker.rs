//! Broker core.
//!
//! Owns the session table, the [`Router`] and the hooks, and is the single entry
//! point for a connection's packets. A [`Broker`] is a cheap handle; clone it into
//! every connection task.
//!
//! Lock discipline: table shard, then session, then registry. Outside of a takeover
//! an `Arc<Session>` is cloned out of the table before the session is locked, and
//! registry changes happen under the lock of the session they belong to. Hooks run
//! with no lock held.

use std::fmt;
use std::num::NonZeroU16;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::conf::Settings;
use crate::delivery::{self, AckType};
use crate::hook::DefaultHookManager;
use crate::retain::{DefaultRetainStorage, RetainStorage};
use crate::router::Router;
use crate::session::{Detached, Session, Sessions, Terminated};
use crate::stats::Stats;
use crate::topic::Topic;
use crate::types::{
    ClientId, ConnId, Connect, ConnectAckReason, LastWill, Packet, Publish, SubscribeReturnCode, TimestampMillis,
    TopicFilter, Tx,
};
use crate::utils::timestamp_millis;
use crate::{MqttError, QoS, Reason};

/// A connection bound to its session, returned by [`Broker::on_connect`].
#[derive(Clone, Debug)]
pub struct Handle {
    pub session: Arc<Session>,
    pub conn_id: ConnId,
    pub session_present: bool,
}

impl Handle {
    #[inline]
    pub fn id(&self) -> &ClientId {
        &self.session.id
    }

    #[inline]
    fn send(&self, packet: Packet) {
        self.session.send(self.conn_id, packet);
    }
}

#[derive(Default)]
pub struct Builder {
    settings: Option<Settings>,
    retain: Option<Box<dyn RetainStorage>>,
    hooks: Option<DefaultHookManager>,
}

impl Builder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    ///Replaces the in-memory retained store
    pub fn retain_storage(mut self, retain: Box<dyn RetainStorage>) -> Self {
        self.retain = Some(retain);
        self
    }

    pub fn hooks(mut self, hooks: DefaultHookManager) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> Broker {
        let settings = self.settings.unwrap_or_default();
        let retain =
            self.retain.unwrap_or_else(|| Box::new(DefaultRetainStorage::new(settings.mqtt.retain_enable)));
        Broker(Arc::new(BrokerInner {
            router: Router::new(retain),
            hooks: self.hooks.unwrap_or_default(),
            sessions: Sessions::default(),
            stats: Arc::new(Stats::new()),
            conn_ids: AtomicU64::new(1),
            settings,
        }))
    }
}

pub struct BrokerInner {
    pub settings: Settings,
    pub sessions: Sessions,
    pub router: Router,
    pub hooks: DefaultHookManager,
    pub stats: Arc<Stats>,
    conn_ids: AtomicU64,
}

#[derive(Clone)]
pub struct Broker(Arc<BrokerInner>);

impl Deref for Broker {
    type Target = BrokerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker {{ sessions: {}, {:?} }}", self.sessions.len(), self.router.registry())
    }
}

impl Broker {
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    #[inline]
    pub fn session(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|s| s.value().clone())
    }

    /// Spawns the periodic task driving retransmission and keepalive expiry.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        let tick_interval = self.settings.mqtt.tick_interval;
        log::info!("broker started, tick interval: {:?}", tick_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                ticker.tick().await;
                broker.tick(timestamp_millis());
            }
        })
    }

    /// Binds a new connection. CONNACK is sent through `tx` before anything else,
    /// including a refusal, in which case the refusing code is returned.
    ///
    /// An existing session with the same client id is resumed when both the old and
    /// the new connection ask for a persistent session; otherwise it is terminated and
    /// replaced. A connection still attached to it is closed as taken over.
    pub fn on_connect(&self, connect: &Connect, tx: Tx) -> Result<Handle, ConnectAckReason> {
        let mqtt = &self.settings.mqtt;
        let refuse = |return_code: ConnectAckReason| {
            log::info!("{:?} connect refused, {}", connect.client_id, return_code.reason());
            delivery::send(&tx, Packet::ConnectAck { return_code, session_present: false });
            Err(return_code)
        };

        if connect.keep_alive == 0 && !mqtt.allow_zero_keepalive {
            return refuse(ConnectAckReason::ServiceUnavailable);
        }
        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                return refuse(ConnectAckReason::IdentifierRejected);
            }
            ClientId::from(Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_string())
        } else {
            connect.client_id.clone()
        };
        let keep_alive = connect.keep_alive.min(mqtt.max_keepalive);
        let conn_id = self.conn_ids.fetch_add(1, Ordering::SeqCst);

        //a replaced session is terminated while its shard is still held
        let (session, session_present, replaced) = match self.sessions.entry(client_id.clone()) {
            Entry::Occupied(mut e) if connect.clean_session || e.get().clean_session => {
                let s = Arc::new(Session::new(client_id, connect.clean_session, mqtt, &self.stats));
                let old = e.insert(s.clone());
                let was_attached = old.is_attached();
                let detached = old.kick(Reason::ConnectTakenOver, self.router.registry());
                (s, false, Some((old, was_attached, detached)))
            }
            Entry::Occupied(e) => (e.get().clone(), true, None),
            Entry::Vacant(e) => {
                let s = Arc::new(Session::new(client_id, connect.clean_session, mqtt, &self.stats));
                e.insert(s.clone());
                (s, false, None)
            }
        };

        if let Some((old, was_attached, detached)) = replaced {
            if was_attached {
                self.hooks.client_disconnected(&old, Reason::ConnectTakenOver);
            }
            self.detached(&old, detached, Reason::ConnectTakenOver);
        }
        if !session_present {
            self.hooks.session_created(&session);
        }

        delivery::send(
            &tx,
            Packet::ConnectAck { return_code: ConnectAckReason::ConnectionAccepted, session_present },
        );
        let now = timestamp_millis();
        let prev = session.attach(
            conn_id,
            tx,
            keep_alive,
            mqtt.keepalive_timeout_millis(keep_alive),
            connect.last_will.clone(),
            now,
        );
        if let Some(prev) = prev {
            self.hooks.client_disconnected(&session, Reason::ConnectTakenOver);
            self.detached(&session, prev, Reason::ConnectTakenOver);
        }

        log::debug!("{:?} connected, conn_id: {}, session_present: {}", session.id, conn_id, session_present);
        self.hooks.client_connected(&session);
        Ok(Handle { session, conn_id, session_present })
    }

    /// Dispatches one inbound packet of an established connection. An error is a
    /// protocol violation and the connection must be closed with it. A connection
    /// that no longer owns its session gets [`MqttError::ConnectionClosed`].
    pub fn on_packet(&self, handle: &Handle, packet: Packet) -> Result<(), MqttError> {
        if handle.session.conn_id() != Some(handle.conn_id) {
            log::debug!("{:?} {} from stale conn_id {}, refused", handle.id(), packet.name(), handle.conn_id);
            return Err(MqttError::ConnectionClosed);
        }
        let now = timestamp_millis();
        handle.session.touch(now);
        match packet {
            Packet::Publish(publish) => self.on_publish(handle, publish, now),
            Packet::PublishAck { packet_id } => {
                self.on_ack(handle, packet_id, AckType::PublishAck, now);
                Ok(())
            }
            Packet::PublishReceived { packet_id } => {
                self.on_ack(handle, packet_id, AckType::PublishReceived, now);
                Ok(())
            }
            Packet::PublishRelease { packet_id } => {
                if !handle.session.incoming_remove(&packet_id) {
                    log::debug!("{:?} PUBREL for unknown packet id {}", handle.id(), packet_id);
                }
                handle.send(Packet::PublishComplete { packet_id });
                Ok(())
            }
            Packet::PublishComplete { packet_id } => {
                self.on_ack(handle, packet_id, AckType::PublishComplete, now);
                Ok(())
            }
            Packet::Subscribe { packet_id, topic_filters } => {
                self.on_subscribe(handle, packet_id, topic_filters, now)
            }
            Packet::Unsubscribe { packet_id, topic_filters } => {
                self.on_unsubscribe(handle, packet_id, topic_filters)
            }
            Packet::PingRequest => {
                handle.send(Packet::PingResponse);
                Ok(())
            }
            Packet::Disconnect => {
                self.on_disconnect(handle);
                Ok(())
            }
            Packet::Connect(_) => Err(MqttError::UnexpectedPacket("CONNECT")),
            Packet::ConnectAck { .. }
            | Packet::SubscribeAck { .. }
            | Packet::UnsubscribeAck { .. }
            | Packet::PingResponse => Err(MqttError::UnexpectedPacket(packet.name())),
        }
    }

    /// Validates the whole batch first, a malformed filter rejects it untouched.
    /// Each filter then goes through the subscribe policy; retained messages of the
    /// granted filters follow the SUBACK.
    pub fn on_subscribe(
        &self,
        handle: &Handle,
        packet_id: NonZeroU16,
        topic_filters: Vec<(TopicFilter, QoS)>,
        now: TimestampMillis,
    ) -> Result<(), MqttError> {
        let topics = topic_filters.iter().map(|(f, _)| Topic::filter(f)).collect::<Result<Vec<_>, _>>()?;
        let s = &handle.session;
        let mut status = Vec::with_capacity(topic_filters.len());
        let mut retaineds = Vec::new();
        for ((topic_filter, qos), topic) in topic_filters.into_iter().zip(topics) {
            match self.hooks.client_subscribe(s, &topic_filter, qos) {
                SubscribeReturnCode::Success(granted) => {
                    s.subscribe(handle.conn_id, self.router.registry(), topic_filter.clone(), granted)?;
                    self.hooks.session_subscribed(s, &topic_filter, granted);
                    retaineds.extend(self.router.retained(&topic, granted));
                    status.push(SubscribeReturnCode::Success(granted));
                }
                SubscribeReturnCode::Failure => {
                    log::debug!("{:?} subscribe refused, {}", s.id, topic_filter);
                    status.push(SubscribeReturnCode::Failure);
                }
            }
        }
        handle.send(Packet::SubscribeAck { packet_id, status });
        for publish in retaineds {
            if let Err(reason) = s.deliver(publish.clone(), now) {
                self.dropped(&s.id, &publish, reason);
            }
        }
        Ok(())
    }

    pub fn on_unsubscribe(
        &self,
        handle: &Handle,
        packet_id: NonZeroU16,
        topic_filters: Vec<TopicFilter>,
    ) -> Result<(), MqttError> {
        for f in topic_filters.iter() {
            Topic::filter(f)?;
        }
        let s = &handle.session;
        for topic_filter in topic_filters {
            if s.unsubscribe(handle.conn_id, self.router.registry(), &topic_filter)?.is_some() {
                self.hooks.session_unsubscribed(s, &topic_filter);
            }
        }
        handle.send(Packet::UnsubscribeAck { packet_id });
        Ok(())
    }

    /// Inbound PUBLISH. QoS 1 is routed then acknowledged. QoS 2 is routed once per
    /// packet id; a retransmission only repeats the PUBREC. With the inbound window
    /// full the message is dropped unacknowledged, so the client retries it.
    pub fn on_publish(&self, handle: &Handle, publish: Publish, now: TimestampMillis) -> Result<(), MqttError> {
        Topic::name(&publish.topic)?;
        let s = &handle.session;
        match publish.qos {
            QoS::AtMostOnce => {
                self.forward(s, publish, now)?;
            }
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id.ok_or(MqttError::PacketIdMissing)?;
                self.forward(s, publish, now)?;
                handle.send(Packet::PublishAck { packet_id });
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.ok_or(MqttError::PacketIdMissing)?;
                match s.incoming_add(packet_id, publish.dup) {
                    Ok(true) => {
                        self.forward(s, publish, now)?;
                        handle.send(Packet::PublishReceived { packet_id });
                    }
                    Ok(false) => {
                        log::debug!("{:?} duplicate QoS 2 publish, packet id {}", s.id, packet_id);
                        handle.send(Packet::PublishReceived { packet_id });
                    }
                    Err(Reason::InflightWindowFull) => {
                        self.dropped(&s.id, &publish, Reason::InflightWindowFull);
                    }
                    Err(_) => return Err(MqttError::PacketIdInUse(packet_id)),
                }
            }
        }
        Ok(())
    }

    /// DISCONNECT: the will is discarded and the session detached.
    pub fn on_disconnect(&self, handle: &Handle) {
        handle.session.discard_last_will(handle.conn_id);
        self.on_close(handle, Reason::ConnectDisconnect);
    }

    /// The connection is gone. Publishes the will, if still armed, and removes a
    /// clean session. A no-op when the connection was already replaced or closed.
    pub fn on_close(&self, handle: &Handle, reason: Reason) {
        let s = &handle.session;
        if let Some(detached) = s.detach(handle.conn_id, reason.clone(), self.router.registry()) {
            log::debug!("{:?} closed, conn_id: {}, reason: {}", s.id, handle.conn_id, reason);
            self.hooks.client_disconnected(s, reason.clone());
            if detached.terminated.is_some() {
                self.sessions.remove_if(&s.id, |_, v| Arc::ptr_eq(v, s));
            }
            self.detached(s, detached, reason);
        }
    }

    /// Retransmits due deliveries of every attached session and force-closes those
    /// whose keepalive expired.
    pub fn tick(&self, now: TimestampMillis) {
        let sessions = self.sessions.iter().map(|e| e.value().clone()).collect::<Vec<_>>();
        for s in sessions {
            if s.is_expired(now) {
                if let Some(conn_id) = s.conn_id() {
                    log::info!("{:?} keepalive timeout, keep_alive: {}", s.id, s.keep_alive());
                    let handle = Handle { session: s.clone(), conn_id, session_present: false };
                    self.on_close(&handle, Reason::ConnectKeepaliveTimeout);
                }
                continue;
            }
            for publish in s.tick(now) {
                self.dropped(&s.id, &publish, Reason::RetryExhausted);
            }
        }
    }

    #[inline]
    pub fn stats_json(&self) -> serde_json::Value {
        self.stats.to_json(self.router.registry(), self.router.retain())
    }

    #[inline]
    fn on_ack(&self, handle: &Handle, packet_id: NonZeroU16, ack: AckType, now: TimestampMillis) {
        if let Some(publish) = handle.session.on_ack(packet_id, ack, now) {
            self.stats.acked.inc();
            self.hooks.message_acked(&handle.session, &publish);
        }
    }

    /// Runs the publish hook, then fans the message out.
    fn forward(&self, from: &Session, publish: Publish, now: TimestampMillis) -> Result<usize, MqttError> {
        let publish = match self.hooks.message_publish(from, &publish) {
            Ok(Some(p)) => p,
            Ok(None) => publish,
            Err(reason) => {
                log::debug!("{:?} publish refused, {:?}", from.id, publish);
                self.dropped(&from.id, &publish, reason);
                return Ok(0);
            }
        };
        let routed = self.router.route(&self.sessions, &publish, now)?;
        self.stats.forwards.incs(routed.accepted as isize);
        for (to, p, reason) in routed.dropped {
            self.dropped(&to, &p, reason);
        }
        Ok(routed.accepted)
    }

    fn publish_last_will(&self, from: &Session, last_will: LastWill) {
        log::debug!("{:?} publish last will, topic: {}", from.id, last_will.topic);
        if let Err(e) = self.forward(from, last_will.to_publish(), timestamp_millis()) {
            log::warn!("{:?} last will error, {}", from.id, e);
        }
    }

    fn detached(&self, s: &Session, detached: Detached, reason: Reason) {
        if let Some(last_will) = detached.last_will {
            self.publish_last_will(s, last_will);
        }
        if let Some(terminated) = detached.terminated {
            self.terminated(s, terminated, reason);
        }
    }

    fn terminated(&self, s: &Session, terminated: Terminated, reason: Reason) {
        for publish in terminated.undelivered {
            self.dropped(&s.id, &publish, Reason::SessionTerminated);
        }
        log::debug!(
            "{:?} session terminated, reason: {}, subscriptions: {}",
            s.id,
            reason,
            terminated.subscriptions.len()
        );
        self.hooks.session_terminated(s, reason);
    }

    #[inline]
    fn dropped(&self, to: &ClientId, publish: &Publish, reason: Reason) {
        self.stats.dropped.inc();
        self.hooks.message_dropped(to, publish, reason);
    }
}
