use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::error::MqttError;

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

pub type ClientId = ByteString;
pub type TopicName = ByteString;
pub type TopicFilter = ByteString;
pub type PacketId = u16;
///Identifies one network connection of a session, changes on every CONNECT
pub type ConnId = u64;
pub type TimestampMillis = tmq_utils::TimestampMillis;

///Outbound channel of one connection, bounded by `mqtt.max_outbound_len`
pub type Tx = tokio::sync::mpsc::Sender<Outgoing>;
pub type Rx = tokio::sync::mpsc::Receiver<Outgoing>;

/// Quality of Service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QoS {
    /// At most once delivery
    AtMostOnce = 0,
    /// At least once delivery, acknowledged by PUBACK
    AtLeastOnce = 1,
    /// Exactly once delivery, PUBREC / PUBREL / PUBCOMP
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    #[inline]
    pub fn less_value(&self, qos: QoS) -> QoS {
        if self.value() < qos.value() {
            *self
        } else {
            qos
        }
    }
}

impl From<QoS> for u8 {
    fn from(v: QoS) -> Self {
        v.value()
    }
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(MqttError::UnexpectedPacket("qos out of range")),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Publish {
    /// this might be re-delivery of an earlier attempt to send the Packet.
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: TopicName,
    /// only present in PUBLISH Packets where the QoS level is 1 or 2.
    pub packet_id: Option<NonZeroU16>,
    pub payload: Bytes,
}

impl Publish {
    #[inline]
    pub fn new<T, P>(topic: T, payload: P, qos: QoS) -> Self
    where
        TopicName: From<T>,
        Bytes: From<P>,
    {
        Self { dup: false, retain: false, qos, topic: topic.into(), packet_id: None, payload: payload.into() }
    }

    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[inline]
    pub fn packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = NonZeroU16::new(packet_id);
        self
    }

    #[inline]
    pub fn dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }
}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publish")
            .field("packet_id", &self.packet_id)
            .field("topic", &self.topic)
            .field("dup", &self.dup)
            .field("retain", &self.retain)
            .field("qos", &self.qos)
            .field("payload", &format_args!("{} bytes", self.payload.len()))
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
/// Connection Will
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: TopicName,
    pub message: Bytes,
}

impl LastWill {
    #[inline]
    pub fn to_publish(&self) -> Publish {
        Publish::new(self.topic.clone(), self.message.clone(), self.qos).retain(self.retain)
    }
}

#[derive(Default, Debug, PartialEq, Eq, Clone)]
/// Connect packet content
pub struct Connect {
    pub clean_session: bool,
    /// seconds, 0 disables the keepalive mechanism
    pub keep_alive: u16,
    pub last_will: Option<LastWill>,
    pub client_id: ClientId,
}

impl Connect {
    #[inline]
    pub fn new<T>(client_id: T, clean_session: bool, keep_alive: u16) -> Self
    where
        ClientId: From<T>,
    {
        Self { clean_session, keep_alive, last_will: None, client_id: client_id.into() }
    }

    #[inline]
    pub fn last_will(mut self, last_will: LastWill) -> Self {
        self.last_will = Some(last_will);
        self
    }
}

/// Connect Return Code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectAckReason {
    ConnectionAccepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServiceUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectAckReason {
    pub fn reason(self) -> &'static str {
        match self {
            ConnectAckReason::ConnectionAccepted => "Connection Accepted",
            ConnectAckReason::UnacceptableProtocolVersion => {
                "Connection Refused, unacceptable protocol version"
            }
            ConnectAckReason::IdentifierRejected => "Connection Refused, identifier rejected",
            ConnectAckReason::ServiceUnavailable => "Connection Refused, Server unavailable",
            ConnectAckReason::BadUserNameOrPassword => "Connection Refused, bad user name or password",
            ConnectAckReason::NotAuthorized => "Connection Refused, not authorized",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
/// Subscribe Return Code
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// MQTT Control Packets
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck {
        return_code: ConnectAckReason,
        session_present: bool,
    },
    Publish(Publish),
    PublishAck {
        packet_id: NonZeroU16,
    },
    PublishReceived {
        packet_id: NonZeroU16,
    },
    PublishRelease {
        packet_id: NonZeroU16,
    },
    PublishComplete {
        packet_id: NonZeroU16,
    },
    Subscribe {
        packet_id: NonZeroU16,
        topic_filters: Vec<(TopicFilter, QoS)>,
    },
    SubscribeAck {
        packet_id: NonZeroU16,
        status: Vec<SubscribeReturnCode>,
    },
    Unsubscribe {
        packet_id: NonZeroU16,
        topic_filters: Vec<TopicFilter>,
    },
    UnsubscribeAck {
        packet_id: NonZeroU16,
    },
    PingRequest,
    PingResponse,
    Disconnect,
}

impl From<Connect> for Packet {
    fn from(val: Connect) -> Packet {
        Packet::Connect(Box::new(val))
    }
}

impl From<Publish> for Packet {
    fn from(val: Publish) -> Packet {
        Packet::Publish(val)
    }
}

impl Packet {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnectAck { .. } => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PublishAck { .. } => "PUBACK",
            Packet::PublishReceived { .. } => "PUBREC",
            Packet::PublishRelease { .. } => "PUBREL",
            Packet::PublishComplete { .. } => "PUBCOMP",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubscribeAck { .. } => "SUBACK",
            Packet::Unsubscribe { .. } => "UNSUBSCRIBE",
            Packet::UnsubscribeAck { .. } => "UNSUBACK",
            Packet::PingRequest => "PINGREQ",
            Packet::PingResponse => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

/// What the engine hands to a connection's writer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Outgoing {
    Packet(Packet),
    ///The broker ended this connection
    Close(Reason),
}

/// Why a connection ended or a message was dropped
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum Reason {
    #[error("Disconnect")]
    ConnectDisconnect,
    #[error("Keepalive timeout")]
    ConnectKeepaliveTimeout,
    #[error("Taken over by a new connection")]
    ConnectTakenOver,
    #[error("Remote close connect")]
    ConnectRemoteClose,
    #[error("Protocol error, {0}")]
    ProtocolError(String),
    #[error("Message queue is full")]
    MessageQueueFull,
    #[error("Inflight window is full")]
    InflightWindowFull,
    #[error("Retransmission limit reached")]
    RetryExhausted,
    #[error("Session terminated")]
    SessionTerminated,
    #[error("Publish refused")]
    PublishRefused,
}

impl From<MqttError> for Reason {
    #[inline]
    fn from(e: MqttError) -> Self {
        Reason::ProtocolError(e.to_string())
    }
}
