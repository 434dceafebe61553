use std::num::NonZeroU16;

/// Protocol level errors. Any of these ends the offending connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MqttError {
    #[error("invalid topic filter, {0}")]
    InvalidTopicFilter(String),
    #[error("invalid topic name, {0}")]
    InvalidTopicName(String),
    #[error("packet id {0} is in use")]
    PacketIdInUse(NonZeroU16),
    #[error("packet id is missing for a QoS > 0 publish")]
    PacketIdMissing,
    #[error("identifier rejected")]
    IdentifierRejected,
    #[error("unexpected packet, {0}")]
    UnexpectedPacket(&'static str),
    #[error("first packet is not CONNECT")]
    ConnectExpected,
    #[error("connection is closed or taken over")]
    ConnectionClosed,
}
