//! Per-connection driver.
//!
//! [`serve`] runs one connection over any decoded packet stream and packet sink, so a
//! framed TCP/TLS/WebSocket codec plugs in without the core knowing the byte layout.
//! The loop multiplexes inbound packets with the session's outbound channel; the first
//! of remote close, protocol violation, DISCONNECT, takeover or keepalive expiry ends it.

use std::fmt;

use anyhow::anyhow;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::broker::{Broker, Handle};
use crate::types::{Outgoing, Packet, Rx};
use crate::{MqttError, Reason, Result};

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct StateFlags: u8 {
        const DisconnectReceived = 0b00000001;
        const Kicked = 0b00000010;
    }
}

/// Serves one connection until it ends. The first packet must be CONNECT; a refused
/// CONNECT is answered with its CONNACK and the connection ends.
pub async fn serve<St, Si, E>(broker: Broker, mut stream: St, mut sink: Si) -> Result<()>
where
    St: Stream<Item = std::result::Result<Packet, E>> + Unpin,
    Si: Sink<Packet> + Unpin,
    Si::Error: fmt::Debug,
    E: fmt::Debug,
{
    let connect = match stream.next().await {
        Some(Ok(Packet::Connect(connect))) => connect,
        Some(Ok(packet)) => {
            log::warn!("first packet is {}, not CONNECT", packet.name());
            return Err(MqttError::ConnectExpected.into());
        }
        Some(Err(e)) => return Err(anyhow!("decode error, {:?}", e)),
        None => return Ok(()),
    };

    let (tx, mut rx) = mpsc::channel(broker.settings.mqtt.max_outbound_len);
    let handle = match broker.on_connect(&connect, tx) {
        Ok(handle) => handle,
        Err(return_code) => {
            while let Ok(Outgoing::Packet(packet)) = rx.try_recv() {
                sink.send(packet).await.map_err(|e| anyhow!("send error, {:?}", e))?;
            }
            return Err(anyhow!("{:?} {}", connect.client_id, return_code.reason()));
        }
    };

    log::debug!("{:?} online, conn_id: {}", handle.id(), handle.conn_id);
    let mut flags = StateFlags::empty();
    let reason = run_loop(&broker, &handle, &mut stream, &mut sink, &mut rx, &mut flags).await;
    log::info!(
        "{:?} offline, reason: {}, disconnect received: {}, kicked: {}",
        handle.id(),
        reason,
        flags.contains(StateFlags::DisconnectReceived),
        flags.contains(StateFlags::Kicked)
    );
    if !flags.contains(StateFlags::Kicked) {
        broker.on_close(&handle, reason);
    }
    Ok(())
}

async fn run_loop<St, Si, E>(
    broker: &Broker,
    handle: &Handle,
    stream: &mut St,
    sink: &mut Si,
    rx: &mut Rx,
    flags: &mut StateFlags,
) -> Reason
where
    St: Stream<Item = std::result::Result<Packet, E>> + Unpin,
    Si: Sink<Packet> + Unpin,
    Si::Error: fmt::Debug,
    E: fmt::Debug,
{
    loop {
        tokio::select! {
            pkt = stream.next() => match pkt {
                Some(Ok(packet)) => {
                    log::debug!("{:?} recv {}", handle.id(), packet.name());
                    if matches!(packet, Packet::Disconnect) {
                        flags.insert(StateFlags::DisconnectReceived);
                    }
                    if let Err(e) = broker.on_packet(handle, packet) {
                        log::info!("{:?} protocol error, {}", handle.id(), e);
                        return e.into();
                    }
                }
                Some(Err(e)) => return Reason::ProtocolError(format!("decode error, {:?}", e)),
                None => return Reason::ConnectRemoteClose,
            },

            out = rx.recv() => match out {
                Some(Outgoing::Packet(packet)) => {
                    if let Err(e) = sink.send(packet).await {
                        log::debug!("{:?} send error, {:?}", handle.id(), e);
                        return Reason::ConnectRemoteClose;
                    }
                }
                Some(Outgoing::Close(reason)) => {
                    flags.insert(StateFlags::Kicked);
                    return reason;
                }
                None => return Reason::ConnectRemoteClose,
            },
        }
    }
}
