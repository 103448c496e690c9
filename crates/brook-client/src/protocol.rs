//! Client-role protocol handler.
//!
//! `ClientProtocol` holds no socket. Callers feed it received bytes and the
//! current time, then drain its outbound buffer and events. The QoS
//! handshakes are the shared `InflightState` from brook-core, driven by the
//! opposite packet directions to the broker's.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use brook_core::codec::Decode;
use brook_core::keepalive::{KeepAlive, PingTimer};
use brook_core::packet_id::PacketIdAllocator;
use brook_core::topic::validate_topic_name;
use brook_core::{
    Connack, ConnackCode, Connect, InflightState, Message, Packet, PacketDecoder, PacketType,
    ProtocolError, QoS, Subscribe, Topic, Unsubscribe,
};
use log::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, ConnectionState};

/// Client-side protocol state for one broker connection.
#[derive(Debug)]
pub struct ClientProtocol {
    state: ConnectionState,
    inflight: InflightState,
    packet_ids: PacketIdAllocator,
    decoder: PacketDecoder,
    max_packet_size: usize,
    keep_alive_secs: u16,
    /// PINGREQ cadence, running while connected.
    ping: PingTimer,
    /// Receive timeout.
    keep_alive: KeepAlive,
    outbound: Vec<u8>,
    events: VecDeque<ClientEvent>,
}

impl ClientProtocol {
    /// Start disconnected, carrying over in-flight state from a previous run.
    pub fn new(inflight: InflightState, max_packet_size: usize) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            inflight,
            packet_ids: PacketIdAllocator::new(),
            decoder: PacketDecoder::new(max_packet_size),
            max_packet_size,
            keep_alive_secs: 0,
            ping: PingTimer::stopped(),
            keep_alive: KeepAlive::disabled(Instant::now()),
            outbound: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Unacknowledged QoS 1/2 state.
    pub fn inflight(&self) -> &InflightState {
        &self.inflight
    }

    /// Queue CONNECT. A clean session drops any in-flight state.
    pub fn connect(&mut self, config: &ClientConfig, now: Instant) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(ClientError::InvalidState(
                "Already connected or connecting".to_string(),
            ));
        }

        if config.clean_session {
            self.inflight.clear();
            self.packet_ids.reset();
        }

        self.decoder = PacketDecoder::new(self.max_packet_size);
        self.outbound.clear();
        self.keep_alive_secs = config.keep_alive;
        self.keep_alive = KeepAlive::new(config.keep_alive, now);
        self.ping = PingTimer::stopped();
        self.state = ConnectionState::Connecting;

        self.send(&Packet::Connect(Connect {
            clean_session: config.clean_session,
            keep_alive: config.keep_alive,
            client_id: config.client_id.clone(),
            will: config.will.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            ..Default::default()
        }));
        Ok(())
    }

    /// Queue DISCONNECT and stop the timers.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.send(&Packet::Disconnect);
        self.close(None);
    }

    /// Queue SUBSCRIBE. Returns its packet identifier.
    pub fn subscribe(&mut self, topics: &[(&str, QoS)]) -> Result<u16> {
        self.require_connected()?;
        if topics.is_empty() {
            return Err(ProtocolError::MalformedPacket("SUBSCRIBE without topics".into()).into());
        }

        let packet_id = self.allocate_id()?;
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            topics: topics
                .iter()
                .map(|(name, qos)| Topic::new(*name, *qos))
                .collect(),
        }));
        Ok(packet_id)
    }

    /// Queue UNSUBSCRIBE. Returns its packet identifier.
    pub fn unsubscribe(&mut self, topics: &[&str]) -> Result<u16> {
        self.require_connected()?;
        if topics.is_empty() {
            return Err(ProtocolError::MalformedPacket("UNSUBSCRIBE without topics".into()).into());
        }

        let packet_id = self.allocate_id()?;
        self.send(&Packet::Unsubscribe(Unsubscribe {
            packet_id,
            topics: topics.iter().map(|t| t.to_string()).collect(),
        }));
        Ok(packet_id)
    }

    /// Queue PUBLISH. QoS 1/2 messages get a packet identifier and stay in
    /// flight until acknowledged.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        self.require_connected()?;
        validate_topic_name(topic)?;

        let message = Message::new(topic, payload, qos, retain);
        if qos == QoS::AtMostOnce {
            self.send(&Packet::Publish(message.to_publish(0, false)));
            return Ok(None);
        }

        let packet_id = self.allocate_id()?;
        let publish = message.to_publish(packet_id, false);
        self.inflight.track(packet_id, message);
        self.send(&Packet::Publish(publish));
        Ok(Some(packet_id))
    }

    /// Feed received bytes. Partial packets are kept for the next call.
    pub fn handle_bytes(&mut self, buf: &[u8], now: Instant) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() && self.state != ConnectionState::Disconnected {
            let progress = match self.decoder.decode(&buf[pos..]) {
                Ok(progress) => progress,
                Err(e) => {
                    self.close(Some(e.to_string()));
                    return Err(e.into());
                }
            };
            pos += progress.consumed;
            let Some(packet) = progress.value else {
                break;
            };
            self.keep_alive.restart(now);
            debug!("<- {:?}", packet.packet_type());
            if let Err(e) = self.handle_packet(packet, now) {
                if self.state != ConnectionState::Disconnected {
                    self.close(Some(e.to_string()));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Send PINGREQ when due and check the receive timeout.
    pub fn poll_timers(&mut self, now: Instant) -> Result<()> {
        if self.state == ConnectionState::Disconnected {
            return Ok(());
        }
        if self.keep_alive.is_expired(now) {
            warn!("No packet from broker within keep-alive timeout");
            self.close(Some(ClientError::KeepAliveTimeout.to_string()));
            return Err(ClientError::KeepAliveTimeout);
        }
        if self.ping.poll(now) {
            self.send(&Packet::Pingreq);
        }
        Ok(())
    }

    /// Earliest instant `poll_timers` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        match (self.ping.deadline(), self.keep_alive.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The socket went away without DISCONNECT.
    pub fn connection_lost(&mut self, reason: impl Into<String>) {
        if self.state != ConnectionState::Disconnected {
            self.close(Some(reason.into()));
        }
    }

    pub fn pending_output(&self) -> &[u8] {
        &self.outbound
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Drop the first `n` bytes of output after they were written.
    pub fn consume_output(&mut self, n: usize) {
        let n = n.min(self.outbound.len());
        self.outbound.drain(..n);
    }

    pub fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    fn send(&mut self, packet: &Packet) {
        let start = self.outbound.len();
        packet.encode(&mut self.outbound);
        trace!(
            "-> {:?} {:02x?}",
            packet.packet_type(),
            &self.outbound[start..]
        );
    }

    fn close(&mut self, reason: Option<String>) {
        self.state = ConnectionState::Disconnected;
        self.ping = PingTimer::stopped();
        self.events.push_back(ClientEvent::Disconnected { reason });
    }

    fn require_connected(&self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> Result<u16> {
        let inflight = &self.inflight;
        self.packet_ids
            .allocate(|id| inflight.is_in_use(id))
            .ok_or_else(|| ClientError::InvalidState("No free packet identifier".to_string()))
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) -> Result<()> {
        if self.state == ConnectionState::Connecting {
            return match packet {
                Packet::Connack(connack) => self.handle_connack(connack, now),
                other => Err(ProtocolError::UnexpectedPacket(other.packet_type()).into()),
            };
        }

        match packet {
            Packet::Publish(publish) => {
                let inbound = self.inflight.on_publish(&publish)?;
                if let Some(reply) = &inbound.reply {
                    self.send(reply);
                }
                if inbound.deliver {
                    self.events.push_back(ClientEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload,
                        qos: publish.qos,
                        retain: publish.retain,
                    });
                }
            }
            Packet::Puback { packet_id } => {
                if self.inflight.on_puback(packet_id)?.is_some() {
                    self.events.push_back(ClientEvent::PubAck { packet_id });
                } else {
                    debug!("PUBACK for unknown packet {}", packet_id);
                }
            }
            Packet::Pubrec { packet_id } => {
                let pubrel = self.inflight.on_pubrec(packet_id)?;
                self.send(&pubrel);
            }
            Packet::Pubrel { packet_id } => {
                let pubcomp = self.inflight.on_pubrel(packet_id)?;
                self.send(&pubcomp);
            }
            Packet::Pubcomp { packet_id } => {
                if self.inflight.on_pubcomp(packet_id)? {
                    self.events.push_back(ClientEvent::PubComp { packet_id });
                }
            }
            Packet::Suback(suback) => {
                if suback.packet_id == 0 {
                    return Err(ProtocolError::MissingPacketId(PacketType::Suback).into());
                }
                self.events.push_back(ClientEvent::SubAck {
                    packet_id: suback.packet_id,
                    return_codes: suback.return_codes,
                });
            }
            Packet::Unsuback { packet_id } => {
                if packet_id == 0 {
                    return Err(ProtocolError::MissingPacketId(PacketType::Unsuback).into());
                }
                self.events.push_back(ClientEvent::UnsubAck { packet_id });
            }
            Packet::Pingresp => {}
            other => return Err(ProtocolError::UnexpectedPacket(other.packet_type()).into()),
        }
        Ok(())
    }

    fn handle_connack(&mut self, connack: Connack, now: Instant) -> Result<()> {
        if connack.code != ConnackCode::Accepted {
            warn!("Connection refused: {:?}", connack.code);
            self.close(Some(format!("Connection refused: {:?}", connack.code)));
            return Err(ClientError::ConnectionRefused(connack.code));
        }

        info!(
            "Connected (session_present={}, in flight={})",
            connack.session_present,
            self.inflight.publish_map.len() + self.inflight.pubrel_packetidentifier_set.len()
        );
        self.state = ConnectionState::Connected;
        self.ping = PingTimer::new(self.keep_alive_secs, now);
        for packet in self.inflight.resend() {
            self.send(&packet);
        }
        self.events.push_back(ClientEvent::Connected {
            session_present: connack.session_present,
        });
        Ok(())
    }
}
