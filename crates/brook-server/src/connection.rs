//! Server-side protocol handler.
//!
//! A [`Connection`] turns bytes from one client into broker operations and
//! collects the bytes to send back. It never touches the socket, so the
//! reactor owns all I/O and tests can drive a connection from memory.
//!
//! Any `Err` returned from [`Connection::handle_bytes`] is fatal: the reactor
//! flushes what is already queued (a negative CONNACK, for example) and then
//! tears the connection down.

use std::time::Instant;

use brook_core::codec::Decode;
use brook_core::keepalive::KeepAlive;
use brook_core::topic::validate_topic_name;
use brook_core::{
    Connack, ConnackCode, Connect, InflightState, Message, Packet, PacketDecoder, PacketType,
    ProtocolError, Publish, Suback, Subscribe, Unsubscribe, PROTOCOL_LEVEL, PROTOCOL_NAME,
};
use log::{debug, info, trace, warn};
use mio::Token;

use crate::broker::Broker;
use crate::config::{Config, SessionConfig};
use crate::session::Delivery;

/// Per-connection limits taken from the configuration.
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    pub max_packet_size: usize,
    pub max_topic_length: usize,
    pub session: SessionConfig,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ConnectionLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_packet_size: config.limits.max_packet_size,
            max_topic_length: config.limits.max_topic_length,
            session: config.session.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for CONNECT.
    AwaitingConnect,
    Connected,
    /// DISCONNECT received or a fatal error occurred.
    Closed,
}

/// Why a connection is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent DISCONNECT.
    Graceful,
    /// Socket error, protocol violation or keep-alive expiry. The will fires.
    Ungraceful,
    /// The broker is shutting down. The will is suppressed.
    Shutdown,
}

fn inflight<'a>(
    broker: &'a mut Broker,
    client_id: &str,
) -> Result<&'a mut InflightState, ProtocolError> {
    broker
        .session_mut(client_id)
        .map(|session| session.inflight_mut())
        .ok_or_else(|| ProtocolError::MalformedPacket(format!("no session for {}", client_id)))
}

/// Protocol state of one client connection.
pub struct Connection {
    token: Token,
    state: ConnectionState,
    limits: ConnectionLimits,
    decoder: PacketDecoder,
    /// Set once the CONNECT is accepted.
    client_id: Option<String>,
    will: Option<Message>,
    keep_alive: KeepAlive,
    outbound: Vec<u8>,
    torn_down: bool,
}

impl Connection {
    pub fn new(token: Token, limits: ConnectionLimits, now: Instant) -> Self {
        Self {
            token,
            state: ConnectionState::AwaitingConnect,
            decoder: PacketDecoder::new(limits.max_packet_size),
            limits,
            client_id: None,
            will: None,
            keep_alive: KeepAlive::disabled(now),
            outbound: Vec::new(),
            torn_down: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn has_will(&self) -> bool {
        self.will.is_some()
    }

    /// When the keep-alive timeout fires if nothing else arrives.
    pub fn deadline(&self) -> Option<Instant> {
        self.keep_alive.deadline()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.keep_alive.is_expired(now)
    }

    // === Output ===

    /// Bytes waiting to be written to the socket.
    pub fn pending_output(&self) -> &[u8] {
        &self.outbound
    }

    /// Drop `n` bytes that were written.
    pub fn consume_output(&mut self, n: usize) {
        self.outbound.drain(..n.min(self.outbound.len()));
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Queue a packet for the client.
    pub fn send(&mut self, packet: &Packet) {
        let start = self.outbound.len();
        packet.encode(&mut self.outbound);
        trace!(
            "{:?} -> {:?} {:02x?}",
            self.token,
            packet.packet_type(),
            &self.outbound[start..]
        );
    }

    /// Write deliveries for this connection into the outbound buffer and
    /// pass the rest on.
    fn route(&mut self, deliveries: Vec<Delivery>, out: &mut Vec<Delivery>) {
        for delivery in deliveries {
            if delivery.token == self.token {
                self.send(&delivery.packet);
            } else {
                out.push(delivery);
            }
        }
    }

    // === Input ===

    /// Decode and handle every complete packet in `buf`. Partial packets are
    /// kept until the next call.
    ///
    /// Deliveries for other connections are appended to `out`.
    pub fn handle_bytes(
        &mut self,
        buf: &[u8],
        broker: &mut Broker,
        now: Instant,
        out: &mut Vec<Delivery>,
    ) -> Result<(), ProtocolError> {
        let mut pos = 0;
        while pos < buf.len() && !self.is_closed() {
            let progress = match self.decoder.decode(&buf[pos..]) {
                Ok(progress) => progress,
                Err(e) => {
                    self.state = ConnectionState::Closed;
                    return Err(e);
                }
            };
            pos += progress.consumed;
            let Some(packet) = progress.value else {
                break;
            };
            self.keep_alive.restart(now);
            debug!("{:?} <- {:?}", self.token, packet.packet_type());
            if let Err(e) = self.handle_packet(packet, broker, now, out) {
                self.state = ConnectionState::Closed;
                return Err(e);
            }
        }
        Ok(())
    }

    fn handle_packet(
        &mut self,
        packet: Packet,
        broker: &mut Broker,
        now: Instant,
        out: &mut Vec<Delivery>,
    ) -> Result<(), ProtocolError> {
        if self.state == ConnectionState::AwaitingConnect {
            return match packet {
                Packet::Connect(connect) => self.handle_connect(connect, broker, now, out),
                _ => Err(ProtocolError::FirstPacketNotConnect),
            };
        }
        let client_id = match (self.state, self.client_id.clone()) {
            (ConnectionState::Connected, Some(client_id)) => client_id,
            _ => return Err(ProtocolError::UnexpectedPacket(packet.packet_type())),
        };

        match packet {
            Packet::Publish(publish) => self.handle_publish(&client_id, publish, broker, out),
            Packet::Puback { packet_id } => {
                inflight(broker, &client_id)?.on_puback(packet_id)?;
                Ok(())
            }
            Packet::Pubrec { packet_id } => {
                let reply = inflight(broker, &client_id)?.on_pubrec(packet_id)?;
                self.send(&reply);
                Ok(())
            }
            Packet::Pubrel { packet_id } => {
                let reply = inflight(broker, &client_id)?.on_pubrel(packet_id)?;
                self.send(&reply);
                Ok(())
            }
            Packet::Pubcomp { packet_id } => {
                inflight(broker, &client_id)?.on_pubcomp(packet_id)?;
                Ok(())
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(&client_id, subscribe, broker, out)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(&client_id, unsubscribe, broker)
            }
            Packet::Pingreq => {
                self.send(&Packet::Pingresp);
                Ok(())
            }
            Packet::Disconnect => {
                info!("{} disconnected", client_id);
                self.will = None;
                self.state = ConnectionState::Closed;
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedPacket(other.packet_type())),
        }
    }

    fn reject(&mut self, code: ConnackCode) {
        self.send(&Packet::Connack(Connack {
            session_present: false,
            code,
        }));
    }

    fn handle_connect(
        &mut self,
        connect: Connect,
        broker: &mut Broker,
        now: Instant,
        out: &mut Vec<Delivery>,
    ) -> Result<(), ProtocolError> {
        if connect.protocol_name != PROTOCOL_NAME {
            return Err(ProtocolError::InvalidProtocolName(connect.protocol_name));
        }
        if connect.protocol_level != PROTOCOL_LEVEL {
            self.reject(ConnackCode::UnacceptableProtocolVersion);
            return Err(ProtocolError::UnsupportedProtocolVersion(
                connect.protocol_level,
            ));
        }

        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                self.reject(ConnackCode::IdentifierRejected);
                return Err(ProtocolError::IdentifierRejected(connect.client_id));
            }
            broker.assign_client_id()
        } else {
            connect.client_id
        };

        if broker.has_active_session(&client_id) {
            warn!("{:?}: client id {} already connected", self.token, client_id);
            self.reject(ConnackCode::IdentifierRejected);
            return Err(ProtocolError::IdentifierRejected(client_id));
        }

        let keep_alive = self.limits.session.effective_keep_alive(connect.keep_alive);
        self.keep_alive = KeepAlive::new(keep_alive, now);
        self.will = connect.will.map(Message::from);

        let session_present = broker.has_retained_session(&client_id) && !connect.clean_session;
        if session_present {
            broker.renew_session(&client_id, self.token);
        } else {
            // Drops a retained session and its subscriptions, if any
            broker.delete_session(&client_id);
            broker.new_session(&client_id, self.token, connect.clean_session);
        }

        info!(
            "{:?}: {} connected (clean_session={}, keep_alive={}, session_present={})",
            self.token, client_id, connect.clean_session, keep_alive, session_present
        );
        self.send(&Packet::Connack(Connack {
            session_present,
            code: ConnackCode::Accepted,
        }));
        self.state = ConnectionState::Connected;

        if session_present {
            let mut deliveries = Vec::new();
            broker.restart_session(&client_id, &mut deliveries);
            self.route(deliveries, out);
        }
        self.client_id = Some(client_id);
        Ok(())
    }

    fn handle_publish(
        &mut self,
        client_id: &str,
        publish: Publish,
        broker: &mut Broker,
        out: &mut Vec<Delivery>,
    ) -> Result<(), ProtocolError> {
        validate_topic_name(&publish.topic)?;
        if publish.topic.len() > self.limits.max_topic_length {
            return Err(ProtocolError::InvalidTopicName(publish.topic));
        }

        let inbound = inflight(broker, client_id)?.on_publish(&publish)?;
        if let Some(reply) = &inbound.reply {
            self.send(reply);
        }
        if inbound.deliver {
            let mut deliveries = Vec::new();
            broker.publish(Some(client_id), Message::from(&publish), &mut deliveries);
            self.route(deliveries, out);
        } else {
            debug!(
                "{}: duplicate QoS 2 PUBLISH {:?} not redelivered",
                client_id, publish.packet_id
            );
        }
        Ok(())
    }

    fn handle_subscribe(
        &mut self,
        client_id: &str,
        subscribe: Subscribe,
        broker: &mut Broker,
        out: &mut Vec<Delivery>,
    ) -> Result<(), ProtocolError> {
        if subscribe.packet_id == 0 {
            return Err(ProtocolError::MissingPacketId(PacketType::Subscribe));
        }
        let mut deliveries = Vec::new();
        let return_codes = subscribe
            .topics
            .iter()
            .map(|topic| broker.subscribe(client_id, &topic.name, topic.qos, &mut deliveries))
            .collect();
        self.send(&Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes,
        }));
        // Retained messages follow the SUBACK
        self.route(deliveries, out);
        Ok(())
    }

    fn handle_unsubscribe(
        &mut self,
        client_id: &str,
        unsubscribe: Unsubscribe,
        broker: &mut Broker,
    ) -> Result<(), ProtocolError> {
        if unsubscribe.packet_id == 0 {
            return Err(ProtocolError::MissingPacketId(PacketType::Unsubscribe));
        }
        for filter in &unsubscribe.topics {
            broker.unsubscribe(client_id, filter);
        }
        self.send(&Packet::Unsuback {
            packet_id: unsubscribe.packet_id,
        });
        Ok(())
    }

    // === Teardown ===

    /// Release the session and publish the will if it is still armed.
    /// Only the first call has any effect.
    pub fn teardown(&mut self, reason: CloseReason, broker: &mut Broker, out: &mut Vec<Delivery>) {
        if std::mem::replace(&mut self.torn_down, true) {
            return;
        }
        self.state = ConnectionState::Closed;
        let Some(client_id) = self.client_id.clone() else {
            debug!("{:?} closed before CONNECT was accepted", self.token);
            return;
        };
        info!("{:?}: closing {} ({:?})", self.token, client_id, reason);

        if reason != CloseReason::Ungraceful {
            self.will = None;
        }
        broker.release_session(&client_id, self.token);

        if let Some(will) = self.will.take() {
            info!("Publishing will of {} to '{}'", client_id, will.topic);
            broker.publish(Some(&client_id), will, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerOptions;
    use brook_core::{decode_packet, QoS, Topic, Will};
    use bytes::Bytes;

    fn connection(token: usize) -> Connection {
        Connection::new(Token(token), ConnectionLimits::default(), Instant::now())
    }

    fn connect_packet(client_id: &str, clean_session: bool) -> Packet {
        Packet::Connect(Connect {
            client_id: client_id.into(),
            clean_session,
            keep_alive: 10,
            ..Default::default()
        })
    }

    /// Feed packets and decode everything the connection wrote back.
    fn exchange(
        conn: &mut Connection,
        broker: &mut Broker,
        packets: &[Packet],
        out: &mut Vec<Delivery>,
    ) -> Result<Vec<Packet>, ProtocolError> {
        let mut bytes = Vec::new();
        for packet in packets {
            packet.encode(&mut bytes);
        }
        let result = conn.handle_bytes(&bytes, broker, Instant::now(), out);
        let replies = drain(conn);
        result.map(|_| replies)
    }

    fn drain(conn: &mut Connection) -> Vec<Packet> {
        let mut replies = Vec::new();
        let mut pos = 0;
        let output = conn.pending_output().to_vec();
        while let Ok(Some((packet, used))) = decode_packet(&output[pos..]) {
            replies.push(packet);
            pos += used;
        }
        conn.consume_output(output.len());
        replies
    }

    fn connack(session_present: bool, code: ConnackCode) -> Packet {
        Packet::Connack(Connack {
            session_present,
            code,
        })
    }

    fn subscribe(packet_id: u16, filter: &str, qos: QoS) -> Packet {
        Packet::Subscribe(Subscribe {
            packet_id,
            topics: vec![Topic::new(filter, qos)],
        })
    }

    fn publish(topic: &str, payload: &'static str, qos: QoS, packet_id: Option<u16>) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id,
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    #[test]
    fn test_connect_accepted() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        let replies = exchange(&mut conn, &mut broker, &[connect_packet("c", true)], &mut out).unwrap();
        assert_eq!(replies, vec![connack(false, ConnackCode::Accepted)]);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(broker.is_active_session("c", Token(1)));
        assert!(conn.deadline().is_some());
    }

    #[test]
    fn test_connect_byte_at_a_time() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        let bytes = connect_packet("slow", true).to_bytes();
        for byte in &bytes {
            conn.handle_bytes(std::slice::from_ref(byte), &mut broker, Instant::now(), &mut out)
                .unwrap();
        }
        assert_eq!(drain(&mut conn), vec![connack(false, ConnackCode::Accepted)]);
    }

    #[test]
    fn test_first_packet_must_be_connect() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        let err = exchange(&mut conn, &mut broker, &[Packet::Pingreq], &mut out).unwrap_err();
        assert_eq!(err, ProtocolError::FirstPacketNotConnect);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_wrong_protocol_name_closes_without_connack() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        let packet = Packet::Connect(Connect {
            protocol_name: "MQIsdp".into(),
            client_id: "c".into(),
            ..Default::default()
        });
        assert!(exchange(&mut conn, &mut broker, &[packet], &mut out).is_err());
        assert!(conn.pending_output().is_empty());
    }

    #[test]
    fn test_wrong_level_gets_connack_1() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        let packet = Packet::Connect(Connect {
            protocol_level: 3,
            client_id: "c".into(),
            ..Default::default()
        });
        let mut bytes = Vec::new();
        packet.encode(&mut bytes);
        let err = conn
            .handle_bytes(&bytes, &mut broker, Instant::now(), &mut out)
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedProtocolVersion(3));
        assert_eq!(
            drain(&mut conn),
            vec![connack(false, ConnackCode::UnacceptableProtocolVersion)]
        );
    }

    #[test]
    fn test_empty_client_id() {
        let mut broker = Broker::default();
        let mut out = Vec::new();

        let mut persistent = connection(1);
        let packet = connect_packet("", false);
        let mut bytes = Vec::new();
        packet.encode(&mut bytes);
        assert!(persistent
            .handle_bytes(&bytes, &mut broker, Instant::now(), &mut out)
            .is_err());
        assert_eq!(
            drain(&mut persistent),
            vec![connack(false, ConnackCode::IdentifierRejected)]
        );

        let mut clean = connection(2);
        exchange(&mut clean, &mut broker, &[connect_packet("", true)], &mut out).unwrap();
        let assigned = clean.client_id().unwrap().to_string();
        assert!(!assigned.is_empty());
        assert!(broker.is_active_session(&assigned, Token(2)));
    }

    #[test]
    fn test_duplicate_client_id_rejected_without_will() {
        let mut broker = Broker::default();
        let mut out = Vec::new();
        let mut first = connection(1);
        exchange(&mut first, &mut broker, &[connect_packet("dup", true)], &mut out).unwrap();

        let mut second = connection(2);
        let packet = Packet::Connect(Connect {
            client_id: "dup".into(),
            will: Some(Will {
                topic: "wills".into(),
                message: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Default::default()
        });
        let mut bytes = Vec::new();
        packet.encode(&mut bytes);
        let err = second
            .handle_bytes(&bytes, &mut broker, Instant::now(), &mut out)
            .unwrap_err();
        assert_eq!(err, ProtocolError::IdentifierRejected("dup".into()));
        assert_eq!(
            drain(&mut second),
            vec![connack(false, ConnackCode::IdentifierRejected)]
        );
        assert!(!second.has_will());

        second.teardown(CloseReason::Ungraceful, &mut broker, &mut out);
        assert!(broker.is_active_session("dup", Token(1)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_second_connect_is_violation() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        let packets = [connect_packet("c", true), connect_packet("c", true)];
        let err = exchange(&mut conn, &mut broker, &packets, &mut out).unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedPacket(PacketType::Connect));
    }

    #[test]
    fn test_zero_packet_id_subscribe_is_violation() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        exchange(&mut conn, &mut broker, &[connect_packet("c", true)], &mut out).unwrap();

        let err = conn
            .handle_bytes(
                &subscribe(0, "a/b", QoS::AtLeastOnce).to_bytes(),
                &mut broker,
                Instant::now(),
                &mut out,
            )
            .unwrap_err();
        assert_eq!(err, ProtocolError::MissingPacketId(PacketType::Subscribe));
        assert!(conn.is_closed());
        assert!(!conn.has_pending_output());
        assert!(broker.subscriptions("c").is_empty());
    }

    #[test]
    fn test_zero_packet_id_unsubscribe_is_violation() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        let packets = [connect_packet("c", false), subscribe(1, "a/b", QoS::AtMostOnce)];
        exchange(&mut conn, &mut broker, &packets, &mut out).unwrap();

        let unsubscribe = Packet::Unsubscribe(Unsubscribe {
            packet_id: 0,
            topics: vec!["a/b".into()],
        });
        let err = conn
            .handle_bytes(&unsubscribe.to_bytes(), &mut broker, Instant::now(), &mut out)
            .unwrap_err();
        assert_eq!(err, ProtocolError::MissingPacketId(PacketType::Unsubscribe));
        assert!(conn.is_closed());
        assert!(!conn.has_pending_output());
        assert_eq!(broker.subscriptions("c"), vec!["a/b"]);
    }

    #[test]
    fn test_ping_and_disconnect() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        let replies = exchange(
            &mut conn,
            &mut broker,
            &[connect_packet("c", true), Packet::Pingreq, Packet::Disconnect],
            &mut out,
        )
        .unwrap();
        assert_eq!(replies[1], Packet::Pingresp);
        assert!(conn.is_closed());
        conn.teardown(CloseReason::Graceful, &mut broker, &mut out);
        assert!(!broker.has_session("c"));
    }

    #[test]
    fn test_subscribe_suback_then_retained() {
        let mut broker = Broker::default();
        let mut out = Vec::new();
        broker.publish(None, Message::new("a/b", "X", QoS::AtMostOnce, true), &mut out);

        let mut conn = connection(1);
        let replies = exchange(
            &mut conn,
            &mut broker,
            &[
                connect_packet("c", true),
                Packet::Subscribe(Subscribe {
                    packet_id: 1,
                    topics: vec![
                        Topic::new("a/b", QoS::ExactlyOnce),
                        Topic::new("a/#/b", QoS::AtMostOnce),
                    ],
                }),
            ],
            &mut out,
        )
        .unwrap();
        assert_eq!(
            replies[1],
            Packet::Suback(Suback {
                packet_id: 1,
                return_codes: vec![2, 0x80],
            })
        );
        match &replies[2] {
            Packet::Publish(p) => {
                assert!(p.retain);
                assert_eq!(p.payload.as_ref(), b"X");
                assert_eq!(p.qos, QoS::AtMostOnce);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_publish_routes_to_other_connection() {
        let mut broker = Broker::default();
        let mut out = Vec::new();
        let mut sub = connection(1);
        exchange(
            &mut sub,
            &mut broker,
            &[connect_packet("sub", true), subscribe(1, "sport/tennis/#", QoS::AtLeastOnce)],
            &mut out,
        )
        .unwrap();

        let mut publisher = connection(2);
        let replies = exchange(
            &mut publisher,
            &mut broker,
            &[
                connect_packet("pub", true),
                Packet::Publish(publish("sport/tennis", "1", QoS::ExactlyOnce, Some(9))),
            ],
            &mut out,
        )
        .unwrap();
        assert_eq!(replies[1], Packet::Pubrec { packet_id: 9 });
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].token, Token(1));
        assert!(matches!(&out[0].packet, Packet::Publish(p) if p.qos == QoS::AtLeastOnce));
    }

    #[test]
    fn test_qos2_duplicate_delivered_once() {
        let mut broker = Broker::default();
        let mut out = Vec::new();
        let mut sub = connection(1);
        exchange(
            &mut sub,
            &mut broker,
            &[connect_packet("sub", true), subscribe(1, "t", QoS::ExactlyOnce)],
            &mut out,
        )
        .unwrap();

        let mut publisher = connection(2);
        let mut retry = publish("t", "once", QoS::ExactlyOnce, Some(5));
        retry.dup = true;
        let replies = exchange(
            &mut publisher,
            &mut broker,
            &[
                connect_packet("pub", true),
                Packet::Publish(publish("t", "once", QoS::ExactlyOnce, Some(5))),
                Packet::Publish(retry),
                Packet::Pubrel { packet_id: 5 },
            ],
            &mut out,
        )
        .unwrap();
        assert_eq!(
            &replies[1..],
            &[
                Packet::Pubrec { packet_id: 5 },
                Packet::Pubrec { packet_id: 5 },
                Packet::Pubcomp { packet_id: 5 },
            ]
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_outbound_qos2_handshake() {
        let mut broker = Broker::default();
        let mut out = Vec::new();
        let mut conn = connection(1);
        exchange(
            &mut conn,
            &mut broker,
            &[connect_packet("c", true), subscribe(1, "t", QoS::ExactlyOnce)],
            &mut out,
        )
        .unwrap();
        broker.publish(None, Message::new("t", "x", QoS::ExactlyOnce, false), &mut out);
        let packet_id = match &out[0].packet {
            Packet::Publish(p) => p.packet_id.unwrap(),
            other => panic!("unexpected {:?}", other),
        };

        let replies = exchange(&mut conn, &mut broker, &[Packet::Pubrec { packet_id }], &mut out).unwrap();
        assert_eq!(replies, vec![Packet::Pubrel { packet_id }]);
        exchange(&mut conn, &mut broker, &[Packet::Pubcomp { packet_id }], &mut out).unwrap();
        assert!(broker.session("c").unwrap().inflight().is_empty());
    }

    #[test]
    fn test_wildcard_publish_topic_is_fatal() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        let result = exchange(
            &mut conn,
            &mut broker,
            &[
                connect_packet("c", true),
                Packet::Publish(publish("a/+", "x", QoS::AtMostOnce, None)),
            ],
            &mut out,
        );
        assert!(matches!(result, Err(ProtocolError::InvalidTopicName(_))));
    }

    #[test]
    fn test_unsubscribe_acknowledged() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        let replies = exchange(
            &mut conn,
            &mut broker,
            &[
                connect_packet("c", true),
                subscribe(1, "a", QoS::AtMostOnce),
                Packet::Unsubscribe(Unsubscribe {
                    packet_id: 2,
                    topics: vec!["a".into(), "never".into()],
                }),
            ],
            &mut out,
        )
        .unwrap();
        assert_eq!(replies[2], Packet::Unsuback { packet_id: 2 });
        assert!(broker.subscriptions("c").is_empty());
    }

    fn connect_with_will(client_id: &str) -> Packet {
        Packet::Connect(Connect {
            client_id: client_id.into(),
            will: Some(Will {
                topic: "wills".into(),
                message: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Default::default()
        })
    }

    #[test]
    fn test_will_fires_on_ungraceful_close_only() {
        for (reason, fires) in [
            (CloseReason::Ungraceful, true),
            (CloseReason::Shutdown, false),
        ] {
            let mut broker = Broker::default();
            let mut out = Vec::new();
            let mut watcher = connection(1);
            exchange(
                &mut watcher,
                &mut broker,
                &[connect_packet("w", true), subscribe(1, "wills", QoS::AtMostOnce)],
                &mut out,
            )
            .unwrap();

            let mut conn = connection(2);
            exchange(&mut conn, &mut broker, &[connect_with_will("c")], &mut out).unwrap();
            conn.teardown(reason, &mut broker, &mut out);
            assert_eq!(out.len(), usize::from(fires), "{:?}", reason);
        }
    }

    #[test]
    fn test_disconnect_suppresses_will() {
        let mut broker = Broker::default();
        let mut out = Vec::new();
        let mut watcher = connection(1);
        exchange(
            &mut watcher,
            &mut broker,
            &[connect_packet("w", true), subscribe(1, "wills", QoS::AtMostOnce)],
            &mut out,
        )
        .unwrap();

        let mut conn = connection(2);
        exchange(
            &mut conn,
            &mut broker,
            &[connect_with_will("c"), Packet::Disconnect],
            &mut out,
        )
        .unwrap();
        conn.teardown(CloseReason::Graceful, &mut broker, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_session_persistence_across_reconnect() {
        let mut broker = Broker::new(BrokerOptions::default());
        let mut out = Vec::new();

        let mut first = connection(1);
        exchange(
            &mut first,
            &mut broker,
            &[connect_packet("p", false), subscribe(1, "news/#", QoS::AtLeastOnce)],
            &mut out,
        )
        .unwrap();
        first.teardown(CloseReason::Ungraceful, &mut broker, &mut out);
        assert!(broker.has_retained_session("p"));

        for payload in ["one", "two"] {
            broker.publish(None, Message::new("news/x", payload, QoS::AtLeastOnce, false), &mut out);
        }
        assert!(out.is_empty());

        let mut second = connection(2);
        let replies = exchange(&mut second, &mut broker, &[connect_packet("p", false)], &mut out).unwrap();
        assert_eq!(replies[0], connack(true, ConnackCode::Accepted));
        let payloads: Vec<_> = replies[1..]
            .iter()
            .filter_map(|p| match p {
                Packet::Publish(p) => Some(p.payload.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec!["one", "two"]);
    }

    #[test]
    fn test_clean_connect_discards_retained_session() {
        let mut broker = Broker::default();
        let mut out = Vec::new();
        let mut first = connection(1);
        exchange(
            &mut first,
            &mut broker,
            &[connect_packet("p", false), subscribe(1, "a", QoS::AtLeastOnce)],
            &mut out,
        )
        .unwrap();
        first.teardown(CloseReason::Ungraceful, &mut broker, &mut out);

        let mut second = connection(2);
        let replies = exchange(&mut second, &mut broker, &[connect_packet("p", true)], &mut out).unwrap();
        assert_eq!(replies, vec![connack(false, ConnackCode::Accepted)]);
        assert!(broker.subscriptions("p").is_empty());
    }

    #[test]
    fn test_keep_alive_expiry() {
        let mut broker = Broker::default();
        let mut conn = connection(1);
        let mut out = Vec::new();
        let start = Instant::now();
        conn.handle_bytes(&connect_packet("c", true).to_bytes(), &mut broker, start, &mut out)
            .unwrap();
        // keep_alive = 10 s, so the timeout is 15 s
        assert!(!conn.is_expired(start + std::time::Duration::from_secs(14)));
        assert!(conn.is_expired(start + std::time::Duration::from_secs(15)));
    }

    #[test]
    fn test_oversized_packet_is_framing_error() {
        let mut broker = Broker::default();
        let limits = ConnectionLimits {
            max_packet_size: 16,
            ..Default::default()
        };
        let mut conn = Connection::new(Token(1), limits, Instant::now());
        let mut out = Vec::new();
        let err = conn
            .handle_bytes(
                &connect_packet("a-rather-long-client-id", true).to_bytes(),
                &mut broker,
                Instant::now(),
                &mut out,
            )
            .unwrap_err();
        assert!(err.is_framing());
    }
}
