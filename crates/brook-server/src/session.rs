//! Per-client session state.
//!
//! A session outlives its connection when the client connected with
//! `clean_session = false`. While no connection owns it, messages for it are
//! queued and replayed on the next renewal.

use std::collections::VecDeque;

use brook_core::packet_id::PacketIdAllocator;
use brook_core::{InflightState, Message, Packet, QoS};
use log::{debug, warn};
use mio::Token;
use serde::{Deserialize, Serialize};

/// A packet the broker wants written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub token: Token,
    pub packet: Packet,
}

/// Broker-side session.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Session {
    /// Connection currently owning this session.
    #[serde(skip)]
    owner: Option<Token>,
    #[serde(skip)]
    clean_session: bool,
    #[serde(skip)]
    packet_ids: PacketIdAllocator,
    /// Bound on `message_queue` (0 = unbounded).
    #[serde(skip)]
    max_queued: usize,
    /// Messages received while inactive, oldest first.
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    message_queue: VecDeque<Message>,
    #[serde(flatten)]
    inflight: InflightState,
}

impl Session {
    pub fn new(owner: Token, clean_session: bool, max_queued: usize) -> Self {
        Self {
            owner: Some(owner),
            clean_session,
            max_queued,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.owner.is_some()
    }

    pub fn is_owned_by(&self, token: Token) -> bool {
        self.owner == Some(token)
    }

    pub fn owner(&self) -> Option<Token> {
        self.owner
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Attach a new connection.
    pub fn renew(&mut self, owner: Token) {
        self.owner = Some(owner);
    }

    /// Detach the connection, keeping all state.
    pub fn retain(&mut self) {
        self.owner = None;
    }

    pub fn set_max_queued(&mut self, max_queued: usize) {
        self.max_queued = max_queued;
    }

    pub fn message_queue(&self) -> &VecDeque<Message> {
        &self.message_queue
    }

    pub fn inflight(&self) -> &InflightState {
        &self.inflight
    }

    pub fn inflight_mut(&mut self) -> &mut InflightState {
        &mut self.inflight
    }

    /// Send `message` at `min(message.qos, qos)` with the given retain flag.
    ///
    /// An active session gets a PUBLISH for its owner, with QoS 1/2 messages
    /// tracked until acknowledged. An inactive session queues the message; a
    /// QoS 0 message first empties the queue.
    pub fn send_publish(&mut self, message: &Message, qos: QoS, retain: bool) -> Option<Delivery> {
        let mut outgoing = message.clone();
        outgoing.qos = message.qos.min(qos);
        outgoing.retain = retain;

        let Some(token) = self.owner else {
            if message.qos == QoS::AtMostOnce {
                self.message_queue.clear();
            }
            self.enqueue(outgoing);
            return None;
        };

        let packet_id = if outgoing.qos > QoS::AtMostOnce {
            let inflight = &self.inflight;
            let Some(packet_id) = self.packet_ids.allocate(|id| inflight.is_in_use(id)) else {
                warn!("No free packet identifier for {:?}, queueing message", token);
                self.enqueue(outgoing);
                return None;
            };
            self.inflight.track(packet_id, outgoing.clone());
            packet_id
        } else {
            0
        };

        debug!(
            "PUBLISH to {:?}: topic={} qos={:?} retain={}",
            token, outgoing.topic, outgoing.qos, outgoing.retain
        );
        Some(Delivery {
            token,
            packet: Packet::Publish(outgoing.to_publish(packet_id, false)),
        })
    }

    fn enqueue(&mut self, message: Message) {
        if self.max_queued > 0 && self.message_queue.len() >= self.max_queued {
            self.message_queue.pop_front();
        }
        self.message_queue.push_back(message);
    }

    /// Take the queued messages for replay.
    pub fn take_queue(&mut self) -> VecDeque<Message> {
        std::mem::take(&mut self.message_queue)
    }
}
