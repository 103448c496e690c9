//! MQTT client over a non-blocking mio socket.

use std::io::{self, Read, Write};
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::Bytes;
use brook_core::{InflightState, QoS};
use log::{info, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, ConnectionState};
use crate::protocol::ClientProtocol;
use crate::store;

const CLIENT: Token = Token(0);
const READ_CHUNK_SIZE: usize = 4096;

/// MQTT client.
pub struct Client {
    config: ClientConfig,
    protocol: ClientProtocol,
    poll: Poll,
    stream: Option<TcpStream>,
}

impl Client {
    /// Create a new MQTT client with the given configuration.
    ///
    /// In-flight state left by a previous run is loaded from the configured
    /// session store.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let poll = Poll::new()?;
        let inflight = match &config.session_store {
            Some(path) => store::load(path)?,
            None => InflightState::default(),
        };
        let protocol = ClientProtocol::new(inflight, config.max_packet_size);

        Ok(Self {
            config,
            protocol,
            poll,
            stream: None,
        })
    }

    /// Open the socket and send CONNECT. The outcome arrives as an event.
    pub fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(ClientError::InvalidState(
                "Already connected or connecting".to_string(),
            ));
        }

        let addr = self
            .config
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                ClientError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "Could not resolve address",
                ))
            })?;

        let std_stream = StdTcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
        std_stream.set_nonblocking(true)?;
        std_stream.set_nodelay(true)?;

        let mut stream = TcpStream::from_std(std_stream);
        self.poll
            .registry()
            .register(&mut stream, CLIENT, Interest::READABLE | Interest::WRITABLE)?;
        self.stream = Some(stream);

        info!("Connecting to {} as '{}'", addr, self.config.client_id);
        if let Err(e) = self.protocol.connect(&self.config, Instant::now()) {
            self.cleanup();
            return Err(e);
        }
        self.flush()
    }

    /// Send DISCONNECT and close the socket.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        self.protocol.disconnect();
        let result = self.flush();
        self.cleanup();
        result
    }

    /// Subscribe to topics. Returns the SUBSCRIBE packet identifier.
    pub fn subscribe(&mut self, topics: &[(&str, QoS)]) -> Result<u16> {
        let packet_id = self.protocol.subscribe(topics)?;
        self.flush()?;
        Ok(packet_id)
    }

    /// Unsubscribe from topics.
    pub fn unsubscribe(&mut self, topics: &[&str]) -> Result<u16> {
        let packet_id = self.protocol.unsubscribe(topics)?;
        self.flush()?;
        Ok(packet_id)
    }

    /// Publish a message. QoS 1/2 return their packet identifier.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        let packet_id = self.protocol.publish(topic, payload, qos, retain)?;
        self.flush()?;
        Ok(packet_id)
    }

    /// Wait for socket activity or the next keep-alive deadline, whichever
    /// comes first. Returns true if there are events to process.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.stream.is_none() {
            return Ok(self.protocol.has_events());
        }
        self.flush()?;

        let timeout = match self.protocol.next_deadline() {
            Some(deadline) => {
                let until = deadline.saturating_duration_since(Instant::now());
                Some(timeout.map_or(until, |t| t.min(until)))
            }
            None => timeout,
        };

        let mut events = Events::with_capacity(16);
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        for event in events.iter() {
            if event.token() == CLIENT {
                if event.is_readable() {
                    self.handle_read()?;
                }
                if event.is_writable() {
                    self.flush()?;
                }
            }
        }

        if self.stream.is_some() {
            if let Err(e) = self.protocol.poll_timers(Instant::now()) {
                self.cleanup();
                return Err(e);
            }
            self.flush()?;
        }

        Ok(self.protocol.has_events())
    }

    /// Get the next event, if any.
    pub fn next_event(&mut self) -> Option<ClientEvent> {
        self.protocol.next_event()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.protocol.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.protocol.state()
    }

    /// Unacknowledged QoS 1/2 state.
    pub fn inflight(&self) -> &InflightState {
        self.protocol.inflight()
    }

    fn handle_read(&mut self) -> Result<()> {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(());
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.protocol.connection_lost("Connection closed by peer");
                    self.cleanup();
                    return Ok(());
                }
                Ok(n) => {
                    if let Err(e) = self.protocol.handle_bytes(&buf[..n], Instant::now()) {
                        // CONNACK refusals and protocol errors end the connection
                        let _ = self.flush();
                        self.cleanup();
                        return Err(e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.protocol.connection_lost(e.to_string());
                    self.cleanup();
                    return Err(e.into());
                }
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while self.protocol.has_pending_output() {
            match stream.write(self.protocol.pending_output()) {
                Ok(0) => return Err(ClientError::ConnectionClosed),
                Ok(n) => self.protocol.consume_output(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.disconnect();
        if let Some(path) = &self.config.session_store {
            if let Err(e) = store::save(path, self.protocol.inflight()) {
                warn!("Could not save client session {}: {}", path.display(), e);
            }
        }
    }
}
