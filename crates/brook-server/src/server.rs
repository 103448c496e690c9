//! MQTT broker server - the reactor.
//!
//! One `mio::Poll` owns the listener, every client socket and the broker.
//! Packets the broker produces come back as [`Delivery`] values and are
//! written to the socket named by their token.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

use brook_core::error::Result;

use crate::broker::Broker;
use crate::client::{Client, ReadStatus};
use crate::config::Config;
use crate::connection::{CloseReason, Connection, ConnectionLimits};
use crate::persistence;
use crate::session::Delivery;

/// Token for the TCP listener socket.
const LISTENER: Token = Token(0);

/// Token for the cross-thread waker.
const WAKER: Token = Token(1);

/// First token handed to a client.
const FIRST_CLIENT: usize = 2;

/// Requests sent to a running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    Shutdown,
}

/// Controls a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    commands: Sender<ServerCommand>,
    waker: Arc<Waker>,
}

impl ServerHandle {
    /// Ask the server to close every connection and return from `run`.
    pub fn shutdown(&self) -> io::Result<()> {
        // The receiver only goes away once the server has stopped
        let _ = self.commands.send(ServerCommand::Shutdown);
        self.waker.wake()
    }
}

/// MQTT broker server.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    commands: Receiver<ServerCommand>,
    command_sender: Sender<ServerCommand>,
    clients: AHashMap<Token, Client>,
    next_token: usize,
    broker: Broker,
    config: Config,
    limits: ConnectionLimits,
    last_sync: Instant,
}

impl Server {
    /// Bind the listener. `broker` may be a fresh one or restored from the
    /// session store.
    pub fn new(config: Config, broker: Broker) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.server.bind)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (command_sender, commands) = unbounded();

        info!("brook listening on {}", listener.local_addr()?);

        Ok(Self {
            poll,
            listener,
            waker,
            commands,
            command_sender,
            clients: AHashMap::new(),
            next_token: FIRST_CLIENT,
            broker,
            limits: ConnectionLimits::from(&config),
            config,
            last_sync: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            commands: self.command_sender.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Run until a shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);

        loop {
            let timeout = self.next_timeout(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_connections()?,
                    WAKER => {}
                    token => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                    }
                }
            }

            if self.commands.try_iter().any(|cmd| cmd == ServerCommand::Shutdown) {
                self.shutdown();
                return Ok(());
            }

            let now = Instant::now();
            self.expire_keep_alives(now);
            self.sync_store(now);
        }
    }

    /// Accept new TCP connections.
    fn accept_connections(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if self.clients.len() >= self.config.server.max_connections {
                        warn!(
                            "Rejecting connection from {}: max_connections ({}) reached",
                            addr, self.config.server.max_connections
                        );
                        continue;
                    }

                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;

                    debug!("Accepted connection from {} as {:?}", addr, token);
                    let connection = Connection::new(token, self.limits.clone(), Instant::now());
                    self.clients
                        .insert(token, Client::new(token, stream, addr, connection));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn handle_readable(&mut self, token: Token) {
        let mut deliveries = Vec::new();
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        let status = client.read();
        // Bytes that arrived before an EOF or error are still handled
        let result = client.process(&mut self.broker, Instant::now(), &mut deliveries);

        let reason = match (status, result) {
            (_, Err(e)) => {
                warn!("{:?} ({}): protocol error: {}", token, client.addr, e);
                Some(CloseReason::Ungraceful)
            }
            _ if client.connection.is_closed() => Some(CloseReason::Graceful),
            (Ok(ReadStatus::Open), Ok(())) => None,
            (Ok(ReadStatus::Closed), Ok(())) => {
                debug!("{:?} ({}): connection closed by peer", token, client.addr);
                Some(CloseReason::Ungraceful)
            }
            (Err(e), Ok(())) => {
                debug!("{:?} ({}): read error: {}", token, client.addr, e);
                Some(CloseReason::Ungraceful)
            }
        };

        if let Err(e) = self.flush_client(token) {
            debug!("{:?}: write error: {}", token, e);
            self.close_client(token, CloseReason::Ungraceful, &mut deliveries);
        }
        if let Some(reason) = reason {
            self.close_client(token, reason, &mut deliveries);
        }
        self.dispatch(deliveries);
    }

    fn handle_writable(&mut self, token: Token) {
        if let Err(e) = self.flush_client(token) {
            debug!("{:?}: write error: {}", token, e);
            let mut deliveries = Vec::new();
            self.close_client(token, CloseReason::Ungraceful, &mut deliveries);
            self.dispatch(deliveries);
        }
    }

    /// Write a client's pending output and keep WRITABLE interest registered
    /// only while some of it is left.
    fn flush_client(&mut self, token: Token) -> io::Result<()> {
        let Some(client) = self.clients.get_mut(&token) else {
            return Ok(());
        };
        let done = client.flush()?;
        if done == client.wants_write {
            let interest = if done {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            self.poll
                .registry()
                .reregister(&mut client.stream, token, interest)?;
            client.wants_write = !done;
        }
        Ok(())
    }

    /// Write deliveries to their connections. Closing a connection on a
    /// write error can publish a will, which is dispatched in turn.
    fn dispatch(&mut self, mut deliveries: Vec<Delivery>) {
        while !deliveries.is_empty() {
            let mut touched = Vec::new();
            for Delivery { token, packet } in deliveries.drain(..) {
                match self.clients.get_mut(&token) {
                    Some(client) => {
                        client.connection.send(&packet);
                        touched.push(token);
                    }
                    None => debug!(
                        "Dropping {:?} for closed connection {:?}",
                        packet.packet_type(),
                        token
                    ),
                }
            }
            touched.sort_unstable();
            touched.dedup();
            for token in touched {
                if let Err(e) = self.flush_client(token) {
                    debug!("{:?}: write error: {}", token, e);
                    self.close_client(token, CloseReason::Ungraceful, &mut deliveries);
                }
            }
        }
    }

    fn close_client(&mut self, token: Token, reason: CloseReason, out: &mut Vec<Delivery>) {
        let Some(mut client) = self.clients.remove(&token) else {
            return;
        };
        client.connection.teardown(reason, &mut self.broker, out);
        // Best effort: a rejected CONNECT still gets its CONNACK
        let _ = client.flush();
        if let Err(e) = self.poll.registry().deregister(&mut client.stream) {
            debug!("{:?}: deregister failed: {}", token, e);
        }
        info!("Connection {:?} ({}) closed", token, client.addr);
    }

    fn expire_keep_alives(&mut self, now: Instant) {
        let expired: Vec<Token> = self
            .clients
            .iter()
            .filter(|(_, client)| client.connection.is_expired(now))
            .map(|(token, _)| *token)
            .collect();
        if expired.is_empty() {
            return;
        }

        let mut deliveries = Vec::new();
        for token in expired {
            warn!("{:?}: keep-alive timeout", token);
            self.close_client(token, CloseReason::Ungraceful, &mut deliveries);
        }
        self.dispatch(deliveries);
    }

    fn sync_interval(&self) -> Option<Duration> {
        let persistence = &self.config.persistence;
        (persistence.enabled && persistence.sync_interval_secs > 0)
            .then(|| Duration::from_secs(persistence.sync_interval_secs))
    }

    fn sync_store(&mut self, now: Instant) {
        let Some(interval) = self.sync_interval() else {
            return;
        };
        if now.duration_since(self.last_sync) >= interval {
            self.save_store();
            self.last_sync = now;
        }
    }

    /// Time until the nearest keep-alive deadline or store sync.
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let sync = self.sync_interval().map(|interval| self.last_sync + interval);
        self.clients
            .values()
            .filter_map(|client| client.connection.deadline())
            .chain(sync)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Write the session store if persistence is enabled.
    pub fn save_store(&self) {
        if !self.config.persistence.enabled {
            return;
        }
        let path = &self.config.persistence.path;
        let result = self
            .broker
            .snapshot()
            .map_err(persistence::PersistenceError::from)
            .and_then(|snapshot| persistence::save(path, &snapshot));
        match result {
            Ok(()) => info!("Session store saved to {}", path.display()),
            Err(e) => error!("Failed to save session store to {}: {}", path.display(), e),
        }
    }

    /// Close every connection. Wills are suppressed.
    fn shutdown(&mut self) {
        info!("Shutting down, closing {} connections", self.clients.len());
        let tokens: Vec<Token> = self.clients.keys().copied().collect();
        let mut deliveries = Vec::new();
        for token in tokens {
            self.close_client(token, CloseReason::Shutdown, &mut deliveries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brook_client::{ClientConfig, ClientEvent};
    use brook_core::{
        decode_packet, Connack, ConnackCode, Connect, Packet, Publish, QoS, Subscribe, Topic,
    };
    use bytes::Bytes;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1:0".parse().unwrap();
        config
    }

    fn start(config: Config) -> (SocketAddr, ServerHandle, thread::JoinHandle<Server>) {
        let mut server = Server::new(config, Broker::default()).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let join = thread::spawn(move || {
            server.run().unwrap();
            server
        });
        (addr, handle, join)
    }

    fn read_packet(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Packet {
        loop {
            if let Some((packet, used)) = decode_packet(buf).unwrap() {
                buf.drain(..used);
                return packet;
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn connect(addr: SocketAddr, client_id: &str) -> (TcpStream, Vec<u8>) {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let connect = Packet::Connect(Connect {
            client_id: client_id.into(),
            ..Default::default()
        });
        stream.write_all(&connect.to_bytes()).unwrap();
        let mut buf = Vec::new();
        assert_eq!(
            read_packet(&mut stream, &mut buf),
            Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::Accepted,
            })
        );
        (stream, buf)
    }

    #[test]
    fn test_publish_between_sockets() {
        let (addr, handle, join) = start(test_config());

        let (mut sub, mut sub_buf) = connect(addr, "sub");
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: 1,
            topics: vec![Topic::new("a/+", QoS::AtMostOnce)],
        });
        sub.write_all(&subscribe.to_bytes()).unwrap();
        assert!(matches!(read_packet(&mut sub, &mut sub_buf), Packet::Suback(_)));

        let (mut publisher, _) = connect(addr, "pub");
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "a/b".into(),
            packet_id: None,
            payload: Bytes::from_static(b"hello"),
        });
        publisher.write_all(&publish.to_bytes()).unwrap();

        match read_packet(&mut sub, &mut sub_buf) {
            Packet::Publish(p) => assert_eq!(p.payload.as_ref(), b"hello"),
            other => panic!("unexpected {:?}", other),
        }

        handle.shutdown().unwrap();
        let server = join.join().unwrap();
        assert!(!server.broker().has_session("sub"));
    }

    #[test]
    fn test_store_saved_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let mut config = test_config();
        config.persistence.enabled = true;
        config.persistence.path = path.clone();
        config.persistence.sync_interval_secs = 0;

        let (addr, handle, join) = start(config);
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let connect = Packet::Connect(Connect {
            client_id: "keeper".into(),
            clean_session: false,
            ..Default::default()
        });
        stream.write_all(&connect.to_bytes()).unwrap();
        let mut buf = Vec::new();
        assert!(matches!(read_packet(&mut stream, &mut buf), Packet::Connack(_)));

        handle.shutdown().unwrap();
        let server = join.join().unwrap();
        assert!(server.broker().has_retained_session("keeper"));
        server.save_store();

        let store = persistence::load(&path).unwrap();
        assert!(store.session_store.contains_key("keeper"));
    }

    fn wait_for(
        client: &mut brook_client::Client,
        mut done: impl FnMut(&ClientEvent) -> bool,
    ) -> ClientEvent {
        for _ in 0..100 {
            client.poll(Some(Duration::from_millis(50))).unwrap();
            while let Some(event) = client.next_event() {
                if done(&event) {
                    return event;
                }
            }
        }
        panic!("event not received");
    }

    #[test]
    fn test_client_resumes_persistent_session() {
        let (addr, handle, join) = start(test_config());
        let config = ClientConfig::new(addr.to_string())
            .client_id("durable")
            .clean_session(false);

        let mut client = brook_client::Client::new(config.clone()).unwrap();
        client.connect().unwrap();
        wait_for(&mut client, |e| matches!(e, ClientEvent::Connected { .. }));
        client.subscribe(&[("jobs/#", QoS::AtLeastOnce)]).unwrap();
        wait_for(&mut client, |e| matches!(e, ClientEvent::SubAck { .. }));
        client.disconnect().unwrap();
        drop(client);

        let (mut publisher, _) = connect(addr, "producer");
        for (packet_id, payload) in [(1, "first"), (2, "second")] {
            let publish = Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "jobs/new".into(),
                packet_id: Some(packet_id),
                payload: Bytes::from_static(payload.as_bytes()),
            });
            publisher.write_all(&publish.to_bytes()).unwrap();
        }
        let mut buf = Vec::new();
        assert_eq!(read_packet(&mut publisher, &mut buf), Packet::Puback { packet_id: 1 });
        assert_eq!(read_packet(&mut publisher, &mut buf), Packet::Puback { packet_id: 2 });

        let mut client = brook_client::Client::new(config).unwrap();
        client.connect().unwrap();
        assert_eq!(
            wait_for(&mut client, |e| matches!(e, ClientEvent::Connected { .. })),
            ClientEvent::Connected {
                session_present: true
            }
        );
        let mut received = Vec::new();
        while received.len() < 2 {
            if let ClientEvent::Message { payload, .. } =
                wait_for(&mut client, |e| matches!(e, ClientEvent::Message { .. }))
            {
                received.push(payload);
            }
        }
        assert_eq!(received, vec![Bytes::from("first"), Bytes::from("second")]);
        client.disconnect().unwrap();

        handle.shutdown().unwrap();
        join.join().unwrap();
    }

    #[test]
    fn test_protocol_error_closes_socket() {
        let (addr, handle, join) = start(test_config());
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(&Packet::Pingreq.to_bytes()).unwrap();
        let mut chunk = [0u8; 16];
        assert_eq!(stream.read(&mut chunk).unwrap_or(0), 0);

        handle.shutdown().unwrap();
        join.join().unwrap();
    }
}
