//! Per-client socket state and buffer management.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use brook_core::ProtocolError;
use mio::net::TcpStream;
use mio::Token;

use crate::broker::Broker;
use crate::connection::Connection;
use crate::session::Delivery;

/// Initial read buffer size.
const INITIAL_BUFFER_SIZE: usize = 1024;

/// Largest read buffer kept between reads.
const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of draining the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Socket still open.
    Open,
    /// Peer closed the connection.
    Closed,
}

/// One accepted socket and the protocol state running over it.
pub struct Client {
    pub token: Token,
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub connection: Connection,
    read_buf: Vec<u8>,
    read_len: usize,
    /// WRITABLE interest is registered.
    pub wants_write: bool,
}

impl Client {
    pub fn new(token: Token, stream: TcpStream, addr: SocketAddr, connection: Connection) -> Self {
        Self {
            token,
            stream,
            addr,
            connection,
            read_buf: vec![0u8; INITIAL_BUFFER_SIZE],
            read_len: 0,
            wants_write: false,
        }
    }

    /// Read everything available from the socket.
    pub fn read(&mut self) -> io::Result<ReadStatus> {
        loop {
            if self.read_len == self.read_buf.len() {
                let new_size = self.read_buf.len() * 2;
                self.read_buf.resize(new_size, 0);
            }

            match self.stream.read(&mut self.read_buf[self.read_len..]) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => self.read_len += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Hand the bytes read so far to the protocol handler.
    pub fn process(
        &mut self,
        broker: &mut Broker,
        now: Instant,
        out: &mut Vec<Delivery>,
    ) -> Result<(), ProtocolError> {
        let result = self
            .connection
            .handle_bytes(&self.read_buf[..self.read_len], broker, now, out);
        self.read_len = 0;
        if self.read_buf.len() > MAX_BUFFER_SIZE {
            self.read_buf.truncate(INITIAL_BUFFER_SIZE);
            self.read_buf.shrink_to_fit();
        }
        result
    }

    /// Write queued output. Returns true once everything was written.
    pub fn flush(&mut self) -> io::Result<bool> {
        while self.connection.has_pending_output() {
            match self.stream.write(self.connection.pending_output()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.connection.consume_output(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
