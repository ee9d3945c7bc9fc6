//! Reliable byte-stream transport for migration.
//!
//! Migration state moves over one TCP connection with a strict
//! all-or-nothing discipline: [`MigrationStream::send_all`] and
//! [`MigrationStream::recv_all`] either move the entire buffer or fail.
//! There are no partial transfers at this layer; every short read is a
//! protocol violation surfaced to the coordinator, which aborts.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};

use log::info;
use vm_memory::ByteValued;

use super::MigrationError;

/// Fixed TCP port of the migration channel.
pub const MIGRATION_PORT: u16 = 1337;

/// One established migration connection.
pub struct MigrationStream {
    stream: TcpStream,
}

impl From<TcpStream> for MigrationStream {
    fn from(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl MigrationStream {
    /// Connect to the migration responder at `ip:port` (initiator side).
    pub fn connect(ip: &str, port: u16) -> Result<Self, MigrationError> {
        let addr: Ipv4Addr = ip
            .trim()
            .parse()
            .map_err(|_| MigrationError::BadAddress(ip.to_string()))?;
        info!("connecting to migration server {addr}:{port}");
        let stream = TcpStream::connect(SocketAddr::from((addr, port)))?;
        stream.set_nodelay(true)?;
        info!("connected to migration server {addr}:{port}");
        Ok(Self { stream })
    }

    /// Wait for an initiator on `port` (responder side).
    ///
    /// The listener is dropped once a connection is established; a failed
    /// migration leaves the responder free to accept again.
    pub fn accept(port: u16) -> Result<Self, MigrationError> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        info!("waiting for an incoming migration on port {port}");
        let (stream, peer) = listener.accept()?;
        stream.set_nodelay(true)?;
        info!("incoming migration from {peer}");
        Ok(Self { stream })
    }

    /// Send the whole buffer.
    pub fn send_all(&mut self, buf: &[u8]) -> Result<(), MigrationError> {
        self.stream.write_all(buf)?;
        Ok(())
    }

    /// Receive exactly `buf.len()` bytes.
    pub fn recv_all(&mut self, buf: &mut [u8]) -> Result<(), MigrationError> {
        self.stream
            .read_exact(buf)
            .map_err(|_| MigrationError::ShortTransfer)
    }

    /// Send one fixed-layout record.
    pub fn send_obj<T: ByteValued>(&mut self, value: &T) -> Result<(), MigrationError> {
        self.send_all(value.as_slice())
    }

    /// Receive one fixed-layout record.
    pub fn recv_obj<T: ByteValued + Default>(&mut self) -> Result<T, MigrationError> {
        let mut value = T::default();
        self.recv_all(value.as_mut_slice())?;
        Ok(value)
    }

    /// Send a bare little-endian word.
    pub fn send_u64(&mut self, value: u64) -> Result<(), MigrationError> {
        self.send_all(&value.to_le_bytes())
    }

    /// Receive a bare little-endian word.
    pub fn recv_u64(&mut self) -> Result<u64, MigrationError> {
        let mut bytes = [0u8; 8];
        self.recv_all(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Close both directions of the channel.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
