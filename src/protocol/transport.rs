use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;

use super::{Message, MessagePool, ProtocolError};

/// Largest datagram a peer is expected to send.
pub const DATAGRAM_SIZE: usize = 1450;

/// Size of the buffer incoming datagrams are read into.
pub const RECEIVE_BUFFER_SIZE: usize = 64000;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for a datagram")]
    TimedOut,

    #[error("unroutable packet with tag {tag} from {from}")]
    Unroutable { tag: u8, from: SocketAddr },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// A connectionless, message-oriented channel.
pub trait DatagramChannel: Send + Sync {
    fn send_datagram(&self, bytes: &[u8], to: SocketAddr) -> io::Result<usize>;

    /// Waits at most `timeout` for one datagram; `None` waits forever.
    fn recv_datagram(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramChannel for UdpSocket {
    fn send_datagram(&self, bytes: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.send_to(bytes, to)
    }

    fn recv_datagram(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<(usize, SocketAddr)> {
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(io::ErrorKind::TimedOut.into());
        }
        self.set_read_timeout(timeout)?;
        self.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Sends and receives protocol messages over a datagram channel, building
/// incoming messages from a shared pool.
pub struct ProtocolTransport<C: DatagramChannel> {
    channel: C,
    pool: Arc<MessagePool>,
    max_datagram: usize,
}

impl<C: DatagramChannel> ProtocolTransport<C> {
    pub fn new(channel: C, pool: Arc<MessagePool>, max_datagram: usize) -> Self {
        Self {
            channel,
            pool,
            max_datagram,
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    pub fn max_datagram(&self) -> usize {
        self.max_datagram
    }

    pub fn send(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        let bytes = message.serialize()?;
        if bytes.len() > self.max_datagram {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_datagram,
            }
            .into());
        }
        self.channel.send_datagram(&bytes, to)?;
        Ok(())
    }

    /// Receives the next datagram and decodes it into a pooled message.
    pub fn recv(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<Message, TransportError> {
        let (n, from) = match self.channel.recv_datagram(buf, timeout) {
            Ok(received) => received,
            Err(e) if is_timeout(&e) => return Err(TransportError::TimedOut),
            Err(e) => return Err(e.into()),
        };

        let bytes = &buf[..n];
        self.pool
            .decode(bytes, Some(from))?
            .ok_or(TransportError::Unroutable {
                tag: bytes[0],
                from,
            })
    }

    pub fn release(&self, message: Message) {
        self.pool.release(message);
    }
}
