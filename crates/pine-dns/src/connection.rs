use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::{TcpStream, ToSocketAddrs, UdpSocket};
use tokio_rustls::server::TlsStream;

use crate::{DEFAULT_EDNS_BUF_CAPACITY, MAX_STREAM_FRAME};

/// Per-connection transport failures. All of them tear down the offending
/// connection and nothing else.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("stream frame of {0} bytes exceeds the frame cap")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn map_closed(error: io::Error) -> TransportError {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::ConnectionClosed
    } else {
        TransportError::Io(error)
    }
}

/// An enum that abstracts the underlying transport to simplify the logic
/// inside the resolver. Stream variants share the 2-byte length framing;
/// the TLS variant operates above an already-established encrypted stream.
pub enum Connection<U: AsyncUdpSocket> {
    Udp(U, Option<SocketAddr>),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

pub trait AsyncUdpSocket {
    fn send(&self, buf: &[u8]) -> impl std::future::Future<Output = io::Result<usize>>;
    fn send_to<A: ToSocketAddrs>(
        &self,
        buf: &[u8],
        target: A,
    ) -> impl std::future::Future<Output = io::Result<usize>>;
    fn recv(&self, buf: &mut [u8]) -> impl std::future::Future<Output = io::Result<usize>>;
    fn peer_addr(&self) -> io::Result<IpAddr>;
}

impl AsyncUdpSocket for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf).await
    }

    async fn send_to<A: ToSocketAddrs>(&self, buf: &[u8], target: A) -> io::Result<usize> {
        self.send_to(buf, target).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf).await
    }

    fn peer_addr(&self) -> io::Result<IpAddr> {
        self.peer_addr().map(|socket_addr| socket_addr.ip())
    }
}

impl AsyncUdpSocket for Arc<UdpSocket> {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.as_ref().send(buf).await
    }

    async fn send_to<A: ToSocketAddrs>(&self, buf: &[u8], target: A) -> io::Result<usize> {
        self.as_ref().send_to(buf, target).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.as_ref().recv(buf).await
    }

    fn peer_addr(&self) -> io::Result<IpAddr> {
        self.as_ref().peer_addr().map(|socket_addr| socket_addr.ip())
    }
}

/// Reads one length-prefixed message from a stream. Partial frames keep
/// their bytes buffered inside `read_exact` across readiness events, so
/// reassembly state is connection-scoped for free.
async fn read_stream_frame<S>(stream: &mut S, dst: &mut Vec<u8>) -> Result<usize, TransportError>
where
    S: AsyncRead + Unpin,
{
    let length = stream.read_u16().await.map_err(map_closed)? as usize;
    if length == 0 || length > MAX_STREAM_FRAME {
        return Err(TransportError::FrameTooLarge(length));
    }
    if dst.len() < length {
        dst.resize(length, 0);
    }
    stream
        .read_exact(&mut dst[..length])
        .await
        .map_err(map_closed)?;
    Ok(length)
}

async fn write_stream_frame<S>(stream: &mut S, src: &[u8]) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    let length = (src.len() as u16).to_be_bytes();
    stream.write_all(&length).await?;
    stream.write_all(src).await?;
    stream.flush().await?;
    Ok(())
}

impl<U: AsyncUdpSocket> Connection<U> {
    /// Reads one complete wire message into `dst` and returns its length.
    pub async fn read(&mut self, dst: &mut Vec<u8>) -> Result<usize, TransportError> {
        match self {
            Connection::Udp(socket, _) => {
                if dst.len() < DEFAULT_EDNS_BUF_CAPACITY {
                    dst.resize(DEFAULT_EDNS_BUF_CAPACITY, 0);
                }
                Ok(socket.recv(dst).await?)
            }
            Connection::Tcp(stream) => read_stream_frame(stream, dst).await,
            Connection::Tls(stream) => read_stream_frame(stream, dst).await,
        }
    }

    /// Sends one encoded wire message, framed for this transport.
    pub async fn send_message(&mut self, src: &[u8]) -> Result<(), TransportError> {
        match self {
            Connection::Udp(socket, addr) => {
                match addr {
                    Some(addr) => socket.send_to(src, &*addr).await?,
                    None => socket.send(src).await?,
                };
                Ok(())
            }
            Connection::Tcp(stream) => write_stream_frame(stream, src).await,
            Connection::Tls(stream) => write_stream_frame(stream, src).await,
        }
    }

    pub fn peer_addr(&self) -> Option<IpAddr> {
        match self {
            Connection::Udp(socket, addr) => addr
                .map(|socket_addr| socket_addr.ip())
                .or_else(|| socket.peer_addr().ok()),
            Connection::Tcp(stream) => stream.peer_addr().map(|addr| addr.ip()).ok(),
            Connection::Tls(stream) => stream.get_ref().0.peer_addr().map(|addr| addr.ip()).ok(),
        }
    }

    /// Stream transports frame their own length and never need datagram
    /// truncation.
    pub fn is_stream(&self) -> bool {
        !matches!(self, Connection::Udp(..))
    }
}
