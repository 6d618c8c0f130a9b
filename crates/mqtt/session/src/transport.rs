//! Byte transport beneath the MQTT codec.
//!
//! The session never touches sockets directly. It drives a [`Transport`],
//! which tests replace with an in-memory double. [`TcpTransport`] is the plain
//! TCP implementation with per-call send and receive timeouts.

use std::{fmt, io, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info};

/// Broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
}

impl ServerInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Broker login presented when a connection is opened.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Byte stream to a broker.
///
/// `recv` returning `Ok(0)` means the peer closed the stream. A receive that
/// times out without data reports [`io::ErrorKind::TimedOut`].
#[async_trait]
pub trait Transport: Send {
    /// Opens the stream, closing any previous one first.
    ///
    /// Transports that authenticate at their own layer use `credentials`;
    /// others ignore them and leave authentication to the MQTT CONNECT.
    async fn connect(&mut self, server: &ServerInfo, credentials: &Credentials) -> io::Result<()>;

    /// Closes the stream. Closing an already closed transport is a no-op.
    async fn disconnect(&mut self);

    async fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn is_connected(&self) -> bool;
}

fn elapsed(operation: &str, limit: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{operation} timed out after {limit:?}"),
    )
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not connected")
}

/// Plain TCP transport.
///
/// TCP has no authentication of its own, so connection credentials are only
/// logged and the broker login is left to the CONNECT packet.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    connect_timeout: Duration,
    send_timeout: Duration,
    recv_timeout: Duration,
}

impl TcpTransport {
    /// # Arguments
    /// - `connect_timeout`: bound on the TCP handshake
    /// - `send_timeout`: bound on each `send` call
    /// - `recv_timeout`: bound on each `recv` call
    pub fn new(connect_timeout: Duration, send_timeout: Duration, recv_timeout: Duration) -> Self {
        Self {
            stream: None,
            connect_timeout,
            send_timeout,
            recv_timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, server: &ServerInfo, credentials: &Credentials) -> io::Result<()> {
        self.disconnect().await;

        debug!(server = %server, anonymous = credentials.is_anonymous(), "Opening TCP connection");
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((server.host.as_str(), server.port)),
        )
        .await
        .map_err(|_| elapsed("connect", self.connect_timeout))??;
        stream.set_nodelay(true)?;

        info!(server = %server, "TCP connection established");
        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "TCP shutdown failed");
            }
        }
    }

    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let limit = self.send_timeout;
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        timeout(limit, stream.write(buf))
            .await
            .map_err(|_| elapsed("send", limit))?
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = self.recv_timeout;
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        timeout(limit, stream.read(buf))
            .await
            .map_err(|_| elapsed("recv", limit))?
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
