use crate::config::{Config, ProtocolFamily};
use crate::snapshot::{AddressFamily, MetricSnapshot};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

pub const AUTH_CHALLENGE: &str = "Authentication required";
pub const FAMILY_BANNER: &str = "You are connecting via";
const IPV4_MARKER: &str = "IPv4";

const READ_CHUNK: usize = 1024;
const MAX_PENDING: usize = 4096;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },
    #[error("{addr} resolved to no usable address")]
    NoAddress { addr: String },
    #[error("failed to connect to {addr}: {source}")]
    Dial { addr: SocketAddr, source: io::Error },
    #[error("connect to {addr} timed out after {after:?}")]
    DialTimeout { addr: SocketAddr, after: Duration },
    #[error("read failed: {source} (received: {buffer:?})")]
    Read { source: io::Error, buffer: String },
    #[error("no data within {after:?} (received: {buffer:?})")]
    ReadTimeout { after: Duration, buffer: String },
    #[error("connection closed by peer (received: {buffer:?})")]
    Closed { buffer: String },
    #[error("write failed: {source}")]
    Write { source: io::Error },
    #[error("write timed out after {after:?}")]
    WriteTimeout { after: Duration },
    #[error("session is closed")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Network(#[from] NetworkError),
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    fn line(&self) -> String {
        format!("{}:{}\n", self.username, self.password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingBanner,
    Authenticating,
    Ready(AddressFamily),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    SendCredentials,
    Ready(AddressFamily),
}

/// Substring matcher over raw server text.
///
/// A credential challenge is answered before a family banner found in the
/// same text, and each challenge is consumed once.
#[derive(Debug)]
pub struct HandshakeParser {
    state: HandshakeState,
    pending: String,
}

impl Default for HandshakeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeParser {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::AwaitingBanner,
            pending: String::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn feed(&mut self, text: &str) {
        self.pending.push_str(text);
        if self.pending.len() > MAX_PENDING {
            let mut cut = self.pending.len() - MAX_PENDING;
            while !self.pending.is_char_boundary(cut) {
                cut += 1;
            }
            self.pending.drain(..cut);
        }
    }

    pub fn next_step(&mut self) -> Option<HandshakeStep> {
        if matches!(self.state, HandshakeState::Ready(_)) {
            return None;
        }
        if let Some(pos) = self.pending.find(AUTH_CHALLENGE) {
            self.pending.drain(..pos + AUTH_CHALLENGE.len());
            self.state = HandshakeState::Authenticating;
            return Some(HandshakeStep::SendCredentials);
        }
        if let Some(pos) = self.pending.find(FAMILY_BANNER) {
            // The family is only known once the banner line is complete.
            let end = self.pending[pos..].find('\n')?;
            let family = if self.pending[pos..pos + end].contains(IPV4_MARKER) {
                AddressFamily::Ipv4
            } else {
                AddressFamily::Ipv6
            };
            self.state = HandshakeState::Ready(family);
            return Some(HandshakeStep::Ready(family));
        }
        None
    }
}

/// One authenticated connection. Closed on the first write error and never
/// reopened; a reconnect builds a new `Session`.
#[derive(Debug)]
pub struct Session<S> {
    stream: Option<S>,
    family: AddressFamily,
    io_timeout: Duration,
    last_activity: Instant,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn handshake(
        mut stream: S,
        credentials: &Credentials,
        io_timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let mut parser = HandshakeParser::new();
        let mut buf = [0_u8; READ_CHUNK];

        loop {
            let n = match time::timeout(io_timeout, stream.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    return Err(NetworkError::Closed {
                        buffer: parser.pending().to_string(),
                    })
                }
                Ok(Ok(n)) => n,
                Ok(Err(source)) => {
                    return Err(NetworkError::Read {
                        source,
                        buffer: parser.pending().to_string(),
                    })
                }
                Err(_elapsed) => {
                    return Err(NetworkError::ReadTimeout {
                        after: io_timeout,
                        buffer: parser.pending().to_string(),
                    })
                }
            };
            parser.feed(&String::from_utf8_lossy(&buf[..n]));

            while let Some(step) = parser.next_step() {
                match step {
                    HandshakeStep::SendCredentials => {
                        debug!(
                            username = %credentials.username,
                            state = ?parser.state(),
                            "server requested authentication"
                        );
                        write_all_within(&mut stream, credentials.line().as_bytes(), io_timeout)
                            .await?;
                    }
                    HandshakeStep::Ready(family) => {
                        return Ok(Self::established(stream, family, io_timeout));
                    }
                }
            }
        }
    }

    pub(crate) fn established(stream: S, family: AddressFamily, io_timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            family,
            io_timeout,
            last_activity: Instant::now(),
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub async fn send(&mut self, snapshot: &MetricSnapshot) -> Result<usize, SendError> {
        let frame = snapshot.to_frame()?;
        Ok(self.write_frame(&frame).await?)
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<usize, NetworkError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(NetworkError::NotConnected);
        };
        match write_all_within(stream, frame, self.io_timeout).await {
            Ok(()) => {
                self.last_activity = Instant::now();
                Ok(frame.len())
            }
            Err(err) => {
                self.close().await;
                Err(err)
            }
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = time::timeout(self.io_timeout, stream.shutdown()).await;
        }
    }
}

async fn write_all_within<S>(stream: &mut S, data: &[u8], after: Duration) -> Result<(), NetworkError>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(data).await?;
        stream.flush().await
    };
    match time::timeout(after, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(NetworkError::Write { source }),
        Err(_elapsed) => Err(NetworkError::WriteTimeout { after }),
    }
}

pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
    ) -> impl std::future::Future<Output = Result<Session<Self::Stream>, NetworkError>> + Send;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    protocol: ProtocolFamily,
    credentials: Credentials,
    io_timeout: Duration,
}

impl TcpConnector {
    pub fn new(
        address: impl Into<String>,
        protocol: ProtocolFamily,
        credentials: Credentials,
        io_timeout: Duration,
    ) -> Self {
        Self {
            address: address.into(),
            protocol,
            credentials,
            io_timeout,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.server_address(),
            cfg.protocol,
            Credentials {
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            },
            cfg.io_timeout(),
        )
    }

    async fn resolve(&self) -> Result<SocketAddr, NetworkError> {
        let addrs: Vec<SocketAddr> = lookup_host(self.address.as_str())
            .await
            .map_err(|source| NetworkError::Resolve {
                addr: self.address.clone(),
                source,
            })?
            .collect();

        if let Some(addr) = addrs.iter().find(|a| self.protocol.matches(a)) {
            return Ok(*addr);
        }
        match addrs.first() {
            Some(addr) => {
                warn!(
                    server = %self.address,
                    protocol = ?self.protocol,
                    fallback = %addr,
                    "no address of the preferred family, using fallback"
                );
                Ok(*addr)
            }
            None => Err(NetworkError::NoAddress {
                addr: self.address.clone(),
            }),
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<Session<TcpStream>, NetworkError> {
        let addr = self.resolve().await?;
        let stream = match time::timeout(self.io_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(NetworkError::Dial { addr, source }),
            Err(_elapsed) => {
                return Err(NetworkError::DialTimeout {
                    addr,
                    after: self.io_timeout,
                })
            }
        };
        let _ = stream.set_nodelay(true);

        let session = Session::handshake(stream, &self.credentials, self.io_timeout).await?;
        info!(server = %addr, family = %session.family(), "connected to collector");
        Ok(session)
    }

    fn describe(&self) -> String {
        self.address.clone()
    }
}
