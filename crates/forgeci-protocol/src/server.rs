// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC listener for the runner service.
//!
//! [`ForgeServer`] owns the endpoint; [`ConnectionHandler`] wraps one
//! accepted connection; [`StreamHandler`] wraps one bidirectional stream,
//! which carries exactly one call.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::frame::{Frame, FrameError, read_frame, write_frame};

/// Server-side transport failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("server closed")]
    Closed,
}

/// Listener tuning and TLS material.
#[derive(Debug, Clone)]
pub struct ForgeServerConfig {
    pub bind_addr: SocketAddr,
    /// Certificate chain, PEM.
    pub cert_pem: Vec<u8>,
    /// Private key, PEM.
    pub key_pem: Vec<u8>,
    /// Handshakes allowed in flight at once.
    pub max_incoming: u32,
    /// Bidirectional streams each connection may hold open.
    pub max_bi_streams: u32,
    pub idle_timeout_ms: u64,
    /// Zero disables server-side keep-alives.
    pub keep_alive_interval_ms: u64,
    /// Zero keeps the OS default.
    pub udp_receive_buffer_size: usize,
    /// Zero keeps the OS default.
    pub udp_send_buffer_size: usize,
}

impl Default for ForgeServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8088".parse().unwrap(),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_incoming: 10_000,
            max_bi_streams: 256,
            idle_timeout_ms: 120_000,
            keep_alive_interval_ms: 15_000,
            udp_receive_buffer_size: 2 * 1024 * 1024,
            udp_send_buffer_size: 2 * 1024 * 1024,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl ForgeServerConfig {
    /// Read the tuning knobs from `FORGECI_QUIC_*` environment variables,
    /// falling back to the defaults. Address and TLS material are set by
    /// the caller afterwards.
    ///
    /// Recognized variables: `FORGECI_QUIC_MAX_INCOMING`,
    /// `FORGECI_QUIC_MAX_BI_STREAMS`, `FORGECI_QUIC_IDLE_TIMEOUT_MS`,
    /// `FORGECI_QUIC_KEEP_ALIVE_MS`, `FORGECI_QUIC_UDP_RECV_BUFFER`,
    /// `FORGECI_QUIC_UDP_SEND_BUFFER`.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            max_incoming: env_or("FORGECI_QUIC_MAX_INCOMING", base.max_incoming),
            max_bi_streams: env_or("FORGECI_QUIC_MAX_BI_STREAMS", base.max_bi_streams),
            idle_timeout_ms: env_or("FORGECI_QUIC_IDLE_TIMEOUT_MS", base.idle_timeout_ms),
            keep_alive_interval_ms: env_or(
                "FORGECI_QUIC_KEEP_ALIVE_MS",
                base.keep_alive_interval_ms,
            ),
            udp_receive_buffer_size: env_or(
                "FORGECI_QUIC_UDP_RECV_BUFFER",
                base.udp_receive_buffer_size,
            ),
            udp_send_buffer_size: env_or(
                "FORGECI_QUIC_UDP_SEND_BUFFER",
                base.udp_send_buffer_size,
            ),
            ..base
        }
    }
}

/// Bind the UDP socket with the configured buffer sizes.
///
/// Buffer resizing is best effort; the kernel may clamp or refuse, and the
/// endpoint works either way.
fn bind_udp_socket(config: &ForgeServerConfig) -> Result<std::net::UdpSocket, ServerError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if config.bind_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if config.udp_receive_buffer_size > 0
        && let Err(e) = socket.set_recv_buffer_size(config.udp_receive_buffer_size)
    {
        warn!(size = config.udp_receive_buffer_size, error = %e, "could not size UDP receive buffer");
    }
    if config.udp_send_buffer_size > 0
        && let Err(e) = socket.set_send_buffer_size(config.udp_send_buffer_size)
    {
        warn!(size = config.udp_send_buffer_size, error = %e, "could not size UDP send buffer");
    }

    socket.bind(&config.bind_addr.into())?;
    Ok(socket.into())
}

fn build_server_config(config: &ForgeServerConfig) -> Result<ServerConfig, ServerError> {
    let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("bad certificate PEM: {e}")))?;
    let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
        .map_err(|e| ServerError::Tls(format!("bad private key PEM: {e}")))?
        .ok_or_else(|| ServerError::Tls("no private key in PEM".to_string()))?;

    let crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .unwrap(),
    ));
    transport.max_concurrent_bidi_streams(config.max_bi_streams.into());
    if config.keep_alive_interval_ms > 0 {
        transport.keep_alive_interval(Some(Duration::from_millis(config.keep_alive_interval_ms)));
    }

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| ServerError::Tls(e.to_string()))?,
    ));
    server_config.transport_config(Arc::new(transport));
    server_config.max_incoming(config.max_incoming as usize);
    Ok(server_config)
}

/// The QUIC endpoint the runner service listens on.
pub struct ForgeServer {
    endpoint: Endpoint,
    config: ForgeServerConfig,
}

impl ForgeServer {
    /// Bind an endpoint with the given configuration.
    pub fn new(config: ForgeServerConfig) -> Result<Self, ServerError> {
        let server_config = build_server_config(&config)?;
        let socket = bind_udp_socket(&config)?;

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(socket)?,
            runtime,
        )?;

        info!(
            addr = %config.bind_addr,
            max_incoming = config.max_incoming,
            max_bi_streams = config.max_bi_streams,
            idle_timeout_ms = config.idle_timeout_ms,
            "QUIC server bound"
        );
        Ok(Self { endpoint, config })
    }

    /// Bind with a freshly generated self-signed certificate.
    ///
    /// Intended for development and tests; runners must be configured to
    /// trust the certificate explicitly.
    pub fn localhost(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        Self::localhost_with_config(bind_addr, ForgeServerConfig::from_env())
    }

    /// [`Self::localhost`] with caller-supplied tuning.
    pub fn localhost_with_config(
        bind_addr: SocketAddr,
        mut config: ForgeServerConfig,
    ) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        config.bind_addr = bind_addr;
        config.cert_pem = cert.cert.pem().into_bytes();
        config.key_pem = cert.key_pair.serialize_pem().into_bytes();
        Self::new(config)
    }

    pub fn config(&self) -> &ForgeServerConfig {
        &self.config
    }

    /// Wait for the next incoming connection attempt.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }

    /// Accept loop: each accepted connection is handed to `handler` on its
    /// own task. Returns when the endpoint is closed.
    #[instrument(skip(self, handler))]
    pub async fn run<H, Fut>(&self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(ConnectionHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("QUIC server running");
        while let Some(incoming) = self.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        debug!(remote = %connection.remote_address(), "accepted connection");
                        handler(ConnectionHandler::new(connection)).await;
                    }
                    Err(e) => warn!(error = %e, "handshake failed"),
                }
            });
        }
        Ok(())
    }
}

/// One accepted runner connection.
pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Wait for the peer to open the next bidirectional stream.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        Ok(self.connection.accept_bi().await?)
    }

    /// Stream loop: each opened stream is handed to `handler` on its own
    /// task. Returns when the connection goes away.
    #[instrument(skip(self, handler), fields(remote = %self.remote_address()))]
    pub async fn run<H, Fut>(&self, handler: H)
    where
        H: Fn(StreamHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept_bi().await {
                Ok((send, recv)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler(StreamHandler::new(send, recv)).await;
                    });
                }
                Err(ServerError::Connection(
                    quinn::ConnectionError::ApplicationClosed(_)
                    | quinn::ConnectionError::LocallyClosed,
                )) => {
                    debug!("connection closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "stream accept failed");
                    break;
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    pub fn close(&self, code: u32, reason: &[u8]) {
        self.connection.close(code.into(), reason);
    }
}

/// One call's worth of stream: read the request, write the response, finish.
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, ServerError> {
        Ok(read_frame(&mut self.recv).await?)
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ServerError> {
        Ok(write_frame(&mut self.send, frame).await?)
    }

    /// Signal the end of the response.
    pub fn finish(&mut self) -> Result<(), ServerError> {
        self.send
            .finish()
            .map_err(|e| ServerError::Frame(FrameError::Io(std::io::Error::other(e))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_defaults() {
        let config = ForgeServerConfig::default();
        assert_eq!(config.max_incoming, 10_000);
        assert_eq!(config.max_bi_streams, 256);
        assert!(config.cert_pem.is_empty() && config.key_pem.is_empty());
    }

    #[tokio::test]
    async fn test_localhost_binds_ephemeral_port() {
        let server = ForgeServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn test_accept_returns_none_after_close() {
        let server = ForgeServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap();
        server.close();
        assert!(server.accept().await.is_none());
    }

    #[test]
    fn test_garbage_pem_rejected() {
        let config = ForgeServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            cert_pem: b"not a certificate".to_vec(),
            key_pem: b"not a key".to_vec(),
            ..Default::default()
        };
        assert!(ForgeServer::new(config).is_err());
    }

    #[test]
    fn test_self_signed_pem_accepted() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = ForgeServerConfig {
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: cert.key_pair.serialize_pem().into_bytes(),
            ..Default::default()
        };
        assert!(build_server_config(&config).is_ok());
    }
}
