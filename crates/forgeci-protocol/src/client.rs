// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client used by runners to call the Actions server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::frame::{Frame, FrameError, read_frame, write_frame};
use crate::runner_proto::{RpcRequest, RpcResponse, rpc_request};

/// Client-side transport failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("no connection established")]
    NotConnected,

    #[error("connection timed out after {0}ms")]
    Timeout(u64),
}

/// Connection parameters for [`RunnerClient`].
#[derive(Debug, Clone)]
pub struct RunnerClientConfig {
    pub server_addr: SocketAddr,
    /// Name the server certificate must match.
    pub server_name: String,
    /// Accept any server certificate. Development only; the standalone
    /// server presents a self-signed certificate.
    pub dangerous_skip_cert_verification: bool,
    /// Zero disables keep-alives.
    pub keep_alive_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RunnerClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8088".parse().unwrap(),
            server_name: "localhost".to_string(),
            dangerous_skip_cert_verification: false,
            keep_alive_interval_ms: 10_000,
            idle_timeout_ms: 120_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Caller side of the runner service.
///
/// The connection is anonymous and lazily (re)established; credentials
/// travel per call in the [`RpcRequest`] envelope, so one client can serve
/// a runner through registration and beyond.
pub struct RunnerClient {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    config: RunnerClientConfig,
}

impl RunnerClient {
    pub fn new(config: RunnerClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())?;
        endpoint.set_default_client_config(build_client_config(&config));
        Ok(Self {
            endpoint,
            connection: Mutex::new(None),
            config,
        })
    }

    /// Client for a local development server (certificate checks off).
    pub fn localhost(server_addr: SocketAddr) -> Result<Self, ClientError> {
        Self::new(RunnerClientConfig {
            server_addr,
            dangerous_skip_cert_verification: true,
            ..Default::default()
        })
    }

    /// Establish the connection if there is no live one.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref()
            && conn.close_reason().is_none()
        {
            debug!("reusing existing connection");
            return Ok(());
        }

        info!(addr = %self.config.server_addr, "connecting to runner service");
        let connecting = self
            .endpoint
            .connect(self.config.server_addr, &self.config.server_name)?;
        let connection = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            connecting,
        )
        .await
        .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        *guard = Some(connection);
        Ok(())
    }

    async fn live_connection(&self) -> Result<Connection, ClientError> {
        self.connect().await?;
        let guard = self.connection.lock().await;
        guard.clone().ok_or(ClientError::NotConnected)
    }

    /// Issue one call on a fresh stream and wait for the response frame.
    ///
    /// `uuid` and `token` are empty for `Register`, which authenticates
    /// with the registration token in its body instead.
    #[instrument(skip(self, request, token))]
    pub async fn call(
        &self,
        uuid: &str,
        token: &str,
        request: rpc_request::Request,
    ) -> Result<RpcResponse, ClientError> {
        let envelope = RpcRequest {
            uuid: uuid.to_string(),
            token: token.to_string(),
            request: Some(request),
        };

        let conn = self.live_connection().await?;
        let (mut send, mut recv) = conn.open_bi().await?;

        write_frame(&mut send, &Frame::request(&envelope)?).await?;
        send.finish()?;

        Ok(read_frame(&mut recv).await?.decode()?)
    }

    pub async fn close(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close(0u32.into(), b"client closing");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| conn.close_reason().is_none())
    }
}

impl Drop for RunnerClient {
    fn drop(&mut self) {
        // Best effort; skipped if the lock is held.
        if let Ok(mut guard) = self.connection.try_lock()
            && let Some(conn) = guard.take()
        {
            conn.close(0u32.into(), b"client dropped");
        }
    }
}

fn build_client_config(config: &RunnerClientConfig) -> ClientConfig {
    let crypto = if config.dangerous_skip_cert_verification {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    let mut transport = TransportConfig::default();
    if config.keep_alive_interval_ms > 0 {
        transport.keep_alive_interval(Some(Duration::from_millis(config.keep_alive_interval_ms)));
    }
    transport.max_idle_timeout(Some(
        Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .unwrap(),
    ));

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto).unwrap(),
    ));
    client_config.transport_config(Arc::new(transport));
    client_config
}

/// Accepts any server certificate. Only reachable through
/// [`RunnerClientConfig::dangerous_skip_cert_verification`].
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_verify_certificates() {
        let config = RunnerClientConfig::default();
        assert!(!config.dangerous_skip_cert_verification);
        assert_eq!(config.server_name, "localhost");
    }

    #[tokio::test]
    async fn test_fresh_client_is_disconnected() {
        let client = RunnerClient::localhost("127.0.0.1:8088".parse().unwrap()).unwrap();
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_times_out_against_dead_port() {
        let client = RunnerClient::new(RunnerClientConfig {
            server_addr: "127.0.0.1:59998".parse().unwrap(),
            dangerous_skip_cert_verification: true,
            connect_timeout_ms: 100,
            ..Default::default()
        })
        .unwrap();
        assert!(client.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_close_without_connection_is_noop() {
        let client = RunnerClient::localhost("127.0.0.1:8088".parse().unwrap()).unwrap();
        client.close().await;
        assert!(!client.is_connected().await);
    }
}
