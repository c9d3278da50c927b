//! QUIC Transport
//!
//! Request/response calls between ring members over QUIC (via Quinn).
//! Every call opens one bidirectional stream on a cached connection, writes
//! one length-prefixed request and reads one length-prefixed response.
//!
//! Uses Sans-IO pattern: message encoding/decoding is separated from I/O for testability.

use crate::replication::types::{Request, Response, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use quinn::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use quinn::rustls::{DigitallySignedStruct, SignatureScheme};
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Largest frame accepted from a peer.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// How long a silent peer keeps its connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

const KEEP_ALIVE: Duration = Duration::from_secs(1);

// ==================== Sans-IO Functions ====================

/// Encode a message for transport (Sans-IO pattern).
/// Returns length-prefixed binary data ready for sending.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, StoreError> {
    let data = bincode::serialize(msg).map_err(|e| StoreError::Codec(e.to_string()))?;
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(StoreError::Codec(format!("message too large: {} bytes", data.len())));
    }
    let len = data.len() as u32;

    let mut result = Vec::with_capacity(4 + data.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&data);

    Ok(result)
}

/// Decode a length from the first 4 bytes.
pub fn decode_length(buf: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*buf)
}

/// Decode a message from binary data (Sans-IO pattern).
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(data).map_err(|e| StoreError::Codec(e.to_string()))
}

// ==================== Server Side ====================

/// Serves the requests a node receives.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// One QUIC endpoint acting as both server and client.
pub struct Transport {
    endpoint: Endpoint,
    connections: DashMap<SocketAddr, Connection>,
}

impl Transport {
    /// Bind the endpoint. Must be called inside a tokio runtime.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        // Another endpoint in the process may have installed it already.
        let _ = rustls::crypto::ring::default_provider().install_default();

        // Generate self-signed certificate for QUIC
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;

        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der)];
        let private_key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
            .map_err(|e| anyhow::anyhow!("failed to parse private key: {:?}", e))?;

        let mut transport_config = TransportConfig::default();
        transport_config
            .max_idle_timeout(Some(IDLE_TIMEOUT.try_into()?))
            .keep_alive_interval(Some(KEEP_ALIVE));
        let transport_config = Arc::new(transport_config);

        let server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)?;

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_config.transport_config(transport_config.clone());

        // Peers present self-signed certificates
        let client_crypto = quinn::rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyPeer::new()))
            .with_no_client_auth();

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
        ));
        client_config.transport_config(transport_config);

        let mut endpoint = Endpoint::server(server_config, addr)?;
        endpoint.set_default_client_config(client_config);

        tracing::info!("transport listening on {}", endpoint.local_addr()?);

        Ok(Self {
            endpoint,
            connections: DashMap::new(),
        })
    }

    /// The address actually bound, with the real port when bound to port 0.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Spawn the accept loop. It runs until the endpoint is closed.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn serve(&self, handler: Arc<dyn RequestHandler>) {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => Self::handle_connection(connection, handler).await,
                        Err(e) => {
                            tracing::warn!("failed to accept connection: {:?}", e);
                        }
                    }
                });
            }
            tracing::debug!("accept loop finished");
        });
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn handle_connection(connection: Connection, handler: Arc<dyn RequestHandler>) {
        let remote = connection.remote_address();
        loop {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_stream(send, recv, handler).await {
                            tracing::debug!("failed to serve request from {}: {:?}", remote, e);
                        }
                    });
                }
                Err(quinn::ConnectionError::ApplicationClosed(_)) | Err(quinn::ConnectionError::LocallyClosed) => {
                    break;
                }
                Err(e) => {
                    tracing::debug!("connection error from {}: {:?}", remote, e);
                    break;
                }
            }
        }
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn handle_stream(mut send: SendStream, mut recv: RecvStream, handler: Arc<dyn RequestHandler>) -> anyhow::Result<()> {
        let request: Request = read_frame(&mut recv).await?;
        let response = handler.handle(request).await;
        send.write_all(&encode_message(&response)?).await?;
        send.finish()?;
        Ok(())
    }

    // ==================== Client Side ====================

    /// Send `request` to the node at `addr` and wait for its response.
    ///
    /// Any I/O failure is a [`StoreError::Transport`] and drops the cached
    /// connection, so the next call dials again.
    #[cfg_attr(coverage_nightly, coverage(off))]
    #[tracing::instrument(level = "trace", skip(self, request), fields(kind = request.name()))]
    pub async fn call(&self, addr: &str, request: Request) -> Result<Response, StoreError> {
        let target = resolve(addr).await?;
        let connection = self
            .connection(target)
            .await
            .map_err(|e| StoreError::transport(addr, e))?;
        let frame = encode_message(&request)?;
        match exchange(&connection, &frame).await {
            Ok(data) => decode_message(&data),
            Err(e) => {
                self.connections.remove(&target);
                Err(StoreError::transport(addr, e))
            }
        }
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn connection(&self, target: SocketAddr) -> anyhow::Result<Connection> {
        if let Some(existing) = self.connections.get(&target) {
            if existing.close_reason().is_none() {
                return Ok(existing.clone());
            }
        }
        let connection = self.endpoint.connect(target, "localhost")?.await?;
        self.connections.insert(target, connection.clone());
        Ok(connection)
    }

    /// Number of cached outgoing connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close every connection and stop accepting.
    pub fn close(&self) {
        self.connections.clear();
        self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn resolve(addr: &str) -> Result<SocketAddr, StoreError> {
    if let Ok(target) = addr.parse() {
        return Ok(target);
    }
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| StoreError::transport(addr, e))?
        .next()
        .ok_or_else(|| StoreError::transport(addr, "address did not resolve"))
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn exchange(connection: &Connection, frame: &[u8]) -> anyhow::Result<Vec<u8>> {
    let (mut send, mut recv) = connection.open_bi().await?;
    send.write_all(frame).await?;
    send.finish()?;
    read_raw_frame(&mut recv).await
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn read_raw_frame(recv: &mut RecvStream) -> anyhow::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = decode_length(&len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        anyhow::bail!("message too large: {} bytes", len);
    }
    let mut data = vec![0u8; len];
    recv.read_exact(&mut data).await?;
    Ok(data)
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn read_frame<T: DeserializeOwned>(recv: &mut RecvStream) -> anyhow::Result<T> {
    let data = read_raw_frame(recv).await?;
    Ok(decode_message(&data)?)
}

/// Accepts any peer certificate. Every node generates its own self-signed
/// certificate, so there is no chain to verify; links stay encrypted.
#[derive(Debug)]
struct AcceptAnyPeer {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAnyPeer {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
impl ServerCertVerifier for AcceptAnyPeer {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, quinn::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
