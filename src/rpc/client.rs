// src/rpc/client.rs

//! Client side of the agent RPC protocol.
//!
//! Connections are short-lived: callers connect, issue one or a few unary
//! calls, and drop the client. The control plane uses `direct` credentials;
//! agents talking to each other inside a cluster use `cluster` credentials
//! carrying the cluster's shared token.

use crate::core::errors::AgentError;
use crate::rpc::{
    MAX_FRAME_BYTES, RequestEnvelope, ResponseEnvelope, SERVICE_HEALTHCHECK, SERVICE_INTER_AGENT,
    Status,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// How a caller authenticates itself.
#[derive(Debug, Clone)]
pub enum Credential {
    /// The control-plane secret; permits every service.
    Direct { token: String },
    /// A cluster's shared token; permits only the inter-agent service.
    Cluster { token: String, cluster_id: String },
}

impl Credential {
    fn header(&self) -> String {
        match self {
            Credential::Direct { token } => format!("direct:{token}:"),
            Credential::Cluster { token, cluster_id } => {
                format!("cluster:{token}:{cluster_id}")
            }
        }
    }
}

/// A plain or TLS client stream behind one type.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// One connection to a peer agent.
pub struct AgentClient {
    framed: Framed<ClientStream, LengthDelimitedCodec>,
    credential: Credential,
    next_id: u64,
}

impl AgentClient {
    /// Connects to an agent. With `trusted_ca_path` set, the connection is
    /// wrapped in TLS validated against that CA bundle.
    pub async fn connect(
        host: &str,
        port: u16,
        trusted_ca_path: Option<&str>,
        credential: Credential,
        connect_timeout: Duration,
    ) -> Result<Self, AgentError> {
        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| AgentError::Timeout(format!("connecting to {host}:{port}")))??;

        let stream = match trusted_ca_path {
            Some(ca_path) => {
                let connector = tls_connector(ca_path)?;
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|_| AgentError::InvalidArgument(format!("bad host name '{host}'")))?;
                let tls = tokio::time::timeout(connect_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| AgentError::Timeout(format!("TLS handshake with {host}:{port}")))??;
                ClientStream::Tls(Box::new(tls))
            }
            None => ClientStream::Tcp(tcp),
        };

        Ok(Self {
            framed: Framed::new(stream, codec()),
            credential,
            next_id: 1,
        })
    }

    async fn send(&mut self, request: &RequestEnvelope) -> Result<(), AgentError> {
        let bytes: Bytes = serde_json::to_vec(request)?.into();
        self.framed.send(bytes).await?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<ResponseEnvelope, AgentError> {
        let frame = tokio::time::timeout(timeout, self.framed.next())
            .await
            .map_err(|_| AgentError::Timeout("waiting for RPC response".to_string()))?
            .ok_or_else(|| AgentError::Rpc {
                code: "UNAVAILABLE".to_string(),
                message: "connection closed by peer".to_string(),
            })??;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Issues one unary call and returns the response payload, converting
    /// non-OK statuses into errors.
    pub async fn call(
        &mut self,
        service: &str,
        method: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = RequestEnvelope {
            id,
            service: service.to_string(),
            method: method.to_string(),
            auth_token: self.credential.header(),
            payload,
        };
        self.send(&request).await?;
        let response = self.recv(timeout).await?;
        match response.code {
            Status::Ok => Ok(response.payload),
            code => Err(AgentError::Rpc {
                code: format!("{code:?}"),
                message: response.message,
            }),
        }
    }

    /// Reads the next frame of a streaming response (`Job/Listen`).
    pub async fn next_stream_frame(
        &mut self,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, AgentError> {
        self.recv(timeout).await
    }

    // --- Typed convenience wrappers over the wire methods the core uses ---

    pub async fn ping(&mut self, timeout: Duration) -> Result<(), AgentError> {
        self.call(SERVICE_HEALTHCHECK, "Ping", json!({}), timeout)
            .await?;
        Ok(())
    }

    /// Asks the remote agent whether a database node of the cluster answers
    /// SQL. Errors count as unreachable at the call sites.
    pub async fn check_database_reachability(
        &mut self,
        cluster_id: &str,
        node_id: &str,
        timeout: Duration,
    ) -> Result<bool, AgentError> {
        let payload = self
            .call(
                SERVICE_INTER_AGENT,
                "CheckDatabaseReachability",
                json!({ "cluster_id": cluster_id, "node_id": node_id }),
                timeout,
            )
            .await?;
        Ok(payload
            .get("reachable")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub async fn request_rsync_access(
        &mut self,
        cluster_id: &str,
        node_id: &str,
        timeout: Duration,
    ) -> Result<RsyncAccess, AgentError> {
        let payload = self
            .call(
                SERVICE_INTER_AGENT,
                "RequestRsyncAccess",
                json!({ "cluster_id": cluster_id, "node_id": node_id }),
                timeout,
            )
            .await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn revoke_rsync_access(
        &mut self,
        cluster_id: &str,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<(), AgentError> {
        self.call(
            SERVICE_INTER_AGENT,
            "RevokeRsyncAccess",
            json!({ "cluster_id": cluster_id, "instance_id": instance_id }),
            timeout,
        )
        .await?;
        Ok(())
    }

    pub async fn sync_replication_user(
        &mut self,
        cluster_id: &str,
        node_id: &str,
        timeout: Duration,
    ) -> Result<(), AgentError> {
        self.call(
            SERVICE_INTER_AGENT,
            "SyncReplicationUser",
            json!({ "cluster_id": cluster_id, "node_id": node_id }),
            timeout,
        )
        .await?;
        Ok(())
    }
}

/// Credentials granted by `RequestRsyncAccess`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RsyncAccess {
    pub instance_id: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub src_path: String,
}

fn tls_connector(ca_path: &str) -> Result<TlsConnector, AgentError> {
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    let ca_file = std::fs::File::open(ca_path)?;
    let mut reader = std::io::BufReader::new(ca_file);
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert?;
        roots
            .add(cert)
            .map_err(|e| AgentError::Internal(format!("invalid CA certificate: {e}")))?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
