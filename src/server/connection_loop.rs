// src/server/connection_loop.rs

//! The accept loop, per-connection framing, and graceful shutdown.

use crate::core::agent_state::AgentContext;
use crate::core::errors::AgentError;
use crate::core::pubsub::JOB_UPDATE_STREAM;
use crate::rpc::{
    MAX_FRAME_BYTES, RequestEnvelope, ResponseEnvelope, SERVICE_JOB, Status,
};
use crate::server::auth::authenticate;
use crate::server::context::ServerContext;
use crate::server::dispatch::{AuthScope, ServiceRegistry, dispatch};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

/// A plain-TCP or TLS server-side stream behind one type.
enum ServerStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Runs the accept loop until shutdown, then drains background tasks.
/// Returns an error when a critical background task died early, so the
/// process can exit non-zero.
pub async fn run(mut ctx: ServerContext) -> anyhow::Result<()> {
    let mut shutdown_rx = ctx.agent.shutdown_rx();

    loop {
        tokio::select! {
            accepted = ctx.listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let agent = ctx.agent.clone();
                        let registry = ctx.registry.clone();
                        let permits = ctx.handler_permits.clone();
                        let acceptor = ctx.acceptor.clone();
                        tokio::spawn(async move {
                            handle_connection(
                                agent,
                                registry,
                                permits,
                                acceptor,
                                stream,
                                peer.to_string(),
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            joined = ctx.background_tasks.join_next() => {
                // Tasks returning because shutdown was requested are fine;
                // anything else finishing here panicked or hit an
                // unrecoverable state.
                if shutdown_rx.try_recv().is_ok() {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                match joined {
                    Some(Ok(())) => error!("A background task exited unexpectedly"),
                    Some(Err(e)) => error!("A background task panicked: {e}"),
                    None => error!("All background tasks are gone"),
                }
                ctx.fatal.store(true, Ordering::SeqCst);
                ctx.agent.trigger_shutdown();
                break;
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown requested, stopping accept loop");
                break;
            }
        }
    }

    drain_background_tasks(&mut ctx).await;

    if ctx.fatal.load(Ordering::SeqCst) {
        anyhow::bail!("shut down after a background task failure");
    }
    Ok(())
}

async fn drain_background_tasks(ctx: &mut ServerContext) {
    let grace = Duration::from_secs(10);
    let deadline = tokio::time::Instant::now() + grace;
    while let Ok(Some(result)) =
        tokio::time::timeout_at(deadline, ctx.background_tasks.join_next()).await
    {
        if let Err(e) = result {
            if e.is_panic() {
                error!("Background task panicked during shutdown: {e}");
                ctx.fatal.store(true, Ordering::SeqCst);
            }
        }
    }
    // Whatever is still running after the grace period gets aborted.
    ctx.background_tasks.shutdown().await;
    info!("Background tasks drained");
}

async fn handle_connection(
    agent: Arc<AgentContext>,
    registry: Arc<ServiceRegistry>,
    permits: Arc<Semaphore>,
    acceptor: Option<TlsAcceptor>,
    stream: TcpStream,
    peer: String,
) {
    let stream = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => ServerStream::Tls(Box::new(tls)),
            Err(e) => {
                debug!(%peer, "TLS handshake failed: {e}");
                return;
            }
        },
        None => ServerStream::Tcp(stream),
    };

    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec();
    let mut framed = Framed::new(stream, codec);
    let mut shutdown_rx = agent.shutdown_rx();

    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = shutdown_rx.recv() => return,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(%peer, "Connection framing error: {e}");
                return;
            }
            None => return,
        };

        let mut request: RequestEnvelope = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(e) => {
                let err = AgentError::InvalidArgument(format!("undecodable request frame: {e}"));
                let _ = send(&mut framed, &ResponseEnvelope::error(0, &err)).await;
                continue;
            }
        };

        // Authentication decides the scope (and pins cluster_id) before any
        // handler is looked at.
        let scope = match authenticate(&agent, &mut request) {
            Ok(scope) => scope,
            Err(e) => {
                let _ = send(&mut framed, &ResponseEnvelope::error(request.id, &e)).await;
                continue;
            }
        };

        // The single streaming method takes over the connection.
        if request.service == SERVICE_JOB && request.method == "Listen" {
            if scope != AuthScope::Direct {
                let err = AgentError::Unauthenticated(
                    "job streaming requires direct credentials".to_string(),
                );
                let _ = send(&mut framed, &ResponseEnvelope::error(request.id, &err)).await;
                continue;
            }
            stream_job_updates(&agent, &mut framed, request.id, &mut shutdown_rx).await;
            return;
        }

        let _permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let request_id = request.id;
        let response = dispatch(&agent, &registry, scope, &peer, request).await;
        drop(_permit);

        if let Err(e) = send(&mut framed, &response).await {
            debug!(%peer, request_id, "Failed to write response: {e}");
            return;
        }
    }
}

async fn send(
    framed: &mut Framed<ServerStream, LengthDelimitedCodec>,
    response: &ResponseEnvelope,
) -> Result<(), AgentError> {
    let bytes: Bytes = response.to_bytes()?;
    framed.send(bytes).await?;
    Ok(())
}

/// `Job/Listen`: replay everything not yet acknowledged, then forward live
/// updates until the client goes away.
async fn stream_job_updates(
    agent: &Arc<AgentContext>,
    framed: &mut Framed<ServerStream, LengthDelimitedCodec>,
    request_id: u64,
    shutdown_rx: &mut tokio::sync::broadcast::Receiver<()>,
) {
    // Subscribe before the replay so records completed in between are not
    // lost; duplicates are fine, lost records are not.
    let mut updates = agent.broker.subscribe(JOB_UPDATE_STREAM);

    for record in agent.jobs.unacknowledged() {
        let Ok(payload) = serde_json::to_value(&record) else {
            continue;
        };
        if send(framed, &ResponseEnvelope::ok(request_id, payload)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(raw) => {
                        let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&raw) else {
                            continue;
                        };
                        if send(framed, &ResponseEnvelope::ok(request_id, payload)).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Job listener lagged; client should reconnect for replay");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
            // Surface client disconnects promptly.
            frame = framed.next() => {
                if frame.is_none() {
                    return;
                }
                let err = AgentError::InvalidState(
                    "connection is streaming job updates".to_string(),
                );
                if send(framed, &ResponseEnvelope { id: 0, code: Status::from_error(&err), message: err.to_string(), payload: serde_json::Value::Null }).await.is_err() {
                    return;
                }
            }
            _ = shutdown_rx.recv() => return,
        }
    }
}
