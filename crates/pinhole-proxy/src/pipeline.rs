//! Per-connection channel pipeline.
//!
//! Every accepted socket gets one [`Pipeline`]: the codec stage turns bytes
//! into messages (sniffing TLS and CONNECT first), and the
//! [`HandlerStage`](crate::handler::HandlerStage) forwards them. Both share
//! a typed [`ChannelContext`].

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, FramedParts};

use crate::ca::CaManager;
use crate::codec::{looks_like_tls, parse_client_hello, RequestCodec};
use crate::config::ProxyConfig;
use crate::error::{DecodeError, ProxyError, Result};
use crate::handler::{ClientFramed, Exchange, HandlerStage, UpstreamConnection};
use crate::message::{HttpResponse, Scheme, Upstream};

/// Largest first TLS record buffered while looking for SNI.
const MAX_CLIENT_HELLO: usize = 16 * 1024 + 5;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Byte stream the pipeline can run over (TCP, TLS, or a replaying wrapper).
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Io for T {}

/// Type-erased pipeline stream.
pub type BoxedIo = Box<dyn Io>;

/// Replays already-read bytes before reading from the inner stream.
pub struct PrefixedIo<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> PrefixedIo<T> {
    /// Wraps `inner`, serving `prefix` first.
    pub fn new(prefix: Bytes, inner: T) -> Self {
        Self { prefix, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PrefixedIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PrefixedIo<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Identity of one accepted client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Process-unique connection id.
    pub id: u64,
    /// Peer address of the client.
    pub client_addr: SocketAddr,
    /// When the connection was accepted.
    pub opened_at: DateTime<Utc>,
}

impl ConnectionInfo {
    /// Allocates a new connection id for `client_addr`.
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            client_addr,
            opened_at: Utc::now(),
        }
    }
}

/// State shared by the stages of one pipeline.
pub(crate) struct ChannelContext {
    pub(crate) info: ConnectionInfo,
    /// Config snapshot taken when the connection was accepted.
    pub(crate) config: Arc<ProxyConfig>,
    /// CONNECT (or SNI) target of the current tunnel.
    pub(crate) tunnel_target: Option<Upstream>,
    /// True once the client leg is TLS terminated by us.
    pub(crate) intercepted: bool,
    /// Outbound connection kept for the next request to the same target.
    pub(crate) upstream: Option<UpstreamConnection>,
}

/// Server-wide collaborators every pipeline needs.
#[derive(Clone)]
pub(crate) struct PipelineServices {
    pub(crate) ca: Arc<CaManager>,
    pub(crate) handler: HandlerStage,
}

pub(crate) struct Pipeline {
    ctx: ChannelContext,
    services: PipelineServices,
}

impl Pipeline {
    pub(crate) fn new(
        info: ConnectionInfo,
        config: Arc<ProxyConfig>,
        services: PipelineServices,
    ) -> Self {
        Self {
            ctx: ChannelContext {
                info,
                config,
                tunnel_target: None,
                intercepted: false,
                upstream: None,
            },
            services,
        }
    }

    /// Drives the connection to completion. Failures are logged and
    /// reported to observers, never returned.
    pub(crate) async fn run(mut self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        tracing::debug!(
            conn = self.ctx.info.id,
            client = %self.ctx.info.client_addr,
            "Connection opened"
        );

        if let Err(error) = self.serve(Box::new(stream)).await {
            self.services.handler.report(&self.ctx.info, &error);
        }
        tracing::debug!(conn = self.ctx.info.id, "Connection closed");
    }

    async fn serve(&mut self, mut io: BoxedIo) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            if buf.is_empty() && io.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }

            if looks_like_tls(&buf) {
                match self.accept_tls(io, buf).await? {
                    Some(tls) => {
                        io = tls;
                        buf = BytesMut::with_capacity(4096);
                        continue;
                    }
                    None => return Ok(()),
                }
            }

            let mut parts = FramedParts::new::<HttpResponse>(io, RequestCodec::new());
            parts.read_buf = buf;
            match self.serve_http(Framed::from_parts(parts)).await? {
                Some((next_io, next_buf)) => {
                    io = next_io;
                    buf = next_buf;
                }
                None => return Ok(()),
            }
        }
    }

    /// Handles a TLS client leg: terminates it with a leaf certificate when
    /// interception is on, otherwise relays it blindly. Returns the
    /// decrypted stream to keep decoding.
    async fn accept_tls(&mut self, mut io: BoxedIo, mut buf: BytesMut) -> Result<Option<BoxedIo>> {
        let server_name = loop {
            match parse_client_hello(&buf) {
                Ok(Some(hello)) => break hello.server_name,
                Ok(None) if buf.len() < MAX_CLIENT_HELLO => {
                    if io.read_buf(&mut buf).await? == 0 {
                        return Ok(None);
                    }
                }
                Ok(None) => break None,
                Err(e) => {
                    tracing::debug!(conn = self.ctx.info.id, error = %e, "Could not read SNI");
                    break None;
                }
            }
        };

        let target = match (&self.ctx.tunnel_target, &server_name) {
            (Some(target), _) => target.clone(),
            (None, Some(name)) => Upstream::new(Scheme::Https, name.clone(), 443),
            (None, None) => {
                let error = ProxyError::Tls("TLS client sent no SNI and no CONNECT target".into());
                self.services.handler.report(&self.ctx.info, &error);
                return Ok(None);
            }
        };

        if !self.ctx.config.enable_ssl {
            self.relay_blind(io, buf, &target).await?;
            return Ok(None);
        }

        let cert_host = server_name.unwrap_or_else(|| target.host.clone());
        let ca = self.services.ca.clone();
        let host = cert_host.clone();
        let cert = tokio::task::spawn_blocking(move || ca.certificate_for(&host))
            .await
            .map_err(|e| ProxyError::Tls(format!("certificate task failed: {e}")))??;
        let acceptor = TlsAcceptor::from(self.services.ca.server_config(&cert)?);

        let tls = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            acceptor.accept(PrefixedIo::new(buf.freeze(), io)),
        )
        .await
        .map_err(|_| ProxyError::Tls(format!("client handshake for {cert_host} timed out")))?
        .map_err(|e| ProxyError::Tls(format!("client handshake for {cert_host} failed: {e}")))?;

        tracing::debug!(conn = self.ctx.info.id, host = %cert_host, "TLS intercepted");
        self.ctx.tunnel_target = Some(target);
        self.ctx.intercepted = true;
        self.ctx.upstream = None;
        Ok(Some(Box::new(tls)))
    }

    async fn relay_blind(&self, mut client: BoxedIo, hello: BytesMut, target: &Upstream) -> Result<()> {
        let mut origin = match self
            .services
            .handler
            .connector()
            .open(target, &self.ctx.config)
            .await
        {
            Ok((origin, _)) => origin,
            Err(error) => {
                tracing::warn!(conn = self.ctx.info.id, upstream = %target, error = %error, "Tunnel target unreachable");
                self.services.handler.report(&self.ctx.info, &error);
                return Ok(());
            }
        };

        tracing::debug!(conn = self.ctx.info.id, upstream = %target, "Relaying TLS without interception");
        origin.write_all(&hello).await?;
        let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut origin).await?;
        tracing::debug!(conn = self.ctx.info.id, up, down, "Tunnel closed");
        Ok(())
    }

    /// Serves HTTP requests until the connection ends. After a CONNECT the
    /// raw stream and its unread bytes are handed back for re-sniffing.
    async fn serve_http(&mut self, mut client: ClientFramed) -> Result<Option<(BoxedIo, BytesMut)>> {
        let handler = self.services.handler.clone();
        loop {
            let request = match client.next().await {
                Some(Ok(request)) => request,
                Some(Err(DecodeError::Io(e))) => return Err(e.into()),
                Some(Err(e)) => {
                    let response = match e {
                        DecodeError::BodyTooLarge(_) => {
                            HttpResponse::error(413, "request body too large")
                                .with_header("Connection", "close")
                        }
                        _ => bad_request("malformed request"),
                    };
                    handler.report(&self.ctx.info, &ProxyError::Decode(e));
                    let _ = client.send(response).await;
                    return Ok(None);
                }
                None => return Ok(None),
            };

            if request.is_connect() {
                let Some(target) = request.upstream(Scheme::Https) else {
                    let error = ProxyError::Decode(DecodeError::InvalidHead(format!(
                        "invalid CONNECT target {:?}",
                        request.target
                    )));
                    handler.report(&self.ctx.info, &error);
                    let _ = client.send(bad_request("invalid CONNECT target")).await;
                    return Ok(None);
                };

                tracing::debug!(conn = self.ctx.info.id, target = %target.authority(), "CONNECT");
                let mut established = HttpResponse::new(200);
                established.reason = "Connection Established".into();
                client.send(established).await?;

                self.ctx.tunnel_target = Some(target);
                self.ctx.upstream = None;
                let parts = client.into_parts();
                return Ok(Some((parts.io, parts.read_buf)));
            }

            match handler.handle(&mut self.ctx, request, &mut client).await? {
                Exchange::KeepAlive => continue,
                Exchange::Close => {
                    let _ = client.close().await;
                    return Ok(None);
                }
                Exchange::Upgrade { request, origin } => {
                    handler
                        .relay_frames(&self.ctx, &request, client, origin)
                        .await?;
                    return Ok(None);
                }
                Exchange::Raw(origin) => {
                    handler.relay_raw(&self.ctx, client, origin).await?;
                    return Ok(None);
                }
            }
        }
    }
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::error(400, message).with_header("Connection", "close")
}
