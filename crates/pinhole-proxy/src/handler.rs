//! Terminal pipeline stage: rewrites, forwards and observes exchanges.
//!
//! For each decoded request the handler resolves the upstream, consults
//! the [`Rewriter`], notifies observers, forwards over a (possibly reused)
//! outbound connection and writes the response back. A `101` response
//! hands both legs over to frame relay.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, FramedParts};

use crate::codec::{FrameCodec, RequestCodec, ResponseCodec};
use crate::config::{ExternalProxy, ProxyConfig};
use crate::error::{DecodeError, ProxyError, Result};
use crate::listener::{EventFanout, EventListener};
use crate::message::{Direction, HttpRequest, HttpResponse, Scheme, Upstream, WebSocketFrame};
use crate::pipeline::{BoxedIo, ChannelContext, ConnectionInfo, PrefixedIo};
use crate::rewrite::{FrameAction, RequestAction, Rewriter};

pub(crate) type ClientFramed = Framed<BoxedIo, RequestCodec>;
type FrameFramed = Framed<BoxedIo, FrameCodec>;

/// How the connection continues after one exchange.
pub(crate) enum Exchange {
    /// Read the next request.
    KeepAlive,
    /// Close the client connection.
    Close,
    /// Switch both legs to WebSocket frame relay.
    Upgrade {
        request: HttpRequest,
        origin: UpstreamConnection,
    },
    /// Protocol switch to something other than WebSocket; relay bytes.
    Raw(UpstreamConnection),
}

/// Outbound connection to one upstream.
pub(crate) struct UpstreamConnection {
    pub(crate) target: Upstream,
    absolute_form: bool,
    framed: Framed<BoxedIo, ResponseCodec>,
}

impl UpstreamConnection {
    /// Request as it goes on the wire toward this connection.
    fn outbound(&self, request: &HttpRequest) -> HttpRequest {
        let mut outbound = request.clone();
        outbound.target = if self.absolute_form {
            self.target.url(request.origin_form())
        } else {
            request.origin_form().to_string()
        };
        // The body is already buffered, so never wait for 100-continue.
        outbound.headers.remove("expect");
        outbound.headers.remove("proxy-connection");
        outbound
    }

    /// True once the origin started answering the last request sent.
    fn response_started(&self) -> bool {
        self.framed.codec().response_started() || !self.framed.read_buffer().is_empty()
    }

    async fn exchange(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        self.framed.send(request).await?;
        loop {
            match self.framed.next().await {
                Some(Ok(response))
                    if (100..200).contains(&response.status) && response.status != 101 =>
                {
                    continue
                }
                Some(Ok(response)) => return Ok(response),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(ProxyError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "upstream closed the connection without responding",
                    )))
                }
            }
        }
    }
}

/// Opens outbound connections, directly or through an external proxy.
#[derive(Clone)]
pub(crate) struct UpstreamConnector {
    tls: TlsConnector,
}

impl std::fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnector").finish_non_exhaustive()
    }
}

impl UpstreamConnector {
    /// Creates a connector verifying origins against the webpki roots, or
    /// accepting any certificate when `accept_invalid_certs` is set.
    pub fn new(accept_invalid_certs: bool) -> Result<Self> {
        let config = client_config(accept_invalid_certs)?;
        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    pub(crate) async fn connect(
        &self,
        upstream: &Upstream,
        config: &ProxyConfig,
    ) -> Result<UpstreamConnection> {
        let (io, absolute_form) = self.open(upstream, config).await?;
        let io = match upstream.scheme {
            Scheme::Https => self.handshake(upstream, io).await?,
            Scheme::Http => io,
        };
        tracing::debug!(upstream = %upstream, "Connected upstream");

        Ok(UpstreamConnection {
            target: upstream.clone(),
            absolute_form,
            framed: Framed::new(io, ResponseCodec::new()),
        })
    }

    /// Opens a byte stream toward `upstream`. Through an external proxy,
    /// TLS upstreams are tunnelled with CONNECT and plain ones need
    /// absolute-form targets (the returned flag).
    pub(crate) async fn open(
        &self,
        upstream: &Upstream,
        config: &ProxyConfig,
    ) -> Result<(BoxedIo, bool)> {
        match config.active_external_proxy() {
            Some(proxy) => {
                let stream = tcp_connect(&proxy.host, proxy.port, proxy.authority()).await?;
                match upstream.scheme {
                    Scheme::Https => Ok((tunnel_through(stream, upstream, proxy).await?, false)),
                    Scheme::Http => Ok((Box::new(stream), true)),
                }
            }
            None => {
                let stream =
                    tcp_connect(&upstream.host, upstream.port, upstream.authority()).await?;
                Ok((Box::new(stream), false))
            }
        }
    }

    async fn handshake(&self, upstream: &Upstream, io: BoxedIo) -> Result<BoxedIo> {
        let server_name = ServerName::try_from(upstream.host.clone())
            .map_err(|e| ProxyError::Tls(format!("invalid server name {}: {e}", upstream.host)))?;
        let tls = self
            .tls
            .connect(server_name, io)
            .await
            .map_err(|source| ProxyError::UpstreamUnreachable {
                authority: upstream.authority(),
                source,
            })?;
        Ok(Box::new(tls))
    }
}

async fn tcp_connect(host: &str, port: u16, authority: String) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|source| ProxyError::UpstreamUnreachable { authority, source })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn tunnel_through(
    stream: TcpStream,
    upstream: &Upstream,
    proxy: &ExternalProxy,
) -> Result<BoxedIo> {
    let authority = upstream.authority();
    let refused = |reason: String| ProxyError::UpstreamUnreachable {
        authority: proxy.authority(),
        source: io::Error::other(reason),
    };

    let mut framed = Framed::new(Box::new(stream) as BoxedIo, ResponseCodec::new());
    framed
        .send(HttpRequest::new("CONNECT", authority.clone()).with_header("Host", authority.clone()))
        .await?;
    let response = framed
        .next()
        .await
        .transpose()?
        .ok_or_else(|| refused("proxy closed the connection".into()))?;
    if !(200..300).contains(&response.status) {
        return Err(refused(format!(
            "proxy refused CONNECT {authority}: {} {}",
            response.status, response.reason
        )));
    }

    let parts = framed.into_parts();
    Ok(Box::new(PrefixedIo::new(parts.read_buf.freeze(), parts.io)))
}

fn client_config(accept_invalid_certs: bool) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    let mut config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Accepts any origin certificate (`accept_invalid_upstream_certs`).
#[derive(Debug)]
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// True when the response body ends only when the origin closes.
fn is_close_delimited(request: &HttpRequest, response: &HttpResponse) -> bool {
    let bodyless = request.is_head()
        || (100..200).contains(&response.status)
        || response.status == 204
        || response.status == 304;
    !bodyless && !response.headers.contains("content-length") && !response.headers.is_chunked()
}

/// Handler stage shared by every connection of a running server.
#[derive(Clone)]
pub(crate) struct HandlerStage {
    listeners: Arc<EventFanout>,
    rewriter: Arc<dyn Rewriter>,
    connector: UpstreamConnector,
}

impl HandlerStage {
    /// Creates a handler stage.
    pub fn new(
        listeners: Arc<EventFanout>,
        rewriter: Arc<dyn Rewriter>,
        connector: UpstreamConnector,
    ) -> Self {
        Self {
            listeners,
            rewriter,
            connector,
        }
    }

    pub(crate) fn connector(&self) -> &UpstreamConnector {
        &self.connector
    }

    /// Logs a per-connection failure and reports it to observers.
    pub(crate) fn report(&self, conn: &ConnectionInfo, error: &ProxyError) {
        tracing::debug!(conn = conn.id, error = %error, "Connection error");
        let _ = self.listeners.on_error(conn, error);
    }

    /// Runs one request/response exchange.
    pub(crate) async fn handle(
        &self,
        ctx: &mut ChannelContext,
        mut request: HttpRequest,
        client: &mut ClientFramed,
    ) -> Result<Exchange> {
        let default_scheme = if ctx.intercepted {
            Scheme::Https
        } else {
            Scheme::Http
        };
        let Some(upstream) = request
            .upstream(default_scheme)
            .or_else(|| ctx.tunnel_target.clone())
        else {
            let error = ProxyError::Decode(DecodeError::InvalidHead(
                "request does not name a host".into(),
            ));
            self.report(&ctx.info, &error);
            client
                .send(HttpResponse::error(400, "missing Host header").with_header("Connection", "close"))
                .await?;
            return Ok(Exchange::Close);
        };
        let client_keep_alive = request.keep_alive();

        tracing::debug!(
            conn = ctx.info.id,
            method = %request.method,
            url = %upstream.url(request.origin_form()),
            "Request"
        );

        if let RequestAction::Respond(response) = self.rewriter.rewrite_request(&upstream, &mut request)
        {
            let _ = self.listeners.on_request(&ctx.info, &upstream, &request);
            let _ = self
                .listeners
                .on_response(&ctx.info, &upstream, &request, &response);
            let close = !client_keep_alive || !response.keep_alive();
            client.send(response).await?;
            return Ok(if close { Exchange::Close } else { Exchange::KeepAlive });
        }

        let _ = self.listeners.on_request(&ctx.info, &upstream, &request);

        let (mut response, origin) = match self.forward(ctx, &upstream, &request).await {
            Ok(pair) => pair,
            Err(error) => {
                tracing::warn!(conn = ctx.info.id, upstream = %upstream, error = %error, "Upstream request failed");
                let _ = self.listeners.on_error(&ctx.info, &error);
                let response = HttpResponse::error(
                    502,
                    &format!("upstream {} unreachable", upstream.authority()),
                );
                let _ = self
                    .listeners
                    .on_response(&ctx.info, &upstream, &request, &response);
                client.send(response).await?;
                return Ok(if client_keep_alive {
                    Exchange::KeepAlive
                } else {
                    Exchange::Close
                });
            }
        };

        self.rewriter
            .rewrite_response(&upstream, &request, &mut response);
        let _ = self
            .listeners
            .on_response(&ctx.info, &upstream, &request, &response);

        tracing::debug!(conn = ctx.info.id, status = response.status, "Response");

        let switching = response.is_switching_protocols();
        // Close-delimited bodies are re-framed with a length for the client,
        // but the origin leg is spent.
        let reusable = response.keep_alive() && !is_close_delimited(&request, &response);
        let close = !client_keep_alive || !response.keep_alive();
        client.send(response).await?;

        if switching {
            return Ok(if request.is_websocket_upgrade() {
                Exchange::Upgrade { request, origin }
            } else {
                Exchange::Raw(origin)
            });
        }
        if reusable {
            ctx.upstream = Some(origin);
        }
        Ok(if close { Exchange::Close } else { Exchange::KeepAlive })
    }

    async fn forward(
        &self,
        ctx: &mut ChannelContext,
        upstream: &Upstream,
        request: &HttpRequest,
    ) -> Result<(HttpResponse, UpstreamConnection)> {
        let (mut origin, reused) = match ctx.upstream.take() {
            Some(origin) if origin.target == *upstream => (origin, true),
            _ => (self.connector.connect(upstream, &ctx.config).await?, false),
        };

        let outbound = origin.outbound(request);
        match origin.exchange(outbound.clone()).await {
            Ok(response) => Ok((response, origin)),
            // A stale keep-alive connection is retried only when the origin
            // cannot have acted on the request.
            Err(error) if reused && !origin.response_started() && request.is_idempotent() => {
                tracing::debug!(conn = ctx.info.id, error = %error, "Reused upstream connection failed, reconnecting");
                let mut origin = self.connector.connect(upstream, &ctx.config).await?;
                let response = origin.exchange(outbound).await?;
                Ok((response, origin))
            }
            Err(error) => Err(error),
        }
    }

    /// Relays WebSocket frames between both legs until either side closes.
    pub(crate) async fn relay_frames(
        &self,
        ctx: &ChannelContext,
        upgrade: &HttpRequest,
        client: ClientFramed,
        origin: UpstreamConnection,
    ) -> Result<()> {
        let mut client = into_frames(client.into_parts());
        let mut origin = into_frames(origin.framed.into_parts());
        tracing::debug!(conn = ctx.info.id, "Relaying WebSocket frames");

        loop {
            tokio::select! {
                frame = client.next() => match frame {
                    Some(Ok(frame)) => {
                        self.relay_frame(ctx, upgrade, Direction::ClientToServer, frame, &mut origin).await?;
                    }
                    Some(Err(e)) => {
                        self.report(&ctx.info, &ProxyError::Decode(e));
                        break;
                    }
                    None => break,
                },
                frame = origin.next() => match frame {
                    Some(Ok(frame)) => {
                        self.relay_frame(ctx, upgrade, Direction::ServerToClient, frame, &mut client).await?;
                    }
                    Some(Err(e)) => {
                        self.report(&ctx.info, &ProxyError::Decode(e));
                        break;
                    }
                    None => break,
                },
            }
        }

        let _ = client.close().await;
        let _ = origin.close().await;
        Ok(())
    }

    async fn relay_frame(
        &self,
        ctx: &ChannelContext,
        upgrade: &HttpRequest,
        direction: Direction,
        mut frame: WebSocketFrame,
        sink: &mut FrameFramed,
    ) -> Result<()> {
        let action = self.rewriter.rewrite_frame(direction, &mut frame);
        let _ = self
            .listeners
            .on_message(&ctx.info, upgrade, direction, &frame);
        if action == FrameAction::Forward {
            sink.send(frame).await?;
        }
        Ok(())
    }

    /// Relays raw bytes after a non-WebSocket protocol switch.
    pub(crate) async fn relay_raw(
        &self,
        ctx: &ChannelContext,
        client: ClientFramed,
        origin: UpstreamConnection,
    ) -> Result<()> {
        let client = client.into_parts();
        let origin = origin.framed.into_parts();
        let (mut client_io, mut origin_io) = (client.io, origin.io);

        if !client.read_buf.is_empty() {
            origin_io.write_all(&client.read_buf).await?;
        }
        if !origin.read_buf.is_empty() {
            client_io.write_all(&origin.read_buf).await?;
        }
        let (up, down) = tokio::io::copy_bidirectional(&mut client_io, &mut origin_io).await?;
        tracing::debug!(conn = ctx.info.id, up, down, "Raw relay finished");
        Ok(())
    }
}

fn into_frames<C>(parts: FramedParts<BoxedIo, C>) -> FrameFramed {
    let mut frames = FramedParts::new::<WebSocketFrame>(parts.io, FrameCodec::new());
    frames.read_buf = parts.read_buf;
    frames.write_buf = parts.write_buf;
    Framed::from_parts(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_delimited_detection() {
        let get = HttpRequest::new("GET", "/");
        let head = HttpRequest::new("HEAD", "/");
        let bare = HttpResponse::new(200);
        let sized = HttpResponse::new(200).with_body(bytes::Bytes::from_static(b"x"));

        assert!(is_close_delimited(&get, &bare));
        assert!(!is_close_delimited(&get, &sized));
        assert!(!is_close_delimited(&head, &bare));
        assert!(!is_close_delimited(&get, &HttpResponse::new(204)));
    }

    #[tokio::test]
    async fn connector_builds_both_verifier_modes() {
        assert!(UpstreamConnector::new(false).is_ok());
        assert!(UpstreamConnector::new(true).is_ok());
    }
}
