//! Test doubles and loopback fixtures shared by the unit tests.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::ca::CaManager;
use crate::config::ProxyConfig;
use crate::error::{ObserverError, ProxyError, Result};
use crate::handler::{HandlerStage, UpstreamConnector};
use crate::listener::{EventFanout, EventListener};
use crate::message::{Direction, HttpRequest, HttpResponse, Upstream, WebSocketFrame};
use crate::pipeline::{ConnectionInfo, Pipeline, PipelineServices};
use crate::rewrite::{NoRewrite, Rewriter};
use crate::system_proxy::SystemProxyController;

/// One observed event, flattened for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Request { url: String, target: String },
    Response { url: String, status: u16 },
    Message { direction: Direction, payload: String },
    Error(String),
}

/// Observer that records everything it sees.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn requests(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Request { .. }))
            .collect()
    }
}

impl EventListener for RecordingListener {
    fn on_request(
        &self,
        _conn: &ConnectionInfo,
        upstream: &Upstream,
        request: &HttpRequest,
    ) -> std::result::Result<(), ObserverError> {
        self.events.lock().push(Event::Request {
            url: upstream.url(request.origin_form()),
            target: request.target.clone(),
        });
        Ok(())
    }

    fn on_response(
        &self,
        _conn: &ConnectionInfo,
        upstream: &Upstream,
        request: &HttpRequest,
        response: &HttpResponse,
    ) -> std::result::Result<(), ObserverError> {
        self.events.lock().push(Event::Response {
            url: upstream.url(request.origin_form()),
            status: response.status,
        });
        Ok(())
    }

    fn on_message(
        &self,
        _conn: &ConnectionInfo,
        _upgrade: &HttpRequest,
        direction: Direction,
        frame: &WebSocketFrame,
    ) -> std::result::Result<(), ObserverError> {
        self.events.lock().push(Event::Message {
            direction,
            payload: String::from_utf8_lossy(&frame.payload).into_owned(),
        });
        Ok(())
    }

    fn on_error(
        &self,
        _conn: &ConnectionInfo,
        error: &ProxyError,
    ) -> std::result::Result<(), ObserverError> {
        self.events.lock().push(Event::Error(error.to_string()));
        Ok(())
    }
}

/// Observer whose every callback fails.
pub struct FailingListener;

impl EventListener for FailingListener {
    fn on_request(
        &self,
        _conn: &ConnectionInfo,
        _upstream: &Upstream,
        _request: &HttpRequest,
    ) -> std::result::Result<(), ObserverError> {
        Err(ObserverError::new("rejected request"))
    }

    fn on_response(
        &self,
        _conn: &ConnectionInfo,
        _upstream: &Upstream,
        _request: &HttpRequest,
        _response: &HttpResponse,
    ) -> std::result::Result<(), ObserverError> {
        Err(ObserverError::new("rejected response"))
    }
}

/// Observer that panics on every request.
pub struct PanickingListener;

impl EventListener for PanickingListener {
    fn on_request(
        &self,
        _conn: &ConnectionInfo,
        _upstream: &Upstream,
        _request: &HttpRequest,
    ) -> std::result::Result<(), ObserverError> {
        panic!("observer bug");
    }
}

/// A call made to [`MockSystemProxy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyCall {
    Enable { port: u16, enable: bool },
    Set { host: String, port: u16 },
}

/// Controller that records calls instead of touching the OS.
#[derive(Default)]
pub struct MockSystemProxy {
    calls: Mutex<Vec<ProxyCall>>,
}

impl MockSystemProxy {
    pub fn calls(&self) -> Vec<ProxyCall> {
        self.calls.lock().clone()
    }

    /// The `enable` flags of every `set_system_proxy_enable` call.
    pub fn enable_flags(&self) -> Vec<bool> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ProxyCall::Enable { enable, .. } => Some(enable),
                ProxyCall::Set { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl SystemProxyController for MockSystemProxy {
    async fn set_system_proxy_enable(
        &self,
        port: u16,
        enable: bool,
        _tls_enabled: bool,
        _pass_domains: &[String],
    ) -> Result<()> {
        self.calls.lock().push(ProxyCall::Enable { port, enable });
        Ok(())
    }

    async fn set_system_proxy(
        &self,
        host: &str,
        port: u16,
        _tls_enabled: bool,
        _pass_domains: &[String],
    ) -> Result<()> {
        self.calls.lock().push(ProxyCall::Set {
            host: host.to_string(),
            port,
        });
        Ok(())
    }
}

/// Reads one message head, a byte at a time so nothing after it is consumed.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Reads one `Content-Length` framed message (request or response), head
/// and body.
pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let head = read_head(stream).await;
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.unwrap();

    let mut response = head.into_bytes();
    response.extend_from_slice(&body);
    response
}

/// Origin that answers every request with `response` and reports each
/// request it received, head and body.
pub async fn spawn_http_origin(
    response: &'static [u8],
) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    let request = read_message(&mut stream).await;
                    if request.is_empty() {
                        break;
                    }
                    let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
                    if stream.write_all(response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, rx)
}

/// Origin that echoes every byte back.
pub async fn spawn_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Serves pipelines on a loopback port with `listener` registered.
pub async fn spawn_pipelines(
    config: Arc<ProxyConfig>,
    listener: Arc<dyn EventListener>,
) -> SocketAddr {
    spawn_pipelines_with(config, listener, Arc::new(NoRewrite)).await
}

/// Like [`spawn_pipelines`], with `rewriter` in the handler stage.
pub async fn spawn_pipelines_with(
    config: Arc<ProxyConfig>,
    listener: Arc<dyn EventListener>,
    rewriter: Arc<dyn Rewriter>,
) -> SocketAddr {
    let ca_dir = config.ca_dir.clone().unwrap();
    let ca = Arc::new(CaManager::new(ca_dir));
    ca.ensure_ca().unwrap();

    let fanout = Arc::new(EventFanout::new());
    fanout.add(listener);
    let connector = UpstreamConnector::new(config.accept_invalid_upstream_certs).unwrap();
    let services = PipelineServices {
        ca,
        handler: HandlerStage::new(fanout, rewriter, connector),
    };

    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, peer)) = socket.accept().await {
            let pipeline = Pipeline::new(ConnectionInfo::new(peer), config.clone(), services.clone());
            tokio::spawn(pipeline.run(stream));
        }
    });
    addr
}
