//! Proxy server lifecycle.
//!
//! [`ProxyServer`] owns the listening socket and the server-wide
//! collaborators (certificate manager, observer fanout, rewriter, OS proxy
//! controller). Each accepted socket is handed to its own
//! [`Pipeline`](crate::pipeline::Pipeline) task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::ca::CaManager;
use crate::config::{ExternalProxy, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::handler::{HandlerStage, UpstreamConnector};
use crate::listener::{EventFanout, EventListener};
use crate::pipeline::{ConnectionInfo, Pipeline, PipelineServices};
use crate::rewrite::{NoRewrite, Rewriter};
use crate::system_proxy::{PlatformSystemProxy, SystemProxyController, SUPPORTS_SYSTEM_PROXY};

/// Probe timeout used by [`ProxyServer::start_for_check`].
const CHECK_TIMEOUT: Duration = Duration::from_millis(100);

/// Probe timeout used by [`ProxyServer::retry_bind`].
const RETRY_TIMEOUT: Duration = Duration::from_millis(350);

/// Handle to a listening server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHandle {
    addr: SocketAddr,
}

impl ServerHandle {
    /// Address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port (the ephemeral one when configured with port 0).
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// Snapshot of the server state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyServerState {
    /// True while the accept loop runs.
    pub listening: bool,
    /// Bound port while listening.
    pub bound_port: Option<u16>,
    /// Whether TLS traffic is intercepted.
    pub tls_interception_enabled: bool,
    /// Whether the OS proxy currently points at this server.
    pub system_proxy_enabled: bool,
    /// Configured external proxy.
    pub external_proxy: Option<ExternalProxy>,
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The intercepting proxy server.
pub struct ProxyServer {
    config: Arc<RwLock<ProxyConfig>>,
    ca: Arc<CaManager>,
    listeners: Arc<EventFanout>,
    rewriter: Arc<dyn Rewriter>,
    system_proxy: Arc<dyn SystemProxyController>,
    system_proxy_enabled: AtomicBool,
    running: Mutex<Option<RunningServer>>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &*self.config.read())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    /// Creates a stopped server. The CA lives in `config.ca_dir`, or the
    /// platform data directory when unset.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let ca = match &config.ca_dir {
            Some(dir) => CaManager::new(dir),
            None => CaManager::with_default_dir()?,
        };

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            ca: Arc::new(ca),
            listeners: Arc::new(EventFanout::new()),
            rewriter: Arc::new(NoRewrite),
            system_proxy: Arc::new(PlatformSystemProxy),
            system_proxy_enabled: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }

    /// Sets the rewriter consulted for every request, response and frame.
    pub fn with_rewriter(mut self, rewriter: Arc<dyn Rewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Sets the OS proxy controller.
    pub fn with_system_proxy_controller(
        mut self,
        controller: Arc<dyn SystemProxyController>,
    ) -> Self {
        self.system_proxy = controller;
        self
    }

    /// Registers an observer. Valid before or after `start`.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.add(listener);
    }

    /// The certificate manager.
    pub fn ca(&self) -> Arc<CaManager> {
        self.ca.clone()
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> ProxyConfig {
        self.config.read().clone()
    }

    /// Mutates the configuration. Connections accepted afterwards see the
    /// change; the upstream TLS verification mode applies from the next start.
    pub fn update_config(&self, update: impl FnOnce(&mut ProxyConfig)) {
        update(&mut self.config.write());
    }

    /// Binds the listening socket and starts accepting connections.
    ///
    /// Returns the current handle if the server is already listening.
    pub async fn start(&self) -> Result<ServerHandle> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            return Ok(ServerHandle { addr: server.addr });
        }

        let config = self.config();
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: bind_addr,
                source,
            })?;
        let addr = listener.local_addr()?;

        let ca = self.ca.clone();
        match tokio::task::spawn_blocking(move || ca.ensure_ca()).await {
            Ok(Ok(())) => tracing::debug!("CA certificate: {:?}", self.ca.cert_path()),
            Ok(Err(e)) => tracing::error!("CA unavailable, TLS interception will fail: {}", e),
            Err(e) => tracing::error!("CA initialisation task failed: {}", e),
        }

        let connector = UpstreamConnector::new(config.accept_invalid_upstream_certs)?;
        let services = PipelineServices {
            ca: self.ca.clone(),
            handler: HandlerStage::new(self.listeners.clone(), self.rewriter.clone(), connector),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            self.config.clone(),
            services,
            shutdown_rx,
        ));
        *running = Some(RunningServer {
            addr,
            shutdown,
            task,
        });
        tracing::info!("Proxy listening on {}", addr);

        if config.enable_system_proxy {
            if let Err(e) = self.apply_system_proxy(true, addr.port(), &config).await {
                tracing::warn!("Failed to set system proxy: {}", e);
            }
        }

        Ok(ServerHandle { addr })
    }

    /// Stops accepting connections. Connections already accepted finish on
    /// their own. Does nothing when the server is not running.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(server) = running.take() else {
            return Ok(());
        };

        if self.system_proxy_enabled.load(Ordering::SeqCst) {
            let config = self.config();
            if let Err(e) = self
                .apply_system_proxy(false, server.addr.port(), &config)
                .await
            {
                tracing::warn!("Failed to restore system proxy: {}", e);
            }
        }

        let _ = server.shutdown.send(true);
        if !server.task.is_finished() {
            let _ = server.task.await;
        }
        tracing::info!("Proxy on {} stopped", server.addr);
        Ok(())
    }

    /// Stops then starts the server. A failed start leaves it stopped.
    pub async fn restart(&self) -> Result<ServerHandle> {
        self.stop().await?;
        self.start().await
    }

    /// Starts the server unless something already answers on the port.
    ///
    /// Returns `false` without binding when the port is taken.
    pub async fn start_for_check(&self) -> Result<bool> {
        if port_answers(self.check_port().await, CHECK_TIMEOUT).await {
            return Ok(false);
        }
        self.start().await?;
        Ok(true)
    }

    /// Restarts the server if its port no longer answers. Returns `true`
    /// when a restart was performed.
    pub async fn retry_bind(&self) -> Result<bool> {
        let port = self.check_port().await;
        if port_answers(port, RETRY_TIMEOUT).await {
            return Ok(false);
        }
        tracing::info!("Port {} unreachable, rebinding", port);
        self.restart().await?;
        Ok(true)
    }

    /// Points the OS proxy at this server, or releases it (back to the
    /// external proxy when one is enabled). No-op on unsupported platforms.
    pub async fn set_system_proxy_enable(&self, enable: bool) -> Result<()> {
        if !SUPPORTS_SYSTEM_PROXY {
            tracing::debug!("System proxy not supported on this platform");
            return Ok(());
        }
        let port = self.check_port().await;
        let config = self.config();
        self.apply_system_proxy(enable, port, &config).await?;
        self.config.write().enable_system_proxy = enable;
        Ok(())
    }

    async fn apply_system_proxy(&self, enable: bool, port: u16, config: &ProxyConfig) -> Result<()> {
        let tls = config.enable_ssl;
        let domains = &config.proxy_pass_domains;
        if enable {
            self.system_proxy
                .set_system_proxy_enable(port, true, tls, domains)
                .await?;
        } else if let Some(external) = config.active_external_proxy() {
            self.system_proxy
                .set_system_proxy(&external.host, external.port, tls, domains)
                .await?;
        } else {
            self.system_proxy
                .set_system_proxy_enable(port, false, tls, domains)
                .await?;
        }
        self.system_proxy_enabled.store(enable, Ordering::SeqCst);
        Ok(())
    }

    /// True while the server is listening.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bound address while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|s| s.addr)
    }

    /// Snapshot of the server state.
    pub async fn state(&self) -> ProxyServerState {
        let bound_port = self.local_addr().await.map(|a| a.port());
        let config = self.config.read();
        ProxyServerState {
            listening: bound_port.is_some(),
            bound_port,
            tls_interception_enabled: config.enable_ssl,
            system_proxy_enabled: self.system_proxy_enabled.load(Ordering::SeqCst),
            external_proxy: config.external_proxy.clone(),
        }
    }

    async fn check_port(&self) -> u16 {
        match self.local_addr().await {
            Some(addr) => addr.port(),
            None => self.config.read().port,
        }
    }

    /// Kills the accept loop without going through `stop`.
    #[cfg(test)]
    async fn kill_listener(&self) {
        if let Some(server) = self.running.lock().await.as_mut() {
            server.task.abort();
            let _ = (&mut server.task).await;
        }
    }
}

async fn port_answers(port: u16, timeout: Duration) -> bool {
    if port == 0 {
        return false;
    }
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<RwLock<ProxyConfig>>,
    services: PipelineServices,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let snapshot = Arc::new(config.read().clone());
                    let pipeline = Pipeline::new(ConnectionInfo::new(peer), snapshot, services.clone());
                    tokio::spawn(pipeline.run(stream));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        read_message, spawn_http_origin, FailingListener, MockSystemProxy, PanickingListener,
        ProxyCall, RecordingListener,
    };
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn server(config: ProxyConfig) -> (ProxyServer, Arc<MockSystemProxy>, TempDir) {
        let ca_dir = TempDir::new().unwrap();
        let mock = Arc::new(MockSystemProxy::default());
        let server = ProxyServer::new(config.with_port(0).with_ca_dir(ca_dir.path()))
            .unwrap()
            .with_system_proxy_controller(mock.clone());
        (server, mock, ca_dir)
    }

    #[tokio::test]
    async fn start_listens_and_is_idempotent() {
        let (server, _mock, _dir) = server(ProxyConfig::new());
        assert!(!server.is_running().await);

        let handle = server.start().await.unwrap();
        assert_ne!(handle.port(), 0);
        assert!(server.is_running().await);
        assert!(server.ca().ca_exists());

        let again = server.start().await.unwrap();
        assert_eq!(again, handle);

        let state = server.state().await;
        assert!(state.listening);
        assert_eq!(state.bound_port, Some(handle.port()));
        assert!(state.tls_interception_enabled);

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
        assert!(!server.state().await.listening);
    }

    #[tokio::test]
    async fn bind_failure_leaves_server_stopped() {
        let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let (server, _mock, _dir) = server(ProxyConfig::new());
        server.update_config(|c| c.port = port);

        assert!(matches!(server.start().await, Err(ProxyError::Bind { .. })));
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn stop_when_not_running_leaves_os_proxy_alone() {
        let (server, mock, _dir) = server(ProxyConfig::new().with_system_proxy(true));
        server.stop().await.unwrap();
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn start_for_check_does_not_rebind_a_live_port() {
        let (first, _mock, _dir) = server(ProxyConfig::new());
        let handle = first.start().await.unwrap();
        assert!(!first.start_for_check().await.unwrap());

        let (second, _mock2, _dir2) = server(ProxyConfig::new());
        second.update_config(|c| c.port = handle.port());
        assert!(!second.start_for_check().await.unwrap());
        assert!(!second.is_running().await);

        let (third, _mock3, _dir3) = server(ProxyConfig::new());
        assert!(third.start_for_check().await.unwrap());
        assert!(third.is_running().await);
    }

    #[tokio::test]
    async fn retry_bind_restarts_a_dead_listener_once() {
        let (server, mock, _dir) = server(ProxyConfig::new().with_system_proxy(true));
        server.start().await.unwrap();
        assert!(!server.retry_bind().await.unwrap());

        server.kill_listener().await;
        assert!(server.retry_bind().await.unwrap());
        assert!(server.is_running().await);
        assert_eq!(mock.enable_flags(), vec![true, false, true]);
    }

    #[tokio::test]
    async fn stop_restores_external_proxy() {
        let config = ProxyConfig::new()
            .with_system_proxy(true)
            .with_external_proxy(ExternalProxy::new("corp.proxy", 3128));
        let (server, mock, _dir) = server(config);
        let handle = server.start().await.unwrap();
        assert!(server.state().await.system_proxy_enabled);

        server.stop().await.unwrap();
        assert_eq!(
            mock.calls(),
            vec![
                ProxyCall::Enable {
                    port: handle.port(),
                    enable: true
                },
                ProxyCall::Set {
                    host: "corp.proxy".into(),
                    port: 3128
                },
            ]
        );
        assert!(!server.state().await.system_proxy_enabled);
    }

    #[tokio::test]
    async fn toggling_system_proxy_updates_state_and_config() {
        let (server, mock, _dir) = server(ProxyConfig::new());
        let handle = server.start().await.unwrap();

        server.set_system_proxy_enable(true).await.unwrap();
        assert!(server.state().await.system_proxy_enabled);
        assert!(server.config().enable_system_proxy);

        server.set_system_proxy_enable(false).await.unwrap();
        assert!(!server.state().await.system_proxy_enabled);
        assert!(!server.config().enable_system_proxy);
        assert_eq!(
            mock.calls(),
            vec![
                ProxyCall::Enable {
                    port: handle.port(),
                    enable: true
                },
                ProxyCall::Enable {
                    port: handle.port(),
                    enable: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn listener_added_after_start_sees_traffic() {
        const RESPONSE: &[u8] = b"HTTP/1.1 204 No Content\r\n\r\n";
        let (origin, _heads) = spawn_http_origin(RESPONSE).await;
        let (server, _mock, _dir) = server(ProxyConfig::new());
        let handle = server.start().await.unwrap();

        let recorder = Arc::new(RecordingListener::default());
        server.add_listener(recorder.clone());

        let mut client = TcpStream::connect(("127.0.0.1", handle.port())).await.unwrap();
        let request = format!("GET http://{origin}/ping HTTP/1.1\r\nHost: {origin}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        assert_eq!(read_message(&mut client).await, RESPONSE);

        assert_eq!(recorder.requests().len(), 1);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failing_observers_do_not_block_traffic() {
        const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let (origin, mut requests) = spawn_http_origin(RESPONSE).await;
        let (server, _mock, _dir) = server(ProxyConfig::new());
        let recorder = Arc::new(RecordingListener::default());
        server.add_listener(Arc::new(FailingListener));
        server.add_listener(Arc::new(PanickingListener));
        server.add_listener(recorder.clone());
        let handle = server.start().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", handle.port())).await.unwrap();
        for _ in 0..2 {
            let request = format!("GET /ping HTTP/1.1\r\nHost: {origin}\r\n\r\n");
            client.write_all(request.as_bytes()).await.unwrap();
            assert_eq!(read_message(&mut client).await, RESPONSE);
            assert!(requests.recv().await.unwrap().starts_with("GET /ping HTTP/1.1\r\n"));
        }

        assert_eq!(recorder.requests().len(), 2);
        assert_eq!(recorder.events().len(), 4);
        server.stop().await.unwrap();
    }
}
