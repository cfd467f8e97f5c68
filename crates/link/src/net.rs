//! Where connections come from.
//!
//! Servers take connections from an [`Acceptor`], clients open them through a
//! [`Connector`]. The TLS pair is the production transport; the loopback
//! network wires connections together in-process for tests and embedding.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::config::LinkConfig;
use crate::connection::Connection;
use crate::error::LinkError;
use crate::tls::{self, ClientValidation, TlsServerIdentity};

/// Source of server-side connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Wait for the next authenticated connection.
    async fn accept(&self) -> Result<Connection, LinkError>;

    /// The address clients use to reach this acceptor.
    fn endpoint(&self) -> String;
}

/// Opens client-side connections by endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Connection, LinkError>;
}

#[async_trait]
impl<T: Acceptor + ?Sized> Acceptor for Arc<T> {
    async fn accept(&self) -> Result<Connection, LinkError> {
        (**self).accept().await
    }

    fn endpoint(&self) -> String {
        (**self).endpoint()
    }
}

#[async_trait]
impl<T: Connector + ?Sized> Connector for Arc<T> {
    async fn connect(&self, endpoint: &str) -> Result<Connection, LinkError> {
        (**self).connect(endpoint).await
    }
}

// ── loopback ──────────────────────────────────────────────────────

type Listeners = Arc<Mutex<HashMap<String, mpsc::Sender<Connection>>>>;

fn listeners(map: &Listeners) -> MutexGuard<'_, HashMap<String, mpsc::Sender<Connection>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process network of named endpoints.
///
/// Connecting creates a [`Connection::loopback_pair`] and hands the server
/// half to whoever listens on the endpoint.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    listeners: Listeners,
    config: LinkConfig,
}

impl LoopbackNetwork {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            listeners: Listeners::default(),
            config,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Start listening on `endpoint`. Fails if it is already taken.
    pub fn listen(&self, endpoint: impl Into<String>) -> Result<LoopbackListener, LinkError> {
        let endpoint = endpoint.into();
        let (tx, rx) = mpsc::channel(16);
        let mut map = listeners(&self.listeners);
        if map.get(&endpoint).is_some_and(|tx| !tx.is_closed()) {
            return Err(LinkError::Config(format!("endpoint '{endpoint}' already in use")));
        }
        map.insert(endpoint.clone(), tx.clone());
        debug!(endpoint = %endpoint, "loopback listener registered");
        Ok(LoopbackListener {
            endpoint,
            registration: tx,
            incoming: tokio::sync::Mutex::new(rx),
            listeners: Arc::clone(&self.listeners),
        })
    }
}

#[async_trait]
impl Connector for LoopbackNetwork {
    async fn connect(&self, endpoint: &str) -> Result<Connection, LinkError> {
        let tx = listeners(&self.listeners)
            .get(endpoint)
            .cloned()
            .ok_or_else(|| LinkError::NoListener(endpoint.to_string()))?;
        let (server, client) = Connection::loopback_pair(self.config.clone());
        if tx.send(server).await.is_err() {
            client.disconnect().await;
            return Err(LinkError::NoListener(endpoint.to_string()));
        }
        Ok(client)
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut endpoints: Vec<_> = listeners(&self.listeners).keys().cloned().collect();
        endpoints.sort();
        f.debug_struct("LoopbackNetwork").field("endpoints", &endpoints).finish()
    }
}

/// Server end of a loopback endpoint. Unregisters itself when dropped.
pub struct LoopbackListener {
    endpoint: String,
    registration: mpsc::Sender<Connection>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    listeners: Listeners,
}

#[async_trait]
impl Acceptor for LoopbackListener {
    async fn accept(&self) -> Result<Connection, LinkError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| LinkError::NoListener(self.endpoint.clone()))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        let mut map = listeners(&self.listeners);
        // Only remove our own registration, not a newer listener's.
        if map
            .get(&self.endpoint)
            .is_some_and(|tx| tx.same_channel(&self.registration))
        {
            map.remove(&self.endpoint);
        }
    }
}

// ── TLS over TCP ──────────────────────────────────────────────────

const HANDSHAKE_QUEUE: usize = 16;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// TCP listener that authenticates every accepted stream with TLS.
///
/// Handshakes run concurrently on a background task, each bounded by
/// [`LinkConfig::handshake_timeout`], so one silent client cannot hold up
/// the others.
pub struct TlsListener {
    incoming: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    handshakes: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl TlsListener {
    #[instrument(skip(identity, config))]
    pub async fn bind(addr: &str, identity: &TlsServerIdentity, config: LinkConfig) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let acceptor = identity.acceptor()?;
        info!(addr = %local_addr, thumbprint = %identity.thumbprint(), "TLS listener bound");

        let (ready, incoming) = mpsc::channel(HANDSHAKE_QUEUE);
        let limit = config.handshake_timeout();
        let handshakes = tokio::spawn(run_handshakes(
            listener,
            move |tcp| {
                let acceptor = acceptor.clone();
                let config = config.clone();
                async move { tls::accept(tcp, &acceptor, config).await }
            },
            limit,
            ready,
        ));
        Ok(Self {
            incoming: tokio::sync::Mutex::new(incoming),
            handshakes,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Acceptor for TlsListener {
    async fn accept(&self) -> Result<Connection, LinkError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| LinkError::NoListener(self.local_addr.to_string()))
    }

    fn endpoint(&self) -> String {
        self.local_addr.to_string()
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.handshakes.abort();
    }
}

/// Accept TCP clients and run `handshake` on each, handing finished
/// connections to `ready`. Stops once `ready` has no receiver.
async fn run_handshakes<H, F>(listener: TcpListener, handshake: H, limit: Duration, ready: mpsc::Sender<Connection>)
where
    H: Fn(TcpStream) -> F,
    F: Future<Output = Result<Connection, LinkError>> + Send + 'static,
{
    let mut pending = JoinSet::new();
    loop {
        tokio::select! {
            _ = ready.closed() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    let ready = ready.clone();
                    let handshake = handshake(tcp);
                    pending.spawn(async move {
                        match tokio::time::timeout(limit, handshake).await {
                            Ok(Ok(connection)) => {
                                if let Err(unclaimed) = ready.send(connection).await {
                                    unclaimed.0.disconnect().await;
                                }
                            }
                            // One client failing its handshake must not stop the listener.
                            Ok(Err(err)) => warn!(peer = %peer, error = %err, "TLS handshake failed"),
                            Err(_) => warn!(peer = %peer, ?limit, "TLS handshake timed out"),
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "TCP accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = pending.join_next(), if !pending.is_empty() => {}
        }
    }
    debug!(in_flight = pending.len(), "handshake loop stopped");
}

/// Dials `host:port` endpoints over TLS.
#[derive(Debug, Clone, Default)]
pub struct TlsConnector {
    validation: ClientValidation,
    config: LinkConfig,
    /// Name to authenticate instead of the endpoint's host part.
    server_name: Option<String>,
}

impl TlsConnector {
    pub fn new(validation: ClientValidation, config: LinkConfig) -> Self {
        Self {
            validation,
            config,
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Connection, LinkError> {
        let host = match &self.server_name {
            Some(name) => name.as_str(),
            None => host_of(endpoint)?,
        };
        tls::connect(endpoint, host, &self.validation, self.config.clone()).await
    }
}

/// Host part of `host:port` or `[v6]:port`.
fn host_of(endpoint: &str) -> Result<&str, LinkError> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| LinkError::Config(format!("endpoint '{endpoint}' is not host:port")))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(LinkError::Config(format!("endpoint '{endpoint}' is not host:port")));
    }
    Ok(host.trim_start_matches('[').trim_end_matches(']'))
}
