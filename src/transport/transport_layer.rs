use super::{
    connection::TransportSender,
    sip_addr::SipAddr,
    tcp::TcpConnection,
    tls::{PeerPolicy, TlsConfig, TlsConnection},
    SipConnection, TransportEvent,
};
use crate::{Error, Result};
use rsip::{transport::Transport, SipMessage};
use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound on waiting for another task to finish establishing a connection to
/// the same destination.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Send attempts per message before the destination is reported unreachable.
pub const DEFAULT_SEND_ATTEMPTS: usize = 2;

#[derive(Clone, Default)]
pub struct TransportLayerOption {
    pub connect_timeout: Option<Duration>,
    pub send_attempts: Option<usize>,
    pub tls: Option<TlsConfig>,
    pub peer_policy: Option<Arc<dyn PeerPolicy>>,
}

pub struct TransportLayerInner {
    cancel_token: CancellationToken,
    option: TransportLayerOption,
    /// Local sockets and listeners, keyed by their bound address.
    listens: RwLock<HashMap<SipAddr, SipConnection>>,
    /// Established outbound/accepted connections, keyed by remote address.
    connections: RwLock<HashMap<SipAddr, SipConnection>>,
    /// Per-destination guards so concurrent sends to a new destination
    /// produce exactly one connection attempt.
    connect_locks: Mutex<HashMap<SipAddr, Arc<Semaphore>>>,
    sender: RwLock<Option<TransportSender>>,
}

pub type TransportLayerRef = Arc<TransportLayerInner>;

/// Owns every socket and connection of an endpoint.
///
/// Reliable connections are cached by destination and shared between
/// transactions; UDP traffic is multiplexed over the listen sockets.
#[derive(Clone)]
pub struct TransportLayer {
    pub inner: TransportLayerRef,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self::with_option(cancel_token, TransportLayerOption::default())
    }

    pub fn with_option(cancel_token: CancellationToken, option: TransportLayerOption) -> Self {
        let inner = TransportLayerInner {
            cancel_token,
            option,
            listens: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
            sender: RwLock::new(None),
        };
        TransportLayer {
            inner: Arc::new(inner),
        }
    }

    pub async fn add_transport(&self, connection: SipConnection) {
        self.inner.add_transport(connection).await
    }

    pub async fn del_transport(&self, addr: &SipAddr) {
        self.inner.listens.write().await.remove(addr);
    }

    pub async fn add_connection(&self, connection: SipConnection) {
        self.inner.add_connection(connection).await
    }

    pub async fn del_connection(&self, addr: &SipAddr) {
        self.inner.del_connection(addr).await
    }

    /// Resolve a destination to a usable connection, dialing when needed.
    pub async fn lookup(&self, target: &SipAddr) -> Result<SipConnection> {
        self.inner.lookup(target).await
    }

    /// Send with bounded retry. A stale cached connection is evicted after a
    /// send failure and the dial is attempted once more before giving up.
    pub async fn send_message(
        &self,
        msg: SipMessage,
        destination: Option<&SipAddr>,
    ) -> Result<SipConnection> {
        self.inner.send_message(msg, destination).await
    }

    pub async fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner
            .listens
            .read()
            .await
            .keys()
            .cloned()
            .collect()
    }

    /// First listen address matching `transport`, used to fill in Via and
    /// Contact on outbound requests.
    pub async fn get_addr(&self, transport: Option<Transport>) -> Option<SipAddr> {
        let listens = self.inner.listens.read().await;
        match transport {
            Some(t) => listens
                .keys()
                .find(|addr| addr.r#type == Some(t))
                .cloned(),
            None => listens.keys().next().cloned(),
        }
    }

    pub async fn serve_listens(&self, sender: TransportSender) -> Result<()> {
        self.inner.sender.write().await.replace(sender.clone());
        let listens = self.inner.listens.read().await;
        for (addr, connection) in listens.iter() {
            debug!("serving transport: {}", addr);
            self.inner
                .spawn_serve_loop(connection.clone(), sender.clone());
        }
        Ok(())
    }
}

impl TransportLayerInner {
    async fn add_transport(self: &Arc<Self>, connection: SipConnection) {
        let addr = connection.get_addr().clone();
        info!("added transport: {}", addr);
        self.listens.write().await.insert(addr, connection.clone());
        if let Some(sender) = self.sender.read().await.clone() {
            self.spawn_serve_loop(connection, sender);
        }
    }

    async fn add_connection(self: &Arc<Self>, connection: SipConnection) {
        let addr = connection.get_addr().clone();
        info!("added connection: {}", addr);
        self.connections
            .write()
            .await
            .insert(addr, connection.clone());
        if let Some(sender) = self.sender.read().await.clone() {
            self.spawn_serve_loop(connection, sender);
        }
    }

    async fn del_connection(&self, addr: &SipAddr) {
        let connection = self.connections.write().await.remove(addr);
        self.connect_locks.lock().await.remove(addr);
        if let Some(connection) = connection {
            info!("removed connection: {}", addr);
            connection.close().await.ok();
        }
    }

    fn spawn_serve_loop(self: &Arc<Self>, connection: SipConnection, sender: TransportSender) {
        let inner = self.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            let addr = connection.get_addr().clone();
            tokio::select! {
                _ = cancel_token.cancelled() => {}
                result = connection.serve_loop(sender.clone()) => {
                    if let Err(e) = result {
                        warn!("serve_loop error: {} {}", addr, e);
                    }
                }
            }
            inner.connections.write().await.remove(&addr);
            inner.connect_locks.lock().await.remove(&addr);
            sender.send(TransportEvent::Closed(connection)).ok();
        });
    }

    async fn lookup(self: &Arc<Self>, target: &SipAddr) -> Result<SipConnection> {
        let transport = target.r#type.unwrap_or(Transport::Udp);

        if !target.is_reliable() {
            let listens = self.listens.read().await;
            return listens
                .iter()
                .find(|(addr, _)| addr.r#type == Some(Transport::Udp))
                .map(|(_, connection)| connection.clone())
                .ok_or_else(|| {
                    Error::TransportLayerError(
                        "no UDP socket available".to_string(),
                        target.clone(),
                    )
                });
        }

        if let Some(connection) = self.connections.read().await.get(target) {
            return Ok(connection.clone());
        }

        // one dialer per destination; late arrivals wait here and then hit
        // the cache populated by the winner
        let guard = {
            let mut locks = self.connect_locks.lock().await;
            locks
                .entry(target.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        let connect_timeout = self
            .option
            .connect_timeout
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let _permit = tokio::time::timeout(connect_timeout, guard.acquire())
            .await
            .map_err(|_| {
                Error::TransportFailure(
                    "timeout waiting for connection".to_string(),
                    target.clone(),
                )
            })?
            .map_err(|_| {
                Error::TransportFailure("connection guard closed".to_string(), target.clone())
            })?;

        if let Some(connection) = self.connections.read().await.get(target) {
            return Ok(connection.clone());
        }

        let connection: SipConnection = match transport {
            Transport::Tcp => TcpConnection::connect(target).await?.into(),
            Transport::Tls => {
                let config = self.option.tls.clone().unwrap_or_default();
                TlsConnection::connect(target, &config, self.option.peer_policy.clone())
                    .await?
                    .into()
            }
            _ => {
                return Err(Error::TransportLayerError(
                    format!("unsupported transport: {}", transport),
                    target.clone(),
                ))
            }
        };
        self.add_connection(connection.clone()).await;
        Ok(connection)
    }

    async fn send_message(
        self: &Arc<Self>,
        msg: SipMessage,
        destination: Option<&SipAddr>,
    ) -> Result<SipConnection> {
        let target = match destination {
            Some(addr) => addr.clone(),
            None => SipConnection::get_destination(&msg)?,
        };

        let attempts = self.option.send_attempts.unwrap_or(DEFAULT_SEND_ATTEMPTS);
        let mut last_err = None;
        for attempt in 0..attempts.max(1) {
            let connection = match self.lookup(&target).await {
                Ok(connection) => connection,
                // dial and policy failures are final, only stale sends retry
                Err(e) => return Err(e),
            };
            match connection.send(msg.clone(), Some(&target)).await {
                Ok(()) => return Ok(connection),
                Err(e) => {
                    warn!(
                        "send attempt {} to {} failed: {}",
                        attempt + 1,
                        target,
                        e
                    );
                    self.del_connection(connection.get_addr()).await;
                    last_err = Some(e);
                }
            }
        }
        Err(Error::TransportFailure(
            format!(
                "unreachable after {} attempts: {}",
                attempts.max(1),
                last_err.map(|e| e.to_string()).unwrap_or_default()
            ),
            target,
        ))
    }
}
