//! Cluster coordinator: owns the peer connections of one node and the
//! channels attached to them.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use replimap_types::{ChannelId, NodeId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, MapConfig};
use crate::error::Error;
use crate::map::{MapCore, ReplicatedMap};
use crate::mux::ChannelMux;
use crate::protocol::{self, Command, ConnectionState, Session, SessionEnd};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The replication endpoint of one node.
///
/// A cluster listens for peers, dials peers, and attaches every channel it
/// creates to every connection, current and future. Dropping it stops all
/// background tasks; [`Cluster::close`] also waits for them.
///
/// # Example
///
/// ```no_run
/// use replimap::{ChannelId, Cluster, ClusterConfig, MapConfig, NodeId};
///
/// #[tokio::main]
/// async fn main() -> Result<(), replimap::Error> {
///     let cluster = Cluster::new(ClusterConfig::new(NodeId(1)))?;
///     cluster.listen("0.0.0.0:9001").await?;
///     cluster.connect("10.0.0.2:9001")?;
///
///     let users = cluster.create_channel(ChannelId(1), MapConfig::new().with_entries(10_000))?;
///     users.put("alice", "admin")?;
///
///     cluster.close().await;
///     Ok(())
/// }
/// ```
pub struct Cluster {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<ClusterConfig>,
    registry: Mutex<Registry>,
    shutdown: watch::Sender<bool>,
    next_connection: AtomicU64,
}

#[derive(Default)]
struct Registry {
    closed: bool,
    channels: ChannelMux,
    connections: HashMap<u64, ConnectionHandle>,
    tasks: Vec<JoinHandle<()>>,
}

struct ConnectionHandle {
    peer_addr: SocketAddr,
    state: Arc<Mutex<ConnectionState>>,
    commands: mpsc::UnboundedSender<Command>,
}

/// A snapshot of one live connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub state: ConnectionState,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Result<Self, Error> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        info!(node = %config.node_id, "starting cluster");

        Ok(Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                registry: Mutex::new(Registry::default()),
                shutdown,
                next_connection: AtomicU64::new(1),
            }),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.shared.config.node_id
    }

    /// Accepts peers on `addr` and returns the bound address.
    pub async fn listen(&self, addr: impl Into<PeerAddr>) -> Result<SocketAddr, Error> {
        self.shared.ensure_open()?;
        let addr = addr.into();
        let listener = TcpListener::bind(addr.0.as_str()).await?;
        let local_addr = listener.local_addr()?;
        info!(node = %self.node_id(), addr = %local_addr, "listening");

        let shared = Arc::clone(&self.shared);
        let shutdown = self.shared.shutdown.subscribe();
        self.shared
            .track(tokio::spawn(Shared::accept(shared, listener, shutdown)));
        Ok(local_addr)
    }

    /// Dials `addr` in the background, retrying with backoff until the
    /// cluster closes.
    pub fn connect(&self, addr: impl Into<PeerAddr>) -> Result<(), Error> {
        self.shared.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shared.shutdown.subscribe();
        self.shared
            .track(tokio::spawn(Shared::dial(shared, addr.into(), shutdown)));
        Ok(())
    }

    /// Opens a map and binds it to `channel` on every connection.
    ///
    /// Connections that are already streaming other channels bootstrap the
    /// new one without disturbing them. Closing the returned map unbinds it.
    pub fn create_channel(
        &self,
        channel: impl Into<ChannelId>,
        config: MapConfig,
    ) -> Result<ReplicatedMap, Error> {
        let channel = channel.into();
        let mut registry = self.shared.registry.lock();
        if registry.closed {
            return Err(Error::Closed);
        }
        if registry.channels.get(channel).is_some() {
            return Err(Error::ChannelAlreadyBound(channel));
        }

        let map = ReplicatedMap::open(config, self.node_id())?;
        let shared = Arc::downgrade(&self.shared);
        map.core().set_release(Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                let _ = shared.unbind(channel);
            }
        }));

        registry.channels.bind(channel, Arc::clone(map.core()))?;
        for handle in registry.connections.values() {
            let _ = handle
                .commands
                .send(Command::Attach(channel, Arc::clone(map.core())));
        }
        info!(node = %self.node_id(), channel = %channel, "created channel");
        Ok(map)
    }

    /// Detaches `channel` from every connection. The map stays usable locally.
    pub fn unbind_channel(&self, channel: impl Into<ChannelId>) -> Result<(), Error> {
        self.shared.unbind(channel.into()).map(|_| ())
    }

    /// The map bound to `channel`, if any.
    pub fn channel(&self, channel: impl Into<ChannelId>) -> Option<ReplicatedMap> {
        let registry = self.shared.registry.lock();
        registry
            .channels
            .get(channel.into())
            .cloned()
            .map(ReplicatedMap::from_core)
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.shared.registry.lock().channels.channels().collect()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let registry = self.shared.registry.lock();
        let mut connections: Vec<_> = registry
            .connections
            .iter()
            .map(|(id, handle)| ConnectionInfo {
                id: *id,
                peer_addr: handle.peer_addr,
                state: handle.state.lock().clone(),
            })
            .collect();
        connections.sort_by_key(|info| info.id);
        connections
    }

    /// Tears down every connection and waits for background tasks to stop.
    /// Idempotent.
    pub async fn close(&self) {
        let tasks = {
            let mut registry = self.shared.registry.lock();
            if registry.closed {
                return;
            }
            registry.closed = true;
            registry.connections.clear();
            registry.channels.clear();
            std::mem::take(&mut registry.tasks)
        };
        self.shared.shutdown.send_replace(true);

        for result in join_all(tasks).await {
            if let Err(err) = result {
                warn!(error = %err, "cluster task failed");
            }
        }
        info!(node = %self.node_id(), "cluster closed");
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        {
            let mut registry = self.shared.registry.lock();
            registry.closed = true;
            registry.connections.clear();
        }
        self.shared.shutdown.send_replace(true);
    }
}

impl Shared {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.registry.lock().closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut registry = self.registry.lock();
        registry.tasks.retain(|task| !task.is_finished());
        registry.tasks.push(task);
    }

    fn unbind(&self, channel: ChannelId) -> Result<Arc<MapCore>, Error> {
        let mut registry = self.registry.lock();
        let map = registry.channels.unbind(channel)?;
        for handle in registry.connections.values() {
            let _ = handle.commands.send(Command::Detach(channel));
        }
        info!(node = %self.config.node_id, channel = %channel, "unbound channel");
        Ok(map)
    }

    async fn accept(shared: Arc<Shared>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        info!(node = %shared.config.node_id, peer = %peer_addr, "accepted connection");
                        let session = Arc::clone(&shared);
                        shared.track(tokio::spawn(async move {
                            session.run_session(stream, peer_addr).await;
                        }));
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn dial(shared: Arc<Shared>, addr: PeerAddr, mut shutdown: watch::Receiver<bool>) {
        let policy = shared.config.reconnect;
        let mut backoff = policy.initial_backoff;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                connected = TcpStream::connect(addr.0.as_str()) => connected,
                _ = shutdown.changed() => break,
            };

            match connected.and_then(|stream| Ok((stream.peer_addr()?, stream))) {
                Ok((peer_addr, stream)) => {
                    info!(node = %shared.config.node_id, peer = %addr, "connected");
                    let end = shared.run_session(stream, peer_addr).await;
                    if !policy.enabled || matches!(end.reason, Error::Closed) {
                        break;
                    }
                    // A peer that keeps failing the handshake is retried
                    // with growing delays, like one that refuses connects.
                    if end.settled {
                        backoff = policy.initial_backoff;
                    }
                    debug!(peer = %addr, reason = %end.reason, retry_in = ?backoff, "redialing");
                }
                Err(err) => {
                    debug!(peer = %addr, error = %err, retry_in = ?backoff, "connect failed");
                }
            }

            tokio::select! {
                _ = time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(policy.max_backoff);
        }
    }

    /// Registers a connection, runs it to completion and unregisters it.
    async fn run_session(&self, stream: TcpStream, peer_addr: SocketAddr) -> SessionEnd {
        let (id, state, channels, commands) = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return SessionEnd {
                    reason: Error::Closed,
                    settled: false,
                };
            }
            let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            let state = Arc::new(Mutex::new(ConnectionState::Connecting));
            let (tx, rx) = mpsc::unbounded_channel();
            let channels: Vec<_> = registry
                .channels
                .iter()
                .map(|(channel, map)| (channel, Arc::clone(map)))
                .collect();
            registry.connections.insert(
                id,
                ConnectionHandle {
                    peer_addr,
                    state: Arc::clone(&state),
                    commands: tx,
                },
            );
            (id, state, channels, rx)
        };

        let session = Session::new(
            id,
            self.config.node_id,
            peer_addr,
            Arc::clone(&self.config),
            state,
        );
        let end = protocol::run(stream, session, channels, commands, self.shutdown.subscribe()).await;

        self.registry.lock().connections.remove(&id);
        end
    }
}

/// Address of a peer or of a local listener.
#[derive(Clone, Debug)]
pub struct PeerAddr(pub String);

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerAddr {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerAddr {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}
