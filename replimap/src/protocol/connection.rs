//! One replication session over one TCP socket.
//!
//! A session runs a reader and a writer concurrently inside a single task.
//! The reader decodes frames, enforces the handshake order and applies peer
//! records; the writer sends the handshake, drains attached channels and
//! keeps the socket warm with heartbeats. Neither holds a segment lock across
//! an await.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::stream::Stream;
use parking_lot::{Mutex, RwLock};
use replimap_types::{encode_frame, ChannelId, Frame, FrameDecoder, NodeId, RecordKind, Timestamp};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, trace, warn};

use crate::config::ClusterConfig;
use crate::error::Error;
use crate::map::MapCore;
use crate::mux::ChannelMux;

use super::outbound::{ChannelOutbound, DrainStatus};
use super::state::{ConnectionEvent, ConnectionState};

/// Control messages from the cluster to a running session.
pub(crate) enum Command {
    Attach(ChannelId, Arc<MapCore>),
    Detach(ChannelId),
}

/// What the reader hands over to the writer.
enum Inbound {
    Identified(NodeId),
    BootstrapRequest(ChannelId, Timestamp),
}

/// Identity and shared state of a session.
pub(crate) struct Session {
    pub id: u64,
    pub local: NodeId,
    pub peer_addr: SocketAddr,
    pub config: Arc<ClusterConfig>,
    pub state: Arc<Mutex<ConnectionState>>,
    settled: AtomicBool,
}

/// How a session ended.
#[derive(Debug)]
pub(crate) struct SessionEnd {
    pub reason: Error,
    /// Whether the session ever reached steady state.
    pub settled: bool,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        local: NodeId,
        peer_addr: SocketAddr,
        config: Arc<ClusterConfig>,
        state: Arc<Mutex<ConnectionState>>,
    ) -> Self {
        Self {
            id,
            local,
            peer_addr,
            config,
            state,
            settled: AtomicBool::new(false),
        }
    }

    fn transition(&self, event: ConnectionEvent) -> Result<(), Error> {
        let mut state = self.state.lock();
        let current = std::mem::replace(&mut *state, ConnectionState::Connecting);
        match current.on_event(self.local, event) {
            Ok(next) => {
                if matches!(next, ConnectionState::SteadyState { .. }) {
                    self.settled.store(true, Ordering::Relaxed);
                }
                *state = next;
                Ok(())
            }
            Err(err) => {
                *state = ConnectionState::Closed {
                    reason: err.to_string(),
                };
                Err(err)
            }
        }
    }
}

/// Runs a session until the socket fails, the peer misbehaves, the cluster
/// shuts down or the command sender is dropped.
pub(crate) async fn run(
    stream: TcpStream,
    session: Session,
    channels: Vec<(ChannelId, Arc<MapCore>)>,
    commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) -> SessionEnd {
    let reason = match serve(stream, &session, channels, commands, &mut shutdown).await {
        Ok(()) => Error::Closed,
        Err(err) => err,
    };
    // Closed is terminal, so this cannot fail.
    let _ = session.transition(ConnectionEvent::Closed(reason.to_string()));
    info!(
        connection = session.id,
        peer = %session.peer_addr,
        reason = %reason,
        "connection closed"
    );
    SessionEnd {
        reason,
        settled: session.settled.load(Ordering::Relaxed),
    }
}

async fn serve(
    stream: TcpStream,
    session: &Session,
    channels: Vec<(ChannelId, Arc<MapCore>)>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), Error> {
    stream.set_nodelay(session.config.socket.nodelay)?;
    if let Some(ttl) = session.config.socket.ttl {
        stream.set_ttl(ttl)?;
    }
    session.transition(ConnectionEvent::Established)?;

    let mut mux = ChannelMux::new();
    for (channel, map) in channels {
        mux.bind(channel, map)?;
    }
    let mux = RwLock::new(mux);

    let (read_half, write_half) = stream.into_split();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let mut sender = Writer::new(write_half, session, &mux);
    let reader = read_loop(read_half, session, &mux, inbound_tx);
    let writer = sender.run(inbound_rx, commands);

    if *shutdown.borrow() {
        return Ok(());
    }

    tokio::select! {
        result = reader => result,
        result = writer => result,
        _ = shutdown.changed() => Ok(()),
    }
}

/// Reads from `reader` until it fails, yielding complete frames.
fn frames<R>(mut reader: R, max_len: usize) -> impl Stream<Item = Result<Frame, Error>>
where
    R: AsyncRead + Unpin,
{
    async_stream::stream! {
        let mut decoder = FrameDecoder::new(max_len);
        loop {
            match decoder.decode() {
                Ok(Some(frame)) => {
                    yield Ok(frame);
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    yield Err(Error::from(err));
                    break;
                }
            }

            match reader.read_buf(decoder.buffer_mut()).await {
                Ok(0) => {
                    yield Err(Error::ConnectionLost("peer closed the connection".into()));
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    yield Err(Error::ConnectionLost(err.to_string()));
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    session: &Session,
    mux: &RwLock<ChannelMux>,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> Result<(), Error> {
    let dead_after = session.config.dead_after();
    let frames = frames(read_half, session.config.max_frame_len).timeout(dead_after);
    tokio::pin!(frames);

    let mut remote = None;
    // Channels with a record that failed to apply. Their checkpoints would
    // claim the record arrived, so none are recorded until the next session.
    let mut stalled: BTreeSet<ChannelId> = BTreeSet::new();
    loop {
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame?,
            Some(Err(_)) => {
                return Err(Error::ConnectionLost(format!(
                    "no traffic for {:?}",
                    dead_after
                )))
            }
            None => return Err(Error::ConnectionLost("frame stream ended".into())),
        };

        let kind = frame.validate()?;
        trace!(connection = session.id, ?kind, channel = frame.channel, "received frame");

        let Some(peer) = remote else {
            if kind != RecordKind::Identifier {
                return Err(Error::ProtocolViolation(format!(
                    "expected identifier, got {:?}",
                    kind
                )));
            }
            let peer = frame.origin_id();
            session.transition(ConnectionEvent::IdentifierReceived(peer))?;
            info!(connection = session.id, peer = %peer, "peer identified");
            remote = Some(peer);
            let _ = inbound.send(Inbound::Identified(peer));
            continue;
        };

        match kind {
            RecordKind::Heartbeat => {}
            RecordKind::Identifier => {
                session.transition(ConnectionEvent::IdentifierReceived(frame.origin_id()))?;
            }
            RecordKind::BootstrapTimestamp => {
                let _ = inbound.send(Inbound::BootstrapRequest(frame.channel_id(), frame.timestamp));
            }
            RecordKind::Checkpoint => {
                if frame.origin_id() != peer {
                    return Err(Error::ProtocolViolation(format!(
                        "checkpoint for node {} from node {}",
                        frame.origin_id(),
                        peer
                    )));
                }
                let channel = frame.channel_id();
                if stalled.contains(&channel) {
                    debug!(connection = session.id, channel = %channel, "ignoring checkpoint");
                    continue;
                }
                let map = mux.read().get(channel).cloned();
                if let Some(map) = map {
                    map.record_checkpoint(peer, frame.timestamp);
                }
            }
            RecordKind::Put | RecordKind::Remove => {
                let routed = mux.read().route_inbound(frame)?;
                match routed {
                    Some((channel, map, record)) => {
                        if let Err(err) = map.apply_remote(&record) {
                            warn!(
                                connection = session.id,
                                channel = %channel,
                                error = %err,
                                "failed to apply peer record, channel resyncs on reconnect"
                            );
                            stalled.insert(channel);
                        }
                    }
                    None => debug!(connection = session.id, "dropping record for unbound channel"),
                }
            }
        }
    }
}

struct Writer<'a> {
    session: &'a Session,
    mux: &'a RwLock<ChannelMux>,
    sink: BufWriter<OwnedWriteHalf>,
    buf: BytesMut,
    last_sent: Instant,
    remote: Option<NodeId>,
    /// Bootstrap timestamps the peer declared, by channel.
    requested: HashMap<ChannelId, Timestamp>,
    outbound: BTreeMap<ChannelId, ChannelOutbound>,
    changes: StreamMap<ChannelId, WatchStream<u64>>,
    dirty: BTreeSet<ChannelId>,
}

impl<'a> Writer<'a> {
    fn new(write_half: OwnedWriteHalf, session: &'a Session, mux: &'a RwLock<ChannelMux>) -> Self {
        Self {
            session,
            mux,
            sink: BufWriter::new(write_half),
            buf: BytesMut::new(),
            last_sent: Instant::now(),
            remote: None,
            requested: HashMap::new(),
            outbound: BTreeMap::new(),
            changes: StreamMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    async fn run(
        &mut self,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), Error> {
        let local = self.session.local;
        self.send(&[Frame::identifier(local)]).await?;

        let interval = self.session.config.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + interval / 2, interval / 2);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !self.dirty.is_empty() {
                self.drain_round().await?;
            }

            tokio::select! {
                Some(event) = inbound.recv() => match event {
                    Inbound::Identified(remote) => self.on_identified(remote).await?,
                    Inbound::BootstrapRequest(channel, since) => {
                        self.requested.insert(channel, since);
                        self.start_outbound(channel, since)?;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Attach(channel, map)) => self.attach(channel, map).await?,
                    Some(Command::Detach(channel)) => self.detach(channel)?,
                    None => return Ok(()),
                },
                Some((channel, _)) = self.changes.next(), if !self.changes.is_empty() => {
                    self.dirty.insert(channel);
                }
                _ = heartbeat.tick() => {
                    if self.last_sent.elapsed() >= interval / 2 {
                        trace!(connection = self.session.id, "heartbeat");
                        self.send(&[Frame::heartbeat(local)]).await?;
                    }
                }
                _ = std::future::ready(()), if !self.dirty.is_empty() => {}
            }
        }
    }

    async fn on_identified(&mut self, remote: NodeId) -> Result<(), Error> {
        self.remote = Some(remote);
        let local = self.session.local;
        let frames: Vec<Frame> = self
            .mux
            .read()
            .iter()
            .map(|(channel, map)| Frame::bootstrap(channel, map.last_known(remote), local))
            .collect();
        self.send(&frames).await
    }

    async fn attach(&mut self, channel: ChannelId, map: Arc<MapCore>) -> Result<(), Error> {
        let last_known = self.remote.map(|remote| map.last_known(remote));
        let bound = self.mux.write().bind(channel, map);
        if let Err(err) = bound {
            warn!(connection = self.session.id, error = %err, "ignoring attach");
            return Ok(());
        }
        debug!(connection = self.session.id, channel = %channel, "channel attached");

        if let Some(last_known) = last_known {
            self.send(&[Frame::bootstrap(channel, last_known, self.session.local)])
                .await?;
        }
        if let Some(since) = self.requested.get(&channel).copied() {
            self.start_outbound(channel, since)?;
        }
        Ok(())
    }

    fn detach(&mut self, channel: ChannelId) -> Result<(), Error> {
        if self.mux.write().unbind(channel).is_err() {
            return Ok(());
        }
        self.changes.remove(&channel);
        self.dirty.remove(&channel);
        debug!(connection = self.session.id, channel = %channel, "channel detached");
        match self.outbound.remove(&channel) {
            Some(outbound) if outbound.is_bootstrapping() => self
                .session
                .transition(ConnectionEvent::ChannelBootstrapped(channel)),
            _ => Ok(()),
        }
    }

    /// Starts replaying `channel` to the peer if it is bound here.
    fn start_outbound(&mut self, channel: ChannelId, since: Timestamp) -> Result<(), Error> {
        let Some(map) = self.mux.read().get(channel).cloned() else {
            debug!(
                connection = self.session.id,
                channel = %channel,
                "peer requested a channel that is not bound here"
            );
            return Ok(());
        };

        self.changes
            .insert(channel, WatchStream::from_changes(map.subscribe()));
        self.outbound
            .insert(channel, ChannelOutbound::new(channel, map, since));
        self.dirty.insert(channel);
        self.session
            .transition(ConnectionEvent::ChannelBootstrapping(channel))
    }

    /// Drains every dirty channel once, writes the frames and acknowledges
    /// them to the logs.
    async fn drain_round(&mut self) -> Result<(), Error> {
        let budget = self.session.config.drain_batch;
        let mut frames = Vec::new();
        let mut drained = Vec::new();

        for channel in std::mem::take(&mut self.dirty) {
            let Some(outbound) = self.outbound.get_mut(&channel) else {
                continue;
            };
            let was_bootstrapping = outbound.is_bootstrapping();
            if outbound.drain(budget, &mut frames)? == DrainStatus::More {
                self.dirty.insert(channel);
            }
            drained.push((channel, was_bootstrapping && !outbound.is_bootstrapping()));
        }

        self.send(&frames).await?;

        for (channel, finished) in drained {
            if let Some(outbound) = self.outbound.get_mut(&channel) {
                outbound.acknowledge()?;
            }
            if finished {
                info!(
                    connection = self.session.id,
                    channel = %channel,
                    "bootstrap finished"
                );
                self.session
                    .transition(ConnectionEvent::ChannelBootstrapped(channel))?;
            }
        }
        Ok(())
    }

    async fn send(&mut self, frames: &[Frame]) -> Result<(), Error> {
        if frames.is_empty() {
            return Ok(());
        }
        self.buf.clear();
        for frame in frames {
            encode_frame(frame, &mut self.buf)?;
        }
        let lost = |err: std::io::Error| Error::ConnectionLost(err.to_string());
        self.sink.write_all(&self.buf).await.map_err(lost)?;
        self.sink.flush().await.map_err(lost)?;
        self.last_sent = Instant::now();
        trace!(connection = self.session.id, frames = frames.len(), "sent frames");
        Ok(())
    }
}
