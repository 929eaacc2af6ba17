//! The tokio shell around [`NodeCore`].
//!
//! One reactor task owns the core and consumes a single event queue fed by
//! connection tasks, the miner bridge, and the verification pool. Each
//! connection runs the proto handshake itself and only registers with the
//! core once `Active`; after that the reader forwards decoded messages and
//! the writer drains per-peer queues, reporting flushed bytes back for
//! backpressure accounting.
//!
//! Wire format: before the secure channel is established, frames travel as
//! plain protocol frames (tag, varint length, payload). Once the session
//! key exists, every frame is sealed and shipped behind a varint
//! ciphertext-length prefix.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use mist_chain::ChainProcessor;
use mist_crypto::FrameCipher;
use mist_miner::{MinerConfig, MinerDriver, MinerEvent};
use mist_network::PeerStore;
use mist_proto::messages::{Login, NodeMsg};
use mist_proto::{codec, decode_frame, encode_frame, login_flags, Handshake, IdType, ProtoError};
use mist_types::{ContextHash, KeyPair, NodeId, Transaction};

use crate::config::NodeConfig;
use crate::core::{NodeCore, Outbound, PeerToken};
use crate::error::NodeError;
use crate::validate::TxValidator;
use crate::worker::{resolve_verification_threads, ValidationPool};

/// Event queue depth.
const EVENT_QUEUE: usize = 4096;

/// Per-peer outbound queue depth.
const WRITE_QUEUE: usize = 1024;

/// Handshake must complete within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle read timeout; peers ping well within it.
const READ_TIMEOUT: Duration = Duration::from_secs(90);

enum Event {
    Connected {
        addr: SocketAddr,
        node_id: NodeId,
        login: Login,
        id_type: IdType,
        accepted_inbound: bool,
        write_tx: mpsc::Sender<NodeMsg>,
        token_tx: oneshot::Sender<PeerToken>,
    },
    Msg {
        tok: PeerToken,
        msg: NodeMsg,
    },
    Validated {
        tok: PeerToken,
        msg: NodeMsg,
        ok: bool,
    },
    Disconnected {
        tok: PeerToken,
    },
    Drained {
        tok: PeerToken,
        bytes: usize,
    },
    DialFailed {
        addr: SocketAddr,
    },
    Miner(MinerEvent),
    SubmitTx {
        tx: Transaction,
        context: Option<ContextHash>,
        fluff: bool,
    },
}

/// Handle for submitting work to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    events: mpsc::Sender<Event>,
}

impl NodeHandle {
    pub async fn submit_tx(
        &self,
        tx: Transaction,
        context: Option<ContextHash>,
        fluff: bool,
    ) -> Result<(), NodeError> {
        self.events
            .send(Event::SubmitTx { tx, context, fluff })
            .await
            .map_err(|_| NodeError::ShutdownTimeout)
    }
}

pub struct Node {
    core: NodeCore,
    identity: Arc<KeyPair>,
    login: Login,
    pool: ValidationPool,
    miner_rx: Option<std::sync::mpsc::Receiver<MinerEvent>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: Option<mpsc::Receiver<Event>>,
}

impl Node {
    /// Wire the shell around a constructed core. `miner_rx` is the solved
    /// channel the core's driver posts to; `pool` carries the verification
    /// threads resolved from config.
    pub fn new(
        core: NodeCore,
        identity: Arc<KeyPair>,
        login: Login,
        pool: ValidationPool,
        miner_rx: std::sync::mpsc::Receiver<MinerEvent>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel::<Event>(EVENT_QUEUE);
        Self {
            core,
            identity,
            login,
            pool,
            miner_rx: Some(miner_rx),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Build the full stack from configuration: miner driver, verification
    /// pool, and the reactor core, with the standard capability flags.
    pub fn from_config(
        cfg: NodeConfig,
        processor: Box<dyn ChainProcessor>,
        validator: Box<dyn TxValidator>,
        peer_store: Box<dyn PeerStore + Send>,
        identity: Arc<KeyPair>,
    ) -> Self {
        let (miner_tx, miner_rx) = std::sync::mpsc::channel();
        let miner = MinerDriver::new(
            MinerConfig {
                threads: cfg.mining_threads,
                soft_restart_ms: cfg.timeout.mining_soft_restart_ms,
                fake_pow_solve_time_ms: (cfg.test_mode.fake_pow_solve_time_ms > 0)
                    .then_some(cfg.test_mode.fake_pow_solve_time_ms),
            },
            None,
            miner_tx,
        );
        let pool = ValidationPool::new(resolve_verification_threads(
            cfg.verification_threads,
            cfg.mining_threads,
        ));
        let mut flags = login_flags::SPREADING_TRANSACTIONS
            | login_flags::SEND_PEERS
            | login_flags::DEPENDENT_CONTEXT;
        if cfg.bbs.limit_count > 0 {
            flags |= login_flags::BBS;
        }
        let login = Login {
            flags,
            min_fork_height: 0,
        };
        let core = NodeCore::new(cfg, processor, validator, peer_store, miner);
        Self::new(core, identity, login, pool, miner_rx)
    }

    /// Submission handle, usable from any task while the node runs.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            events: self.events_tx.clone(),
        }
    }

    /// Run until `shutdown` fires. Consumes the node.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), NodeError> {
        let listener = TcpListener::bind(self.core.cfg.listen).await?;
        tracing::info!(listen = %self.core.cfg.listen, "node listening");

        let events_tx = self.events_tx.clone();
        let mut events_rx = self.events_rx.take().expect("run called once");

        // Accept loop.
        {
            let events_tx = events_tx.clone();
            let identity = Arc::clone(&self.identity);
            let login = self.login.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            spawn_connection(stream, addr, false, Arc::clone(&identity),
                                login.clone(), events_tx.clone());
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            });
        }

        // Miner bridge: forward solved blocks onto the event queue.
        if let Some(miner_rx) = self.miner_rx.take() {
            let events_tx = events_tx.clone();
            std::thread::Builder::new()
                .name("mist-miner-bridge".into())
                .spawn(move || {
                    while let Ok(ev) = miner_rx.recv() {
                        if events_tx.blocking_send(Event::Miner(ev)).is_err() {
                            return;
                        }
                    }
                })
                .expect("spawn miner bridge");
        }

        let mut writers: std::collections::HashMap<PeerToken, mpsc::Sender<NodeMsg>> =
            std::collections::HashMap::new();
        let start = Instant::now();
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let now_ms = move || epoch_ms + start.elapsed().as_millis() as u64;

        self.core.on_timer(now_ms());
        self.drain_outbound(&mut writers, &events_tx);

        loop {
            let wake_at = self.core.next_wakeup_ms();
            let sleep = match wake_at {
                Some(deadline) => {
                    let delta = deadline.saturating_sub(now_ms());
                    tokio::time::sleep(Duration::from_millis(delta))
                }
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            tokio::pin!(sleep);

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                _ = &mut sleep => {
                    self.core.on_timer(now_ms());
                }
                maybe = events_rx.recv() => {
                    let Some(event) = maybe else { break };
                    self.handle_event(event, &mut writers, &events_tx, now_ms());
                }
            }
            self.drain_outbound(&mut writers, &events_tx);
        }

        self.core.miner.hard_abort_safe();
        self.pool.shutdown();
        // Final address-book flush.
        let now = now_ms();
        if let Err(e) = self
            .core
            .peer_mgr
            .flush(self.core.peer_store.as_mut(), now)
        {
            tracing::warn!(error = %e, "final peer store flush failed");
        }
        Ok(())
    }

    fn handle_event(
        &mut self,
        event: Event,
        writers: &mut std::collections::HashMap<PeerToken, mpsc::Sender<NodeMsg>>,
        events_tx: &mpsc::Sender<Event>,
        now: u64,
    ) {
        match event {
            Event::Connected {
                addr,
                node_id,
                login,
                id_type,
                accepted_inbound,
                write_tx,
                token_tx,
            } => {
                let tok = self.core.on_peer_connected(
                    addr,
                    node_id,
                    &login,
                    id_type,
                    accepted_inbound,
                    now,
                );
                writers.insert(tok, write_tx);
                let _ = token_tx.send(tok);
            }
            Event::Msg { tok, msg } => {
                if self.pool.threads() > 0 && needs_heavy_validation(&msg) {
                    let events_tx = events_tx.clone();
                    self.pool.submit(move || {
                        let ok = prevalidate(&msg);
                        let _ = events_tx.blocking_send(Event::Validated { tok, msg, ok });
                    });
                } else {
                    self.core.on_peer_msg(tok, msg, now);
                }
            }
            Event::Validated { tok, msg, ok } => {
                if ok {
                    self.core.on_peer_msg(tok, msg, now);
                } else {
                    self.core
                        .disconnect(tok, mist_proto::ByeReason::BadData, true, now);
                }
            }
            Event::Disconnected { tok } => {
                writers.remove(&tok);
                self.core.on_peer_disconnected(tok, now);
            }
            Event::Drained { tok, bytes } => self.core.on_peer_drained(tok, bytes, now),
            Event::DialFailed { addr } => self.core.on_dial_failed(addr, now),
            Event::Miner(ev) => self.core.on_miner_event(ev, now),
            Event::SubmitTx { tx, context, fluff } => {
                let verdict = self.core.on_tx_submitted(tx, context, fluff, now);
                tracing::debug!(?verdict, "local submission processed");
            }
        }
    }

    fn drain_outbound(
        &mut self,
        writers: &mut std::collections::HashMap<PeerToken, mpsc::Sender<NodeMsg>>,
        events_tx: &mpsc::Sender<Event>,
    ) {
        for directive in self.core.take_outbound() {
            match directive {
                Outbound::Send { to, msg } => {
                    if let Some(writer) = writers.get(&to) {
                        if writer.try_send(msg).is_err() {
                            tracing::debug!(peer = to, "write queue full, dropping frame");
                        }
                    }
                }
                Outbound::Disconnect { to, .. } => {
                    // Dropping the writer closes the socket; the reader
                    // observes EOF and reports Disconnected.
                    writers.remove(&to);
                }
                Outbound::Dial { addr } => {
                    let events_tx = events_tx.clone();
                    let identity = Arc::clone(&self.identity);
                    let login = self.login.clone();
                    tokio::spawn(async move {
                        match TcpStream::connect(addr).await {
                            Ok(stream) => {
                                spawn_connection(stream, addr, true, identity, login, events_tx);
                            }
                            Err(e) => {
                                tracing::debug!(peer = %addr, error = %e, "dial failed");
                                let _ = events_tx.send(Event::DialFailed { addr }).await;
                            }
                        }
                    });
                }
            }
        }
    }
}

/// Cheap triage on the reactor: only messages with real CPU weight take
/// the trip through the worker pool.
fn needs_heavy_validation(msg: &NodeMsg) -> bool {
    matches!(
        msg,
        NodeMsg::HdrPack(_) | NodeMsg::NewTransaction(_) | NodeMsg::BodyPack(_)
    )
}

/// Pure structural pre-validation, safe to run off the reactor.
fn prevalidate(msg: &NodeMsg) -> bool {
    match msg {
        NodeMsg::HdrPack(m) => m
            .states
            .windows(2)
            .all(|pair| pair[1].is_valid_successor_of(&pair[0])),
        NodeMsg::NewTransaction(m) => {
            let mut ids: Vec<_> = m.tx.kernels.iter().map(|k| k.id).collect();
            let before = ids.len();
            ids.sort();
            ids.dedup();
            before > 0 && ids.len() == before
        }
        NodeMsg::BodyPack(m) => !m.bodies.is_empty(),
        _ => true,
    }
}

fn spawn_connection(
    stream: TcpStream,
    addr: SocketAddr,
    initiator: bool,
    identity: Arc<KeyPair>,
    login: Login,
    events_tx: mpsc::Sender<Event>,
) {
    tokio::spawn(async move {
        match run_connection(stream, addr, initiator, identity, login, events_tx.clone()).await {
            Ok(()) => tracing::debug!(peer = %addr, "connection closed"),
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, "connection failed");
                if initiator {
                    let _ = events_tx.send(Event::DialFailed { addr }).await;
                }
            }
        }
    });
}

async fn run_connection(
    stream: TcpStream,
    addr: SocketAddr,
    initiator: bool,
    identity: Arc<KeyPair>,
    login: Login,
    events_tx: mpsc::Sender<Event>,
) -> Result<(), NodeError> {
    stream.set_nodelay(true).ok();
    let (mut read_half, mut write_half) = stream.into_split();

    let mut hs = Handshake::new(initiator, identity, login);
    let mut seal: Option<FrameCipher> = None;
    let mut open: Option<FrameCipher> = None;

    for msg in hs.start() {
        write_msg(&mut write_half, &mut seal, &msg).await?;
    }

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    while !hs.is_active() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let msg = tokio::time::timeout(remaining, read_msg(&mut read_half, &mut open))
            .await
            .map_err(|_| {
                NodeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "handshake timeout",
                ))
            })??;
        let replies = hs.on_msg(&msg)?;
        // The secure phase just completed: arm both cipher directions
        // before any sealed frame is produced or consumed.
        if let (Some(key), None) = (hs.session_key(), &seal) {
            seal = Some(FrameCipher::new(&key, initiator));
            open = Some(FrameCipher::new(&key, initiator));
        }
        for reply in replies {
            write_msg(&mut write_half, &mut seal, &reply).await?;
        }
    }

    let node_id = hs.remote_id().expect("active implies authenticated");
    let remote_login = hs.remote_login().expect("active implies login").clone();
    let id_type = hs.remote_id_type().expect("active implies authenticated");

    // Register with the reactor and learn our peer token.
    let (write_tx, mut write_rx) = mpsc::channel::<NodeMsg>(WRITE_QUEUE);
    let (token_tx, token_rx) = oneshot::channel();
    events_tx
        .send(Event::Connected {
            addr,
            node_id,
            login: remote_login,
            id_type,
            accepted_inbound: !initiator,
            write_tx,
            token_tx,
        })
        .await
        .map_err(|_| NodeError::ShutdownTimeout)?;
    let tok = token_rx.await.map_err(|_| NodeError::ShutdownTimeout)?;

    // Writer task: drain the queue, seal, write, report flushed bytes.
    let writer_events = events_tx.clone();
    let writer = tokio::spawn(async move {
        let mut seal = seal;
        while let Some(msg) = write_rx.recv().await {
            match write_msg(&mut write_half, &mut seal, &msg).await {
                Ok(bytes) => {
                    let _ = writer_events.send(Event::Drained { tok, bytes }).await;
                }
                Err(e) => {
                    tracing::debug!(peer = %addr, error = %e, "write failed");
                    break;
                }
            }
        }
        // Queue closed or write failed: shut the socket down.
        let _ = write_half.shutdown().await;
    });

    // Reader loop.
    let result: Result<(), NodeError> = loop {
        let msg = match tokio::time::timeout(READ_TIMEOUT, read_msg(&mut read_half, &mut open))
            .await
        {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => break Err(e),
            Err(_) => {
                break Err(NodeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "read timeout",
                )))
            }
        };
        if events_tx.send(Event::Msg { tok, msg }).await.is_err() {
            break Ok(());
        }
    };

    let _ = events_tx.send(Event::Disconnected { tok }).await;
    writer.abort();
    result
}

/// Write one message; returns the wire size. Handshake channel-setup
/// frames go clear, everything else is sealed once the cipher exists.
async fn write_msg(
    write_half: &mut OwnedWriteHalf,
    seal: &mut Option<FrameCipher>,
    msg: &NodeMsg,
) -> Result<usize, NodeError> {
    let frame = encode_frame(msg)?;
    let clear = matches!(msg, NodeMsg::SChannelInitiate(_) | NodeMsg::SChannelReady(_));
    let wire = match seal {
        Some(cipher) if !clear => {
            let sealed = cipher.seal(&frame).map_err(ProtoError::from)?;
            let mut wire = Vec::with_capacity(sealed.len() + 5);
            codec::write_varint(&mut wire, sealed.len() as u64);
            wire.extend_from_slice(&sealed);
            wire
        }
        _ => frame,
    };
    write_half.write_all(&wire).await?;
    write_half.flush().await?;
    Ok(wire.len())
}

/// Read one message, transparently opening sealed frames once the cipher
/// is armed.
async fn read_msg(
    read_half: &mut OwnedReadHalf,
    open: &mut Option<FrameCipher>,
) -> Result<NodeMsg, NodeError> {
    match open {
        Some(cipher) => {
            let len = read_wire_varint(read_half).await? as usize;
            if len > codec::MAX_FRAME_SIZE + 64 {
                return Err(ProtoError::FrameTooLarge(len).into());
            }
            let mut sealed = vec![0u8; len];
            read_half.read_exact(&mut sealed).await?;
            let frame = cipher.open(&sealed).map_err(ProtoError::from)?;
            match decode_frame(&frame)? {
                Some((msg, consumed)) if consumed == frame.len() => Ok(msg),
                _ => Err(ProtoError::Malformed("sealed frame truncated".into()).into()),
            }
        }
        None => {
            // Clear frames self-delimit: tag, varint length, payload.
            let mut head = [0u8; 1];
            read_half.read_exact(&mut head).await?;
            let mut buf = vec![head[0]];
            let len = {
                let mut value: u64 = 0;
                let mut shift = 0;
                loop {
                    let mut byte = [0u8; 1];
                    read_half.read_exact(&mut byte).await?;
                    buf.push(byte[0]);
                    value |= ((byte[0] & 0x7F) as u64) << shift;
                    if byte[0] & 0x80 == 0 {
                        break value;
                    }
                    shift += 7;
                    if shift > 28 {
                        return Err(ProtoError::BadVarint.into());
                    }
                }
            } as usize;
            if len > codec::MAX_FRAME_SIZE {
                return Err(ProtoError::FrameTooLarge(len).into());
            }
            let start = buf.len();
            buf.resize(start + len, 0);
            read_half.read_exact(&mut buf[start..]).await?;
            match decode_frame(&buf)? {
                Some((msg, consumed)) if consumed == buf.len() => Ok(msg),
                _ => Err(ProtoError::Malformed("clear frame truncated".into()).into()),
            }
        }
    }
}

async fn read_wire_varint(read_half: &mut OwnedReadHalf) -> Result<u64, NodeError> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        read_half.read_exact(&mut byte).await?;
        value |= ((byte[0] & 0x7F) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(ProtoError::BadVarint.into());
        }
    }
}
