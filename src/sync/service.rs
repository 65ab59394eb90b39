//! Distributed reconciliation service.
//!
//! Two plain background threads per instance: a nonblocking-accept TCP
//! listener for incoming frames, and a send loop that re-evaluates
//! every peer's state each pass (peer counts are small). All socket
//! operations carry explicit timeouts so a closing instance can never
//! hang; shutdown latency is bounded by the poll interval.
//!
//! A failed send never raises: the undelivered delta joins the peer's
//! stash and rides along with the next attempt. A peer silent past the
//! resync threshold gets a full snapshot instead, which supersedes the
//! stash entirely.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::decider::{env_parse, Decider, DeciderSubscriber};
use crate::error::{CepError, Result};
use crate::logging::{self, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use crate::queue::BoundedQueue;
use crate::run::{DeltaBatch, RunRecord};
use crate::sync::frame::{frame_complete, Frame, FrameCipher, MsgType, FLAG_FORCE_RESYNC};
use crate::sync::peer::{PeerConfig, PeerState, SendPlan};
use crate::tasks::Service;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub bind_addr: String,
    /// This instance's identity in outgoing frames.
    pub urn: String,
    /// Shared-secret token peers check against their allow-list.
    pub id_key: String,
    /// Encryption secret; the AEAD key is its SHA-256.
    pub secret: String,
    /// Explicit 64-hex-char key, overriding `secret` when set.
    pub key_hex: Option<String>,
    pub peers: Vec<PeerConfig>,
    pub ping_ms: u64,
    pub resync_ms: u64,
    pub io_timeout_ms: u64,
    /// Sleep between send passes and accept polls; bounds shutdown
    /// latency.
    pub poll_ms: u64,
    pub max_queue: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7400".to_string(),
            urn: "urn:cep:node".to_string(),
            id_key: "change-me".to_string(),
            secret: "change-me".to_string(),
            key_hex: None,
            peers: Vec::new(),
            ping_ms: 5_000,
            resync_ms: 60_000,
            io_timeout_ms: 2_000,
            poll_ms: 100,
            max_queue: 256,
        }
    }
}

impl SyncConfig {
    /// Peers come as `CEP_PEERS="urn|addr|id_key,urn|addr|id_key"`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let peers = std::env::var("CEP_PEERS")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|entry| {
                        let mut parts = entry.trim().splitn(3, '|');
                        Some(PeerConfig {
                            urn: parts.next()?.to_string(),
                            addr: parts.next()?.to_string(),
                            id_key: parts.next()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            bind_addr: std::env::var("CEP_BIND_ADDR").unwrap_or(d.bind_addr),
            urn: std::env::var("CEP_URN").unwrap_or(d.urn),
            id_key: std::env::var("CEP_ID_KEY").unwrap_or(d.id_key),
            secret: std::env::var("CEP_SYNC_SECRET").unwrap_or(d.secret),
            key_hex: std::env::var("CEP_SYNC_KEY_HEX").ok(),
            peers,
            ping_ms: env_parse("CEP_PING_MS", d.ping_ms),
            resync_ms: env_parse("CEP_RESYNC_MS", d.resync_ms),
            io_timeout_ms: env_parse("CEP_IO_TIMEOUT_MS", d.io_timeout_ms),
            poll_ms: env_parse("CEP_POLL_MS", d.poll_ms),
            max_queue: env_parse("CEP_SYNC_QUEUE", d.max_queue),
        }
    }
}

struct PlannedSend {
    urn: String,
    addr: String,
    plan: SendPlan,
    batch: DeltaBatch,
    flags: u8,
}

pub struct DistributedSync {
    cfg: SyncConfig,
    decider: Arc<Decider>,
    cipher: FrameCipher,
    peers: Mutex<HashMap<String, PeerState>>,
    outgoing: BoundedQueue<DeltaBatch>,
    closed: Mutex<bool>,
    local_addr: SocketAddr,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DistributedSync {
    /// Bind, spawn the two loops, return the running service. Register
    /// the returned handle as a decider subscriber to feed it deltas.
    pub fn start(cfg: SyncConfig, decider: Arc<Decider>) -> Result<Arc<Self>> {
        let cipher = match &cfg.key_hex {
            Some(hex_key) => FrameCipher::from_hex_key(hex_key)?,
            None => FrameCipher::from_secret(&cfg.secret),
        };
        let listener = TcpListener::bind(&cfg.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let peers = cfg
            .peers
            .iter()
            .cloned()
            .map(|p| (p.urn.clone(), PeerState::new(p)))
            .collect();
        let outgoing = BoundedQueue::new("sync-outgoing", cfg.max_queue);

        let svc = Arc::new(Self {
            cfg,
            decider,
            cipher,
            peers: Mutex::new(peers),
            outgoing,
            closed: Mutex::new(false),
            local_addr,
            handles: Mutex::new(Vec::new()),
        });

        let listen = Arc::clone(&svc);
        let listen_handle = thread::Builder::new()
            .name("cep-sync-listen".to_string())
            .spawn(move || listen.listen_loop(listener))?;
        let send = Arc::clone(&svc);
        let send_handle = thread::Builder::new()
            .name("cep-sync-send".to_string())
            .spawn(move || send.send_loop())?;
        svc.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([listen_handle, send_handle]);

        logging::log(
            Level::Info,
            Domain::System,
            "sync_started",
            obj(&[
                ("urn", v_str(&svc.cfg.urn)),
                ("addr", v_str(&local_addr.to_string())),
                ("peers", v_num(svc.peer_count() as f64)),
            ]),
        );
        Ok(svc)
    }

    /// Actual bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn add_peer(&self, peer: PeerConfig) {
        let mut peers = self.lock_peers();
        if peers.contains_key(&peer.urn) {
            logging::log(
                Level::Warn,
                Domain::Sync,
                "peer_exists",
                obj(&[("urn", v_str(&peer.urn))]),
            );
            return;
        }
        peers.insert(peer.urn.clone(), PeerState::new(peer));
    }

    pub fn peer_count(&self) -> usize {
        self.lock_peers().len()
    }

    // ------------------------------------------------------------------
    // outgoing
    // ------------------------------------------------------------------

    fn send_loop(&self) {
        let poll = Duration::from_millis(self.cfg.poll_ms);
        loop {
            if self.is_closed() {
                return;
            }
            self.send_pass();
            thread::sleep(poll);
        }
    }

    fn send_pass(&self) {
        // Fold freshly queued deltas into every peer's pending set.
        while let Some(batch) = self.outgoing.pop() {
            let mut peers = self.lock_peers();
            for p in peers.values_mut() {
                p.queue(batch.clone());
            }
        }

        // Plan under the peers lock without touching the decider (lock
        // order: peers, then decider, never both at once here).
        let now = ts_epoch_ms();
        let mut planned = Vec::new();
        {
            let mut peers = self.lock_peers();
            for p in peers.values_mut() {
                let plan = p.plan(now, self.cfg.ping_ms, self.cfg.resync_ms);
                if plan == SendPlan::Skip {
                    continue;
                }
                let batch = match plan {
                    SendPlan::Delta => p.take_outgoing(),
                    SendPlan::Resync => {
                        p.clear_for_resync();
                        DeltaBatch::default()
                    }
                    _ => DeltaBatch::default(),
                };
                p.on_attempt(now);
                planned.push(PlannedSend {
                    urn: p.cfg.urn.clone(),
                    addr: p.cfg.addr.clone(),
                    plan,
                    batch,
                    flags: if p.force_reset { FLAG_FORCE_RESYNC } else { 0 },
                });
            }
        }

        for item in planned {
            self.send_planned(item);
        }
    }

    fn send_planned(&self, item: PlannedSend) {
        let (msg_type, payload) = match item.plan {
            SendPlan::Ping => (MsgType::Ping, "{}".to_string()),
            SendPlan::Resync => {
                let snapshot = self.decider.snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(s) => (MsgType::Resync, s),
                    Err(err) => {
                        self.log_sync_error("encode_snapshot", &err.to_string());
                        return;
                    }
                }
            }
            SendPlan::Delta => match serde_json::to_string(&item.batch) {
                Ok(s) => (MsgType::Sync, s),
                Err(err) => {
                    self.log_sync_error("encode_delta", &err.to_string());
                    return;
                }
            },
            SendPlan::Skip => return,
        };

        let frame = Frame::new(&self.cfg.urn, &self.cfg.id_key, msg_type, item.flags, payload);
        let wire = match self.cipher.seal(&frame) {
            Ok(w) => w,
            Err(err) => {
                self.log_sync_error("seal", &err.to_string());
                return;
            }
        };

        match self.send_to(&item.addr, &wire) {
            Ok(()) => {
                logging::log(
                    Level::Debug,
                    Domain::Sync,
                    "sent",
                    obj(&[
                        ("peer", v_str(&item.urn)),
                        ("msg_type", v_str(msg_type.as_str())),
                        ("records", v_num(item.batch.len() as f64)),
                    ]),
                );
                let mut peers = self.lock_peers();
                if let Some(p) = peers.get_mut(&item.urn) {
                    p.on_success(ts_epoch_ms());
                }
            }
            Err(err) => {
                // Transient: stash the undelivered delta, retry next
                // cycle. A failed resync recomputes its snapshot from
                // live state next pass, a failed ping carries nothing.
                logging::log(
                    Level::Debug,
                    Domain::Net,
                    "send_failed",
                    obj(&[
                        ("peer", v_str(&item.urn)),
                        ("msg_type", v_str(msg_type.as_str())),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                if item.plan == SendPlan::Delta {
                    let mut peers = self.lock_peers();
                    if let Some(p) = peers.get_mut(&item.urn) {
                        p.on_failure(item.batch);
                    }
                }
            }
        }
    }

    fn send_to(&self, addr: &str, wire: &[u8]) -> anyhow::Result<()> {
        let timeout = Duration::from_millis(self.cfg.io_timeout_ms);
        let addr = addr
            .to_socket_addrs()
            .context("resolve peer addr")?
            .next()
            .ok_or_else(|| anyhow!("peer addr resolved to nothing"))?;
        let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_write_timeout(Some(timeout))?;
        stream.write_all(wire)?;
        stream.flush()?;
        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }

    // ------------------------------------------------------------------
    // incoming
    // ------------------------------------------------------------------

    fn listen_loop(&self, listener: TcpListener) {
        let poll = Duration::from_millis(self.cfg.poll_ms);
        while !self.is_closed() {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(err) = self.handle_conn(stream) {
                        logging::log(
                            Level::Warn,
                            Domain::Net,
                            "conn_aborted",
                            obj(&[
                                ("from", v_str(&addr.to_string())),
                                ("error", v_str(&err.to_string())),
                            ]),
                        );
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(poll),
                Err(err) => {
                    logging::log(
                        Level::Warn,
                        Domain::Net,
                        "accept_error",
                        obj(&[("error", v_str(&err.to_string()))]),
                    );
                    thread::sleep(poll);
                }
            }
        }
    }

    fn handle_conn(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_millis(self.cfg.io_timeout_ms)))?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        while !frame_complete(&buf) {
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        // Decrypt-and-authenticate in one step; failure aborts with no
        // partial state applied.
        let frame = self.cipher.open(&buf)?;
        self.dispatch(frame)
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        let now = ts_epoch_ms();
        {
            let mut peers = self.lock_peers();
            let peer = peers
                .values_mut()
                .find(|p| p.cfg.urn == frame.urn)
                .ok_or_else(|| CepError::Auth(format!("unknown peer urn {}", frame.urn)))?;
            if peer.cfg.id_key != frame.id_key {
                return Err(CepError::Auth(format!("wrong id_key for {}", frame.urn)));
            }
            if frame.force_resync() {
                peer.on_force_resync();
            } else {
                peer.on_contact(now);
            }
        }

        match frame.msg_type {
            MsgType::Ping => {
                let trimmed = frame.payload.trim();
                if !trimmed.is_empty() && trimmed != "{}" {
                    logging::log(
                        Level::Warn,
                        Domain::Sync,
                        "ping_payload_ignored",
                        obj(&[("peer", v_str(&frame.urn))]),
                    );
                }
                Ok(())
            }
            MsgType::Sync | MsgType::Resync => {
                let batch: DeltaBatch = serde_json::from_str(&frame.payload).map_err(|e| {
                    CepError::Integrity(format!(
                        "malformed {} payload from {}: {}",
                        frame.msg_type.as_str(),
                        frame.urn,
                        e
                    ))
                })?;
                let relay = self.decider.on_distributed_update(batch)?;
                logging::log(
                    Level::Debug,
                    Domain::Sync,
                    "merged",
                    obj(&[
                        ("peer", v_str(&frame.urn)),
                        ("msg_type", v_str(frame.msg_type.as_str())),
                        ("relayed", v_num(relay.len() as f64)),
                    ]),
                );
                Ok(())
            }
        }
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerState>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_sync_error(&self, event: &str, error: &str) {
        logging::log(
            Level::Error,
            Domain::Sync,
            event,
            obj(&[("error", v_str(error))]),
        );
    }
}

impl DeciderSubscriber for DistributedSync {
    fn on_decider_update(
        &self,
        completed: &[RunRecord],
        halted: &[RunRecord],
        updated: &[RunRecord],
        local: bool,
    ) {
        // Relayed remote batches must not echo back out.
        if !local {
            return;
        }
        let batch = DeltaBatch::new(completed.to_vec(), halted.to_vec(), updated.to_vec());
        if let Err(err) = self.outgoing.push(batch) {
            self.log_sync_error("outgoing_overflow", &err.to_string());
        }
    }
}

impl Service for DistributedSync {
    fn close(&self) {
        {
            let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
            if *closed {
                return;
            }
            *closed = true;
        }
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for h in handles {
            let _ = h.join();
        }
        logging::log(
            Level::Info,
            Domain::System,
            "sync_closed",
            obj(&[("urn", v_str(&self.cfg.urn))]),
        );
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DistributedSync {
    fn drop(&mut self) {
        // Threads hold their own Arc, so by the time drop runs they are
        // gone; this only covers a never-started close.
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}
