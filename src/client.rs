//! ClientAgent (C6): a replica-pool-aware client. The public `ClientAgent`
//! is a thin handle; all socket and cache state lives in a worker task
//! reached over a control channel, following the same application/worker
//! split project-5's `KvClient` keeps between its handle and the
//! connection it owns.

use crate::base::subtree_matches;
use crate::error::{CacheError, Result};
use crate::memcache::MemCache;
use crate::message::{
    send_snapshot_request, KvMessage, KEY_BEGINMEMCACHE, KEY_ENDSNAPSHOT, KEY_HUGZ, PROP_CACHE_ID,
    PROP_TTL,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// How long a server may go without a heartbeat before the agent fails over.
pub const SERVER_TTL_MS: u64 = 5000;

/// At most two replicas are ever tracked: the configured primary and backup.
const MAX_SERVERS: usize = 2;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy)]
struct ServerRecord {
    snapshot_addr: SocketAddr,
    publisher_addr: SocketAddr,
    collector_addr: SocketAddr,
    alive_until_ms: u64,
}

impl ServerRecord {
    fn new(snapshot_addr: SocketAddr) -> Self {
        let mut publisher_addr = snapshot_addr;
        publisher_addr.set_port(snapshot_addr.port() + 1);
        let mut collector_addr = snapshot_addr;
        collector_addr.set_port(snapshot_addr.port() + 2);
        Self {
            snapshot_addr,
            publisher_addr,
            collector_addr,
            alive_until_ms: now_ms() + SERVER_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Initial,
    Syncing,
    Active,
}

enum Command {
    Connect(SocketAddr),
    Set {
        cache_id: String,
        key: Vec<u8>,
        body: Vec<u8>,
        ttl_secs: u64,
    },
    Get {
        cache_id: String,
        key: String,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    OnSnapshot(Box<dyn FnMut() + Send>),
    OnUpdate(Box<dyn FnMut(&KvMessage) + Send>),
    Shutdown,
}

/// A handle to a running client agent. Cloning the handle is cheap; the
/// worker task and its cache are shared.
pub struct ClientAgent {
    tx: mpsc::Sender<Command>,
    worker: JoinHandle<()>,
}

impl ClientAgent {
    /// Start a new agent, optionally restricted to `subtree` (empty means
    /// "everything"). The worker owns whichever MemCache partitions its
    /// replicas snapshot or publish, keyed by `cacheId` as each one is
    /// named on the wire (spec.md §4.6: the worker owns "a set of local
    /// MemCaches", not a single one).
    pub fn new(subtree: impl Into<Vec<u8>>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let worker = Worker::new(subtree.into());
        let handle = tokio::spawn(worker.run(rx));
        Self { tx, worker: handle }
    }

    /// Register a server replica. The first call also begins the snapshot
    /// bootstrap; a second call records a failover candidate.
    pub async fn connect(&self, snapshot_addr: SocketAddr) -> Result<()> {
        self.tx
            .send(Command::Connect(snapshot_addr))
            .await
            .map_err(|_| CacheError::Fatal("client worker gone".into()))
    }

    /// Publish a SET on `cache_id` to every known replica's collector
    /// endpoint.
    pub async fn set(
        &self,
        cache_id: impl Into<String>,
        key: impl Into<Vec<u8>>,
        body: impl Into<Vec<u8>>,
        ttl_secs: u64,
    ) -> Result<()> {
        self.tx
            .send(Command::Set {
                cache_id: cache_id.into(),
                key: key.into(),
                body: body.into(),
                ttl_secs,
            })
            .await
            .map_err(|_| CacheError::Fatal("client worker gone".into()))
    }

    /// Read a key from `cache_id`'s locally replicated cache.
    pub async fn get(&self, cache_id: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Get {
                cache_id: cache_id.to_string(),
                key: key.to_string(),
                reply,
            })
            .await
            .map_err(|_| CacheError::Fatal("client worker gone".into()))?;
        rx.await.map_err(|_| CacheError::Fatal("client worker gone".into()))
    }

    /// Register a callback fired once the initial snapshot has loaded.
    pub async fn on_snapshot(&self, callback: impl FnMut() + Send + 'static) -> Result<()> {
        self.tx
            .send(Command::OnSnapshot(Box::new(callback)))
            .await
            .map_err(|_| CacheError::Fatal("client worker gone".into()))
    }

    /// Register a callback fired on every applied live update.
    pub async fn on_update(&self, callback: impl FnMut(&KvMessage) + Send + 'static) -> Result<()> {
        self.tx
            .send(Command::OnUpdate(Box::new(callback)))
            .await
            .map_err(|_| CacheError::Fatal("client worker gone".into()))
    }

    /// Stop the worker task and wait for it to exit.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.tx.send(Command::Shutdown).await;
        self.worker
            .await
            .map_err(|e| CacheError::Fatal(format!("client worker panicked: {}", e)))
    }
}

struct Worker {
    subtree: Vec<u8>,
    state: ClientState,
    servers: Vec<ServerRecord>,
    current: usize,
    caches: HashMap<String, MemCache>,
    on_snapshot: Option<Box<dyn FnMut() + Send>>,
    on_update: Option<Box<dyn FnMut(&KvMessage) + Send>>,
    update_tx: mpsc::Sender<KvMessage>,
    update_rx: mpsc::Receiver<KvMessage>,
    subscriber_task: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(subtree: Vec<u8>) -> Self {
        let (update_tx, update_rx) = mpsc::channel(256);
        Self {
            subtree,
            state: ClientState::Initial,
            servers: Vec::with_capacity(MAX_SERVERS),
            current: 0,
            caches: HashMap::new(),
            on_snapshot: None,
            on_update: None,
            update_tx,
            update_rx,
            subscriber_task: None,
        }
    }

    async fn run(mut self, mut control_rx: mpsc::Receiver<Command>) {
        let mut heartbeat_timer = interval(Duration::from_millis(1000));

        loop {
            tokio::select! {
                cmd = control_rx.recv() => {
                    match cmd {
                        Some(Command::Connect(addr)) => self.handle_connect(addr).await,
                        Some(Command::Set { cache_id, key, body, ttl_secs }) => {
                            // rejected-by-ignore while a snapshot is in flight: the
                            // cache isn't ready to publish a read-your-write GET yet.
                            if self.state == ClientState::Syncing {
                                debug!("ignoring SET while syncing");
                            } else {
                                self.handle_set(cache_id, key, body, ttl_secs).await;
                            }
                        }
                        Some(Command::Get { cache_id, key, reply }) => {
                            let value = if self.state == ClientState::Syncing {
                                None
                            } else {
                                self.caches
                                    .get(&cache_id)
                                    .and_then(|mc| mc.get(&key))
                                    .map(|m| m.body().to_vec())
                            };
                            let _ = reply.send(value);
                        }
                        Some(Command::OnSnapshot(cb)) => self.on_snapshot = Some(cb),
                        Some(Command::OnUpdate(cb)) => self.on_update = Some(cb),
                        Some(Command::Shutdown) | None => {
                            if let Some(task) = self.subscriber_task.take() {
                                task.abort();
                            }
                            return;
                        }
                    }
                }

                Some(msg) = self.update_rx.recv() => {
                    self.apply_update(msg);
                }

                _ = heartbeat_timer.tick() => {
                    self.check_failover().await;
                }
            }
        }
    }

    async fn handle_connect(&mut self, addr: SocketAddr) {
        if self.servers.len() >= MAX_SERVERS {
            warn!("ignoring connect beyond the configured replica pool: {}", addr);
            return;
        }
        self.servers.push(ServerRecord::new(addr));
        if self.state == ClientState::Initial {
            self.state = ClientState::Syncing;
            self.current = self.servers.len() - 1;
            self.bootstrap_current().await;
        }
    }

    async fn handle_set(&mut self, cache_id: String, key: Vec<u8>, body: Vec<u8>, ttl_secs: u64) {
        let mut msg = KvMessage::new(0);
        msg.set_key(key);
        msg.set_body(body);
        msg.set_prop(PROP_CACHE_ID, cache_id.as_str());
        if ttl_secs > 0 {
            msg.set_prop(PROP_TTL, ttl_secs.to_string());
        }

        for server in self.servers.clone() {
            let msg = msg.duplicate();
            tokio::spawn(async move {
                match TcpStream::connect(server.collector_addr).await {
                    Ok(mut stream) => {
                        if let Err(e) = msg.send(&mut stream).await {
                            debug!("set fan-out to {} failed: {}", server.collector_addr, e);
                        }
                    }
                    Err(e) => debug!("cannot reach collector {}: {}", server.collector_addr, e),
                }
            });
        }
    }

    /// Connect to the current server's snapshot endpoint, request
    /// `self.subtree`, and rebuild `self.cache` from the stream before
    /// opening the live subscriber connection.
    async fn bootstrap_current(&mut self) {
        let server = match self.servers.get(self.current) {
            Some(s) => *s,
            None => return,
        };

        match self.run_bootstrap(server).await {
            Ok(()) => {
                self.state = ClientState::Active;
                if let Some(cb) = self.on_snapshot.as_mut() {
                    cb();
                }
                info!("snapshot loaded from {}", server.snapshot_addr);
                self.start_subscriber(server);
            }
            Err(e) => {
                warn!("snapshot bootstrap from {} failed: {}", server.snapshot_addr, e);
            }
        }
    }

    async fn run_bootstrap(&mut self, server: ServerRecord) -> Result<()> {
        let mut stream = TcpStream::connect(server.snapshot_addr).await?;
        send_snapshot_request(&mut stream, &self.subtree).await?;

        let mut current_cache: Option<String> = None;
        loop {
            let msg = KvMessage::recv(&mut stream).await?;
            match msg.key_str() {
                KEY_BEGINMEMCACHE => {
                    let cache_id = msg.get_prop(PROP_CACHE_ID).to_string();
                    let mc = self
                        .caches
                        .entry(cache_id.clone())
                        .or_insert_with(|| MemCache::new_empty(cache_id.clone()));
                    mc.ensure_allocated();
                    mc.set_sequence(msg.sequence());
                    current_cache = Some(cache_id);
                }
                KEY_ENDSNAPSHOT => break,
                _ => {
                    if let Some(cache_id) = &current_cache {
                        if subtree_matches(msg.key(), &self.subtree) {
                            if let Some(mc) = self.caches.get_mut(cache_id) {
                                mc.store(&msg)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn start_subscriber(&mut self, server: ServerRecord) {
        if let Some(task) = self.subscriber_task.take() {
            task.abort();
        }
        let tx = self.update_tx.clone();
        let addr = server.publisher_addr;
        self.subscriber_task = Some(tokio::spawn(async move {
            let mut stream = match TcpStream::connect(addr).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot subscribe to {}: {}", addr, e);
                    return;
                }
            };
            loop {
                match KvMessage::recv(&mut stream).await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("subscriber connection to {} closed: {}", addr, e);
                        break;
                    }
                }
            }
        }));
    }

    /// Apply a live update: HUGZ frames only refresh liveness; everything
    /// else is dropped unless it carries a sequence newer than what we have.
    fn apply_update(&mut self, msg: KvMessage) {
        if msg.key_str() == KEY_HUGZ {
            if let Some(server) = self.servers.get_mut(self.current) {
                server.alive_until_ms = now_ms() + SERVER_TTL_MS;
            }
            return;
        }

        let cache_id = msg.get_prop(PROP_CACHE_ID).to_string();
        let mc = self
            .caches
            .entry(cache_id.clone())
            .or_insert_with(|| MemCache::new_empty(cache_id));

        if msg.sequence() <= mc.sequence() {
            debug!(
                "dropping out-of-sequence update for {:?}: {} <= {}",
                msg.key_str(),
                msg.sequence(),
                mc.sequence()
            );
            return;
        }
        mc.set_sequence(msg.sequence());
        if let Err(e) = mc.store(&msg) {
            warn!("applying live update failed: {}", e);
            return;
        }
        if let Some(cb) = self.on_update.as_mut() {
            cb(&msg);
        }
    }

    /// Round-robin to the next known server once the current one has gone
    /// silent for longer than `SERVER_TTL_MS`.
    async fn check_failover(&mut self) {
        let expired = self
            .servers
            .get(self.current)
            .map(|s| now_ms() >= s.alive_until_ms)
            .unwrap_or(false);
        if !expired || self.servers.len() < 2 {
            return;
        }

        self.current = (self.current + 1) % self.servers.len();
        warn!(
            "server heartbeat timed out, failing over to {}",
            self.servers[self.current].snapshot_addr
        );
        self.state = ClientState::Syncing;
        self.caches.clear();
        self.bootstrap_current().await;
    }
}
