//! Server (C5): ties Bases to the BinaryStar FSM. Implements snapshot send,
//! the active/passive collector, TTL flush, heartbeats, and the
//! active/passive role-transition handlers (spec.md §4.5).

use crate::base::{subtree_matches, Base};
use crate::binarystar::{BinaryStar, FsmEvent, FsmState, Transition, HEARTBEAT_MS};
use crate::config::{BaseConfig, ClusterConfig};
use crate::durable::DurableStore;
use crate::error::{CacheError, Result};
use crate::memcache::MemCache;
use crate::message::{
    recv_snapshot_request, KvMessage, KEY_BEGINMEMCACHE, KEY_ENDSNAPSHOT, KEY_HUGZ, PROP_CACHE_ID,
    PROP_TTL,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// How often the active role scans for TTL-expired entries.
const TTL_FLUSH_MS: u64 = 1000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Notification fanned out to every Base task when the shared FSM changes
/// active/passive role.
#[derive(Debug, Clone, Copy)]
enum RoleEvent {
    Active,
    Passive,
}

/// Network plumbing and owned state for one configured Base.
struct BaseRuntime {
    base: Base,
    snapshot_listener: TcpListener,
    collector_listener: TcpListener,
    publisher_listener: TcpListener,
    publisher_tx: broadcast::Sender<KvMessage>,
    db_paths: HashMap<String, PathBuf>,
    peer_snapshot_addr: SocketAddr,
    peer_publisher_addr: SocketAddr,
    fsm: Arc<Mutex<BinaryStar>>,
    role_tx: broadcast::Sender<RoleEvent>,
    role_rx: broadcast::Receiver<RoleEvent>,
}

/// Bind every listener named by `config` and recover primary MemCaches from
/// their durable stores. Backup MemCaches start with a null map, per
/// spec.md §4.2's MemCache lifecycle.
async fn bind(
    config: &ClusterConfig,
    fsm: Arc<Mutex<BinaryStar>>,
    role_tx: &broadcast::Sender<RoleEvent>,
) -> Result<Vec<BaseRuntime>> {
    let mut runtimes = Vec::with_capacity(config.base_ids.len());

    for base_id in &config.base_ids {
        let base_cfg: &BaseConfig = &config.bases[base_id];

        let mut memcaches = Vec::with_capacity(base_cfg.cache_ids.len());
        let mut db_paths = HashMap::new();
        for cache_id in &base_cfg.cache_ids {
            let db_path = base_cfg.database_path.join(cache_id);
            db_paths.insert(cache_id.clone(), db_path.clone());

            std::fs::create_dir_all(&db_path)?;
            let durable = DurableStore::open(&db_path)?;
            let mut mc = MemCache::new_empty(cache_id.clone());
            if config.primary {
                mc.recover_from_durable(durable)?;
                memcaches.push(mc);
            } else {
                // The durable mirror is always opened (matching the original's
                // unconditional leveldb_open at memcache_new time); only the
                // in-memory map stays null until a snapshot repopulates it.
                mc.attach_durable(durable);
                memcaches.push(mc);
            }
        }

        let base = Base::new(base_id.clone(), base_cfg.port, base_cfg.peer, memcaches);
        let snapshot_listener = TcpListener::bind(("0.0.0.0", base.snapshot_port())).await?;
        let collector_listener = TcpListener::bind(("0.0.0.0", base.collector_port())).await?;
        let publisher_listener = TcpListener::bind(("0.0.0.0", base.publisher_port())).await?;
        let (publisher_tx, _unused) = broadcast::channel(1024);

        let peer_address = if config.primary {
            &base_cfg.address_backup
        } else {
            &base_cfg.address_primary
        };
        let peer_snapshot_addr: SocketAddr = format!("{}:{}", peer_address, base.peer_port())
            .parse()
            .map_err(|_| CacheError::Config("invalid peer snapshot address".into()))?;
        let peer_publisher_addr: SocketAddr =
            format!("{}:{}", peer_address, base.peer_publisher_port())
                .parse()
                .map_err(|_| CacheError::Config("invalid peer publisher address".into()))?;

        runtimes.push(BaseRuntime {
            base,
            snapshot_listener,
            collector_listener,
            publisher_listener,
            publisher_tx,
            db_paths,
            peer_snapshot_addr,
            peer_publisher_addr,
            fsm: Arc::clone(&fsm),
            role_tx: role_tx.clone(),
            role_rx: role_tx.subscribe(),
        });
    }

    Ok(runtimes)
}

/// §4.5 snapshot send: stream every non-null MemCache, subtree-filtered,
/// bracketed by `BEGINMEMCACHE`/`ENDSNAPSHOT` markers.
async fn send_snapshot(base: &Base, stream: &mut TcpStream, subtree: &[u8]) -> Result<()> {
    let mut last_sequence = 0u64;
    for mc in base.memcaches() {
        if mc.is_null() {
            continue;
        }
        let mut begin = KvMessage::new(mc.sequence());
        begin.set_key(KEY_BEGINMEMCACHE.as_bytes().to_vec());
        begin.set_prop(PROP_CACHE_ID, mc.cache_id());
        begin.send(stream).await?;

        for (key, msg) in mc.iter() {
            if subtree_matches(key.as_bytes(), subtree) {
                msg.send(stream).await?;
            }
        }
        last_sequence = last_sequence.max(mc.sequence());
    }

    let mut end = KvMessage::new(last_sequence);
    end.set_key(KEY_ENDSNAPSHOT.as_bytes().to_vec());
    end.send(stream).await?;
    Ok(())
}

/// §4.5 active-role collector: assign a fresh sequence, stamp a relative
/// TTL into an absolute one, publish, and store.
fn handle_collector_active(
    base: &mut Base,
    publisher_tx: &broadcast::Sender<KvMessage>,
    mut msg: KvMessage,
    now: u64,
) -> Result<()> {
    let cache_id = msg.get_prop(PROP_CACHE_ID).to_string();
    let mc = base
        .memcache_mut(&cache_id)
        .ok_or_else(|| CacheError::UnknownCache(cache_id))?;

    let seq = mc.next_sequence();
    msg.set_sequence(seq);

    if let Ok(ttl_secs) = msg.get_prop(PROP_TTL).parse::<u64>() {
        if ttl_secs > 0 {
            msg.set_prop(PROP_TTL, (now + ttl_secs * 1000).to_string());
        }
    }

    let _ = publisher_tx.send(msg.clone());
    mc.store(&msg)?;
    Ok(())
}

/// §4.5 passive-role collector: apply the shared dedup rule against the
/// pending queue instead of storing directly.
fn handle_collector_passive(base: &mut Base, msg: KvMessage) {
    let cache_id = msg.get_prop(PROP_CACHE_ID).to_string();
    if let Some(mc) = base.memcache_mut(&cache_id) {
        mc.apply_pending_update(msg);
    } else {
        debug!("passive collector: unknown cache id {}", cache_id);
    }
}

/// `s_subscriber`: apply an update read off the peer-publisher bus. This is
/// the only path that actually writes bus-originated data into the map and
/// durable store; the collector above only ever queues.
fn handle_bus_update(base: &mut Base, msg: KvMessage) {
    let cache_id = msg.get_prop(PROP_CACHE_ID).to_string();
    match base.memcache_mut(&cache_id) {
        Some(mc) => {
            if let Err(e) = mc.apply_bus_update(msg) {
                warn!("peer bus update: {}", e);
            }
        }
        None => debug!("peer bus update: unknown cache id {}", cache_id),
    }
}

/// §4.5 TTL flush, active role only, once per second per Base.
fn ttl_flush(base: &mut Base, publisher_tx: &broadcast::Sender<KvMessage>, now: u64) -> Result<()> {
    for mc in base.memcaches_mut() {
        for msg in mc.flush_expired(now)? {
            let _ = publisher_tx.send(msg);
        }
    }
    Ok(())
}

/// §4.5 heartbeats, both roles, once per second per MemCache.
fn publish_heartbeats(base: &Base, publisher_tx: &broadcast::Sender<KvMessage>) {
    for mc in base.memcaches() {
        let mut hugz = KvMessage::new(mc.sequence());
        hugz.set_key(KEY_HUGZ.as_bytes().to_vec());
        hugz.set_prop(PROP_CACHE_ID, mc.cache_id());
        let _ = publisher_tx.send(hugz);
    }
}

/// `s_new_active`: drain every MemCache's pending queue, recovering from
/// durable storage first if this MemCache never received a snapshot
/// (null map).
async fn new_active(
    base: &mut Base,
    db_paths: &HashMap<String, PathBuf>,
    publisher_tx: &broadcast::Sender<KvMessage>,
) -> Result<()> {
    for mc in base.memcaches_mut() {
        if mc.is_null() {
            match db_paths.get(mc.cache_id()) {
                Some(path) => {
                    std::fs::create_dir_all(path)?;
                    let durable = DurableStore::open(path)?;
                    mc.recover_from_durable(durable)?;
                }
                None => mc.ensure_allocated(),
            }
        }
        for msg in mc.drain_pending()? {
            let _ = publisher_tx.send(msg);
        }
    }
    Ok(())
}

/// `s_new_passive`: wipe every MemCache (dropping its durable store) so the
/// subsequent snapshot bootstrap starts from nothing.
async fn new_passive(base: &mut Base) -> Result<()> {
    for mc in base.memcaches_mut() {
        mc.wipe()?;
    }
    Ok(())
}

/// Reconnect to the peer's snapshot endpoint, request a fresh snapshot, and
/// rebuild every MemCache from it — persisting each entry as it arrives and
/// finally writing `SEQUENCENUMBER` (spec.md §4.5, §9 open question: the
/// durable store is reopened fresh per cache as `BEGINMEMCACHE` names it).
async fn bootstrap_from_peer(
    base: &mut Base,
    db_paths: &HashMap<String, PathBuf>,
    peer_snapshot_addr: SocketAddr,
) -> Result<()> {
    let mut stream = TcpStream::connect(peer_snapshot_addr).await?;
    crate::message::send_snapshot_request(&mut stream, b"").await?;

    let mut current_cache: Option<String> = None;
    loop {
        let msg = KvMessage::recv(&mut stream).await?;
        match msg.key_str() {
            KEY_BEGINMEMCACHE => {
                let cache_id = msg.get_prop(PROP_CACHE_ID).to_string();
                if let Some(mc) = base.memcache_mut(&cache_id) {
                    mc.ensure_allocated();
                    mc.set_sequence(msg.sequence());
                    if let Some(path) = db_paths.get(&cache_id) {
                        std::fs::create_dir_all(path)?;
                        let durable = DurableStore::open(path)?;
                        durable.put_sequence(msg.sequence())?;
                        mc.attach_durable(durable);
                    }
                }
                current_cache = Some(cache_id);
            }
            KEY_ENDSNAPSHOT => break,
            _ => {
                if let Some(cache_id) = &current_cache {
                    if let Some(mc) = base.memcache_mut(cache_id) {
                        mc.store(&msg)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn spawn_collector_reader(mut stream: TcpStream, tx: mpsc::Sender<KvMessage>) {
    tokio::spawn(async move {
        loop {
            match KvMessage::recv(&mut stream).await {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("collector connection closed: {}", e);
                    break;
                }
            }
        }
    });
}

fn spawn_publisher_forwarder(mut stream: TcpStream, mut rx: broadcast::Receiver<KvMessage>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if msg.send(&mut stream).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_peer_reader(mut stream: TcpStream, tx: mpsc::Sender<KvMessage>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match KvMessage::recv(&mut stream).await {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("peer subscriber connection closed: {}", e);
                    break;
                }
            }
        }
    })
}

/// One Base's reactor loop: snapshot/collector/publisher accept, peer
/// subscriber application, TTL flush and heartbeat timers, and
/// role-transition handling. Runs until a fatal FSM rejection occurs.
async fn run_base(mut rt: BaseRuntime) -> Result<()> {
    let (collector_tx, mut collector_rx) = mpsc::channel::<KvMessage>(1024);
    let (peer_tx, mut peer_rx) = mpsc::channel::<KvMessage>(1024);
    let mut peer_task: Option<tokio::task::JoinHandle<()>> = None;

    let mut ttl_timer = interval(Duration::from_millis(TTL_FLUSH_MS));
    let mut heartbeat_timer = interval(Duration::from_millis(HEARTBEAT_MS));

    loop {
        tokio::select! {
            accepted = rt.snapshot_listener.accept() => {
                let (mut stream, peer) = accepted?;
                let subtree = match recv_snapshot_request(&mut stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("malformed snapshot request from {}: {}", peer, e);
                        continue;
                    }
                };
                let now = now_ms();
                let outcome = {
                    let mut fsm = rt.fsm.lock().await;
                    fsm.apply(FsmEvent::SnapshotRequest, now)
                };
                match outcome {
                    Ok(transition) => {
                        if transition == Some(Transition::ToActive) {
                            let _ = rt.role_tx.send(RoleEvent::Active);
                        }
                        if let Err(e) = send_snapshot(&rt.base, &mut stream, &subtree).await {
                            warn!("snapshot send to {} failed: {}", peer, e);
                        }
                    }
                    Err(CacheError::Fatal(reason)) => {
                        error!("{}", reason);
                        return Err(CacheError::Fatal(reason));
                    }
                    Err(_) => {
                        // rejected: drop the request without replying; the
                        // client's own timeout drives its failover.
                    }
                }
            }

            accepted = rt.collector_listener.accept() => {
                let (stream, _peer) = accepted?;
                spawn_collector_reader(stream, collector_tx.clone());
            }

            accepted = rt.publisher_listener.accept() => {
                let (stream, _peer) = accepted?;
                spawn_publisher_forwarder(stream, rt.publisher_tx.subscribe());
            }

            Some(msg) = collector_rx.recv() => {
                let is_active = matches!(rt.fsm.lock().await.state(), FsmState::Active);
                if is_active {
                    if let Err(e) = handle_collector_active(&mut rt.base, &rt.publisher_tx, msg, now_ms()) {
                        warn!("collector: {}", e);
                    }
                } else {
                    handle_collector_passive(&mut rt.base, msg);
                }
            }

            Some(msg) = peer_rx.recv() => {
                handle_bus_update(&mut rt.base, msg);
            }

            _ = ttl_timer.tick() => {
                if matches!(rt.fsm.lock().await.state(), FsmState::Active) {
                    if let Err(e) = ttl_flush(&mut rt.base, &rt.publisher_tx, now_ms()) {
                        warn!("ttl flush: {}", e);
                    }
                }
            }

            _ = heartbeat_timer.tick() => {
                publish_heartbeats(&rt.base, &rt.publisher_tx);
            }

            role_event = rt.role_rx.recv() => {
                match role_event {
                    Ok(RoleEvent::Active) => {
                        if let Some(task) = peer_task.take() {
                            task.abort();
                        }
                        info!(base = rt.base.base_id(), "transitioning to ACTIVE");
                        new_active(&mut rt.base, &rt.db_paths, &rt.publisher_tx).await?;
                    }
                    Ok(RoleEvent::Passive) => {
                        info!(base = rt.base.base_id(), "transitioning to PASSIVE");
                        new_passive(&mut rt.base).await?;
                        if let Err(e) = bootstrap_from_peer(&mut rt.base, &rt.db_paths, rt.peer_snapshot_addr).await {
                            warn!("snapshot bootstrap from peer failed: {}", e);
                        }
                        match TcpStream::connect(rt.peer_publisher_addr).await {
                            Ok(stream) => {
                                peer_task = Some(spawn_peer_reader(stream, peer_tx.clone()));
                            }
                            Err(e) => warn!("cannot subscribe to peer publisher: {}", e),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Run the full server reactor for a configured cluster until a fatal FSM
/// condition (dual-active / dual-passive) forces shutdown.
pub async fn run_server(config: ClusterConfig) -> Result<()> {
    info!(
        cluster = %config.cluster_name,
        module = %config.module_name,
        server_type = %config.server_type,
        primary = config.primary,
        "starting clonesrv"
    );

    let fsm = Arc::new(Mutex::new(BinaryStar::new(config.primary)));
    let (role_tx, _unused) = broadcast::channel::<RoleEvent>(16);

    let runtimes = bind(&config, Arc::clone(&fsm), &role_tx).await?;

    let mut bstar_handle = tokio::spawn(run_bstar_heartbeat(
        Arc::clone(&fsm),
        config.bstar_local,
        config.bstar_remote,
        role_tx.clone(),
    ));

    let mut base_handles = Vec::with_capacity(runtimes.len());
    for rt in runtimes {
        base_handles.push(tokio::spawn(run_base(rt)));
    }

    let bases_fut = async {
        for handle in &mut base_handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("base reactor terminated: {}", e);
                    return Err(e);
                }
                Err(join_err) => {
                    error!("base reactor panicked: {}", join_err);
                }
            }
        }
        Ok(())
    };

    // The bstar heartbeat task is the only place a dual-active/dual-passive
    // fatal condition is detected; if it exits for any reason the Base
    // reactors must stop servicing requests rather than keep running past a
    // state the process has already declared unrecoverable (spec.md §7, §8
    // scenario 5).
    tokio::select! {
        result = &mut bstar_handle => {
            for handle in &base_handles {
                handle.abort();
            }
            match result {
                Ok(Err(e)) => {
                    error!("bstar heartbeat terminated: {}", e);
                    Err(e)
                }
                Err(join_err) => {
                    error!("bstar heartbeat panicked: {}", join_err);
                    Ok(())
                }
                Ok(Ok(())) => Ok(()),
            }
        }
        result = bases_fut => {
            bstar_handle.abort();
            result
        }
    }
}

/// The Binary Star state channel: a UDP datagram pair exchanging the
/// single-byte ASCII state code once per second, driving the shared FSM
/// and broadcasting role transitions to every Base task.
async fn run_bstar_heartbeat(
    fsm: Arc<Mutex<BinaryStar>>,
    local: SocketAddr,
    remote: SocketAddr,
    role_tx: broadcast::Sender<RoleEvent>,
) -> Result<()> {
    let socket = tokio::net::UdpSocket::bind(local).await?;
    let mut ticker = interval(Duration::from_millis(HEARTBEAT_MS));
    let mut buf = [0u8; 8];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let code = fsm.lock().await.state().to_code();
                let _ = socket.send_to(format!("{}", code).as_bytes(), remote).await;
            }

            recv = socket.recv_from(&mut buf) => {
                let (len, _addr) = recv?;
                if len == 0 {
                    continue;
                }
                let code: u8 = match std::str::from_utf8(&buf[..len]).ok().and_then(|s| s.trim().parse().ok()) {
                    Some(c) => c,
                    None => continue,
                };
                let peer_state = match FsmState::from_code(code) {
                    Some(s) => s,
                    None => continue,
                };

                let now = now_ms();
                let result = {
                    let mut guard = fsm.lock().await;
                    guard.refresh_peer_expiry(now);
                    guard.apply(FsmEvent::from_peer_state(peer_state), now)
                };

                match result {
                    Ok(Some(Transition::ToActive)) => {
                        let _ = role_tx.send(RoleEvent::Active);
                    }
                    Ok(Some(Transition::ToPassive)) => {
                        let _ = role_tx.send(RoleEvent::Passive);
                    }
                    Ok(None) => {}
                    Err(CacheError::Fatal(reason)) => {
                        error!("{}", reason);
                        return Err(CacheError::Fatal(reason));
                    }
                    Err(_) => {
                        // peer-announcement rejections are logged and ignored;
                        // only client snapshot requests can be legitimately rejected.
                        warn!("unexpected FSM rejection on peer event");
                    }
                }
            }
        }
    }
}
