//! In-process engine.
//!
//! Implements the node contract without the native library: configuration
//! validation, a persisted cluster configuration (redb), a listener that
//! accepts peer handshakes, and a connector that reaches every other member
//! through the installed connect callback, exactly as the native engine
//! would.
//!
//! Each running engine has two worker threads sharing one `watch` shutdown
//! signal. The acceptor drives a tokio listener and reads every handshake
//! in its own task. The connector dials from a plain thread and waits out
//! its retry interval on the signal.
//!
//! # Peer handshake
//!
//! ```text
//! [version u64][node id u64][address len u64][address bytes]   (little endian)
//! ```

use std::collections::HashMap;
use std::ffi::CString;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::raw::{c_int, c_void};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Engine, SnapshotParams};
use crate::error::EngineError;
use crate::ffi::{ConnectFunc, DQLITE_ERROR, DQLITE_MISUSE, NodeInfoExt};
use crate::membership::{self, NodeInfo};
use crate::registry::DialHandle;
use crate::store::ClusterStore;

/// Handshake protocol version.
pub const PROTOCOL_VERSION: u64 = 1;

pub const DEFAULT_NETWORK_LATENCY: Duration = Duration::from_millis(20);
pub const MAX_NETWORK_LATENCY: Duration = Duration::from_secs(3600);
pub const DEFAULT_SNAPSHOT: SnapshotParams = SnapshotParams {
    threshold: 8192,
    trailing: 1024,
};

const MAX_ADDRESS_LEN: u64 = 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Copy)]
struct Connector {
    func: ConnectFunc,
    handle: DialHandle,
}

/// Live connections, keyed by peer id.
#[derive(Default)]
struct Peers {
    outbound: Mutex<HashMap<u64, TcpStream>>,
    inbound: Mutex<HashMap<u64, TcpStream>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Running {
    shutdown: watch::Sender<bool>,
    bound: SocketAddr,
    workers: Vec<JoinHandle<()>>,
}

/// A node hosted inside this process.
pub struct LocalEngine {
    id: u64,
    address: String,
    bind_address: String,
    connector: Option<Connector>,
    network_latency: Duration,
    snapshot: SnapshotParams,
    failure_domain: u64,
    store: ClusterStore,
    peers: Arc<Peers>,
    running: Option<Running>,
}

fn misuse(message: impl Into<String>) -> EngineError {
    EngineError::new(DQLITE_MISUSE, message)
}

fn failure(message: impl Into<String>) -> EngineError {
    EngineError::new(DQLITE_ERROR, message)
}

/// Run `f` on a named thread that owns a current-thread runtime.
///
/// A panic inside `f` surfaces when the thread is joined.
fn spawn_worker<F>(name: String, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce(&Runtime) + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name(name)
        .spawn(move || f(&runtime))
}

impl LocalEngine {
    pub fn network_latency(&self) -> Duration {
        self.network_latency
    }

    pub fn snapshot_params(&self) -> SnapshotParams {
        self.snapshot
    }

    pub fn failure_domain(&self) -> u64 {
        self.failure_domain
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The persisted cluster configuration, ordered by id.
    pub fn cluster(&self) -> Result<Vec<NodeInfo>, EngineError> {
        self.store.load().map_err(|e| failure(e.to_string()))
    }

    /// Ids of peers this node has an outbound connection to.
    pub fn connected_peers(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.peers.outbound).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of peers that completed a handshake on this node's listener.
    pub fn inbound_peers(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.peers.inbound).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn ensure_stopped(&self, what: &str) -> Result<(), EngineError> {
        if self.running.is_some() {
            return Err(misuse(format!("cannot {what}: node is running")));
        }
        Ok(())
    }

    /// Interval between attempts to reach members that are not connected.
    fn retry_interval(&self) -> Duration {
        (self.network_latency * 5).clamp(Duration::from_millis(50), Duration::from_secs(1))
    }

    fn spawn_acceptor(
        &self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<JoinHandle<()>> {
        let peers = Arc::clone(&self.peers);
        let node_id = self.id;
        spawn_worker(format!("replica-accept-{node_id}"), move |runtime| {
            runtime.block_on(accept_loop(node_id, listener, peers, shutdown));
        })
    }

    fn spawn_connector(
        &self,
        members: Vec<NodeInfo>,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<JoinHandle<()>> {
        let peers = Arc::clone(&self.peers);
        let node_id = self.id;
        let own_address = self.address.clone();
        let connector = self.connector;
        let retry = self.retry_interval();
        spawn_worker(format!("replica-connect-{node_id}"), move |runtime| {
            let targets: Vec<NodeInfo> = members.into_iter().filter(|m| m.id != node_id).collect();
            while !*shutdown.borrow() {
                for target in &targets {
                    if *shutdown.borrow() {
                        break;
                    }
                    if lock(&peers.outbound).contains_key(&target.id) {
                        continue;
                    }
                    // Dials happen outside the runtime, so the connect
                    // callback never arrives on a runtime thread.
                    let result = open_stream(connector, &target.address, retry).and_then(|stream| {
                        write_handshake(&stream, node_id, &own_address)?;
                        Ok(stream)
                    });
                    match result {
                        Ok(stream) => {
                            debug!(node_id, peer_id = target.id, address = %target.address, "connected to peer");
                            lock(&peers.outbound).insert(target.id, stream);
                        }
                        Err(e) => {
                            debug!(node_id, peer_id = target.id, address = %target.address, error = %e, "peer unreachable");
                        }
                    }
                }
                runtime.block_on(async {
                    let _ = tokio::time::timeout(retry, shutdown.changed()).await;
                });
            }
            debug!(node_id, "connector stopped");
        })
    }
}

async fn accept_loop(
    node_id: u64,
    listener: TcpListener,
    peers: Arc<Peers>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            warn!(node_id, error = %e, "listener unusable");
            return;
        }
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(admit_peer(node_id, stream, remote, Arc::clone(&peers)));
                }
                Err(e) => {
                    warn!(node_id, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!(node_id, "acceptor stopped");
}

/// Read one peer's handshake and record the connection.
///
/// Runs as its own task so a silent peer only holds up itself.
async fn admit_peer(
    node_id: u64,
    mut stream: tokio::net::TcpStream,
    remote: SocketAddr,
    peers: Arc<Peers>,
) {
    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream))
        .await
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out")));
    let admitted = handshake.and_then(|peer| Ok((peer, stream.into_std()?)));
    match admitted {
        Ok(((peer_id, peer_address), stream)) => {
            debug!(node_id, peer_id, %peer_address, %remote, "peer connected");
            lock(&peers.inbound).insert(peer_id, stream);
        }
        Err(e) => {
            warn!(node_id, %remote, error = %e, "rejected peer handshake");
        }
    }
}

/// Obtain a connected stream to `address`, through the connect callback when
/// one is installed.
fn open_stream(
    connector: Option<Connector>,
    address: &str,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let stream = match connector {
        Some(Connector { func, handle }) => {
            let c_address = CString::new(address)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "address contains NUL"))?;
            let mut fd: c_int = -1;
            // SAFETY: `c_address` outlives the call and `fd` is a valid slot.
            // The handle is passed by value, never dereferenced.
            let rc = unsafe { func(handle as *mut c_void, c_address.as_ptr(), &mut fd) };
            if rc != 0 || fd < 0 {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("connect callback returned {rc}"),
                ));
            }
            // SAFETY: on success the callback transfers ownership of `fd`.
            TcpStream::from(unsafe { OwnedFd::from_raw_fd(fd) })
        }
        None => {
            let addr: SocketAddr = address
                .parse()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{address}: {e}")))?;
            TcpStream::connect_timeout(&addr, timeout)?
        }
    };
    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// `[version u64][node id u64][address len u64][address bytes]`, little endian.
fn handshake_frame(id: u64, address: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24 + address.len());
    buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&(address.len() as u64).to_le_bytes());
    buf.extend_from_slice(address.as_bytes());
    buf
}

fn write_handshake(mut stream: &TcpStream, id: u64, address: &str) -> io::Result<()> {
    stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.write_all(&handshake_frame(id, address))
}

async fn read_handshake<R>(stream: &mut R) -> io::Result<(u64, String)>
where
    R: AsyncRead + Unpin,
{
    let version = stream.read_u64_le().await?;
    if version != PROTOCOL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported protocol version {version}"),
        ));
    }
    let id = stream.read_u64_le().await?;
    let len = stream.read_u64_le().await?;
    if len > MAX_ADDRESS_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("address length {len} too large"),
        ));
    }
    let mut address = vec![0u8; len as usize];
    stream.read_exact(&mut address).await?;
    let address = String::from_utf8(address)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "address is not UTF-8"))?;
    Ok((id, address))
}

impl Engine for LocalEngine {
    fn create(id: u64, address: &str, dir: &Path) -> Result<Self, EngineError> {
        if id == 0 {
            return Err(misuse("node id must not be zero"));
        }
        if address.is_empty() {
            return Err(misuse("node address must not be empty"));
        }
        if !dir.is_dir() {
            return Err(failure(format!(
                "data directory {} does not exist",
                dir.display()
            )));
        }
        let store = ClusterStore::open(dir).map_err(|e| failure(e.to_string()))?;

        debug!(node_id = id, %address, dir = ?dir, "local engine created");
        Ok(Self {
            id,
            address: address.to_string(),
            bind_address: address.to_string(),
            connector: None,
            network_latency: DEFAULT_NETWORK_LATENCY,
            snapshot: DEFAULT_SNAPSHOT,
            failure_domain: 0,
            store,
            peers: Arc::default(),
            running: None,
        })
    }

    fn set_bind_address(&mut self, address: &str) -> Result<(), EngineError> {
        self.ensure_stopped("set bind address")?;
        address
            .parse::<SocketAddr>()
            .map_err(|e| misuse(format!("invalid bind address {address:?}: {e}")))?;
        self.bind_address = address.to_string();
        Ok(())
    }

    fn bind_address(&self) -> String {
        match &self.running {
            Some(running) => running.bound.to_string(),
            None => self.bind_address.clone(),
        }
    }

    fn set_connect_func(
        &mut self,
        func: ConnectFunc,
        handle: DialHandle,
    ) -> Result<(), EngineError> {
        self.ensure_stopped("set connect func")?;
        self.connector = Some(Connector { func, handle });
        Ok(())
    }

    fn set_network_latency(&mut self, nanoseconds: u64) -> Result<(), EngineError> {
        self.ensure_stopped("set network latency")?;
        let latency = Duration::from_nanos(nanoseconds);
        if latency > MAX_NETWORK_LATENCY {
            return Err(misuse(format!(
                "network latency {latency:?} exceeds {MAX_NETWORK_LATENCY:?}"
            )));
        }
        self.network_latency = latency;
        Ok(())
    }

    fn set_snapshot_params(&mut self, params: SnapshotParams) -> Result<(), EngineError> {
        self.ensure_stopped("set snapshot params")?;
        if params.threshold == 0 {
            return Err(misuse("snapshot threshold must be positive"));
        }
        if params.trailing > params.threshold {
            return Err(misuse(format!(
                "snapshot trailing {} exceeds threshold {}",
                params.trailing, params.threshold
            )));
        }
        self.snapshot = params;
        Ok(())
    }

    fn set_failure_domain(&mut self, code: u64) -> Result<(), EngineError> {
        self.ensure_stopped("set failure domain")?;
        self.failure_domain = code;
        Ok(())
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.running.is_some() {
            return Err(misuse("node is already running"));
        }

        let addr: SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| failure(format!("invalid bind address {:?}: {e}", self.bind_address)))?;
        let listener =
            TcpListener::bind(addr).map_err(|e| failure(format!("bind {addr}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| failure(format!("listener {addr}: {e}")))?;
        let bound = listener
            .local_addr()
            .map_err(|e| failure(format!("listener {addr}: {e}")))?;

        let mut members = self.cluster()?;
        if members.is_empty() {
            members = vec![NodeInfo::voter(self.id, self.address.clone())];
            self.store
                .replace(&members)
                .map_err(|e| failure(format!("bootstrap: {e}")))?;
            info!(node_id = self.id, "bootstrapped single-node cluster");
        } else if !members.iter().any(|m| m.id == self.id) {
            warn!(node_id = self.id, "node is not part of its own cluster configuration");
        }

        lock(&self.peers.outbound).clear();
        lock(&self.peers.inbound).clear();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(2);
        let spawned = self
            .spawn_acceptor(listener, shutdown_rx.clone())
            .and_then(|acceptor| {
                workers.push(acceptor);
                self.spawn_connector(members.clone(), shutdown_rx)
            });
        match spawned {
            Ok(connector) => workers.push(connector),
            Err(e) => {
                let _ = shutdown.send(true);
                for worker in workers {
                    let _ = worker.join();
                }
                return Err(failure(format!("spawn worker: {e}")));
            }
        }

        info!(
            node_id = self.id,
            %bound,
            members = members.len(),
            failure_domain = self.failure_domain,
            "engine started"
        );
        self.running = Some(Running {
            shutdown,
            bound,
            workers,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        let Some(running) = self.running.take() else {
            return Err(misuse("node is not running"));
        };

        let _ = running.shutdown.send(true);
        let crashed = running
            .workers
            .into_iter()
            .map(|w| w.join())
            .filter(Result::is_err)
            .count();

        lock(&self.peers.outbound).clear();
        lock(&self.peers.inbound).clear();

        if crashed > 0 {
            return Err(failure(format!("{crashed} worker thread(s) panicked")));
        }
        info!(node_id = self.id, "engine stopped");
        Ok(())
    }

    unsafe fn recover(&mut self, infos: &mut [NodeInfoExt]) -> Result<(), EngineError> {
        self.ensure_stopped("recover")?;
        if infos.is_empty() {
            return Err(misuse("empty cluster configuration"));
        }

        // SAFETY: the caller guarantees the address pointers are live.
        let members = unsafe { membership::decode(infos) }.map_err(|e| misuse(e.to_string()))?;
        membership::validate(&members).map_err(|e| misuse(e.to_string()))?;

        self.store
            .replace(&members)
            .map_err(|e| failure(format!("persist cluster configuration: {e}")))?;
        info!(node_id = self.id, members = members.len(), "cluster configuration recovered");
        Ok(())
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        if self.running.is_some() {
            if let Err(e) = self.stop() {
                warn!(node_id = self.id, error = %e, "engine did not stop cleanly");
            }
        }
    }
}
