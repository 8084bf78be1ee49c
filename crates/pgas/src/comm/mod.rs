//! Connection Manager and Message Engine
//!
//! Bring-up performed by every node:
//!
//! 1. Bind a TCP listener on the configured port and start accepting.
//! 2. Connect to every other node, retrying for up to
//!    [`ClusterConfig::connect_retries`] attempts at one-second intervals,
//!    and send the bare `u32` node id as the very first bytes. The socket is
//!    retained as both the outbound request socket and the inbound response
//!    socket for that peer.
//! 3. Identify each accepted connection by its id preamble, falling back to
//!    the source IP, then to the next empty slot, and hand it to a dedicated
//!    handler task.
//!
//! For every ordered pair (X, Y) there are exactly two connections: the one
//! X initiated (X's requests and responses to X, Y's inbound service) and
//! the one Y initiated. Responses never traverse the reverse socket; the
//! per-peer pair lock is held for the whole of [`CommEngine::send_recv`] to
//! keep request and response adjacent on the initiated socket.
//!
//! Lock order: pair lock, then the peer socket slot, then the send lock.
//! Bring-up and teardown take only the slot locks; handler tasks take no
//! client-side locks at all.

pub mod handler;
pub mod wire;

use crate::config::ClusterConfig;
use crate::error::{PgasError, Result};
use crate::runtime::NodeCore;
use crossbeam::channel;
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use wire::Frame;

/// Pause between connect attempts during bring-up
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout for reading the id preamble off an accepted connection
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-peer connection state
#[derive(Debug)]
struct PeerSlot {
    /// Socket this process initiated toward the peer; carries our requests
    /// out and their responses back
    request_sock: RwLock<Option<TcpStream>>,
    /// Clone of the initiated socket; teardown closes it without waiting
    /// for a blocked reader to release the slot
    request_shutdown: Mutex<Option<TcpStream>>,
    /// Clone of the socket the peer initiated toward us, kept for teardown
    accepted_sock: Mutex<Option<TcpStream>>,
    /// Held for the whole of a send_recv exchange
    pair_lock: Mutex<()>,
    active: AtomicBool,
}

impl PeerSlot {
    fn new() -> Self {
        Self {
            request_sock: RwLock::new(None),
            request_shutdown: Mutex::new(None),
            accepted_sock: Mutex::new(None),
            pair_lock: Mutex::new(()),
            active: AtomicBool::new(false),
        }
    }
}

/// Point-to-point request/response engine over the peer socket pairs
#[derive(Debug)]
pub struct CommEngine {
    local_id: u16,
    num_nodes: u16,
    local_port: u16,
    peers: Vec<PeerSlot>,
    /// Resolved peer addresses, indexed by node id
    peer_ips: Vec<Option<IpAddr>>,
    /// Serializes writes on any request socket so fire-and-forget frames
    /// never interleave with a send_recv request
    send_lock: Mutex<()>,
    next_request_id: AtomicU64,
    running: AtomicBool,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
    dispatcher_thread: Mutex<Option<JoinHandle<()>>>,
    handler_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CommEngine {
    /// Bind, accept, and connect to every peer
    ///
    /// Fails with [`PgasError::ConnectIncomplete`] when no peer could be
    /// reached in a multi-node ensemble; proceeds in degraded mode when at
    /// least one peer connected.
    pub(crate) fn start(config: &ClusterConfig, core: Arc<NodeCore>) -> Result<Arc<CommEngine>> {
        let local = config.local_node();
        let listener = TcpListener::bind(("0.0.0.0", local.port)).map_err(|e| {
            PgasError::Communication {
                node_id: config.local_node_id,
                reason: format!("cannot bind port {}: {}", local.port, e),
            }
        })?;

        let peer_ips = config
            .nodes
            .iter()
            .map(|node| resolve_ip(&node.hostname, node.port))
            .collect();

        let engine = Arc::new(CommEngine {
            local_id: config.local_node_id,
            num_nodes: config.num_nodes,
            local_port: local.port,
            peers: (0..config.num_nodes).map(|_| PeerSlot::new()).collect(),
            peer_ips,
            send_lock: Mutex::new(()),
            next_request_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
            listener_thread: Mutex::new(None),
            dispatcher_thread: Mutex::new(None),
            handler_threads: Mutex::new(Vec::new()),
        });

        let (accept_tx, accept_rx) = channel::unbounded::<TcpStream>();

        let listener_engine = Arc::clone(&engine);
        *engine.listener_thread.lock() = Some(
            std::thread::Builder::new()
                .name("pgas-listener".to_string())
                .spawn(move || listener_engine.listener_loop(listener, accept_tx))
                .map_err(|e| PgasError::Internal(format!("spawn listener: {}", e)))?,
        );

        let dispatcher_engine = Arc::clone(&engine);
        let dispatcher_core = Arc::clone(&core);
        *engine.dispatcher_thread.lock() = Some(
            std::thread::Builder::new()
                .name("pgas-dispatch".to_string())
                .spawn(move || dispatcher_engine.dispatcher_loop(accept_rx, dispatcher_core))
                .map_err(|e| PgasError::Internal(format!("spawn dispatcher: {}", e)))?,
        );

        engine.connect_peers(config);

        let connected = engine.connected_peers();
        let expected = config.num_nodes as usize - 1;
        if connected == 0 && config.num_nodes > 1 {
            engine.shutdown();
            return Err(PgasError::ConnectIncomplete {
                connected: 0,
                expected,
            });
        }
        if connected < expected {
            log::warn!(
                "bring-up degraded: {} of {} peers connected",
                connected,
                expected
            );
        }

        Ok(engine)
    }

    /// Next request id for an outgoing frame
    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether the peer's outbound socket is usable
    pub fn is_active(&self, node_id: u16) -> bool {
        self.peers
            .get(node_id as usize)
            .map(|slot| slot.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Number of peers with a usable outbound socket
    pub fn connected_peers(&self) -> usize {
        self.peers
            .iter()
            .filter(|slot| slot.active.load(Ordering::Acquire))
            .count()
    }

    /// Send a request and receive its response on the initiated socket
    ///
    /// The per-peer pair lock is held for the entire exchange; this is what
    /// pairs each response with its request.
    pub fn send_recv(&self, node_id: u16, frame: &Frame) -> Result<Frame> {
        let slot = self.slot(node_id)?;
        let _pair = slot.pair_lock.lock();

        let guard = slot.request_sock.read();
        let sock = guard.as_ref().ok_or_else(|| self.not_connected(node_id))?;

        {
            let _send = self.send_lock.lock();
            wire::write_frame(&mut &*sock, frame)
                .map_err(|e| self.comm_failed(node_id, "send", e))?;
        }

        wire::read_frame(&mut &*sock).map_err(|e| self.comm_failed(node_id, "recv", e))
    }

    /// Fire-and-forget send on the initiated socket
    pub fn send(&self, node_id: u16, frame: &Frame) -> Result<()> {
        let slot = self.slot(node_id)?;
        let guard = slot.request_sock.read();
        let sock = guard.as_ref().ok_or_else(|| self.not_connected(node_id))?;

        let _send = self.send_lock.lock();
        wire::write_frame(&mut &*sock, frame).map_err(|e| self.comm_failed(node_id, "send", e))
    }

    /// Receive one frame from the peer's initiated socket
    ///
    /// Used by the barrier collect phase; takes the pair lock so it cannot
    /// steal a send_recv response.
    pub fn recv(&self, node_id: u16) -> Result<Frame> {
        let slot = self.slot(node_id)?;
        let _pair = slot.pair_lock.lock();

        let guard = slot.request_sock.read();
        let sock = guard.as_ref().ok_or_else(|| self.not_connected(node_id))?;

        wire::read_frame(&mut &*sock).map_err(|e| self.comm_failed(node_id, "recv", e))
    }

    /// Close every socket, stop the service threads, and join them
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Shut the sockets down through the teardown clones first: a thread
        // blocked in send_recv holds the slot read lock until its read
        // returns, so the slot itself cannot be drained yet.
        for slot in &self.peers {
            slot.active.store(false, Ordering::Release);
            if let Some(sock) = slot.request_shutdown.lock().take() {
                let _ = sock.shutdown(Shutdown::Both);
            }
            if let Some(sock) = slot.accepted_sock.lock().take() {
                let _ = sock.shutdown(Shutdown::Both);
            }
        }

        // Wake the accept loop so it can observe the stopped flag
        let _ = TcpStream::connect_timeout(
            &SocketAddr::from(([127, 0, 0, 1], self.local_port)),
            Duration::from_millis(200),
        );

        if let Some(handle) = self.listener_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher_thread.lock().take() {
            let _ = handle.join();
        }
        for handle in self.handler_threads.lock().drain(..) {
            let _ = handle.join();
        }

        for slot in &self.peers {
            slot.request_sock.write().take();
        }
    }

    fn slot(&self, node_id: u16) -> Result<&PeerSlot> {
        if node_id == self.local_id {
            return Err(PgasError::InvalidArgument(format!(
                "node {} is the local node",
                node_id
            )));
        }
        self.peers.get(node_id as usize).ok_or_else(|| {
            PgasError::InvalidArgument(format!("node {} out of range", node_id))
        })
    }

    fn not_connected(&self, node_id: u16) -> PgasError {
        PgasError::Communication {
            node_id,
            reason: "peer not connected".to_string(),
        }
    }

    fn comm_failed(&self, node_id: u16, what: &str, err: std::io::Error) -> PgasError {
        PgasError::Communication {
            node_id,
            reason: format!("{} failed: {}", what, err),
        }
    }

    /// Outbound half of bring-up
    fn connect_peers(&self, config: &ClusterConfig) {
        for node in &config.nodes {
            if node.node_id == self.local_id {
                continue;
            }

            match self.connect_one(config, node.node_id, &node.endpoint()) {
                Some(sock) => {
                    log::info!(
                        "node {}: peer {} connected ({})",
                        self.local_id,
                        node.node_id,
                        node.endpoint()
                    );
                    let slot = &self.peers[node.node_id as usize];
                    if let Ok(clone) = sock.try_clone() {
                        *slot.request_shutdown.lock() = Some(clone);
                    }
                    *slot.request_sock.write() = Some(sock);
                    slot.active.store(true, Ordering::Release);
                }
                None => {
                    log::warn!(
                        "node {}: peer {} unreachable ({})",
                        self.local_id,
                        node.node_id,
                        node.endpoint()
                    );
                }
            }
        }
    }

    fn connect_one(
        &self,
        config: &ClusterConfig,
        node_id: u16,
        endpoint: &str,
    ) -> Option<TcpStream> {
        for attempt in 0..config.connect_retries {
            if !self.running.load(Ordering::Acquire) {
                return None;
            }
            if attempt > 0 {
                std::thread::sleep(RETRY_INTERVAL);
            }

            let addrs: Vec<SocketAddr> = match endpoint.to_socket_addrs() {
                Ok(addrs) => addrs.collect(),
                Err(e) => {
                    log::debug!("peer {}: resolve failed: {}", node_id, e);
                    continue;
                }
            };

            for addr in addrs {
                let sock = match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                    Ok(sock) => sock,
                    Err(e) => {
                        log::debug!("peer {}: connect {} failed: {}", node_id, addr, e);
                        continue;
                    }
                };

                let _ = sock.set_nodelay(true);
                let _ = sock.set_write_timeout(Some(config.connect_timeout));

                // Identify ourselves: four raw little-endian bytes
                let preamble = u32::from(self.local_id).to_le_bytes();
                if let Err(e) = std::io::Write::write_all(&mut &sock, &preamble) {
                    log::debug!("peer {}: preamble failed: {}", node_id, e);
                    continue;
                }

                // Request/response traffic blocks without a deadline
                let _ = sock.set_write_timeout(None);
                let _ = sock.set_read_timeout(None);
                return Some(sock);
            }
        }
        None
    }

    fn listener_loop(&self, listener: TcpListener, accept_tx: channel::Sender<TcpStream>) {
        loop {
            match listener.accept() {
                Ok((sock, addr)) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    log::debug!("accepted connection from {}", addr);
                    if accept_tx.send(sock).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    log::warn!("accept failed: {}", e);
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    fn dispatcher_loop(&self, accept_rx: channel::Receiver<TcpStream>, core: Arc<NodeCore>) {
        for sock in accept_rx.iter() {
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let peer_id = match self.identify_peer(&sock) {
                Some(peer_id) => peer_id,
                None => {
                    log::warn!("dropping unidentifiable inbound connection");
                    continue;
                }
            };

            if let Ok(clone) = sock.try_clone() {
                *self.peers[peer_id as usize].accepted_sock.lock() = Some(clone);
            }
            log::info!(
                "node {}: inbound connection from peer {}",
                self.local_id,
                peer_id
            );

            let handler_core = Arc::clone(&core);
            let handle = std::thread::Builder::new()
                .name(format!("pgas-peer{}", peer_id))
                .spawn(move || handler::serve(sock, handler_core));
            match handle {
                Ok(handle) => self.handler_threads.lock().push(handle),
                Err(e) => log::warn!("cannot spawn handler for peer {}: {}", peer_id, e),
            }
        }
    }

    /// Map an accepted connection to a peer slot
    ///
    /// Primary: the id preamble. Fallbacks: the source IP, then the next
    /// empty slot (diagnostic only).
    fn identify_peer(&self, sock: &TcpStream) -> Option<u16> {
        let _ = sock.set_read_timeout(Some(HANDSHAKE_TIMEOUT));
        let mut preamble = [0u8; 4];
        let declared = match std::io::Read::read_exact(&mut &*sock, &mut preamble) {
            Ok(()) => Some(u32::from_le_bytes(preamble)),
            Err(e) => {
                log::debug!("no id preamble on inbound connection: {}", e);
                None
            }
        };
        let _ = sock.set_read_timeout(None);
        let _ = sock.set_nodelay(true);

        if let Some(id) = declared {
            let id = id as u16;
            if id < self.num_nodes && id != self.local_id {
                return Some(id);
            }
            log::warn!("inbound connection declared invalid id {}", id);
        }

        if let Ok(addr) = sock.peer_addr() {
            for (node_id, ip) in self.peer_ips.iter().enumerate() {
                if node_id as u16 != self.local_id && *ip == Some(addr.ip()) {
                    log::warn!("identified peer {} by source address {}", node_id, addr);
                    return Some(node_id as u16);
                }
            }
        }

        for (node_id, slot) in self.peers.iter().enumerate() {
            if node_id as u16 != self.local_id && slot.accepted_sock.lock().is_none() {
                log::warn!("assigning inbound connection to empty slot {}", node_id);
                return Some(node_id as u16);
            }
        }
        None
    }
}

impl Drop for CommEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve_ip(hostname: &str, port: u16) -> Option<IpAddr> {
    (hostname, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
}
