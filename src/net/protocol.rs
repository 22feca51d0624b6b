//! Network core: configuration, events and the owning state value
//!
//! Every shared table lives in one [`Network`] value behind its own
//! lock, handed by `Arc` to each task. Nothing here is a process-wide
//! static; tests run isolated instances side by side.

use super::addrbook::AddressBook;
use super::ban::BanList;
use super::connection;
use super::dialer;
use super::handler::{self, ProtocolHandler};
use super::local::LocalAddrs;
use super::peer::{PeerInfo, PeerSession};
use super::relay::RelayPool;
use super::sync::{ChainView, SyncEngine};
use super::types::{
    ASK_FOR_SPACING_SECS, AddrEntry, DEFAULT_BAN_SCORE, DEFAULT_BAN_SECS,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_OUTBOUND, DEFAULT_MAX_RECEIVE_BUFFER, DEFAULT_PORT,
    DUMP_ADDRESSES_SECS, Endpoint, Inv, MAX_CONNECTIONS, MAX_OUTBOUND_CONNECTIONS,
    MIN_CONNECTIONS, MIN_OUTBOUND_CONNECTIONS, NODE_NETWORK, NetAddress, NetworkClass,
    PROTOCOL_VERSION, VersionPayload,
};
use crate::types::{Hash, now};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Runtime configuration, mirroring the command-line surface. Limits
/// are clamped in [`Config::normalize`]; construction through
/// [`Network::new`] always normalizes.
#[derive(Debug, Clone)]
pub struct Config {
    /// Total connection budget (`-maxconnections`), clamped to [8, 1000].
    pub max_connections: usize,
    /// Outbound budget (`-maxoutbound`), clamped to [4, 100] and to
    /// `max_connections`.
    pub max_outbound: usize,
    /// Listen port (`-port`).
    pub port: u16,
    /// Default port assumed for addresses without one.
    pub default_port: u16,
    /// Accept inbound connections.
    pub listen: bool,
    /// Learn own addresses from binds and peers.
    pub discover: bool,
    /// `-connect`: dial only these destinations.
    pub connect: Vec<String>,
    /// `-addnode`: keep these destinations connected.
    pub add_nodes: Vec<String>,
    /// Destinations are resolved by a name proxy, not locally.
    pub name_proxy: bool,
    /// `-dnsseed`: consumed by the external seeding plumbing.
    pub dns_seed: bool,
    /// `-banscore`: misbehavior threshold.
    pub ban_score: u32,
    /// `-bantime`: ban duration, seconds.
    pub ban_time: i64,
    /// `-upnp`: consumed by the external port-mapping plumbing.
    pub upnp: bool,
    /// Receive-buffer high water mark, bytes.
    pub max_receive_buffer: usize,
    /// Service bits we advertise.
    pub services: u64,
    /// Sub-version string for the handshake.
    pub sub_version: String,

    // Sync engine knobs
    /// Checkpoint anchors seeding the slot partition.
    pub hardened_sync_points: BTreeMap<u32, Hash>,
    /// Global throttle between header scheduler passes, seconds.
    pub header_concurrent_poll_secs: i64,
    /// Global throttle between block scheduler passes, seconds.
    pub concurrent_poll_secs: i64,
    /// Spacing before re-sending an identical request span, seconds.
    pub concurrent_retry_secs: i64,
    /// Peers used per header scheduler pass.
    pub header_concurrent: usize,
    /// Peers used per block scheduler pass.
    pub concurrent: usize,
    /// Assumed chain length; peers advertising much less are not
    /// eligible for sync.
    pub max_block_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_outbound: DEFAULT_MAX_OUTBOUND,
            port: DEFAULT_PORT,
            default_port: DEFAULT_PORT,
            listen: true,
            discover: true,
            connect: Vec::new(),
            add_nodes: Vec::new(),
            name_proxy: false,
            dns_seed: true,
            ban_score: DEFAULT_BAN_SCORE,
            ban_time: DEFAULT_BAN_SECS,
            upnp: false,
            max_receive_buffer: DEFAULT_MAX_RECEIVE_BUFFER,
            services: NODE_NETWORK,
            sub_version: format!("/farthing:{}/", env!("CARGO_PKG_VERSION")),
            hardened_sync_points: BTreeMap::new(),
            header_concurrent_poll_secs: 2,
            concurrent_poll_secs: 2,
            concurrent_retry_secs: 30,
            header_concurrent: 8,
            concurrent: 8,
            max_block_count: 400_000,
        }
    }
}

impl Config {
    /// Clamp limits into their sane ranges.
    pub fn normalize(mut self) -> Self {
        self.max_connections = self.max_connections.clamp(MIN_CONNECTIONS, MAX_CONNECTIONS);
        self.max_outbound = self
            .max_outbound
            .clamp(MIN_OUTBOUND_CONNECTIONS, MAX_OUTBOUND_CONNECTIONS)
            .min(self.max_connections);
        self
    }
}

// =============================================================================
// ERRORS AND EVENTS
// =============================================================================

#[derive(Debug, Error)]
pub enum NetError {
    /// Fatal at startup.
    #[error("{0}")]
    Bind(String),
    #[error("connect to {0} failed")]
    ConnectFailed(String),
    #[error("shutting down")]
    ShuttingDown,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle notifications published to the embedder.
#[derive(Debug, Clone)]
pub enum NetEvent {
    Connected { endpoint: Endpoint, inbound: bool },
    Disconnected { endpoint: Endpoint },
    Banned { addr: NetAddress },
    CountChanged(usize),
}

/// Point-in-time counters for RPC surfaces.
#[derive(Debug, Clone)]
pub struct NetworkStats {
    pub peers: usize,
    pub inbound: usize,
    pub outbound: usize,
    pub banned: usize,
    pub addresses: usize,
}

// =============================================================================
// NETWORK CORE
// =============================================================================

/// The owning value for the whole P2P core. One per node.
pub struct Network {
    pub config: Config,

    peers: StdMutex<Vec<Arc<PeerSession>>>,
    listeners: StdMutex<Vec<std::net::TcpListener>>,
    book: Arc<dyn AddressBook>,
    chain: Arc<dyn ChainView>,
    local: StdMutex<LocalAddrs>,
    bans: StdMutex<BanList>,
    relay: StdMutex<RelayPool>,
    one_shots: StdMutex<VecDeque<String>>,
    addnode_addrs: StdMutex<HashSet<NetAddress>>,
    already_asked_for: StdMutex<HashMap<Inv, i64>>,
    outbound_sem: Arc<Semaphore>,
    sync: Mutex<SyncEngine>,

    shutdown: AtomicBool,
    events: mpsc::UnboundedSender<NetEvent>,
    /// Nonce carried in our version payloads; receiving it back means a
    /// self-connection.
    local_nonce: u64,
}

impl Network {
    pub fn new(
        config: Config,
        book: Arc<dyn AddressBook>,
        chain: Arc<dyn ChainView>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NetEvent>) {
        let config = config.normalize();
        let (events, events_rx) = mpsc::unbounded_channel();
        let permits = config.max_outbound.min(config.max_connections);
        let discover = config.discover;
        let net = Arc::new(Self {
            config,
            peers: StdMutex::new(Vec::new()),
            listeners: StdMutex::new(Vec::new()),
            book,
            chain,
            local: StdMutex::new(LocalAddrs::new(discover)),
            bans: StdMutex::new(BanList::new()),
            relay: StdMutex::new(RelayPool::new()),
            one_shots: StdMutex::new(VecDeque::new()),
            addnode_addrs: StdMutex::new(HashSet::new()),
            already_asked_for: StdMutex::new(HashMap::new()),
            outbound_sem: Arc::new(Semaphore::new(permits)),
            sync: Mutex::new(SyncEngine::new()),
            shutdown: AtomicBool::new(false),
            events,
            local_nonce: rand::random(),
        });
        (net, events_rx)
    }

    // -------------------------------------------------------------------------
    // Task lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the long-lived tasks: reactor, message handler, general
    /// dialer, added-node dialer and address dumper.
    pub fn start(self: &Arc<Self>, protocol: Arc<dyn ProtocolHandler>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(connection::reactor_loop(Arc::clone(self))),
            tokio::spawn(handler::message_handler_loop(Arc::clone(self), protocol)),
            tokio::spawn(dialer::open_connections_loop(Arc::clone(self))),
            tokio::spawn(dialer::added_connections_loop(Arc::clone(self))),
            tokio::spawn(address_dump_loop(Arc::clone(self))),
        ]
    }

    /// Shut down: raise the flag, post permits so blocked dialers wake,
    /// give tasks up to 20 seconds to drain, then flush the book.
    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) {
        info!("stopping network");
        self.shutdown.store(true, Ordering::SeqCst);
        self.outbound_sem.add_permits(self.config.max_outbound);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("task still running at shutdown deadline");
                break;
            }
        }

        if let Err(err) = self.book.dump() {
            warn!("final address dump failed: {}", err);
        }
        info!("network stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.outbound_sem.add_permits(self.config.max_outbound);
    }

    // -------------------------------------------------------------------------
    // Collaborators
    // -------------------------------------------------------------------------

    pub fn book(&self) -> &dyn AddressBook {
        &*self.book
    }

    pub fn chain(&self) -> &dyn ChainView {
        &*self.chain
    }

    pub fn sync_engine(&self) -> &Mutex<SyncEngine> {
        &self.sync
    }

    pub(crate) fn outbound_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.outbound_sem)
    }

    /// Free outbound slots right now. The budget invariant: permits in
    /// flight plus available never exceed `max_outbound`.
    pub fn available_outbound_permits(&self) -> usize {
        self.outbound_sem.available_permits()
    }

    pub fn local_nonce(&self) -> u64 {
        self.local_nonce
    }

    pub(crate) fn emit(&self, event: NetEvent) {
        let _ = self.events.send(event);
    }

    // -------------------------------------------------------------------------
    // Peer set
    // -------------------------------------------------------------------------

    pub fn peer_snapshot(&self) -> Vec<Arc<PeerSession>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn add_peer(&self, peer: Arc<PeerSession>) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(peer);
    }

    /// Pull every disconnect-flagged session out of the live set.
    pub(crate) fn take_disconnected(&self) -> Vec<Arc<PeerSession>> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let mut dead = Vec::new();
        peers.retain(|p| {
            if p.is_disconnecting() {
                dead.push(Arc::clone(p));
                false
            } else {
                true
            }
        });
        dead
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn inbound_count(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|p| p.inbound)
            .count()
    }

    pub fn outbound_count(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|p| !p.inbound)
            .count()
    }

    /// Network groups with a live outbound connection, plus the
    /// outbound count. Snapshot for the dialer's diversity check.
    pub(crate) fn outbound_groups(&self) -> (HashSet<Vec<u8>>, usize) {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let mut groups = HashSet::new();
        let mut outbound = 0;
        for peer in peers.iter().filter(|p| !p.inbound) {
            groups.insert(peer.addr.addr.group_key());
            outbound += 1;
        }
        (groups, outbound)
    }

    pub fn find_node(&self, addr: &NetAddress) -> Option<Arc<PeerSession>> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.addr.addr == *addr)
            .cloned()
    }

    pub fn find_node_by_endpoint(&self, endpoint: &Endpoint) -> Option<Arc<PeerSession>> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.addr == *endpoint)
            .cloned()
    }

    pub fn find_node_by_name(&self, name: &str) -> Option<Arc<PeerSession>> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.addr_name == name)
            .cloned()
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peer_snapshot().iter().map(|p| p.info()).collect()
    }

    /// Ask for a mid-session reset of this peer's sync context.
    pub fn reset_peer(&self, peer: &Arc<PeerSession>) -> bool {
        peer.request_reset()
    }

    // -------------------------------------------------------------------------
    // Bans and misbehavior
    // -------------------------------------------------------------------------

    pub fn is_banned(&self, addr: &NetAddress) -> bool {
        self.bans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_banned(addr)
    }

    /// Manual ban (RPC setban). Last-writer-wins on the longer ban.
    pub fn ban_address(&self, addr: NetAddress, until: i64) {
        self.bans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ban_until(addr, until);
    }

    pub fn clear_banned(&self) {
        self.bans.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn banned_count(&self) -> usize {
        self.bans.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Charge `delta` misbehavior to a peer. Crossing `-banscore` bans
    /// the address for `-bantime` and disconnects the session.
    /// Local addresses never accrue bans.
    pub async fn misbehaving(&self, peer: &Arc<PeerSession>, delta: u32) -> bool {
        if peer.addr.addr.is_local() {
            warn!("local node {} misbehaving (delta: {})", peer.addr_name, delta);
            return false;
        }
        let total = peer.misbehavior.fetch_add(delta, Ordering::SeqCst) + delta;
        if total >= self.config.ban_score {
            let until = now() + self.config.ban_time;
            info!(
                "misbehaving: {} ({} -> {}) disconnecting",
                peer.addr_name,
                total - delta,
                total
            );
            self.bans
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .ban_until(peer.addr.addr, until);
            self.emit(NetEvent::Banned { addr: peer.addr.addr });
            peer.close_socket_disconnect().await;
            true
        } else {
            debug!(
                "misbehaving: {} ({} -> {})",
                peer.addr_name,
                total - delta,
                total
            );
            false
        }
    }

    // -------------------------------------------------------------------------
    // Local addresses
    // -------------------------------------------------------------------------

    /// Record one of our own addresses. Advertising happens on the next
    /// [`Network::advertize_local`] pass.
    pub fn add_local(&self, endpoint: Endpoint, score: i32) -> bool {
        self.local
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_local(endpoint, score)
    }

    /// A peer reported seeing us at `endpoint`; re-advertise if the
    /// vote changed the ranking.
    pub async fn seen_local(&self, endpoint: &Endpoint) -> bool {
        let seen = self
            .local
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seen_local(endpoint);
        if seen {
            self.advertize_local().await;
        }
        seen
    }

    pub fn get_local_for_peer(&self, peer: Option<&NetAddress>) -> Option<Endpoint> {
        self.local
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_local_for_peer(peer)
    }

    pub fn is_local_endpoint(&self, endpoint: &Endpoint) -> bool {
        self.local
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_local(&endpoint.addr)
    }

    pub fn set_limited(&self, net: NetworkClass, limited: bool) {
        self.local
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_limited(net, limited);
    }

    pub fn is_limited_addr(&self, addr: &NetAddress) -> bool {
        self.local
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_limited_addr(addr)
    }

    /// Whether we can probably connect into the address's network class.
    pub fn is_reachable(&self, addr: &NetAddress) -> bool {
        self.local
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_reachable(addr)
    }

    /// Push our current best local address to every handshake-complete
    /// peer that has not been told it yet.
    pub async fn advertize_local(&self) {
        for peer in self.peer_snapshot() {
            if !peer.is_successfully_connected() {
                continue;
            }
            let best = self.get_local_for_peer(Some(&peer.addr.addr));
            let Some(best) = best else { continue };
            if !best.addr.is_routable() {
                continue;
            }
            let stale = {
                let advertised = peer
                    .advertised_local
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                *advertised != Some(best)
            };
            if stale {
                peer.push_address(&AddrEntry::new(best, self.config.services))
                    .await;
                *peer
                    .advertised_local
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(best);
            }
        }
    }

    // -------------------------------------------------------------------------
    // One-shots and added nodes
    // -------------------------------------------------------------------------

    /// Queue an opaque destination for a one-shot address exchange.
    pub fn add_one_shot(&self, dest: String) {
        self.one_shots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(dest);
    }

    pub(crate) fn pop_one_shot(&self) -> Option<String> {
        self.one_shots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub(crate) fn register_addnode_addr(&self, addr: NetAddress) {
        self.addnode_addrs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr);
    }

    /// Addresses behind `-addnode` entries; exempt from the inbound cap
    /// and the inbound ban check.
    pub fn is_addnode_addr(&self, addr: &NetAddress) -> bool {
        self.addnode_addrs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(addr)
    }

    // -------------------------------------------------------------------------
    // Request spacing
    // -------------------------------------------------------------------------

    /// Global spacing for repeat getdata of the same inventory id.
    pub fn should_ask_for(&self, inv: &Inv, t: i64) -> bool {
        let mut asked = self
            .already_asked_for
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match asked.get(inv) {
            Some(&last) if t - last < ASK_FOR_SPACING_SECS => false,
            _ => {
                asked.insert(*inv, t);
                true
            }
        }
    }

    // -------------------------------------------------------------------------
    // Relay
    // -------------------------------------------------------------------------

    /// Cache a broadcast payload and announce it to relay-willing
    /// peers, respecting their optional filters.
    pub async fn relay_message(&self, inv: Inv, payload: Vec<u8>) {
        {
            let mut relay = self.relay.lock().unwrap_or_else(|e| e.into_inner());
            relay.insert(inv, payload.clone());
        }
        for peer in self.peer_snapshot() {
            if !peer.relay_txes.load(Ordering::SeqCst) {
                continue;
            }
            let relevant = {
                let mut filter = peer.filter.lock().unwrap_or_else(|e| e.into_inner());
                match filter.as_mut() {
                    Some(filter) => filter.is_relevant_and_update(&inv, &payload),
                    None => true,
                }
            };
            if relevant {
                peer.push_inventory(inv).await;
            }
        }
    }

    /// Serve a cached relay payload if it has not expired.
    pub fn relayed_payload(&self, inv: &Inv) -> Option<Vec<u8>> {
        self.relay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(inv)
            .map(|b| b.to_vec())
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    /// Queue our version message on a freshly connected session.
    pub async fn push_version(&self, peer: &Arc<PeerSession>) {
        let unspecified = Endpoint::from(SocketAddr::from(([0, 0, 0, 0], 0)));
        let addr_recv = if peer.addr.addr.is_routable() {
            peer.addr
        } else {
            unspecified
        };
        let addr_from = self
            .get_local_for_peer(Some(&peer.addr.addr))
            .unwrap_or(unspecified);
        let payload = VersionPayload {
            version: PROTOCOL_VERSION,
            services: self.config.services,
            timestamp: now(),
            addr_recv: AddrEntry::new(addr_recv, 0),
            addr_from: AddrEntry::new(addr_from, self.config.services),
            nonce: self.local_nonce,
            sub_version: self.config.sub_version.clone(),
            start_height: self.chain.best_height(),
        };
        debug!(
            "send version: version {}, blocks {}, them {}",
            payload.version, payload.start_height, peer.addr_name
        );
        peer.push_payload("version", &payload).await;
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    pub(crate) fn add_listener(&self, listener: std::net::TcpListener) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Accept everything currently pending on the listen sockets.
    pub(crate) fn drain_pending_accepts(&self) -> Vec<(std::net::TcpStream, SocketAddr)> {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let mut accepted = Vec::new();
        for listener in listeners.iter() {
            loop {
                match listener.accept() {
                    Ok(pair) => accepted.push(pair),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        debug!("accept failed: {}", err);
                        break;
                    }
                }
            }
        }
        accepted
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            peers: self.peer_count(),
            inbound: self.inbound_count(),
            outbound: self.outbound_count(),
            banned: self.banned_count(),
            addresses: self.book.size(),
        }
    }
}

/// Flush the address book to disk every 100 seconds, and once more on
/// shutdown (from [`Network::stop`]).
async fn address_dump_loop(net: Arc<Network>) {
    loop {
        for _ in 0..DUMP_ADDRESSES_SECS {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if net.is_shutting_down() {
                return;
            }
        }
        let start = std::time::Instant::now();
        match net.book.dump() {
            Ok(()) => debug!(
                "flushed {} addresses to peers.dat in {}ms",
                net.book.size(),
                start.elapsed().as_millis()
            ),
            Err(err) => warn!("address dump failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::addrbook::AddrBook;

    struct TestChain;

    impl ChainView for TestChain {
        fn is_initial_block_download(&self) -> bool {
            false
        }
        fn best_height(&self) -> u32 {
            0
        }
        fn has_block(&self, _hash: &Hash) -> bool {
            false
        }
        fn has_orphan(&self, _hash: &Hash) -> bool {
            false
        }
        fn set_best_chain(&self, _hash: &Hash) -> bool {
            false
        }
        fn accept_orphan(&self, _hash: &Hash) -> bool {
            false
        }
    }

    fn network(config: Config) -> Arc<Network> {
        let (net, _events) = Network::new(config, Arc::new(AddrBook::new()), Arc::new(TestChain));
        net
    }

    fn peer(addr: &str, inbound: bool) -> Arc<PeerSession> {
        let sa: SocketAddr = addr.parse().unwrap();
        Arc::new(PeerSession::new(Endpoint::from(sa), "", inbound))
    }

    #[test]
    fn test_config_clamps() {
        let config = Config {
            max_connections: 5000,
            max_outbound: 500,
            ..Config::default()
        }
        .normalize();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.max_outbound, 100);

        let config = Config {
            max_connections: 2,
            max_outbound: 1,
            ..Config::default()
        }
        .normalize();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.max_outbound, 4);

        let config = Config {
            max_connections: 10,
            max_outbound: 50,
            ..Config::default()
        }
        .normalize();
        assert_eq!(config.max_outbound, 10);
    }

    #[tokio::test]
    async fn test_ban_threshold_scenario() {
        // -banscore 100, -bantime 3600
        let net = network(Config {
            ban_score: 100,
            ban_time: 3600,
            ..Config::default()
        });
        let p = peer("7.7.7.7:9556", true);
        net.add_peer(Arc::clone(&p));

        assert!(!net.misbehaving(&p, 40).await);
        assert!(!net.misbehaving(&p, 40).await);
        assert!(!net.misbehaving(&p, 10).await);
        assert!(!p.is_disconnecting());
        assert!(!net.is_banned(&p.addr.addr));

        // 90 + 20 = 110 crosses the threshold
        assert!(net.misbehaving(&p, 20).await);
        assert!(p.is_disconnecting());
        assert!(net.is_banned(&p.addr.addr));
    }

    #[tokio::test]
    async fn test_local_peer_never_banned() {
        let net = network(Config::default());
        let p = peer("127.0.0.1:9556", true);
        net.add_peer(Arc::clone(&p));
        assert!(!net.misbehaving(&p, 1000).await);
        assert!(!net.is_banned(&p.addr.addr));
    }

    #[test]
    fn test_take_disconnected() {
        let net = network(Config::default());
        let a = peer("1.1.1.1:9556", true);
        let b = peer("2.2.2.2:9556", false);
        net.add_peer(Arc::clone(&a));
        net.add_peer(Arc::clone(&b));

        a.disconnect.store(true, Ordering::SeqCst);
        let dead = net.take_disconnected();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].addr, a.addr);
        assert_eq!(net.peer_count(), 1);
    }

    #[test]
    fn test_outbound_groups() {
        let net = network(Config::default());
        net.add_peer(peer("1.2.3.4:9556", false));
        net.add_peer(peer("1.2.9.9:9556", false));
        net.add_peer(peer("5.6.7.8:9556", true)); // inbound, not counted

        let (groups, outbound) = net.outbound_groups();
        assert_eq!(outbound, 2);
        // both outbound peers share a /16
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_permit_budget() {
        let net = network(Config {
            max_outbound: 4,
            ..Config::default()
        });
        assert_eq!(net.available_outbound_permits(), 4);

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(net.outbound_permits().try_acquire_owned().unwrap());
        }
        assert!(net.outbound_permits().try_acquire_owned().is_err());

        // releasing one frees exactly one slot
        held.pop();
        assert_eq!(net.available_outbound_permits(), 1);
    }

    #[test]
    fn test_permit_released_by_session_teardown() {
        let net = network(Config {
            max_outbound: 4,
            ..Config::default()
        });
        let p = peer("1.2.3.4:9556", false);
        let permit = net.outbound_permits().try_acquire_owned().unwrap();
        p.grant_outbound(permit);
        assert_eq!(net.available_outbound_permits(), 3);

        p.release_outbound();
        assert_eq!(net.available_outbound_permits(), 4);
    }

    #[test]
    fn test_ask_for_spacing() {
        let net = network(Config::default());
        let inv = Inv::block([9u8; 32]);
        let t = now();
        assert!(net.should_ask_for(&inv, t));
        assert!(!net.should_ask_for(&inv, t + 10));
        assert!(net.should_ask_for(&inv, t + ASK_FOR_SPACING_SECS));
    }

    #[tokio::test]
    async fn test_relay_pool_via_network() {
        let net = network(Config::default());
        let inv = Inv::tx([3u8; 32]);
        net.relay_message(inv, vec![1, 2, 3]).await;
        assert_eq!(net.relayed_payload(&inv), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_relay_respects_relay_flag() {
        let net = network(Config::default());
        let p = peer("1.2.3.4:9556", true);
        net.add_peer(Arc::clone(&p));

        let inv = Inv::tx([4u8; 32]);
        net.relay_message(inv, vec![1]).await;
        assert!(p.inventory.lock().await.to_send.is_empty());

        p.relay_txes.store(true, Ordering::SeqCst);
        let inv2 = Inv::tx([5u8; 32]);
        net.relay_message(inv2, vec![2]).await;
        assert_eq!(p.inventory.lock().await.to_send, vec![inv2]);
    }

    #[test]
    fn test_one_shot_queue_fifo() {
        let net = network(Config::default());
        net.add_one_shot("seed.example.net".into());
        net.add_one_shot("other.example.net".into());
        assert_eq!(net.pop_one_shot().as_deref(), Some("seed.example.net"));
        assert_eq!(net.pop_one_shot().as_deref(), Some("other.example.net"));
        assert!(net.pop_one_shot().is_none());
    }
}
