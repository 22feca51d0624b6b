//! Per-peer session state and lifecycle

use super::relay::RelayFilter;
use super::types::{Endpoint, Inv, PROTOCOL_MAGIC};
use crate::types::{Hash, ZERO_HASH, now};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tracing::{debug, warn};

/// Mid-session reset rendezvous between the reactor (socket close), the
/// message handler (state clear) and the dialer (reconnect). Clearing
/// the remote peer's view of our sync context without giving up the
/// address book slot.
///
/// ```text
/// Idle -> WaitingForDisconnect -> WaitingForClearMsg -> WaitingForConnected -> Idle
///            (reactor)                (handler)             (dialer)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    Idle,
    WaitingForDisconnect,
    WaitingForClearMsg,
    WaitingForConnected,
}

/// Inventory-side state, guarded by the session's `inventory` lock.
#[derive(Default)]
pub struct InventoryState {
    /// Items the peer is known to have (announced or sent to it).
    pub known: HashSet<Inv>,
    /// Items queued for announcement to this peer.
    pub to_send: Vec<Inv>,
    /// Addresses already pushed to this peer.
    pub known_addresses: HashSet<Endpoint>,
    /// Continuation hash for a paged getblocks response.
    pub hash_continue: Hash,
    /// Last getblocks request span, for duplicate suppression.
    pub last_getblocks_begin: Hash,
    pub last_getblocks_end: Hash,
}

/// Outgoing data-request queue, guarded by the session's `requests` lock.
#[derive(Default)]
pub struct AskForQueue {
    queue: VecDeque<Inv>,
    queued: HashSet<Inv>,
}

impl AskForQueue {
    /// Queue an inventory item for getdata. Duplicates already queued on
    /// this peer are dropped.
    pub fn push(&mut self, inv: Inv) -> bool {
        if !self.queued.insert(inv) {
            return false;
        }
        self.queue.push_back(inv);
        true
    }

    pub fn pop(&mut self, max: usize) -> Vec<Inv> {
        let mut out = Vec::with_capacity(max.min(self.queue.len()));
        while out.len() < max {
            match self.queue.pop_front() {
                Some(inv) => {
                    self.queued.remove(&inv);
                    out.push(inv);
                }
                None => break,
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.queued.clear();
    }
}

/// A live (or resetting) connection to one remote peer.
///
/// Shared as `Arc<PeerSession>` between the reactor, the dialers and the
/// message handler; the reactor drops its reference once `disconnect`
/// is set and the allocation dies with the last holder.
///
/// Lock order when several are needed:
/// `send_buf` before `recv_buf` before `requests` before `inventory`.
pub struct PeerSession {
    /// Remote endpoint. Immutable after construction.
    pub addr: Endpoint,
    /// Address string, or the original destination name for peers dialed
    /// by name.
    pub addr_name: String,
    pub inbound: bool,
    /// Tear down after one address exchange.
    pub one_shot: AtomicBool,

    socket: Mutex<Option<TcpStream>>,
    pub send_buf: Mutex<Vec<u8>>,
    pub recv_buf: Mutex<Vec<u8>>,
    pub requests: Mutex<AskForQueue>,
    pub inventory: Mutex<InventoryState>,

    /// Teardown requested; the reactor reaps the session next tick.
    pub disconnect: AtomicBool,
    reset: StdMutex<ResetState>,

    // Handshake fields, written exactly once by the version hook.
    version: AtomicU32,
    services: AtomicU64,
    starting_height: AtomicU32,
    sub_version: StdMutex<String>,
    /// Peer advertised no NODE_NETWORK; unusable for sync.
    is_client: AtomicBool,
    successfully_connected: AtomicBool,
    pub relay_txes: AtomicBool,

    pub time_connected: AtomicI64,
    pub last_recv: AtomicI64,
    pub last_send: AtomicI64,
    pub last_send_empty: AtomicI64,

    /// Monotone non-decreasing within a session.
    pub misbehavior: AtomicU32,

    // Sync throughput accounting (60-second sampling windows).
    pub speed: AtomicU64,
    pub header_speed: AtomicU64,
    pub downloaded: AtomicU64,
    pub header_downloaded: AtomicU64,
    pub check_speed_time: AtomicI64,
    pub used: AtomicBool,
    pub header_used: AtomicBool,
    pub send_getheaders_time: AtomicI64,
    pub send_getdata_time: AtomicI64,
    getheaders_span: StdMutex<(Hash, Hash)>,
    getdata_span: StdMutex<(Hash, Hash)>,

    /// Held for the session's lifetime iff this is a permit-budgeted
    /// outbound connection; dropped (released) on teardown.
    outbound_permit: StdMutex<Option<OwnedSemaphorePermit>>,

    /// Optional relay filter installed by the protocol handler.
    pub filter: StdMutex<Option<Box<dyn RelayFilter>>>,

    /// Local address we last advertised to this peer.
    pub advertised_local: StdMutex<Option<Endpoint>>,
}

impl PeerSession {
    pub fn new(addr: Endpoint, addr_name: &str, inbound: bool) -> Self {
        let name = if addr_name.is_empty() {
            addr.to_string()
        } else {
            addr_name.to_string()
        };
        Self {
            addr,
            addr_name: name,
            inbound,
            one_shot: AtomicBool::new(false),
            socket: Mutex::new(None),
            send_buf: Mutex::new(Vec::new()),
            recv_buf: Mutex::new(Vec::new()),
            requests: Mutex::new(AskForQueue::default()),
            inventory: Mutex::new(InventoryState::default()),
            disconnect: AtomicBool::new(false),
            reset: StdMutex::new(ResetState::Idle),
            version: AtomicU32::new(0),
            services: AtomicU64::new(0),
            starting_height: AtomicU32::new(0),
            sub_version: StdMutex::new(String::new()),
            is_client: AtomicBool::new(false),
            successfully_connected: AtomicBool::new(false),
            relay_txes: AtomicBool::new(false),
            time_connected: AtomicI64::new(now()),
            last_recv: AtomicI64::new(0),
            last_send: AtomicI64::new(0),
            last_send_empty: AtomicI64::new(now()),
            misbehavior: AtomicU32::new(0),
            speed: AtomicU64::new(0),
            header_speed: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            header_downloaded: AtomicU64::new(0),
            check_speed_time: AtomicI64::new(0),
            used: AtomicBool::new(false),
            header_used: AtomicBool::new(false),
            send_getheaders_time: AtomicI64::new(0),
            send_getdata_time: AtomicI64::new(0),
            getheaders_span: StdMutex::new((ZERO_HASH, ZERO_HASH)),
            getdata_span: StdMutex::new((ZERO_HASH, ZERO_HASH)),
            outbound_permit: StdMutex::new(None),
            filter: StdMutex::new(None),
            advertised_local: StdMutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Socket
    // -------------------------------------------------------------------------

    pub async fn set_socket(&self, socket: TcpStream) {
        *self.socket.lock().await = Some(socket);
        self.time_connected.store(now(), Ordering::SeqCst);
    }

    /// Socket access for the reactor. Contended access skips a tick.
    pub fn try_socket(&self) -> Option<tokio::sync::MutexGuard<'_, Option<TcpStream>>> {
        self.socket.try_lock().ok()
    }

    pub async fn has_socket(&self) -> bool {
        self.socket.lock().await.is_some()
    }

    /// Normal teardown: mark for reaping and close immediately. The recv
    /// buffer is cleared opportunistically; a failed try-lock leaves it
    /// for the reaper.
    pub async fn close_socket_disconnect(&self) {
        self.disconnect.store(true, Ordering::SeqCst);
        let closed = self.socket.lock().await.take().is_some();
        if closed {
            debug!("disconnecting node {}", self.addr_name);
        }
        if let Ok(mut recv) = self.recv_buf.try_lock() {
            recv.clear();
        }
    }

    /// Reset teardown: close and drain buffers but leave the session
    /// alive. `disconnect` stays false on purpose; the dialer will
    /// reconnect this same session once its state has been cleared.
    pub async fn disconnect_for_reset(&self) {
        if self.socket.lock().await.take().is_some() {
            debug!("reset, disconnecting node {}", self.addr_name);
        }
        if let Ok(mut recv) = self.recv_buf.try_lock() {
            recv.clear();
        }
        if let Ok(mut send) = self.send_buf.try_lock() {
            send.clear();
        }
        self.set_reset(ResetState::WaitingForClearMsg);
    }

    // -------------------------------------------------------------------------
    // Reset state machine
    // -------------------------------------------------------------------------

    pub fn reset_state(&self) -> ResetState {
        *self.reset.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_reset(&self, state: ResetState) {
        *self.reset.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Ask for a mid-session reset. Only an idle session can enter the
    /// cycle.
    pub fn request_reset(&self) -> bool {
        let mut reset = self.reset.lock().unwrap_or_else(|e| e.into_inner());
        if *reset != ResetState::Idle {
            return false;
        }
        *reset = ResetState::WaitingForDisconnect;
        true
    }

    /// Handler-side step: drop all sync context the remote may still
    /// associate with us. Needs the inventory and requests locks; if
    /// either is contended the step is retried next handler pass.
    pub fn try_clear_for_reset(&self) -> bool {
        let Ok(mut inventory) = self.inventory.try_lock() else {
            return false;
        };
        let Ok(mut requests) = self.requests.try_lock() else {
            return false;
        };
        inventory.to_send.clear();
        inventory.known.clear();
        inventory.hash_continue = ZERO_HASH;
        inventory.last_getblocks_begin = ZERO_HASH;
        inventory.last_getblocks_end = ZERO_HASH;
        requests.clear();
        drop(requests);
        drop(inventory);
        self.set_reset(ResetState::WaitingForConnected);
        debug!("reset: cleared msg state, node {}", self.addr_name);
        true
    }

    // -------------------------------------------------------------------------
    // Handshake hooks (driven by the external protocol handler)
    // -------------------------------------------------------------------------

    /// Populate version-negotiated fields. First write wins; a repeated
    /// version message is the handler's problem, not ours.
    pub fn apply_version(
        &self,
        version: u32,
        services: u64,
        starting_height: u32,
        sub_version: &str,
    ) {
        if self
            .version
            .compare_exchange(0, version, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("duplicate version from {}", self.addr_name);
            return;
        }
        self.services.store(services, Ordering::SeqCst);
        self.starting_height.store(starting_height, Ordering::SeqCst);
        self.is_client
            .store(services & super::types::NODE_NETWORK == 0, Ordering::SeqCst);
        *self.sub_version.lock().unwrap_or_else(|e| e.into_inner()) = sub_version.to_string();
    }

    /// Verack received; the session is fully handshake-complete.
    pub fn mark_successfully_connected(&self) {
        self.successfully_connected.store(true, Ordering::SeqCst);
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn services(&self) -> u64 {
        self.services.load(Ordering::SeqCst)
    }

    pub fn starting_height(&self) -> u32 {
        self.starting_height.load(Ordering::SeqCst)
    }

    pub fn sub_version(&self) -> String {
        self.sub_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_client(&self) -> bool {
        self.is_client.load(Ordering::SeqCst)
    }

    pub fn is_successfully_connected(&self) -> bool {
        self.successfully_connected.load(Ordering::SeqCst)
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnect.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Send path
    // -------------------------------------------------------------------------

    /// Frame a command onto the send buffer:
    /// `magic | cmd_len u8 | cmd | payload_len u32le | payload`.
    /// The reactor drains the buffer to the socket in FIFO order.
    pub async fn push_message(&self, cmd: &str, payload: &[u8]) {
        let mut send = self.send_buf.lock().await;
        send.extend_from_slice(&PROTOCOL_MAGIC);
        send.push(cmd.len() as u8);
        send.extend_from_slice(cmd.as_bytes());
        send.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        send.extend_from_slice(payload);
    }

    /// Serialize and frame a core-originated payload.
    pub async fn push_payload<T: Serialize>(&self, cmd: &str, payload: &T) {
        match postcard::to_allocvec(payload) {
            Ok(bytes) => self.push_message(cmd, &bytes).await,
            Err(err) => warn!("encode {} for {} failed: {}", cmd, self.addr_name, err),
        }
    }

    /// Queue an address for relay to this peer, once per session.
    pub async fn push_address(&self, entry: &super::types::AddrEntry) {
        {
            let mut inventory = self.inventory.lock().await;
            if !inventory.known_addresses.insert(entry.endpoint) {
                return;
            }
        }
        self.push_payload("addr", &super::types::AddrPayload { addrs: vec![entry.clone()] })
            .await;
    }

    /// Queue an inventory announcement, skipping items the peer already
    /// knows.
    pub async fn push_inventory(&self, inv: Inv) {
        let mut inventory = self.inventory.lock().await;
        if inventory.known.contains(&inv) {
            return;
        }
        inventory.to_send.push(inv);
    }

    /// Queue a getdata request for later batching by the send hook.
    pub async fn ask_for(&self, inv: Inv) -> bool {
        self.requests.lock().await.push(inv)
    }

    // -------------------------------------------------------------------------
    // Traffic accounting
    // -------------------------------------------------------------------------

    pub fn record_recv(&self) {
        self.last_recv.store(now(), Ordering::SeqCst);
    }

    pub fn record_send(&self) {
        self.last_send.store(now(), Ordering::SeqCst);
    }

    /// Receive hook: block payload bytes ingested for this peer.
    pub fn record_block_bytes(&self, n: u64) {
        self.downloaded.fetch_add(n, Ordering::SeqCst);
    }

    /// Receive hook: header payload bytes ingested for this peer.
    pub fn record_header_bytes(&self, n: u64) {
        self.header_downloaded.fetch_add(n, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------
    // Sync request spans
    // -------------------------------------------------------------------------

    pub fn getheaders_span(&self) -> (Hash, Hash) {
        *self.getheaders_span.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_getheaders_span(&self, begin: Hash, end: Hash) {
        *self.getheaders_span.lock().unwrap_or_else(|e| e.into_inner()) = (begin, end);
    }

    pub fn getdata_span(&self) -> (Hash, Hash) {
        *self.getdata_span.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_getdata_span(&self, begin: Hash, end: Hash) {
        *self.getdata_span.lock().unwrap_or_else(|e| e.into_inner()) = (begin, end);
    }

    // -------------------------------------------------------------------------
    // Outbound permit
    // -------------------------------------------------------------------------

    /// Move an outbound permit into this session. Held until teardown.
    pub fn grant_outbound(&self, permit: OwnedSemaphorePermit) {
        *self
            .outbound_permit
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(permit);
    }

    /// Release the permit (drop returns it to the semaphore). Called
    /// exactly once, by the reactor's reaper.
    pub fn release_outbound(&self) {
        self.outbound_permit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn holds_permit(&self) -> bool {
        self.outbound_permit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stats snapshot for RPC surfaces.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            addr: self.addr,
            addr_name: self.addr_name.clone(),
            inbound: self.inbound,
            services: self.services(),
            version: self.version(),
            sub_version: self.sub_version(),
            starting_height: self.starting_height(),
            successfully_connected: self.is_successfully_connected(),
            time_connected: self.time_connected.load(Ordering::SeqCst),
            last_recv: self.last_recv.load(Ordering::SeqCst),
            last_send: self.last_send.load(Ordering::SeqCst),
            misbehavior: self.misbehavior.load(Ordering::SeqCst),
            speed: self.speed.load(Ordering::SeqCst),
            header_speed: self.header_speed.load(Ordering::SeqCst),
        }
    }
}

/// Peer stats clone-out for external queries.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: Endpoint,
    pub addr_name: String,
    pub inbound: bool,
    pub services: u64,
    pub version: u32,
    pub sub_version: String,
    pub starting_height: u32,
    pub successfully_connected: bool,
    pub time_connected: i64,
    pub last_recv: i64,
    pub last_send: i64,
    pub misbehavior: u32,
    pub speed: u64,
    pub header_speed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer(inbound: bool) -> PeerSession {
        let sa: SocketAddr = "1.2.3.4:9556".parse().unwrap();
        PeerSession::new(Endpoint::from(sa), "", inbound)
    }

    #[tokio::test]
    async fn test_push_message_framing() {
        let p = peer(false);
        p.push_message("ping", &[1, 2, 3]).await;
        let send = p.send_buf.lock().await;
        assert_eq!(&send[..4], &PROTOCOL_MAGIC);
        assert_eq!(send[4], 4);
        assert_eq!(&send[5..9], b"ping");
        assert_eq!(&send[9..13], &3u32.to_le_bytes());
        assert_eq!(&send[13..], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fifo_framing_order() {
        let p = peer(false);
        p.push_message("a", &[]).await;
        p.push_message("b", &[]).await;
        let send = p.send_buf.lock().await;
        let first_cmd = send[5] as char;
        assert_eq!(first_cmd, 'a');
    }

    #[test]
    fn test_apply_version_set_once() {
        let p = peer(true);
        p.apply_version(70002, 1, 1000, "/farthing:0.4.0/");
        p.apply_version(99999, 0, 5, "/other/");
        assert_eq!(p.version(), 70002);
        assert_eq!(p.starting_height(), 1000);
        assert!(!p.is_client());
    }

    #[test]
    fn test_client_flag_from_services() {
        let p = peer(true);
        p.apply_version(70002, 0, 1000, "");
        assert!(p.is_client());
    }

    #[test]
    fn test_reset_cycle() {
        let p = peer(false);
        assert_eq!(p.reset_state(), ResetState::Idle);
        assert!(p.request_reset());
        assert!(!p.request_reset());
        assert_eq!(p.reset_state(), ResetState::WaitingForDisconnect);
    }

    #[tokio::test]
    async fn test_reset_clear_wipes_sync_context() {
        let p = peer(false);
        {
            let mut inv = p.inventory.lock().await;
            inv.known.insert(Inv::block([1u8; 32]));
            inv.to_send.push(Inv::block([2u8; 32]));
            inv.hash_continue = [3u8; 32];
        }
        p.ask_for(Inv::block([4u8; 32])).await;
        p.set_reset(ResetState::WaitingForClearMsg);

        assert!(p.try_clear_for_reset());
        assert_eq!(p.reset_state(), ResetState::WaitingForConnected);
        let inv = p.inventory.lock().await;
        assert!(inv.known.is_empty());
        assert!(inv.to_send.is_empty());
        assert_eq!(inv.hash_continue, ZERO_HASH);
        assert!(p.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_for_reset_keeps_session_alive() {
        let p = peer(false);
        p.disconnect_for_reset().await;
        assert!(!p.is_disconnecting());
        assert_eq!(p.reset_state(), ResetState::WaitingForClearMsg);
    }

    #[tokio::test]
    async fn test_ask_for_dedup() {
        let p = peer(false);
        let inv = Inv::block([7u8; 32]);
        assert!(p.ask_for(inv).await);
        assert!(!p.ask_for(inv).await);
        let mut requests = p.requests.lock().await;
        assert_eq!(requests.len(), 1);
        let batch = requests.pop(10);
        assert_eq!(batch, vec![inv]);
    }

    #[tokio::test]
    async fn test_push_address_once_per_session() {
        let p = peer(false);
        let sa: SocketAddr = "5.6.7.8:9556".parse().unwrap();
        let entry = super::super::types::AddrEntry::new(Endpoint::from(sa), 1);
        p.push_address(&entry).await;
        p.push_address(&entry).await;
        let send = p.send_buf.lock().await;
        // one framed addr message only
        let count = send
            .windows(4)
            .filter(|w| *w == PROTOCOL_MAGIC)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_misbehavior_monotone() {
        let p = peer(true);
        p.misbehavior.fetch_add(40, Ordering::SeqCst);
        p.misbehavior.fetch_add(30, Ordering::SeqCst);
        assert_eq!(p.misbehavior.load(Ordering::SeqCst), 70);
    }
}
