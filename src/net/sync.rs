//! Parallel block synchronization over checkpoint-anchored slots
//!
//! The known-good height range is partitioned into slots anchored at
//! hardened sync points. Header and block requests are spread across
//! eligible peers, slowest-measured first so unused and slow peers get
//! the earliest slots and fast peers pick up the remainder. Throughput
//! is sampled per peer over 60-second windows.

use super::peer::PeerSession;
use super::protocol::Network;
use super::types::{
    GetHeadersPayload, Inv, MIN_GETHEADERS_VERSION, NOBLKS_VERSION_END, NOBLKS_VERSION_START,
};
use crate::types::{Hash, ZERO_HASH, now, short_hash};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// Blocks requested from one peer in a single batch.
const MAX_BLOCKS_ONCE: usize = 1000;

/// Sampling window for per-peer throughput, seconds.
const SPEED_SAMPLE_SECS: i64 = 60;

/// Chain-advance cadence, seconds.
const CHAIN_ADVANCE_SECS: i64 = 60;

/// Peers whose advertised height trails the assumed chain length by
/// more than this are not worth syncing from.
const STARTING_HEIGHT_SLACK: u32 = 144;

/// Chain state consumed by the sync engine. Validation and storage live
/// behind this boundary.
pub trait ChainView: Send + Sync {
    fn is_initial_block_download(&self) -> bool;
    fn best_height(&self) -> u32;
    /// Block is on disk (in the block index).
    fn has_block(&self, hash: &Hash) -> bool;
    /// Block is parked in the orphan map.
    fn has_orphan(&self, hash: &Hash) -> bool;
    /// Read the stored block and make it the chain tip.
    fn set_best_chain(&self, hash: &Hash) -> bool;
    /// Accept an orphan into the chain and evict it from the orphan map.
    fn accept_orphan(&self, hash: &Hash) -> bool;
}

/// One download slot: a height range owned by whichever peer the
/// scheduler assigns it to this tick.
///
/// `start_height` is the highest height known contiguously complete from
/// the slot anchor; it only ever moves forward. `end_height == 0` means
/// open-ended ("to tip"); only the last slot is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSlot {
    pub start_height: u32,
    pub end_height: u32,
}

impl SyncSlot {
    fn new(start_height: u32, end_height: u32) -> Self {
        Self { start_height, end_height }
    }

    pub fn covers(&self, height: u32) -> bool {
        height >= self.start_height && (self.end_height == 0 || height <= self.end_height)
    }
}

/// Build the slot partition from hardened sync points: one slot per
/// anchor, each earlier slot closed at the next anchor minus one, the
/// last slot open-ended.
pub fn build_slots(points: &BTreeMap<u32, Hash>) -> Vec<SyncSlot> {
    let mut slots: Vec<SyncSlot> = Vec::with_capacity(points.len());
    for (&height, _) in points {
        if let Some(prev) = slots.last_mut() {
            prev.end_height = height.saturating_sub(1);
        }
        slots.push(SyncSlot::new(height, 0));
    }
    slots
}

/// Scheduler state: the slot tables, the header indexes and the global
/// throttles. Owned by the network core, driven from the message-handler
/// thread while the chain reports initial download.
pub struct SyncEngine {
    header_slots: Vec<SyncSlot>,
    block_slots: Vec<SyncSlot>,
    height_to_hash: BTreeMap<u32, Hash>,
    hash_to_height: HashMap<Hash, u32>,
    header_poll_time: i64,
    block_poll_time: i64,
    chain_check_time: i64,
    initialized: bool,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self {
            header_slots: Vec::new(),
            block_slots: Vec::new(),
            height_to_hash: BTreeMap::new(),
            hash_to_height: HashMap::new(),
            header_poll_time: 0,
            block_poll_time: 0,
            chain_check_time: 0,
            initialized: false,
        }
    }

    /// Lazily seed slots and indexes from the hardened points.
    fn ensure_initialized(&mut self, points: &BTreeMap<u32, Hash>) {
        if self.initialized {
            return;
        }
        self.header_slots = build_slots(points);
        self.block_slots = build_slots(points);
        for (&height, &hash) in points {
            self.height_to_hash.insert(height, hash);
            self.hash_to_height.insert(hash, height);
        }
        self.initialized = true;
        debug!(
            "sync slots initialized: {} anchors, first {:?}",
            self.header_slots.len(),
            self.header_slots.first()
        );
    }

    /// Register a downloaded header whose parent height is known. Grows
    /// the height indexes the schedulers walk. Returns the new height.
    pub fn connect_header(&mut self, prev: &Hash, hash: Hash) -> Option<u32> {
        let height = self.hash_to_height.get(prev)? + 1;
        self.height_to_hash.entry(height).or_insert(hash);
        self.hash_to_height.entry(hash).or_insert(height);
        Some(height)
    }

    /// Register a header at an explicitly known height (checkpoint or
    /// externally validated).
    pub fn register_header(&mut self, height: u32, hash: Hash) {
        self.height_to_hash.entry(height).or_insert(hash);
        self.hash_to_height.entry(hash).or_insert(height);
    }

    pub fn height_of(&self, hash: &Hash) -> Option<u32> {
        self.hash_to_height.get(hash).copied()
    }

    pub fn hash_at(&self, height: u32) -> Option<Hash> {
        self.height_to_hash.get(&height).copied()
    }

    pub fn header_slots(&self) -> &[SyncSlot] {
        &self.header_slots
    }

    pub fn block_slots(&self) -> &[SyncSlot] {
        &self.block_slots
    }

    /// One scheduler pass: sample throughput, fan out header and block
    /// requests, advance the chain tip through completed heights.
    pub async fn tick(&mut self, net: &Network) {
        self.ensure_initialized(&net.config.hardened_sync_points);
        if self.header_slots.is_empty() {
            return;
        }

        let t = now();
        let peers = eligible_peers(net);
        for peer in &peers {
            sample_speed(peer, t);
        }

        self.sync_headers(net, &peers, t).await;
        self.sync_blocks(net, &peers, t).await;
        self.chain_advance(net, t);
    }

    /// Header pre-fetch scheduler. Globally throttled; at most
    /// `header_concurrent` peers used per invocation, one slot per peer.
    async fn sync_headers(&mut self, net: &Network, peers: &[Arc<PeerSession>], t: i64) {
        if self.header_poll_time != 0
            && t - self.header_poll_time < net.config.header_concurrent_poll_secs
        {
            return;
        }
        self.header_poll_time = t;

        let ordered = order_by_header_speed(peers);
        let max_slot = self.header_slots.len();
        let mut slot_idx = 0;
        let mut used = 0;

        'peers: for peer in ordered {
            // find the first slot with header work, starting where the
            // previous peer left off
            loop {
                if slot_idx >= max_slot {
                    break 'peers;
                }
                let slot = &mut self.header_slots[slot_idx];
                if slot.start_height >= peer.starting_height() {
                    slot_idx += 1;
                    continue;
                }
                advance_through_known(slot, &self.height_to_hash);
                if slot.end_height != 0 && slot.start_height >= slot.end_height {
                    slot_idx += 1;
                    continue;
                }
                break;
            }

            let slot = self.header_slots[slot_idx];
            let Some(begin) = self.height_to_hash.get(&slot.start_height).copied() else {
                // anchors are always indexed, and start only advances
                // through indexed heights
                warn!(
                    "header slot {} has no hash at height {}",
                    slot_idx, slot.start_height
                );
                slot_idx += 1;
                if slot_idx >= max_slot {
                    break;
                }
                continue;
            };
            let end = if slot.end_height != 0 {
                self.height_to_hash
                    .get(&slot.end_height)
                    .copied()
                    .unwrap_or(ZERO_HASH)
            } else {
                ZERO_HASH
            };

            let mut send = true;
            if (begin, end) == peer.getheaders_span()
                && t - peer.send_getheaders_time.load(Ordering::SeqCst)
                    < net.config.concurrent_retry_secs
            {
                send = false;
            }

            if send {
                debug!(
                    "slot {}: getheaders {}..{} ({} -> {}) to {}",
                    slot_idx,
                    slot.start_height,
                    slot.end_height,
                    short_hash(&begin),
                    short_hash(&end),
                    peer.addr_name
                );
                peer.push_payload(
                    "getheaders",
                    &GetHeadersPayload { locator: vec![begin], stop: end },
                )
                .await;
                peer.send_getheaders_time.store(t, Ordering::SeqCst);
                peer.set_getheaders_span(begin, end);
                peer.header_used.store(true, Ordering::SeqCst);
            }

            used += 1;
            if used >= net.config.header_concurrent {
                break;
            }
            slot_idx += 1;
            if slot_idx >= max_slot {
                break;
            }
        }
    }

    /// Block fetch scheduler: per assigned slot, advance past material
    /// already present, then batch up to `MAX_BLOCKS_ONCE` missing
    /// hashes into the peer's ask-for queue.
    async fn sync_blocks(&mut self, net: &Network, peers: &[Arc<PeerSession>], t: i64) {
        if self.block_poll_time != 0 && t - self.block_poll_time < net.config.concurrent_poll_secs
        {
            return;
        }
        self.block_poll_time = t;

        let ordered = order_by_block_speed(peers);
        let chain = net.chain();
        let max_slot = self.block_slots.len();
        let mut slot_idx = 0;
        let mut used = 0;

        'peers: for peer in ordered {
            enum SlotState {
                Finished,
                HeadersLagging,
                NeedAsk,
            }

            // classify slots until one has fetchable work for this peer
            let state = loop {
                if slot_idx >= max_slot {
                    break 'peers;
                }
                let slot = &mut self.block_slots[slot_idx];
                let state = loop {
                    if slot.end_height != 0 && slot.start_height >= slot.end_height {
                        break SlotState::Finished;
                    }
                    if slot.start_height >= peer.starting_height() {
                        break SlotState::Finished;
                    }
                    let Some(hash) = self.height_to_hash.get(&slot.start_height) else {
                        break SlotState::HeadersLagging;
                    };
                    if chain.has_block(hash) || chain.has_orphan(hash) {
                        slot.start_height += 1;
                    } else {
                        break SlotState::NeedAsk;
                    }
                };
                match state {
                    SlotState::Finished | SlotState::HeadersLagging => {
                        slot_idx += 1;
                        continue;
                    }
                    SlotState::NeedAsk => break state,
                }
            };
            debug_assert!(matches!(state, SlotState::NeedAsk));

            let slot = self.block_slots[slot_idx];
            let mut hashes: Vec<Hash> = Vec::new();
            let mut height = slot.start_height;
            loop {
                if slot.end_height != 0 && height > slot.end_height {
                    break;
                }
                if height > peer.starting_height() {
                    break;
                }
                let Some(hash) = self.height_to_hash.get(&height) else {
                    break;
                };
                if chain.has_block(hash) || chain.has_orphan(hash) {
                    height += 1;
                    continue;
                }
                hashes.push(*hash);
                if hashes.len() >= MAX_BLOCKS_ONCE {
                    break;
                }
                height += 1;
            }

            if let (Some(&begin), Some(&end)) = (hashes.first(), hashes.last()) {
                let since_send = t - peer.send_getdata_time.load(Ordering::SeqCst);
                let mut send = since_send >= net.config.concurrent_poll_secs;
                if (begin, end) == peer.getdata_span()
                    && since_send < net.config.concurrent_retry_secs
                {
                    send = false;
                }

                if send {
                    debug!(
                        "slot {}: getblocks {} hashes from height {} ({} -> {}) to {}",
                        slot_idx,
                        hashes.len(),
                        slot.start_height,
                        short_hash(&begin),
                        short_hash(&end),
                        peer.addr_name
                    );
                    for hash in &hashes {
                        if net.should_ask_for(&Inv::block(*hash), t) {
                            peer.ask_for(Inv::block(*hash)).await;
                        }
                    }
                    peer.send_getdata_time.store(t, Ordering::SeqCst);
                    peer.set_getdata_span(begin, end);
                    peer.used.store(true, Ordering::SeqCst);
                }
            }

            used += 1;
            if used >= net.config.concurrent {
                break;
            }
            slot_idx += 1;
            if slot_idx >= max_slot {
                break;
            }
        }
    }

    fn chain_advance(&mut self, net: &Network, t: i64) {
        if self.chain_check_time == 0 {
            self.chain_check_time = t;
            return;
        }
        if t - self.chain_check_time <= CHAIN_ADVANCE_SECS {
            return;
        }
        self.chain_check_time = t;
        self.advance_chain(net);
    }

    /// Walk the height index from the tip upward, attaching every height
    /// whose block is already on disk or parked as an orphan. Stops at
    /// the first unavailable height. Best height never decreases.
    /// Runs once a minute from the scheduler tick.
    pub fn advance_chain(&mut self, net: &Network) {
        let chain = net.chain();
        let mut next = chain.best_height() + 1;
        while let Some(hash) = self.height_to_hash.get(&next) {
            if chain.has_block(hash) {
                if !chain.set_best_chain(hash) {
                    warn!("set_best_chain failed at height {} ({})", next, short_hash(hash));
                    break;
                }
            } else if chain.has_orphan(hash) {
                debug!("accepting orphan at height {} ({})", next, short_hash(hash));
                if !chain.accept_orphan(hash) {
                    break;
                }
            } else {
                break;
            }
            next += 1;
        }

        for (i, slot) in self.block_slots.iter().enumerate() {
            debug!(
                "sync block slot {}: start {} end {}",
                i, slot.start_height, slot.end_height
            );
        }
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Move a header slot's start forward while the following height is
/// already indexed.
fn advance_through_known(slot: &mut SyncSlot, index: &BTreeMap<u32, Hash>) {
    if slot.end_height != 0 && slot.start_height >= slot.end_height {
        return;
    }
    loop {
        let next = slot.start_height + 1;
        if !index.contains_key(&next) {
            break;
        }
        slot.start_height = next;
        if slot.end_height != 0 && slot.start_height >= slot.end_height {
            break;
        }
    }
}

/// Sync eligibility: serving peer, fully connected, near the assumed
/// chain tip, and speaking a version that answers ranged getheaders.
pub fn is_sync_eligible(peer: &PeerSession, max_block_count: u32) -> bool {
    if peer.is_client() || peer.is_disconnecting() || !peer.is_successfully_connected() {
        return false;
    }
    if peer.starting_height() <= max_block_count.saturating_sub(STARTING_HEIGHT_SLACK) {
        return false;
    }
    let version = peer.version();
    if version >= NOBLKS_VERSION_START && version < NOBLKS_VERSION_END {
        return false;
    }
    version >= MIN_GETHEADERS_VERSION
}

fn eligible_peers(net: &Network) -> Vec<Arc<PeerSession>> {
    net.peer_snapshot()
        .into_iter()
        .filter(|p| is_sync_eligible(p, net.config.max_block_count))
        .collect()
}

/// 60-second throughput sampling:
/// `speed <- (downloaded / 60 + speed) / 2`, likewise for headers.
fn sample_speed(peer: &PeerSession, t: i64) {
    if t - peer.check_speed_time.load(Ordering::SeqCst) <= SPEED_SAMPLE_SECS {
        return;
    }
    peer.check_speed_time.store(t, Ordering::SeqCst);

    let downloaded = peer.downloaded.swap(0, Ordering::SeqCst);
    let speed = peer.speed.load(Ordering::SeqCst);
    peer.speed
        .store((downloaded / SPEED_SAMPLE_SECS as u64 + speed) / 2, Ordering::SeqCst);

    let header_downloaded = peer.header_downloaded.swap(0, Ordering::SeqCst);
    let header_speed = peer.header_speed.load(Ordering::SeqCst);
    peer.header_speed.store(
        (header_downloaded / SPEED_SAMPLE_SECS as u64 + header_speed) / 2,
        Ordering::SeqCst,
    );

    debug!(
        "speed sample {}: speed {} header_speed {}",
        peer.addr_name,
        peer.speed.load(Ordering::SeqCst),
        peer.header_speed.load(Ordering::SeqCst)
    );
}

/// Unused peers first, then slowest measured header throughput first.
/// Sorted once per tick on a snapshot of the atomics so a peer mutating
/// mid-pass cannot reorder the schedule.
fn order_by_header_speed(peers: &[Arc<PeerSession>]) -> Vec<Arc<PeerSession>> {
    let mut keyed: Vec<(bool, u64, Arc<PeerSession>)> = peers
        .iter()
        .map(|p| {
            (
                p.header_used.load(Ordering::SeqCst),
                p.header_speed.load(Ordering::SeqCst),
                Arc::clone(p),
            )
        })
        .collect();
    keyed.sort_by_key(|(used, speed, _)| (*used, *speed));
    keyed.into_iter().map(|(_, _, p)| p).collect()
}

/// Unused peers first, then slowest measured block throughput first.
fn order_by_block_speed(peers: &[Arc<PeerSession>]) -> Vec<Arc<PeerSession>> {
    let mut keyed: Vec<(bool, u64, Arc<PeerSession>)> = peers
        .iter()
        .map(|p| {
            (
                p.used.load(Ordering::SeqCst),
                p.speed.load(Ordering::SeqCst),
                Arc::clone(p),
            )
        })
        .collect();
    keyed.sort_by_key(|(used, speed, _)| (*used, *speed));
    keyed.into_iter().map(|(_, _, p)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::Endpoint;
    use std::net::SocketAddr;

    fn hash(n: u8) -> Hash {
        [n; 32]
    }

    fn peer(addr: &str) -> Arc<PeerSession> {
        let sa: SocketAddr = addr.parse().unwrap();
        Arc::new(PeerSession::new(Endpoint::from(sa), "", false))
    }

    #[test]
    fn test_slot_partition() {
        let mut points = BTreeMap::new();
        points.insert(100, hash(1));
        points.insert(500, hash(2));
        points.insert(2000, hash(3));

        let slots = build_slots(&points);
        assert_eq!(
            slots,
            vec![
                SyncSlot { start_height: 100, end_height: 499 },
                SyncSlot { start_height: 500, end_height: 1999 },
                SyncSlot { start_height: 2000, end_height: 0 },
            ]
        );
    }

    #[test]
    fn test_slot_partition_single_anchor_open_ended() {
        let mut points = BTreeMap::new();
        points.insert(1, hash(1));
        let slots = build_slots(&points);
        assert_eq!(slots, vec![SyncSlot { start_height: 1, end_height: 0 }]);
        assert!(slots[0].covers(1_000_000));
    }

    #[test]
    fn test_connect_header_grows_indexes() {
        let mut engine = SyncEngine::new();
        engine.register_header(100, hash(1));
        assert_eq!(engine.connect_header(&hash(1), hash(2)), Some(101));
        assert_eq!(engine.connect_header(&hash(2), hash(3)), Some(102));
        assert_eq!(engine.hash_at(102), Some(hash(3)));
        assert_eq!(engine.height_of(&hash(3)), Some(102));
        // unknown parent
        assert_eq!(engine.connect_header(&hash(9), hash(4)), None);
    }

    #[test]
    fn test_advance_through_known() {
        let mut index = BTreeMap::new();
        index.insert(100, hash(1));
        index.insert(101, hash(2));
        index.insert(102, hash(3));
        // gap at 103
        index.insert(104, hash(4));

        let mut slot = SyncSlot::new(100, 499);
        advance_through_known(&mut slot, &index);
        assert_eq!(slot.start_height, 102);

        // closed slot stops at its end
        let mut slot = SyncSlot::new(100, 101);
        advance_through_known(&mut slot, &index);
        assert_eq!(slot.start_height, 101);
    }

    #[test]
    fn test_start_height_monotone() {
        let mut index = BTreeMap::new();
        index.insert(10, hash(1));
        let mut slot = SyncSlot::new(10, 0);
        advance_through_known(&mut slot, &index);
        assert_eq!(slot.start_height, 10);
        index.insert(11, hash(2));
        advance_through_known(&mut slot, &index);
        assert_eq!(slot.start_height, 11);
        advance_through_known(&mut slot, &index);
        assert_eq!(slot.start_height, 11);
    }

    #[test]
    fn test_eligibility() {
        let p = peer("1.2.3.4:9556");
        // no handshake yet
        assert!(!is_sync_eligible(&p, 400_000));

        p.apply_version(70002, 1, 400_000, "");
        p.mark_successfully_connected();
        assert!(is_sync_eligible(&p, 400_000));

        // client peers are out
        let c = peer("1.2.3.5:9556");
        c.apply_version(70002, 0, 400_000, "");
        c.mark_successfully_connected();
        assert!(!is_sync_eligible(&c, 400_000));

        // too far behind the assumed tip
        let b = peer("1.2.3.6:9556");
        b.apply_version(70002, 1, 1000, "");
        b.mark_successfully_connected();
        assert!(!is_sync_eligible(&b, 400_000));

        // pre-getheaders protocol
        let old = peer("1.2.3.7:9556");
        old.apply_version(60001, 1, 400_000, "");
        old.mark_successfully_connected();
        assert!(!is_sync_eligible(&old, 400_000));
    }

    #[test]
    fn test_unused_first_ordering() {
        let fast = peer("1.1.1.1:9556");
        fast.header_used.store(true, Ordering::SeqCst);
        fast.header_speed.store(10, Ordering::SeqCst);

        let fresh = peer("2.2.2.2:9556");

        let slow = peer("3.3.3.3:9556");
        slow.header_used.store(true, Ordering::SeqCst);
        slow.header_speed.store(3, Ordering::SeqCst);

        let ordered =
            order_by_header_speed(&[Arc::clone(&fast), Arc::clone(&fresh), Arc::clone(&slow)]);
        assert_eq!(ordered[0].addr, fresh.addr);
        assert_eq!(ordered[1].addr, slow.addr);
        assert_eq!(ordered[2].addr, fast.addr);
    }

    #[test]
    fn test_speed_sampling_halves_toward_rate() {
        let p = peer("1.2.3.4:9556");
        p.downloaded.store(6000, Ordering::SeqCst);
        p.check_speed_time.store(now() - 120, Ordering::SeqCst);
        sample_speed(&p, now());
        // (6000/60 + 0) / 2 = 50
        assert_eq!(p.speed.load(Ordering::SeqCst), 50);
        assert_eq!(p.downloaded.load(Ordering::SeqCst), 0);

        // window not yet elapsed: no resample
        p.downloaded.store(6000, Ordering::SeqCst);
        sample_speed(&p, now());
        assert_eq!(p.speed.load(Ordering::SeqCst), 50);
    }
}
