//! Peer address book: biased selection over new/tried bucket tables

use super::types::{AddrEntry, Endpoint, NetAddress};
use crate::types::now;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;
use std::collections::HashMap;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

// Bucket configuration
const NEW_BUCKET_COUNT: usize = 1024;
const TRIED_BUCKET_COUNT: usize = 256;
const BUCKET_SIZE: usize = 64;
const MAX_RETRIES: u32 = 3;
const HORIZON_DAYS: i64 = 30;

/// Size cap applied before deserializing peers.dat.
/// Both tables full is roughly 8 MB; 16 MB is a safe ceiling.
const MAX_ADDRBOOK_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// The collaborator interface the connection core consumes. The dialer
/// computes `unk_bias_percent = 10 + min(outbound, 8) * 10`, so the
/// pull toward untried addresses grows with the outbound count.
pub trait AddressBook: Send + Sync {
    /// Random candidate, biased toward the new table by
    /// `unk_bias_percent` (valid range 10..=90).
    fn select(&self, unk_bias_percent: u32) -> Option<AddressRecord>;
    /// A connection to this endpoint completed its handshake.
    fn connected(&self, endpoint: &Endpoint);
    /// A dial to this endpoint was attempted.
    fn attempt(&self, endpoint: &Endpoint);
    /// Merge gossiped addresses, crediting `source`.
    fn add(&self, records: Vec<AddrEntry>, source: &NetAddress) -> usize;
    fn size(&self) -> usize;
    /// Flush to disk (peers.dat). No-op for books without a path.
    fn dump(&self) -> Result<(), std::io::Error>;
}

/// Address book entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressRecord {
    pub endpoint: Endpoint,
    pub services: u64,
    /// Last time anyone vouched for this address (self-reported on
    /// gossip, locally stamped on successful connect).
    pub last_seen: i64,
    /// Last local dial attempt.
    pub last_try: i64,
    /// Consecutive failed attempts since the last success.
    pub attempts: u32,
}

impl AddressRecord {
    fn new(entry: &AddrEntry) -> Self {
        Self {
            endpoint: entry.endpoint,
            services: entry.services,
            last_seen: entry.last_seen,
            last_try: 0,
            attempts: 0,
        }
    }

    /// Deprioritization heuristic: future-dated, repeatedly failing or
    /// stale addresses are skipped by selection and evictable on bucket
    /// collision.
    pub fn is_terrible(&self) -> bool {
        let t = now();
        // future timestamps beyond 10 min of skew
        if self.last_seen > t + 600 {
            return true;
        }
        if self.last_try > 0 && self.last_try > t - 60 {
            return self.attempts >= MAX_RETRIES;
        }
        if self.attempts >= MAX_RETRIES && self.last_seen < self.last_try {
            return true;
        }
        if self.last_seen < t - HORIZON_DAYS * 24 * 60 * 60 {
            return true;
        }
        false
    }
}

#[derive(Serialize, Deserialize)]
struct Inner {
    /// Random key for bucket placement; an outside observer cannot
    /// predict which addresses collide.
    #[serde(with = "key_serde")]
    key: [u8; 32],
    records: HashMap<Endpoint, AddressRecord>,
    new_table: Vec<Option<Endpoint>>,
    tried_table: Vec<Option<Endpoint>>,
    new_count: usize,
    tried_count: usize,
}

mod key_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        key.to_vec().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let v = Vec::<u8>::deserialize(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("invalid key length"))
    }
}

impl Inner {
    fn new() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill(&mut key);
        Self {
            key,
            records: HashMap::new(),
            new_table: vec![None; NEW_BUCKET_COUNT * BUCKET_SIZE],
            tried_table: vec![None; TRIED_BUCKET_COUNT * BUCKET_SIZE],
            new_count: 0,
            tried_count: 0,
        }
    }

    fn sip(&self, half: usize) -> SipHasher24 {
        let k: [u8; 16] = self.key[half * 16..half * 16 + 16].try_into().unwrap_or([0u8; 16]);
        SipHasher24::new_with_key(&k)
    }

    fn new_bucket(&self, endpoint: &Endpoint, source: Option<&NetAddress>) -> usize {
        let mut hasher = self.sip(0);
        hasher.write(&endpoint.addr.group_key());
        if let Some(src) = source {
            hasher.write(&src.group_key());
        }
        (hasher.finish() as usize) % NEW_BUCKET_COUNT
    }

    fn tried_bucket(&self, endpoint: &Endpoint) -> usize {
        let mut hasher = self.sip(0);
        hasher.write(endpoint.addr.octets());
        hasher.write(&endpoint.port.to_le_bytes());
        hasher.write(&endpoint.addr.group_key());
        (hasher.finish() as usize) % TRIED_BUCKET_COUNT
    }

    fn bucket_position(&self, endpoint: &Endpoint, bucket: usize, is_new: bool) -> usize {
        let mut hasher = self.sip(1);
        hasher.write(endpoint.addr.octets());
        hasher.write(&endpoint.port.to_le_bytes());
        hasher.write(&bucket.to_le_bytes());
        hasher.write(&[u8::from(is_new)]);
        (hasher.finish() as usize) % BUCKET_SIZE
    }

    fn add_one(&mut self, entry: &AddrEntry, source: Option<&NetAddress>) -> bool {
        if self.records.contains_key(&entry.endpoint) {
            // refresh the freshness stamp if the gossip is newer
            if let Some(record) = self.records.get_mut(&entry.endpoint)
                && entry.last_seen > record.last_seen
                && entry.last_seen <= now() + 600
            {
                record.last_seen = entry.last_seen;
            }
            return false;
        }
        if !entry.endpoint.addr.is_routable() {
            return false;
        }
        // future-dated gossip is poison, not news
        if entry.last_seen > now() + 600 {
            return false;
        }

        let bucket = self.new_bucket(&entry.endpoint, source);
        let pos = self.bucket_position(&entry.endpoint, bucket, true);
        let idx = bucket * BUCKET_SIZE + pos;

        if let Some(existing) = self.new_table[idx] {
            match self.records.get(&existing) {
                Some(record) if !record.is_terrible() => return false,
                _ => self.remove_from_new(&existing),
            }
        }

        self.records
            .insert(entry.endpoint, AddressRecord::new(entry));
        self.new_table[idx] = Some(entry.endpoint);
        self.new_count += 1;
        true
    }

    fn remove_from_new(&mut self, endpoint: &Endpoint) {
        for slot in self.new_table.iter_mut() {
            if *slot == Some(*endpoint) {
                *slot = None;
                self.new_count = self.new_count.saturating_sub(1);
                return;
            }
        }
    }

    fn is_in_tried(&self, endpoint: &Endpoint) -> bool {
        self.tried_table.contains(&Some(*endpoint))
    }

    /// Promote to the tried table after a completed handshake. A bucket
    /// collision demotes the incumbent back to new.
    fn mark_good(&mut self, endpoint: &Endpoint) {
        if !self.records.contains_key(endpoint) || self.is_in_tried(endpoint) {
            return;
        }
        self.remove_from_new(endpoint);

        let bucket = self.tried_bucket(endpoint);
        let pos = self.bucket_position(endpoint, bucket, false);
        let idx = bucket * BUCKET_SIZE + pos;

        if let Some(evicted) = self.tried_table[idx] {
            self.tried_table[idx] = None;
            self.tried_count = self.tried_count.saturating_sub(1);
            let new_bucket = self.new_bucket(&evicted, None);
            let new_pos = self.bucket_position(&evicted, new_bucket, true);
            let new_idx = new_bucket * BUCKET_SIZE + new_pos;
            if self.new_table[new_idx].is_none() {
                self.new_table[new_idx] = Some(evicted);
                self.new_count += 1;
            }
        }

        self.tried_table[idx] = Some(*endpoint);
        self.tried_count += 1;
    }

    fn select_from(&self, table: &[Option<Endpoint>], count: usize, rng: &mut ChaCha20Rng) -> Option<AddressRecord> {
        // sparse fast path: random sampling has a low hit rate with few
        // occupied slots
        if count <= 10 {
            for slot in table.iter().flatten() {
                if let Some(record) = self.records.get(slot)
                    && !record.is_terrible()
                {
                    return Some(record.clone());
                }
            }
            return None;
        }
        for _ in 0..1000 {
            let idx = rng.gen_range(0..table.len());
            if let Some(endpoint) = table[idx]
                && let Some(record) = self.records.get(&endpoint)
            {
                if record.is_terrible() {
                    continue;
                }
                return Some(record.clone());
            }
        }
        None
    }

    fn select(&self, unk_bias_percent: u32) -> Option<AddressRecord> {
        let mut rng = ChaCha20Rng::from_entropy();
        let use_new = rng.gen_range(0..100) < unk_bias_percent.clamp(10, 90);

        if use_new && self.new_count > 0 {
            self.select_from(&self.new_table, self.new_count, &mut rng)
        } else if self.tried_count > 0 {
            self.select_from(&self.tried_table, self.tried_count, &mut rng)
        } else if self.new_count > 0 {
            self.select_from(&self.new_table, self.new_count, &mut rng)
        } else {
            None
        }
    }
}

/// Bucketed address book with optional peers.dat persistence.
pub struct AddrBook {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl AddrBook {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            path: None,
        }
    }

    /// Open with persistence. A readable file at `path` seeds the book;
    /// a missing or corrupt one starts it empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let inner = match Self::load_inner(&path) {
            Ok(inner) => {
                info!(
                    "loaded {} addresses from {}",
                    inner.records.len(),
                    path.display()
                );
                inner
            }
            Err(err) => {
                debug!("starting fresh address book: {}", err);
                Inner::new()
            }
        };
        Self {
            inner: Mutex::new(inner),
            path: Some(path),
        }
    }

    fn load_inner(path: &Path) -> Result<Inner, std::io::Error> {
        let data = std::fs::read(path)?;
        if data.len() as u64 > MAX_ADDRBOOK_FILE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("address file too large: {} bytes", data.len()),
            ));
        }
        bincode::deserialize(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Random addresses for an addr response, terrible ones filtered.
    pub fn get_addresses(&self, max: usize) -> Vec<AddressRecord> {
        let inner = self.lock();
        let mut rng = ChaCha20Rng::from_entropy();
        let mut out: Vec<AddressRecord> = inner
            .records
            .values()
            .filter(|r| !r.is_terrible())
            .cloned()
            .collect();
        for i in (1..out.len()).rev() {
            let j = rng.gen_range(0..=i);
            out.swap(i, j);
        }
        out.truncate(max);
        out
    }

    pub fn stats(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.new_count, inner.tried_count)
    }
}

impl Default for AddrBook {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressBook for AddrBook {
    fn select(&self, unk_bias_percent: u32) -> Option<AddressRecord> {
        self.lock().select(unk_bias_percent)
    }

    fn connected(&self, endpoint: &Endpoint) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(endpoint) {
            record.last_seen = now();
            record.attempts = 0;
        }
        inner.mark_good(endpoint);
    }

    fn attempt(&self, endpoint: &Endpoint) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(endpoint) {
            record.last_try = now();
            record.attempts += 1;
        }
    }

    fn add(&self, records: Vec<AddrEntry>, source: &NetAddress) -> usize {
        let mut inner = self.lock();
        let mut added = 0;
        for entry in &records {
            if inner.add_one(entry, Some(source)) {
                added += 1;
            }
        }
        if added > 0 {
            debug!("added {} addresses from {}", added, source);
        }
        added
    }

    fn size(&self) -> usize {
        self.lock().records.len()
    }

    fn dump(&self) -> Result<(), std::io::Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = {
            let inner = self.lock();
            bincode::serialize(&*inner)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        };
        std::fs::write(path, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn entry(s: &str) -> AddrEntry {
        AddrEntry::new(Endpoint::from(s.parse::<SocketAddr>().unwrap()), 1)
    }

    fn source() -> NetAddress {
        NetAddress::from_ip("9.9.9.9".parse().unwrap())
    }

    #[test]
    fn test_add_and_dedup() {
        let book = AddrBook::new();
        assert_eq!(book.add(vec![entry("1.2.3.4:9556")], &source()), 1);
        assert_eq!(book.add(vec![entry("1.2.3.4:9556")], &source()), 0);
        assert_eq!(book.size(), 1);
    }

    #[test]
    fn test_add_rejects_unroutable() {
        let book = AddrBook::new();
        assert_eq!(book.add(vec![entry("192.168.1.1:9556")], &source()), 0);
    }

    #[test]
    fn test_add_rejects_future_timestamps() {
        let book = AddrBook::new();
        let mut e = entry("1.2.3.4:9556");
        e.last_seen = now() + 3600;
        assert_eq!(book.add(vec![e], &source()), 0);
    }

    #[test]
    fn test_connected_moves_to_tried() {
        let book = AddrBook::new();
        let e = entry("1.2.3.4:9556");
        book.add(vec![e.clone()], &source());
        assert_eq!(book.stats(), (1, 0));
        book.connected(&e.endpoint);
        assert_eq!(book.stats(), (0, 1));
    }

    #[test]
    fn test_attempt_stamps_last_try() {
        let book = AddrBook::new();
        let e = entry("1.2.3.4:9556");
        book.add(vec![e.clone()], &source());
        book.attempt(&e.endpoint);
        let selected = book.select(50).unwrap();
        assert!(selected.last_try > 0);
        assert_eq!(selected.attempts, 1);
    }

    #[test]
    fn test_select_biased_eventually_hits_both_tables() {
        let book = AddrBook::new();
        for i in 1..30u8 {
            let e = entry(&format!("{}.{}.1.1:9556", i, i));
            book.add(vec![e.clone()], &source());
            if i % 3 == 0 {
                book.connected(&e.endpoint);
            }
        }
        let mut hit = false;
        for _ in 0..100 {
            if book.select(50).is_some() {
                hit = true;
                break;
            }
        }
        assert!(hit);
    }

    #[test]
    fn test_select_empty_book() {
        let book = AddrBook::new();
        assert!(book.select(50).is_none());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let temp = std::env::temp_dir().join("farthing_test_peers.dat");
        std::fs::remove_file(&temp).ok();
        {
            let book = AddrBook::open(&temp);
            book.add(vec![entry("1.2.3.4:9556")], &source());
            book.dump().unwrap();
        }
        let book = AddrBook::open(&temp);
        assert_eq!(book.size(), 1);
        std::fs::remove_file(temp).ok();
    }

    #[test]
    fn test_terrible_stale() {
        let mut record = AddressRecord::new(&entry("1.2.3.4:9556"));
        assert!(!record.is_terrible());
        record.last_seen = now() - 40 * 24 * 60 * 60;
        assert!(record.is_terrible());
    }
}
