//! Ban table with expiry and persistence

use super::types::NetAddress;
use crate::types::now;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Size cap applied before deserializing a ban file. Each entry is tens
/// of bytes; 1 MB covers far more bans than a node ever accumulates.
const MAX_BANLIST_FILE_SIZE: u64 = 1024 * 1024;

/// Address -> unix time until which inbound from it is rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BanList {
    bans: HashMap<NetAddress, i64>,
}

impl BanList {
    pub fn new() -> Self {
        Self { bans: HashMap::new() }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let data = std::fs::read(&path)?;
        if data.len() as u64 > MAX_BANLIST_FILE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("ban list file too large: {} bytes", data.len()),
            ));
        }
        bincode::deserialize(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let data = bincode::serialize(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, data)
    }

    /// Ban until `until`. Last-writer-wins on `max(existing, until)`;
    /// a ban is never shortened by a later, milder offense.
    pub fn ban_until(&mut self, addr: NetAddress, until: i64) {
        let entry = self.bans.entry(addr).or_insert(0);
        if until > *entry {
            info!("banning {} until {}", addr, until);
            *entry = until;
        }
    }

    pub fn is_banned(&self, addr: &NetAddress) -> bool {
        match self.bans.get(addr) {
            Some(&until) => now() < until,
            None => false,
        }
    }

    pub fn unban(&mut self, addr: &NetAddress) -> bool {
        self.bans.remove(addr).is_some()
    }

    /// Drop entries whose ban time has passed.
    pub fn expire(&mut self) {
        let t = now();
        self.bans.retain(|addr, &mut until| {
            if t >= until {
                debug!("ban expired for {}", addr);
                false
            } else {
                true
            }
        });
    }

    pub fn clear(&mut self) {
        self.bans.clear();
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetAddress {
        NetAddress::from_ip(s.parse().unwrap())
    }

    #[test]
    fn test_ban_and_expiry() {
        let mut bans = BanList::new();
        let a = addr("1.2.3.4");

        bans.ban_until(a, now() + 3600);
        assert!(bans.is_banned(&a));

        bans.ban_until(a, now() - 1);
        // max(existing, new): the longer ban stands
        assert!(bans.is_banned(&a));

        let b = addr("5.6.7.8");
        bans.ban_until(b, now() - 10);
        assert!(!bans.is_banned(&b));

        bans.expire();
        assert_eq!(bans.len(), 1);
    }

    #[test]
    fn test_unban() {
        let mut bans = BanList::new();
        let a = addr("1.2.3.4");
        bans.ban_until(a, now() + 3600);
        assert!(bans.unban(&a));
        assert!(!bans.is_banned(&a));
        assert!(!bans.unban(&a));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let mut bans = BanList::new();
        let a = addr("1.2.3.4");
        bans.ban_until(a, now() + 3600);

        let temp = std::env::temp_dir().join("farthing_test_bans.dat");
        bans.save(&temp).unwrap();
        let loaded = BanList::load(&temp).unwrap();
        assert!(loaded.is_banned(&a));
        std::fs::remove_file(temp).ok();
    }
}
