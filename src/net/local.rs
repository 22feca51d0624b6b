//! Local-address table: which of our own endpoints to advertise

use super::types::{Endpoint, LOCAL_MANUAL, NetAddress, NetworkClass};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
struct LocalServiceInfo {
    score: i32,
    port: u16,
}

/// Our own reachable endpoints, scored, plus per-network reachable and
/// limited flags. Entries are only ever added; the table dies with the
/// process.
///
/// Not internally locked; the owner wraps it in its own mutex.
#[derive(Debug, Default)]
pub struct LocalAddrs {
    map: HashMap<NetAddress, LocalServiceInfo>,
    reachable: [bool; 5],
    limited: [bool; 5],
    /// Interface discovery enabled. When off, only LOCAL_MANUAL entries
    /// are accepted.
    pub discover: bool,
}

impl LocalAddrs {
    pub fn new(discover: bool) -> Self {
        Self {
            map: HashMap::new(),
            reachable: [false; 5],
            limited: [false; 5],
            discover,
        }
    }

    /// Learn one of our own addresses. Returns false for unroutable or
    /// limited addresses, or non-manual ones while discovery is off.
    /// Re-adding with an equal or better score bumps the stored score by
    /// one.
    pub fn add_local(&mut self, endpoint: Endpoint, score: i32) -> bool {
        if !endpoint.addr.is_routable() {
            return false;
        }
        if !self.discover && score < LOCAL_MANUAL {
            return false;
        }
        if self.is_limited(endpoint.addr.network_class()) {
            return false;
        }

        info!("add_local({}, {})", endpoint, score);

        let already = self.map.contains_key(&endpoint.addr);
        let info = self
            .map
            .entry(endpoint.addr)
            .or_insert(LocalServiceInfo { score: 0, port: endpoint.port });
        if !already || score >= info.score {
            info.score = score + if already { 1 } else { 0 };
            info.port = endpoint.port;
        }
        self.set_reachable(endpoint.addr.network_class(), true);
        true
    }

    /// A peer claimed to see us at this address; count the vote.
    pub fn seen_local(&mut self, endpoint: &Endpoint) -> bool {
        match self.map.get_mut(&endpoint.addr) {
            Some(info) => {
                info.score += 1;
                debug!("seen_local({}) score {}", endpoint, info.score);
                true
            }
            None => false,
        }
    }

    /// Best local endpoint to advertise to `peer`: highest reachability
    /// first, score breaking ties.
    pub fn get_local_for_peer(&self, peer: Option<&NetAddress>) -> Option<Endpoint> {
        let mut best: Option<(i32, i32, Endpoint)> = None;
        for (addr, info) in &self.map {
            let reach = addr.reachability_from(peer);
            let better = match best {
                Some((best_reach, best_score, _)) => {
                    reach > best_reach || (reach == best_reach && info.score > best_score)
                }
                None => true,
            };
            if better {
                best = Some((reach, info.score, Endpoint::new(*addr, info.port)));
            }
        }
        best.map(|(_, _, endpoint)| endpoint)
    }

    pub fn is_local(&self, addr: &NetAddress) -> bool {
        self.map.contains_key(addr)
    }

    pub fn set_reachable(&mut self, net: NetworkClass, flag: bool) {
        self.reachable[net.index()] = flag;
        // IPv6 connectivity implies the v4-mapped space works too
        if net == NetworkClass::Ipv6 && flag {
            self.reachable[NetworkClass::Ipv4.index()] = true;
        }
    }

    /// Put a network class entirely off-limits for automatic use.
    pub fn set_limited(&mut self, net: NetworkClass, limited: bool) {
        if net == NetworkClass::Unroutable {
            return;
        }
        self.limited[net.index()] = limited;
    }

    pub fn is_limited(&self, net: NetworkClass) -> bool {
        self.limited[net.index()]
    }

    pub fn is_limited_addr(&self, addr: &NetAddress) -> bool {
        self.is_limited(addr.network_class())
    }

    pub fn is_reachable(&self, addr: &NetAddress) -> bool {
        let net = addr.network_class();
        self.reachable[net.index()] && !self.limited[net.index()]
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::types::{LOCAL_BIND, LOCAL_IF};
    use std::net::SocketAddr;

    fn ep(s: &str) -> Endpoint {
        Endpoint::from(s.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn test_add_local_rejects_unroutable() {
        let mut local = LocalAddrs::new(true);
        assert!(!local.add_local(ep("192.168.1.5:9556"), LOCAL_IF));
        assert!(local.add_local(ep("8.8.8.8:9556"), LOCAL_IF));
    }

    #[test]
    fn test_no_discover_requires_manual() {
        let mut local = LocalAddrs::new(false);
        assert!(!local.add_local(ep("8.8.8.8:9556"), LOCAL_IF));
        assert!(local.add_local(ep("8.8.8.8:9556"), LOCAL_MANUAL));
    }

    #[test]
    fn test_revisit_bumps_score() {
        let mut local = LocalAddrs::new(true);
        local.add_local(ep("8.8.8.8:9556"), LOCAL_BIND);
        // same score again on revisit: stored score becomes score + 1
        local.add_local(ep("8.8.8.8:9556"), LOCAL_BIND);
        let e = ep("8.8.8.8:9556");
        assert!(local.is_local(&e.addr));
        assert_eq!(local.map[&e.addr].score, LOCAL_BIND + 1);
    }

    #[test]
    fn test_seen_local_votes() {
        let mut local = LocalAddrs::new(true);
        let e = ep("8.8.8.8:9556");
        assert!(!local.seen_local(&e));
        local.add_local(e, LOCAL_IF);
        assert!(local.seen_local(&e));
        assert_eq!(local.map[&e.addr].score, LOCAL_IF + 1);
    }

    #[test]
    fn test_best_local_prefers_reachability_then_score() {
        let mut local = LocalAddrs::new(true);
        local.add_local(ep("[2607:f8b0::5]:9556"), LOCAL_MANUAL);
        local.add_local(ep("8.8.8.8:9556"), LOCAL_IF);

        // v4 peer: the v4 local wins despite the lower score
        let peer_v4 = NetAddress::from_ip("1.2.3.4".parse().unwrap());
        let best = local.get_local_for_peer(Some(&peer_v4)).unwrap();
        assert_eq!(best, ep("8.8.8.8:9556"));

        // v6 peer: the v6 local wins
        let peer_v6 = NetAddress::from_ip("2001:4860::1".parse().unwrap());
        let best = local.get_local_for_peer(Some(&peer_v6)).unwrap();
        assert_eq!(best, ep("[2607:f8b0::5]:9556"));
    }

    #[test]
    fn test_limited_blocks_add() {
        let mut local = LocalAddrs::new(true);
        local.set_limited(NetworkClass::Ipv4, true);
        assert!(!local.add_local(ep("8.8.8.8:9556"), LOCAL_IF));
        assert!(local.is_limited_addr(&ep("8.8.8.8:9556").addr));
    }

    #[test]
    fn test_ipv6_reachable_implies_ipv4() {
        let mut local = LocalAddrs::new(true);
        local.set_reachable(NetworkClass::Ipv6, true);
        assert!(local.is_reachable(&NetAddress::from_ip("8.8.8.8".parse().unwrap())));
    }

    #[test]
    fn test_unroutable_never_limited() {
        let mut local = LocalAddrs::new(true);
        local.set_limited(NetworkClass::Unroutable, true);
        assert!(!local.is_limited(NetworkClass::Unroutable));
    }
}
