// Farthing Network Layer - Constants and Types
// Copyright (c) 2024-2026 Farthing developers
// Distributed under the MIT software license.

//! Network constants and types for the Farthing P2P layer.
//!
//! Addresses are stored in a canonical 16-byte form (IPv4 embedded as
//! `::ffff:a.b.c.d`) so that equality, grouping and bucket placement do
//! not depend on how an address was originally written.

use crate::types::{Hash, now};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Protocol version number advertised in the handshake.
pub const PROTOCOL_VERSION: u32 = 70002;

/// First protocol version able to answer `getheaders` with an explicit
/// stop hash. Older peers are excluded from the sync engine.
pub const MIN_GETHEADERS_VERSION: u32 = 70002;

/// Version range of historical clients that never relay blocks.
/// A peer inside `[NOBLKS_VERSION_START, NOBLKS_VERSION_END)` is skipped
/// by the sync engine.
pub const NOBLKS_VERSION_START: u32 = 32000;
pub const NOBLKS_VERSION_END: u32 = 32400;

/// Magic bytes prefixed to every framed message.
/// Prevents cross-talk with other P2P networks on the same port.
pub const PROTOCOL_MAGIC: [u8; 4] = *b"FRTH";

/// Default TCP port for mainnet.
pub const DEFAULT_PORT: u16 = 9556;

// =============================================================================
// CONNECTION LIMITS
// =============================================================================

/// Default total peer connections (`-maxconnections`).
pub const DEFAULT_MAX_CONNECTIONS: usize = 125;

/// Clamp range for `-maxconnections`.
pub const MIN_CONNECTIONS: usize = 8;
pub const MAX_CONNECTIONS: usize = 1000;

/// Default outbound connections (`-maxoutbound`).
pub const DEFAULT_MAX_OUTBOUND: usize = 8;

/// Clamp range for `-maxoutbound`. Also clamped to `-maxconnections`.
pub const MIN_OUTBOUND_CONNECTIONS: usize = 4;
pub const MAX_OUTBOUND_CONNECTIONS: usize = 100;

// =============================================================================
// TIMEOUTS AND INTERVALS
// =============================================================================

/// Reactor poll interval in milliseconds. This is the cadence at which
/// peer send buffers are re-examined for pending bytes.
pub const SOCKET_POLL_MILLIS: u64 = 50;

/// Message-handler loop interval in milliseconds.
pub const HANDLER_POLL_MILLIS: u64 = 100;

/// A fresh connection with no traffic in either direction after this
/// many seconds is dropped.
pub const HANDSHAKE_IDLE_SECS: i64 = 60;

/// A peer silent (or unable to drain our send buffer) for this long is
/// dropped.
pub const INACTIVITY_SECS: i64 = 90 * 60;

/// Outbound TCP connect timeout in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Address book flush interval (`peers.dat`).
pub const DUMP_ADDRESSES_SECS: u64 = 100;

/// Added-node re-attempt interval.
pub const ADDED_NODE_RETRY_SECS: u64 = 120;

/// Repeat `ask_for` spacing for the same inventory id.
pub const ASK_FOR_SPACING_SECS: i64 = 2 * 60;

/// Relay cache entries expire this many seconds after insertion.
pub const RELAY_EXPIRY_SECS: i64 = 15 * 60;

/// Maximum bytes pulled off a socket per reactor pass.
pub const RECV_CHUNK_BYTES: usize = 0x10000;

/// Default receive-buffer high water mark (`-maxreceivebuffer`), bytes.
/// A peer whose pending unprocessed bytes exceed this is disconnected.
pub const DEFAULT_MAX_RECEIVE_BUFFER: usize = 5_000_000;

// =============================================================================
// BAN DEFAULTS
// =============================================================================

/// Misbehavior score at which a peer is banned (`-banscore`).
pub const DEFAULT_BAN_SCORE: u32 = 100;

/// Ban duration in seconds (`-bantime`).
pub const DEFAULT_BAN_SECS: i64 = 60 * 60 * 24;

// =============================================================================
// SERVICE FLAGS
// =============================================================================

/// NODE_NETWORK: serves the full chain. Peers without it are "client"
/// peers and never selected for sync.
pub const NODE_NETWORK: u64 = 1 << 0;

// =============================================================================
// LOCAL ADDRESS SCORES
// =============================================================================
// Higher score wins when several local candidates are equally reachable
// from a peer.

pub const LOCAL_NONE: i32 = 0;
/// Learned from an interface scan.
pub const LOCAL_IF: i32 = 1;
/// Learned from the listen bind address.
pub const LOCAL_BIND: i32 = 2;
/// Learned from an external HTTP probe.
pub const LOCAL_HTTP: i32 = 3;
/// Explicitly configured. Overrides `set_limited` for its own network.
pub const LOCAL_MANUAL: i32 = 4;

// =============================================================================
// NETWORK CLASSES
// =============================================================================

/// Address family classification used for reachability scoring and
/// `-onlynet` style limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkClass {
    Unroutable,
    Ipv4,
    Ipv6,
    Onion,
    Teredo,
}

impl NetworkClass {
    pub const ALL: [NetworkClass; 5] = [
        NetworkClass::Unroutable,
        NetworkClass::Ipv4,
        NetworkClass::Ipv6,
        NetworkClass::Onion,
        NetworkClass::Teredo,
    ];

    pub fn index(self) -> usize {
        match self {
            NetworkClass::Unroutable => 0,
            NetworkClass::Ipv4 => 1,
            NetworkClass::Ipv6 => 2,
            NetworkClass::Onion => 3,
            NetworkClass::Teredo => 4,
        }
    }
}

// Reachability ladder, worst to best. The handshake advertises whichever
// of our local addresses scores highest against the remote peer.
const REACH_UNREACHABLE: i32 = 0;
const REACH_DEFAULT: i32 = 1;
const REACH_TEREDO: i32 = 2;
const REACH_IPV6_WEAK: i32 = 3;
const REACH_IPV4: i32 = 4;
const REACH_IPV6_STRONG: i32 = 5;

// =============================================================================
// NETWORK ADDRESS
// =============================================================================

/// OnionCat prefix (fd87:d87e:eb43::/48) used to tunnel Tor v2 addresses
/// through the IPv6 address space.
const ONION_PREFIX: [u8; 6] = [0xfd, 0x87, 0xd8, 0x7e, 0xeb, 0x43];

/// Canonical peer address: 16 bytes, IPv4 embedded as `::ffff:a.b.c.d`.
///
/// Two addresses are equal iff their canonical bytes match, regardless
/// of the family they were parsed from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    octets: [u8; 16],
}

impl NetAddress {
    pub fn from_ip(ip: IpAddr) -> Self {
        let octets = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self { octets }
    }

    pub fn octets(&self) -> &[u8; 16] {
        &self.octets
    }

    /// Original-family view: embedded IPv4 comes back out as IPv4.
    pub fn ip(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.octets);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    fn as_ipv4(&self) -> Option<Ipv4Addr> {
        Ipv6Addr::from(self.octets).to_ipv4_mapped()
    }

    pub fn is_onion(&self) -> bool {
        self.octets[..6] == ONION_PREFIX
    }

    pub fn is_teredo(&self) -> bool {
        self.octets[0] == 0x20
            && self.octets[1] == 0x01
            && self.octets[2] == 0
            && self.octets[3] == 0
    }

    /// RFC3964 6to4 tunnel (2002::/16). Scores as weak IPv6.
    fn is_6to4(&self) -> bool {
        self.octets[0] == 0x20 && self.octets[1] == 0x02
    }

    /// Loopback or unspecified. Such addresses never accrue bans and are
    /// never dialed from the address book.
    pub fn is_local(&self) -> bool {
        match self.ip() {
            IpAddr::V4(v4) => v4.is_loopback() || v4.is_unspecified(),
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        }
    }

    pub fn network_class(&self) -> NetworkClass {
        if !self.is_routable() {
            return NetworkClass::Unroutable;
        }
        if self.is_onion() {
            return NetworkClass::Onion;
        }
        if self.as_ipv4().is_some() {
            return NetworkClass::Ipv4;
        }
        if self.is_teredo() {
            return NetworkClass::Teredo;
        }
        NetworkClass::Ipv6
    }

    /// Globally routable check. Filters private ranges, loopback,
    /// link-local, documentation, broadcast, multicast and unspecified.
    pub fn is_routable(&self) -> bool {
        if self.is_onion() {
            return true;
        }
        match self.ip() {
            IpAddr::V4(ip) => {
                !ip.is_private()
                    && !ip.is_loopback()
                    && !ip.is_link_local()
                    && !ip.is_broadcast()
                    && !ip.is_documentation()
                    && !ip.is_unspecified()
            }
            IpAddr::V6(ip) => {
                if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
                    return false;
                }
                let segments = ip.segments();
                // fc00::/7 unique local
                if (segments[0] & 0xfe00) == 0xfc00 {
                    return false;
                }
                // fe80::/10 link-local
                if (segments[0] & 0xffc0) == 0xfe80 {
                    return false;
                }
                // 2001:db8::/32 documentation
                if segments[0] == 0x2001 && segments[1] == 0x0db8 {
                    return false;
                }
                true
            }
        }
    }

    /// Network group used for outbound diversity: at most one outbound
    /// peer per group. `/16` for IPv4, `/32` for IPv6, the whole address
    /// for unroutable ones (each is its own group).
    pub fn group_key(&self) -> Vec<u8> {
        let class = self.network_class();
        let mut key = vec![class.index() as u8];
        match class {
            NetworkClass::Unroutable => key.extend_from_slice(&self.octets),
            NetworkClass::Ipv4 => {
                let v4 = self.as_ipv4().map(|ip| ip.octets()).unwrap_or_default();
                key.extend_from_slice(&v4[..2]);
            }
            NetworkClass::Ipv6 | NetworkClass::Teredo => key.extend_from_slice(&self.octets[..4]),
            NetworkClass::Onion => key.extend_from_slice(&self.octets[6..10]),
        }
        key
    }

    /// Score how well this (local) address would serve a connection to
    /// `peer`. Higher is better; the best-scoring local address is the
    /// one advertised to that peer.
    pub fn reachability_from(&self, peer: Option<&NetAddress>) -> i32 {
        if !self.is_routable() {
            return REACH_UNREACHABLE;
        }
        let our = self.network_class();
        let their = peer
            .map(|p| p.network_class())
            .unwrap_or(NetworkClass::Unroutable);
        match their {
            NetworkClass::Ipv4 => match our {
                NetworkClass::Ipv4 => REACH_IPV4,
                _ => REACH_DEFAULT,
            },
            NetworkClass::Ipv6 => match our {
                NetworkClass::Teredo => REACH_TEREDO,
                NetworkClass::Ipv4 => REACH_IPV4,
                NetworkClass::Ipv6 => {
                    if self.is_6to4() {
                        REACH_IPV6_WEAK
                    } else {
                        REACH_IPV6_STRONG
                    }
                }
                _ => REACH_DEFAULT,
            },
            NetworkClass::Teredo => match our {
                NetworkClass::Teredo => REACH_TEREDO,
                NetworkClass::Ipv6 => REACH_IPV6_WEAK,
                NetworkClass::Ipv4 => REACH_IPV4,
                _ => REACH_DEFAULT,
            },
            NetworkClass::Onion => match our {
                NetworkClass::Onion => REACH_IPV6_STRONG,
                NetworkClass::Ipv4 => REACH_IPV4,
                _ => REACH_DEFAULT,
            },
            NetworkClass::Unroutable => match our {
                NetworkClass::Teredo => REACH_TEREDO,
                NetworkClass::Ipv6 => REACH_IPV6_WEAK,
                NetworkClass::Ipv4 => REACH_IPV4,
                _ => REACH_DEFAULT,
            },
        }
    }
}

impl From<IpAddr> for NetAddress {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ip())
    }
}

impl fmt::Debug for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// =============================================================================
// ENDPOINT
// =============================================================================

/// NetAddress plus TCP port. Usable anywhere a bare NetAddress is.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: NetAddress,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: NetAddress, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr.ip(), self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(sa: SocketAddr) -> Self {
        Self {
            addr: NetAddress::from_ip(sa.ip()),
            port: sa.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr.ip() {
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// =============================================================================
// INVENTORY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InvKind {
    Tx = 1,
    Block = 2,
}

/// Inventory identifier: what kind of payload, and which one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash,
}

impl Inv {
    pub fn block(hash: Hash) -> Self {
        Self { kind: InvKind::Block, hash }
    }

    pub fn tx(hash: Hash) -> Self {
        Self { kind: InvKind::Tx, hash }
    }
}

// =============================================================================
// CORE-ORIGINATED PAYLOADS
// =============================================================================
// The full wire codec lives outside this crate; only the handful of
// messages the core itself emits are defined here. Encoded with postcard.

/// Address book entry as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrEntry {
    pub services: u64,
    pub endpoint: Endpoint,
    /// Self-reported last-seen time. Untrusted, freshness heuristic only.
    pub last_seen: i64,
}

impl AddrEntry {
    pub fn new(endpoint: Endpoint, services: u64) -> Self {
        Self { services, endpoint, last_seen: now() }
    }
}

/// Handshake payload pushed as the first message on every outbound
/// connection (and again after a reset-reconnect).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    /// How we see the peer.
    pub addr_recv: AddrEntry,
    /// Best local address for that peer, unspecified if none known.
    pub addr_from: AddrEntry,
    /// Random nonce; a peer receiving its own nonce back is talking to
    /// itself and disconnects.
    pub nonce: u64,
    pub sub_version: String,
    pub start_height: u32,
}

/// Ranged header request: walk forward from the first locator hash the
/// peer recognizes, stop at `stop` (all-zero = no stop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHeadersPayload {
    pub locator: Vec<Hash>,
    pub stop: Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub invs: Vec<Inv>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrPayload {
    pub addrs: Vec<AddrEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        Endpoint::from(s.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn test_canonical_equality() {
        let a = NetAddress::from_ip("1.2.3.4".parse().unwrap());
        let b = NetAddress::from_ip("::ffff:1.2.3.4".parse().unwrap());
        assert_eq!(a, b);
        assert_eq!(a.network_class(), NetworkClass::Ipv4);
    }

    #[test]
    fn test_routable_filtering() {
        let cases = [
            ("8.8.8.8", true),
            ("192.168.1.1", false),
            ("10.0.0.1", false),
            ("127.0.0.1", false),
            ("169.254.1.1", false),
            ("0.0.0.0", false),
        ];
        for (ip, routable) in cases {
            let addr = NetAddress::from_ip(ip.parse().unwrap());
            assert_eq!(addr.is_routable(), routable, "{}", ip);
        }
    }

    #[test]
    fn test_unroutable_class() {
        let addr = NetAddress::from_ip("192.168.1.1".parse().unwrap());
        assert_eq!(addr.network_class(), NetworkClass::Unroutable);
    }

    #[test]
    fn test_group_key_slash16() {
        let a = NetAddress::from_ip("1.2.3.4".parse().unwrap());
        let b = NetAddress::from_ip("1.2.200.200".parse().unwrap());
        let c = NetAddress::from_ip("1.3.3.4".parse().unwrap());
        assert_eq!(a.group_key(), b.group_key());
        assert_ne!(a.group_key(), c.group_key());
    }

    #[test]
    fn test_group_key_unroutable_distinct() {
        let a = NetAddress::from_ip("192.168.1.1".parse().unwrap());
        let b = NetAddress::from_ip("192.168.1.2".parse().unwrap());
        assert_ne!(a.group_key(), b.group_key());
    }

    #[test]
    fn test_reachability_prefers_matching_family() {
        let local_v4 = NetAddress::from_ip("8.8.8.8".parse().unwrap());
        let local_v6 = NetAddress::from_ip("2607:f8b0::1".parse().unwrap());
        let peer_v4 = NetAddress::from_ip("1.2.3.4".parse().unwrap());
        let peer_v6 = NetAddress::from_ip("2001:4860::1".parse().unwrap());

        assert!(
            local_v4.reachability_from(Some(&peer_v4))
                > local_v6.reachability_from(Some(&peer_v4))
        );
        assert!(
            local_v6.reachability_from(Some(&peer_v6))
                > local_v4.reachability_from(Some(&peer_v6))
        );
    }

    #[test]
    fn test_unroutable_local_unreachable() {
        let local = NetAddress::from_ip("192.168.1.1".parse().unwrap());
        let peer = NetAddress::from_ip("1.2.3.4".parse().unwrap());
        assert_eq!(local.reachability_from(Some(&peer)), 0);
    }

    #[test]
    fn test_endpoint_roundtrip() {
        let e = ep("1.2.3.4:9556");
        assert_eq!(e.socket_addr(), "1.2.3.4:9556".parse::<SocketAddr>().unwrap());
        assert_eq!(e.to_string(), "1.2.3.4:9556");
    }

    #[test]
    fn test_is_local() {
        assert!(NetAddress::from_ip("127.0.0.1".parse().unwrap()).is_local());
        assert!(!NetAddress::from_ip("8.8.8.8".parse().unwrap()).is_local());
    }
}
