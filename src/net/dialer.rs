//! Outbound connection dialers
//!
//! Two loops run alongside the reactor: the general dialer feeds on the
//! address book under the outbound permit budget, and the added-node
//! dialer keeps user-pinned connections alive. Both exit on shutdown.

use super::addrbook::{AddressBook, AddressRecord};
use super::peer::{PeerSession, ResetState};
use super::protocol::{NetEvent, Network};
use super::types::{ADDED_NODE_RETRY_SECS, AddrEntry, CONNECT_TIMEOUT_SECS, Endpoint, NetAddress};
use crate::types::now;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Built-in bootstrap addresses, injected only when the address book is
/// still empty a minute after start.
const SEED_NODES: [&str; 6] = [
    "51.68.44.12",
    "95.179.164.73",
    "144.202.63.9",
    "163.172.151.40",
    "45.77.121.204",
    "107.191.41.120",
];

/// Give up after this many address-book picks in one pass and let the
/// outer loop sleep, refresh its group set and retry.
const MAX_SELECT_TRIES: u32 = 100;

/// General dialer task body.
pub(crate) async fn open_connections_loop(net: Arc<Network>) {
    info!("open connections thread started");

    // -connect pins the node to an explicit list; nothing else is dialed
    if !net.config.connect.is_empty() {
        connect_only_loop(&net).await;
        return;
    }

    let start_time = now();
    while !net.is_shutting_down() {
        process_one_shot(&net).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        if net.is_shutting_down() {
            return;
        }

        // reset rendezvous, dialer leg: reconnect cleared sessions
        for peer in net.peer_snapshot() {
            if peer.reset_state() == ResetState::WaitingForConnected {
                reconnect_reset(&net, &peer).await;
            }
        }

        // one permit per outbound session, blocking until a slot frees.
        // Shutdown posts permits to unblock us; re-check the flag after.
        let Ok(permit) = net.outbound_permits().acquire_owned().await else {
            return;
        };
        if net.is_shutting_down() {
            return;
        }

        if net.book().size() == 0 && now() - start_time > 60 {
            inject_seed_nodes(&net);
        }

        let (connected_groups, outbound_count) = net.outbound_groups();
        let candidate = select_candidate(
            net.book(),
            &connected_groups,
            outbound_count,
            &|endpoint| net.is_local_endpoint(endpoint),
            &|addr| net.is_limited_addr(addr),
            net.config.default_port,
        );

        if let Some(record) = candidate {
            open_network_connection(&net, Some(record.endpoint), Some(permit), None, false).await;
        }
        // no candidate: the permit drops here and returns to the budget
    }
}

/// Pick a dialable address. Biased toward untried addresses as the
/// outbound count grows; gives up after `MAX_SELECT_TRIES` picks.
///
/// `tries` is the pick counter of this pass, not a per-address stat:
/// very recently tried addresses are only considered after 30 picks and
/// non-default ports only after 50, so early picks go to fresh,
/// well-known endpoints.
pub fn select_candidate(
    book: &dyn AddressBook,
    connected_groups: &HashSet<Vec<u8>>,
    outbound_count: usize,
    is_local: &dyn Fn(&Endpoint) -> bool,
    is_limited: &dyn Fn(&NetAddress) -> bool,
    default_port: u16,
) -> Option<AddressRecord> {
    let unk_bias = 10 + (outbound_count.min(8) as u32) * 10;
    let t = now();
    let mut tries = 0u32;

    loop {
        let record = book.select(unk_bias)?;
        let endpoint = record.endpoint;

        // an invalid pick, a group collision or one of our own
        // addresses ends the pass
        if !endpoint.addr.is_routable()
            || connected_groups.contains(&endpoint.addr.group_key())
            || is_local(&endpoint)
        {
            return None;
        }

        tries += 1;
        if tries > MAX_SELECT_TRIES {
            return None;
        }

        if is_limited(&endpoint.addr) {
            continue;
        }
        if t - record.last_try < 600 && tries < 30 {
            continue;
        }
        if endpoint.port != default_port && tries < 50 {
            continue;
        }

        return Some(record);
    }
}

/// `-connect` mode: dial only the configured addresses, round-robin,
/// with a backoff that grows with each full pass.
async fn connect_only_loop(net: &Arc<Network>) {
    let mut pass: u64 = 0;
    while !net.is_shutting_down() {
        process_one_shot(net).await;
        for dest in &net.config.connect {
            open_network_connection(net, None, None, Some(dest.as_str()), false).await;
            for _ in 0..pass.min(10) {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if net.is_shutting_down() {
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        pass += 1;
    }
}

/// Drain one entry from the one-shot queue under a non-blocking permit
/// acquire. A failed dial re-queues the destination.
async fn process_one_shot(net: &Arc<Network>) {
    let Some(dest) = net.pop_one_shot() else {
        return;
    };
    let Ok(permit) = net.outbound_permits().try_acquire_owned() else {
        // no permit free right now, keep it queued
        net.add_one_shot(dest);
        return;
    };
    if !open_network_connection(net, None, Some(permit), Some(dest.as_str()), true).await {
        net.add_one_shot(dest);
    }
}

/// Hard-coded seeds get a last-seen randomized one to two weeks in the
/// past, so real gossip immediately outranks them.
fn inject_seed_nodes(net: &Arc<Network>) {
    let mut rng = rand::thread_rng();
    let week = 7 * 24 * 60 * 60;
    let entries: Vec<AddrEntry> = SEED_NODES
        .iter()
        .filter_map(|ip| ip.parse().ok())
        .map(|ip| {
            let endpoint = Endpoint::new(NetAddress::from_ip(ip), net.config.default_port);
            let mut entry = AddrEntry::new(endpoint, net.config.services);
            entry.last_seen = now() - week - rng.gen_range(0..week);
            entry
        })
        .collect();
    let source = NetAddress::from_ip("127.0.0.1".parse().unwrap());
    let added = net.book().add(entries, &source);
    info!("injected {} built-in seed addresses", added);
}

/// Added-node dialer task body: make sure at least one endpoint per
/// `-addnode` entry stays connected, re-attempting missing ones every
/// two minutes.
pub(crate) async fn added_connections_loop(net: Arc<Network>) {
    if net.config.add_nodes.is_empty() {
        return;
    }
    info!("open added connections thread started");

    // name-proxy mode: no local resolution, each entry is an opaque
    // destination handed to the connector
    if net.config.name_proxy {
        while !net.is_shutting_down() {
            for dest in &net.config.add_nodes {
                let Ok(permit) = net.outbound_permits().acquire_owned().await else {
                    return;
                };
                if net.is_shutting_down() {
                    return;
                }
                open_network_connection(&net, None, Some(permit), Some(dest.as_str()), false)
                    .await;
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            if sleep_checking_shutdown(&net, ADDED_NODE_RETRY_SECS).await {
                return;
            }
        }
        return;
    }

    // resolve every entry once; an entry can expand to several
    // endpoints when the name has multiple records
    let mut resolved: Vec<Vec<Endpoint>> = Vec::new();
    for dest in &net.config.add_nodes {
        let endpoints = resolve_destination(dest, net.config.default_port).await;
        if endpoints.is_empty() {
            warn!("addnode {}: no addresses resolved", dest);
            continue;
        }
        for endpoint in &endpoints {
            net.register_addnode_addr(endpoint.addr);
        }
        resolved.push(endpoints);
    }

    while !net.is_shutting_down() {
        // keep only the entries with no live connection
        let peers = net.peer_snapshot();
        let missing: Vec<&Vec<Endpoint>> = resolved
            .iter()
            .filter(|endpoints| {
                !peers
                    .iter()
                    .any(|p| endpoints.iter().any(|e| p.addr == *e))
            })
            .collect();

        for endpoints in missing {
            let Ok(permit) = net.outbound_permits().acquire_owned().await else {
                return;
            };
            if net.is_shutting_down() {
                return;
            }
            open_network_connection(&net, Some(endpoints[0]), Some(permit), None, false).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        if sleep_checking_shutdown(&net, ADDED_NODE_RETRY_SECS).await {
            return;
        }
    }
}

/// Sleep in one-second steps so shutdown is observed promptly.
/// Returns true when shutdown was requested.
async fn sleep_checking_shutdown(net: &Arc<Network>, secs: u64) -> bool {
    for _ in 0..secs {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if net.is_shutting_down() {
            return true;
        }
    }
    false
}

async fn resolve_destination(dest: &str, default_port: u16) -> Vec<Endpoint> {
    let query = if dest.contains(':') && !dest.starts_with('[') {
        dest.to_string()
    } else {
        format!("{}:{}", dest, default_port)
    };
    match tokio::net::lookup_host(&query).await {
        Ok(addrs) => addrs.map(Endpoint::from).collect(),
        Err(err) => {
            debug!("resolve {} failed: {}", dest, err);
            Vec::new()
        }
    }
}

/// Initiate one outbound connection. On success the permit (if any)
/// moves into the new session for its lifetime; on failure it drops
/// back to the budget before the caller's next acquire.
pub(crate) async fn open_network_connection(
    net: &Arc<Network>,
    endpoint: Option<Endpoint>,
    permit: Option<OwnedSemaphorePermit>,
    dest: Option<&str>,
    one_shot: bool,
) -> bool {
    if net.is_shutting_down() {
        return false;
    }
    if dest.is_none() {
        let Some(endpoint) = endpoint else {
            return false;
        };
        if net.is_local_endpoint(&endpoint)
            || net.find_node(&endpoint.addr).is_some()
            || net.is_banned(&endpoint.addr)
            || net.find_node_by_name(&endpoint.to_string()).is_some()
        {
            return false;
        }
    }
    if let Some(dest) = dest
        && net.find_node_by_name(dest).is_some()
    {
        debug!("already connected to {}", dest);
        return false;
    }

    let Some(peer) = connect_node(net, endpoint, dest).await else {
        return false;
    };
    if let Some(permit) = permit {
        peer.grant_outbound(permit);
    }
    if one_shot {
        peer.one_shot.store(true, std::sync::atomic::Ordering::SeqCst);
    }
    true
}

/// TCP connect, session construction, version push.
async fn connect_node(
    net: &Arc<Network>,
    endpoint: Option<Endpoint>,
    dest: Option<&str>,
) -> Option<Arc<PeerSession>> {
    let (endpoint, addr_name) = match dest {
        Some(dest) => {
            let endpoints = resolve_destination(dest, net.config.default_port).await;
            (*endpoints.first()?, dest.to_string())
        }
        None => (endpoint?, String::new()),
    };

    debug!("trying connection {}", endpoint);
    net.book().attempt(&endpoint);

    let stream = match tokio::time::timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        TcpStream::connect(endpoint.socket_addr()),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!("connect {} failed: {}", endpoint, err);
            return None;
        }
        Err(_) => {
            debug!("connect {} timed out", endpoint);
            return None;
        }
    };

    info!("connected {}", endpoint);
    let peer = Arc::new(PeerSession::new(endpoint, &addr_name, false));
    peer.set_socket(stream).await;
    net.push_version(&peer).await;
    net.add_peer(Arc::clone(&peer));
    net.emit(NetEvent::Connected { endpoint, inbound: false });
    Some(peer)
}

/// Reset rendezvous, final leg: reconnect the cleared session to the
/// same endpoint and re-handshake.
async fn reconnect_reset(net: &Arc<Network>, peer: &Arc<PeerSession>) {
    net.book().attempt(&peer.addr);
    match tokio::time::timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        TcpStream::connect(peer.addr.socket_addr()),
    )
    .await
    {
        Ok(Ok(stream)) => {
            peer.set_socket(stream).await;
            peer.set_reset(ResetState::Idle);
            net.push_version(peer).await;
            info!("reset finished, node {}", peer.addr_name);
        }
        _ => {
            warn!("reset reconnect to {} failed, dropping", peer.addr_name);
            peer.disconnect.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    /// Scripted address book: hands out a fixed sequence of records.
    struct ScriptedBook {
        records: Mutex<Vec<AddressRecord>>,
        cursor: Mutex<usize>,
    }

    impl ScriptedBook {
        fn new(endpoints: &[&str]) -> Self {
            let records = endpoints
                .iter()
                .map(|s| {
                    let sa: SocketAddr = s.parse().unwrap();
                    AddressRecord {
                        endpoint: Endpoint::from(sa),
                        services: 1,
                        last_seen: now(),
                        last_try: 0,
                        attempts: 0,
                    }
                })
                .collect();
            Self {
                records: Mutex::new(records),
                cursor: Mutex::new(0),
            }
        }
    }

    impl AddressBook for ScriptedBook {
        fn select(&self, _unk_bias_percent: u32) -> Option<AddressRecord> {
            let records = self.records.lock().unwrap();
            let mut cursor = self.cursor.lock().unwrap();
            let record = records.get(*cursor % records.len().max(1)).cloned();
            *cursor += 1;
            record
        }
        fn connected(&self, _endpoint: &Endpoint) {}
        fn attempt(&self, _endpoint: &Endpoint) {}
        fn add(&self, _records: Vec<AddrEntry>, _source: &NetAddress) -> usize {
            0
        }
        fn size(&self) -> usize {
            self.records.lock().unwrap().len()
        }
        fn dump(&self) -> Result<(), std::io::Error> {
            Ok(())
        }
    }

    fn no_local(_: &Endpoint) -> bool {
        false
    }

    fn no_limit(_: &NetAddress) -> bool {
        false
    }

    #[test]
    fn test_candidate_skips_connected_group() {
        // ten addresses in one /16 group plus one in another
        let mut addrs: Vec<String> =
            (1..=10).map(|i| format!("192.0.78.{}:9556", i)).collect();
        addrs.push("198.51.178.1:9556".to_string());
        let addr_refs: Vec<&str> = addrs.iter().map(|s| s.as_str()).collect();
        let book = ScriptedBook::new(&addr_refs);

        let mut groups = HashSet::new();
        groups.insert(
            NetAddress::from_ip("192.0.78.1".parse().unwrap()).group_key(),
        );

        // first pick collides with the connected group: the pass ends
        // without a candidate rather than dialing into the same group
        let picked = select_candidate(&book, &groups, 1, &no_local, &no_limit, 9556);
        assert!(picked.is_none());
    }

    #[test]
    fn test_candidate_diverse_group_accepted() {
        let book = ScriptedBook::new(&["198.51.178.1:9556"]);
        let mut groups = HashSet::new();
        groups.insert(
            NetAddress::from_ip("192.0.78.1".parse().unwrap()).group_key(),
        );
        let picked =
            select_candidate(&book, &groups, 1, &no_local, &no_limit, 9556).unwrap();
        assert_eq!(
            picked.endpoint.addr,
            NetAddress::from_ip("198.51.178.1".parse().unwrap())
        );
    }

    #[test]
    fn test_candidate_nondefault_port_needs_churn() {
        let book = ScriptedBook::new(&["198.51.178.1:1234"]);
        let picked = select_candidate(&book, &HashSet::new(), 0, &no_local, &no_limit, 9556);
        // a non-default port is only accepted once 50 picks have churned
        assert!(picked.is_some());
        assert!(book.cursor.lock().unwrap().ge(&50));
    }

    #[test]
    fn test_candidate_skips_recently_tried_early() {
        let book = ScriptedBook::new(&["198.51.178.1:9556"]);
        {
            let mut records = book.records.lock().unwrap();
            records[0].last_try = now() - 30;
        }
        // a single fresh-tried address is skipped until the pick counter
        // reaches 30, after which it is accepted
        let picked =
            select_candidate(&book, &HashSet::new(), 0, &no_local, &no_limit, 9556);
        assert!(picked.is_some());
        assert!(book.cursor.lock().unwrap().ge(&30));
    }

    #[test]
    fn test_candidate_rejects_local() {
        let book = ScriptedBook::new(&["198.51.178.1:9556"]);
        let picked = select_candidate(
            &book,
            &HashSet::new(),
            0,
            &|_| true,
            &no_limit,
            9556,
        );
        assert!(picked.is_none());
    }

    #[test]
    fn test_candidate_empty_book() {
        let book = ScriptedBook::new(&[]);
        let picked = select_candidate(&book, &HashSet::new(), 0, &no_local, &no_limit, 9556);
        assert!(picked.is_none());
    }

    #[test]
    fn test_unk_bias_formula() {
        // bias = 10 + min(outbound, 8) * 10, asserted via a probe book
        struct BiasProbe(Mutex<u32>);
        impl AddressBook for BiasProbe {
            fn select(&self, unk_bias_percent: u32) -> Option<AddressRecord> {
                *self.0.lock().unwrap() = unk_bias_percent;
                None
            }
            fn connected(&self, _: &Endpoint) {}
            fn attempt(&self, _: &Endpoint) {}
            fn add(&self, _: Vec<AddrEntry>, _: &NetAddress) -> usize {
                0
            }
            fn size(&self) -> usize {
                0
            }
            fn dump(&self) -> Result<(), std::io::Error> {
                Ok(())
            }
        }

        for (outbound, expected) in [(0, 10), (3, 40), (8, 90), (20, 90)] {
            let probe = BiasProbe(Mutex::new(0));
            select_candidate(&probe, &HashSet::new(), outbound, &no_local, &no_limit, 9556);
            assert_eq!(*probe.0.lock().unwrap(), expected);
        }
    }

    #[test]
    fn test_scripted_empty_book_no_divide_by_zero() {
        let book = ScriptedBook::new(&[]);
        assert!(book.select(50).is_none());
    }
}
