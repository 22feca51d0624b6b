//! Socket reactor: listen, accept, service, reap
//!
//! A single task owns all socket readiness work. Every pass it reaps
//! sessions marked for disconnect, services pending resets, accepts
//! inbound connections, then moves bytes between sockets and the
//! per-peer buffers. Buffer access is try-lock only; a contended lock
//! defers that peer to the next pass instead of stalling the reactor.

use super::peer::{PeerSession, ResetState};
use super::protocol::{NetError, NetEvent, Network};
use super::types::{
    Endpoint, HANDSHAKE_IDLE_SECS, INACTIVITY_SECS, LOCAL_BIND, RECV_CHUNK_BYTES,
    SOCKET_POLL_MILLIS,
};
use crate::types::now;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bind and listen on `addr`. Failure here is fatal to the node and is
/// reported as an error string to the caller.
pub fn bind_listen_port(addr: SocketAddr) -> Result<std::net::TcpListener, NetError> {
    let listener = std::net::TcpListener::bind(addr)
        .map_err(|e| NetError::Bind(format!("unable to bind to {}: {}", addr, e)))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| NetError::Bind(format!("unable to configure listener on {}: {}", addr, e)))?;
    info!("bound to {}", addr);
    Ok(listener)
}

impl Network {
    /// Open a listen socket and register the bind address as a local
    /// service candidate. Returns the bound address (port resolved).
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, NetError> {
        let listener = bind_listen_port(addr)?;
        let bound = listener.local_addr().map_err(NetError::Io)?;
        self.add_listener(listener);
        let endpoint = Endpoint::from(bound);
        if endpoint.addr.is_routable() {
            self.add_local(endpoint, LOCAL_BIND);
        }
        Ok(bound)
    }
}

/// Reactor task body. Exits when shutdown is requested.
pub(crate) async fn reactor_loop(net: Arc<Network>) {
    info!("socket handler started");
    let mut recv_chunk = vec![0u8; RECV_CHUNK_BYTES];
    let mut prev_count = 0usize;

    while !net.is_shutting_down() {
        reap_disconnected(&net).await;

        let peers = net.peer_snapshot();
        if peers.len() != prev_count {
            prev_count = peers.len();
            net.emit(NetEvent::CountChanged(prev_count));
        }

        // reset rendezvous, reactor leg: close the socket, hand the
        // session to the message handler for the state clear
        for peer in &peers {
            if peer.reset_state() == ResetState::WaitingForDisconnect {
                peer.disconnect_for_reset().await;
            }
        }

        accept_pass(&net).await;

        for peer in &peers {
            if net.is_shutting_down() {
                return;
            }
            service_peer(&net, peer, &mut recv_chunk);
            inactivity_check(peer);
        }

        tokio::time::sleep(Duration::from_millis(SOCKET_POLL_MILLIS)).await;
    }
    info!("socket handler exited");
}

/// Remove sessions whose disconnect flag is set. The outbound permit is
/// released here, exactly once; the allocation itself dies with the
/// last `Arc` holder.
async fn reap_disconnected(net: &Arc<Network>) {
    let reaped = net.take_disconnected();
    for peer in reaped {
        debug!(
            "remove node {}, inbound: {}, misbehavior: {}",
            peer.addr_name,
            peer.inbound,
            peer.misbehavior.load(Ordering::SeqCst)
        );
        peer.release_outbound();
        peer.close_socket_disconnect().await;
        if let Ok(mut send) = peer.send_buf.try_lock() {
            send.clear();
        }
        net.emit(NetEvent::Disconnected { endpoint: peer.addr });
    }
}

/// Accept everything pending on every listen socket.
async fn accept_pass(net: &Arc<Network>) {
    let accepted = net.drain_pending_accepts();
    for (stream, remote) in accepted {
        let endpoint = Endpoint::from(remote);
        let max_inbound = net.config.max_connections - net.config.max_outbound;
        let is_addnode = net.is_addnode_addr(&endpoint.addr);

        if net.inbound_count() >= max_inbound && !is_addnode {
            debug!("connection from {} dropped (inbound full)", endpoint);
            continue;
        }
        if net.is_banned(&endpoint.addr) && !is_addnode {
            info!("connection from {} dropped (banned)", endpoint);
            continue;
        }
        if stream.set_nonblocking(true).is_err() {
            continue;
        }
        let stream = match tokio::net::TcpStream::from_std(stream) {
            Ok(s) => s,
            Err(err) => {
                warn!("accepted socket rejected: {}", err);
                continue;
            }
        };

        let peer = Arc::new(PeerSession::new(endpoint, "", true));
        peer.set_socket(stream).await;
        info!("accepted node {}", endpoint);
        net.add_peer(Arc::clone(&peer));
        net.emit(NetEvent::Connected { endpoint, inbound: true });
    }
}

/// Move bytes for one peer: bounded read into the recv buffer (flood
/// control above the high-water mark), then drain as much of the send
/// buffer as the socket takes. Transient errors are skipped.
fn service_peer(net: &Arc<Network>, peer: &Arc<PeerSession>, recv_chunk: &mut [u8]) {
    let Some(mut socket_guard) = peer.try_socket() else {
        return;
    };
    let Some(socket) = socket_guard.as_mut() else {
        return;
    };

    // Receive
    let mut drop_socket = false;
    if let Ok(mut recv) = peer.recv_buf.try_lock() {
        if recv.len() > net.config.max_receive_buffer {
            if !peer.is_disconnecting() {
                warn!(
                    "recv flood control disconnect ({} bytes), node {}",
                    recv.len(),
                    peer.addr_name
                );
            }
            recv.clear();
            peer.disconnect.store(true, Ordering::SeqCst);
            drop_socket = true;
        } else {
            match socket.try_read(recv_chunk) {
                Ok(0) => {
                    // closed gracefully
                    if !peer.is_disconnecting() {
                        debug!("socket closed, node {}", peer.addr_name);
                    }
                    peer.disconnect.store(true, Ordering::SeqCst);
                    drop_socket = true;
                }
                Ok(n) => {
                    recv.extend_from_slice(&recv_chunk[..n]);
                    peer.record_recv();
                }
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    if !peer.is_disconnecting() {
                        debug!("socket recv error {}, node {}", err, peer.addr_name);
                    }
                    peer.disconnect.store(true, Ordering::SeqCst);
                    drop_socket = true;
                }
            }
        }
    }

    // Send
    if !drop_socket
        && let Ok(mut send) = peer.send_buf.try_lock()
    {
        if !send.is_empty() {
            match socket.try_write(&send) {
                Ok(n) if n > 0 => {
                    send.drain(..n);
                    peer.record_send();
                }
                Ok(_) => {}
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!("socket send error {}, node {}", err, peer.addr_name);
                    peer.disconnect.store(true, Ordering::SeqCst);
                    drop_socket = true;
                }
            }
        }
        if send.is_empty() {
            peer.last_send_empty.store(now(), Ordering::SeqCst);
        }
    }

    if drop_socket {
        *socket_guard = None;
    }
}

/// Drop peers that have gone quiet:
/// no traffic at all in the first minute, a send buffer nothing has
/// drained from for 90 minutes, or nothing received for 90 minutes.
fn inactivity_check(peer: &Arc<PeerSession>) {
    let t = now();
    if t - peer.time_connected.load(Ordering::SeqCst) <= HANDSHAKE_IDLE_SECS {
        return;
    }
    let last_recv = peer.last_recv.load(Ordering::SeqCst);
    let last_send = peer.last_send.load(Ordering::SeqCst);
    let last_send_empty = peer.last_send_empty.load(Ordering::SeqCst);

    if last_recv == 0 || last_send == 0 {
        debug!(
            "socket no message in first {} seconds, node {}",
            HANDSHAKE_IDLE_SECS, peer.addr_name
        );
        peer.disconnect.store(true, Ordering::SeqCst);
    } else if t - last_send > INACTIVITY_SECS && t - last_send_empty > INACTIVITY_SECS {
        debug!("socket not sending, node {}", peer.addr_name);
        peer.disconnect.store(true, Ordering::SeqCst);
    } else if t - last_recv > INACTIVITY_SECS {
        debug!("socket inactivity timeout, node {}", peer.addr_name);
        peer.disconnect.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listen_port() {
        let listener = bind_listen_port("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port > 0);
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let first = bind_listen_port("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        let second = bind_listen_port(addr);
        assert!(matches!(second, Err(NetError::Bind(_))));
    }

    #[test]
    fn test_inactivity_first_minute_grace() {
        let sa: SocketAddr = "1.2.3.4:9556".parse().unwrap();
        let peer = Arc::new(PeerSession::new(Endpoint::from(sa), "", true));
        // just connected, no traffic: inside the grace window
        inactivity_check(&peer);
        assert!(!peer.is_disconnecting());

        // pretend the connection is 2 minutes old with no traffic
        peer.time_connected.store(now() - 120, Ordering::SeqCst);
        inactivity_check(&peer);
        assert!(peer.is_disconnecting());
    }

    #[test]
    fn test_inactivity_receive_timeout() {
        let sa: SocketAddr = "1.2.3.4:9556".parse().unwrap();
        let peer = Arc::new(PeerSession::new(Endpoint::from(sa), "", true));
        peer.time_connected.store(now() - 7200, Ordering::SeqCst);
        peer.last_send.store(now(), Ordering::SeqCst);
        peer.last_send_empty.store(now(), Ordering::SeqCst);
        peer.last_recv.store(now() - INACTIVITY_SECS - 1, Ordering::SeqCst);
        inactivity_check(&peer);
        assert!(peer.is_disconnecting());
    }

    #[test]
    fn test_active_peer_not_swept() {
        let sa: SocketAddr = "1.2.3.4:9556".parse().unwrap();
        let peer = Arc::new(PeerSession::new(Endpoint::from(sa), "", true));
        peer.time_connected.store(now() - 7200, Ordering::SeqCst);
        peer.last_send.store(now() - 5, Ordering::SeqCst);
        peer.last_send_empty.store(now() - 5, Ordering::SeqCst);
        peer.last_recv.store(now() - 5, Ordering::SeqCst);
        inactivity_check(&peer);
        assert!(!peer.is_disconnecting());
    }
}
