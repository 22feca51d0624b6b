//! Message-handler loop
//!
//! Drives protocol decode through the external [`ProtocolHandler`],
//! runs the concurrent sync engine while the chain is still in initial
//! download, and services the clear-msg leg of the reset rendezvous.

use super::peer::{PeerSession, ResetState};
use super::protocol::Network;
use super::types::{GetDataPayload, HANDLER_POLL_MILLIS};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Largest getdata batch flushed per pass.
const MAX_GETDATA_BATCH: usize = 1000;

/// Wire-protocol seam. The core moves bytes and schedules; decoding
/// them into messages, driving the version/verack handshake hooks and
/// reacting to payloads is this collaborator's job.
///
/// Both hooks are called from the message-handler task with the
/// relevant buffer lock held, so implementations must not block.
pub trait ProtocolHandler: Send + Sync {
    /// `data` is the peer's receive buffer, bytes in arrival order.
    /// Consume complete frames and leave any trailing partial frame in
    /// place; it will be back, extended, next pass.
    fn process_messages(&self, net: &Arc<Network>, peer: &Arc<PeerSession>, data: &mut Vec<u8>);

    /// Flush queued protocol work for this peer. `trickle` marks the
    /// one randomly chosen peer per pass for rate-limited relay.
    fn send_messages(&self, net: &Arc<Network>, peer: &Arc<PeerSession>, trickle: bool);
}

/// Handler that decodes nothing. Integration tests and the demo binary
/// run the core with this; a real node plugs in its codec.
pub struct NullHandler;

impl ProtocolHandler for NullHandler {
    fn process_messages(&self, _net: &Arc<Network>, _peer: &Arc<PeerSession>, data: &mut Vec<u8>) {
        data.clear();
    }

    fn send_messages(&self, _net: &Arc<Network>, _peer: &Arc<PeerSession>, _trickle: bool) {}
}

/// Handler task body.
pub(crate) async fn message_handler_loop(net: Arc<Network>, handler: Arc<dyn ProtocolHandler>) {
    info!("message handler started");

    while !net.is_shutting_down() {
        let peers = net.peer_snapshot();

        // reset rendezvous, handler leg: wipe sync context the remote
        // still associates with us. Contended locks retry next pass.
        for peer in &peers {
            if peer.reset_state() == ResetState::WaitingForClearMsg {
                peer.try_clear_for_reset();
            }
        }

        if net.chain().is_initial_block_download() {
            net.sync_engine().lock().await.tick(&net).await;
        }

        // re-advertise when a better local address has surfaced
        net.advertize_local().await;

        let trickle = if peers.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..peers.len())
        };

        for (i, peer) in peers.iter().enumerate() {
            // decode inbound bytes in arrival order
            if let Ok(mut recv) = peer.recv_buf.try_lock()
                && !recv.is_empty()
            {
                handler.process_messages(&net, peer, &mut recv);
            }
            if net.is_shutting_down() {
                return;
            }

            handler.send_messages(&net, peer, i == trickle);
            flush_requests(peer).await;
            if net.is_shutting_down() {
                return;
            }
        }

        tokio::time::sleep(Duration::from_millis(HANDLER_POLL_MILLIS)).await;
    }
    info!("message handler exited");
}

/// Drain the peer's ask-for queue into one framed getdata batch.
async fn flush_requests(peer: &Arc<PeerSession>) {
    let invs = {
        let Ok(mut requests) = peer.requests.try_lock() else {
            return;
        };
        requests.pop(MAX_GETDATA_BATCH)
    };
    if invs.is_empty() {
        return;
    }
    peer.push_payload("getdata", &GetDataPayload { invs }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::{Endpoint, Inv, PROTOCOL_MAGIC};
    use std::net::SocketAddr;

    fn peer() -> Arc<PeerSession> {
        let sa: SocketAddr = "1.2.3.4:9556".parse().unwrap();
        Arc::new(PeerSession::new(Endpoint::from(sa), "", false))
    }

    #[tokio::test]
    async fn test_flush_requests_frames_getdata() {
        let p = peer();
        p.ask_for(Inv::block([1u8; 32])).await;
        p.ask_for(Inv::block([2u8; 32])).await;

        flush_requests(&p).await;

        let send = p.send_buf.lock().await;
        assert_eq!(&send[..4], &PROTOCOL_MAGIC);
        assert_eq!(send[4] as usize, "getdata".len());
        assert_eq!(&send[5..12], b"getdata");
        assert!(p.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_flush_requests_empty_queue_sends_nothing() {
        let p = peer();
        flush_requests(&p).await;
        assert!(p.send_buf.lock().await.is_empty());
    }
}
