//! P2P networking layer

pub mod addrbook;
pub mod ban;
pub mod connection;
pub mod dialer;
pub mod handler;
pub mod local;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod sync;
pub mod types;

// Re-exports
pub use addrbook::{AddrBook, AddressBook, AddressRecord};
pub use ban::BanList;
pub use connection::bind_listen_port;
pub use dialer::select_candidate;
pub use handler::{NullHandler, ProtocolHandler};
pub use local::LocalAddrs;
pub use peer::{PeerInfo, PeerSession, ResetState};
pub use protocol::{Config, NetError, NetEvent, Network, NetworkStats};
pub use relay::{RelayFilter, RelayPool};
pub use sync::{ChainView, SyncEngine, SyncSlot, build_slots};
pub use types::*;
