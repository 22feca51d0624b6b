pub mod net;
pub mod types;

pub use net::{
    AddrBook, AddressBook, ChainView, Config, NetError, NetEvent, Network, NullHandler,
    PeerSession, ProtocolHandler, NODE_NETWORK,
};
pub use types::*;
