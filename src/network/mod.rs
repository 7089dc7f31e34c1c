mod error;

pub mod client;
pub mod discovery;
pub mod inmemory;
pub mod server;

pub use self::client::{HeartbeatAck, HttpPeerClient, PeerClient};
pub use self::discovery::{extract_port, normalize_address, ClusterView, LivenessProber, Reachability};
pub use self::error::NetworkError;
pub use self::inmemory::{InMemoryNetwork, InMemoryPeerClient};
pub use self::server::serve;
