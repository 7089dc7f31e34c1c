pub mod config;
pub mod election;
pub mod network;

// Public exports
pub use config::Config;
pub use election::{ElectionConfig, ElectionError, FaultKind, LeaderElection, NodeState};
pub use network::{ClusterView, HttpPeerClient, NetworkError, PeerClient};
