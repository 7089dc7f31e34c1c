use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{NetworkError, PeerClient};
use crate::election::{
    FaultKind, Heartbeat, HeartbeatReply, LeaderElection, SharedNodeState, VoteRequest,
    VoteResponse,
};

/// In-process transport: peers are `LeaderElection` handles looked up by
/// address, so whole clusters can run inside one test runtime.
#[derive(Default)]
pub struct InMemoryNetwork {
    nodes: RwLock<HashMap<String, Arc<LeaderElection>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, address: &str, node: Arc<LeaderElection>) {
        self.nodes.write().await.insert(address.to_string(), node);
    }

    /// Removes a node; calls to its address fail from now on.
    pub async fn disconnect(&self, address: &str) -> Option<Arc<LeaderElection>> {
        self.nodes.write().await.remove(address)
    }

    /// Client for the node owning `state`; honours its `LOST_CONNECTION`.
    pub fn client(self: &Arc<Self>, state: SharedNodeState) -> InMemoryPeerClient {
        InMemoryPeerClient {
            network: Arc::clone(self),
            state,
        }
    }

    async fn lookup(&self, address: &str) -> Result<Arc<LeaderElection>, NetworkError> {
        self.nodes
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| NetworkError::NodeNotFound(address.to_string()))
    }
}

pub struct InMemoryPeerClient {
    network: Arc<InMemoryNetwork>,
    state: SharedNodeState,
}

impl InMemoryPeerClient {
    async fn route(&self, address: &str) -> Result<Arc<LeaderElection>, NetworkError> {
        let lost = self
            .state
            .lock()
            .await
            .faults()
            .is_enabled(FaultKind::LostConnection);
        if lost {
            // Same outcome as hitting the bogus path over HTTP.
            return Err(NetworkError::UnexpectedStatus(404));
        }
        self.network.lookup(address).await
    }
}

/// Runs a handler on its own task, like a server would, so aborting the
/// caller never cancels the peer's handler halfway through.
async fn detached<T, F>(handler: F) -> Result<T, NetworkError>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    tokio::spawn(handler)
        .await
        .map_err(|e| NetworkError::ConnectionError(e.to_string()))
}

#[async_trait]
impl PeerClient for InMemoryPeerClient {
    async fn request_vote(
        &self,
        address: &str,
        request: &VoteRequest,
    ) -> Result<VoteResponse, NetworkError> {
        let node = self.route(address).await?;
        let request = *request;
        detached(async move { node.handle_vote(request).await }).await
    }

    async fn heartbeat(
        &self,
        address: &str,
        heartbeat: &Heartbeat,
    ) -> Result<HeartbeatReply, NetworkError> {
        let node = self.route(address).await?;
        let heartbeat = *heartbeat;
        detached(async move { node.handle_heartbeat(heartbeat).await }).await
    }

    async fn probe(&self, address: &str) -> Result<(), NetworkError> {
        self.network.lookup(address).await.map(|_| ())
    }
}
