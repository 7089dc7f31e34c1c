mod candidacy;
mod config;
mod error;
mod fault;
mod heartbeat;
mod scheduler;
mod state;
mod task;
mod vote;

pub use self::candidacy::{correct, is_eligible, tally, CandidacyCoordinator, Tally};
pub use self::config::ElectionConfig;
pub use self::error::ElectionError;
pub use self::fault::{FaultFlags, FaultInjector, FaultKind, LOST_CONNECTION_SUFFIX};
pub use self::heartbeat::{
    Heartbeat, HeartbeatBroadcaster, HeartbeatReply, LeadershipEvent, SweepOutcome,
};
pub use self::scheduler::{CandidacyOutcome, ElectionScheduler, SchedulerPhase};
pub use self::state::{next_term, NodeState, NodeStatus, SharedNodeState};
pub use self::task::TaskSlot;
pub use self::vote::{decide, VoteRequest, VoteResponse, VotingEngine};

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::network::{ClusterView, PeerClient};

/// One node of the cluster: state, timers and the handlers peers call.
pub struct LeaderElection {
    state: SharedNodeState,
    cluster: ClusterView,
    voting: VotingEngine,
    scheduler: Arc<ElectionScheduler>,
    heartbeats: Arc<HeartbeatBroadcaster>,
    faults: FaultInjector,
    events: Mutex<Option<mpsc::UnboundedReceiver<LeadershipEvent>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElection {
    pub fn new(config: ElectionConfig, cluster: ClusterView, client: Arc<dyn PeerClient>) -> Self {
        let state = NodeState::new(cluster.self_id(), cluster.peer_count()).shared();
        Self::with_state(config, cluster, client, state)
    }

    /// Builds the node around an existing state handle, for callers that
    /// need the handle before the node exists (e.g. the HTTP client).
    pub fn with_state(
        config: ElectionConfig,
        cluster: ClusterView,
        client: Arc<dyn PeerClient>,
        state: SharedNodeState,
    ) -> Self {
        let config = config.validated();
        let (tx, rx) = mpsc::unbounded_channel();

        let heartbeats = Arc::new(HeartbeatBroadcaster::new(
            Arc::clone(&state),
            cluster.clone(),
            Arc::clone(&client),
            &config,
            tx,
        ));
        let coordinator = CandidacyCoordinator::new(
            Arc::clone(&state),
            cluster.clone(),
            client,
            config.rpc_timeout,
        );
        let scheduler = Arc::new(ElectionScheduler::new(
            Arc::clone(&state),
            coordinator,
            Arc::clone(&heartbeats),
            config,
        ));

        Self {
            voting: VotingEngine::new(Arc::clone(&state)),
            faults: FaultInjector::new(Arc::clone(&state), Arc::clone(&heartbeats)),
            state,
            cluster,
            scheduler,
            heartbeats,
            events: Mutex::new(Some(rx)),
            listener: Mutex::new(None),
        }
    }

    /// Moves to the node's first term and starts the election timer.
    pub async fn start(&self) {
        let Some(events) = self.events.lock().await.take() else {
            warn!("Leader election already started");
            return;
        };
        self.state.lock().await.increment_term();
        let handle = self.scheduler.start(events).await;
        *self.listener.lock().await = Some(handle);
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        self.state.lock().await.set_leader(false);
        info!("Leader election stopped");
    }

    pub fn state(&self) -> SharedNodeState {
        Arc::clone(&self.state)
    }

    pub fn cluster(&self) -> &ClusterView {
        &self.cluster
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn heartbeats(&self) -> &Arc<HeartbeatBroadcaster> {
        &self.heartbeats
    }

    /// Handles `RequestVote` from another candidate.
    pub async fn handle_vote(&self, request: VoteRequest) -> VoteResponse {
        info!("Received vote request from server with id: {}", request.candidate_id);
        let (was_leader, infinite) = {
            let mut state = self.state.lock().await;
            (
                state.set_leader(false),
                state.faults().is_enabled(FaultKind::InfiniteReplies),
            )
        };
        if was_leader && !infinite {
            info!("Stopping sending heartbeats...");
            self.heartbeats.stop().await;
        }
        self.scheduler.reset().await;
        self.voting.vote(&request).await
    }

    /// Handles a `Heartbeat` from a node that believes it leads.
    pub async fn handle_heartbeat(&self, heartbeat: Heartbeat) -> HeartbeatReply {
        info!("Received heartbeat from leader with id: {}", heartbeat.leader_id);
        let (responder_id, leader, infinite) = {
            let mut state = self.state.lock().await;
            if heartbeat.term > state.term() {
                state.update_term(heartbeat.term);
            }
            (
                state.id(),
                state.is_leader(),
                state.faults().is_enabled(FaultKind::InfiniteReplies),
            )
        };

        if !leader {
            self.scheduler.reset().await;
            return HeartbeatReply::Ack { responder_id };
        }

        error!("Heartbeat message received while the current server is already the leader!");
        if infinite {
            warn!("Keeping leadership because of INFINITE_REPLIES");
        } else {
            self.scheduler.step_down().await;
        }
        HeartbeatReply::Conflict { responder_id }
    }

    /// Operator-triggered election round.
    pub async fn trigger_candidacy(&self) -> Result<CandidacyOutcome, ElectionError> {
        self.scheduler.run_candidacy().await
    }

    pub async fn enable_fault(&self, name: &str) -> Result<FaultKind, ElectionError> {
        self.faults.enable_by_name(name).await
    }

    pub async fn disable_fault(&self, name: &str) -> Result<FaultKind, ElectionError> {
        self.faults.disable_by_name(name).await
    }

    pub async fn fault_statuses(&self) -> BTreeMap<String, bool> {
        self.faults.statuses().await
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.is_leader()
    }

    pub async fn term(&self) -> u64 {
        self.state.lock().await.term()
    }

    pub async fn phase(&self) -> SchedulerPhase {
        self.scheduler.phase().await
    }

    pub fn all_servers(&self) -> Vec<String> {
        self.cluster.all_servers().into_values().collect()
    }

    pub fn available_servers(&self) -> Vec<String> {
        self.cluster.reachable_peers().into_values().collect()
    }

    pub async fn status(&self) -> NodeStatus {
        let phase = self.scheduler.phase().await;
        let state = self.state.lock().await;
        NodeStatus {
            id: state.id(),
            term: state.term(),
            commit_index: state.commit_index(),
            leader: state.is_leader(),
            phase: phase.to_string(),
            faults: state.faults().statuses(),
        }
    }
}
