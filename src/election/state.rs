use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::fault::FaultFlags;

pub type SharedNodeState = Arc<Mutex<NodeState>>;

/// Local view of this node: identity, term, leadership and fault toggles.
#[derive(Debug, Clone)]
pub struct NodeState {
    id: u64,
    cluster_size: u64,
    term: u64,
    commit_index: u64,
    leader: bool,
    faults: FaultFlags,
}

/// Serializable copy of a node's state, as exposed by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: u64,
    pub term: u64,
    pub commit_index: u64,
    pub leader: bool,
    pub phase: String,
    pub faults: BTreeMap<String, bool>,
}

impl NodeState {
    pub fn new(id: u64, cluster_size: u64) -> Self {
        Self {
            id,
            cluster_size: cluster_size.max(1),
            term: 0,
            commit_index: 0,
            leader: false,
            faults: FaultFlags::default(),
        }
    }

    pub fn shared(self) -> SharedNodeState {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Sets the leader flag and returns the previous value.
    pub fn set_leader(&mut self, leader: bool) -> bool {
        std::mem::replace(&mut self.leader, leader)
    }

    /// Moves to the next term owned by this node in the round-robin order.
    pub fn increment_term(&mut self) -> u64 {
        self.term = next_term(self.term, self.cluster_size, self.id);
        info!("Server {} moved to term {}", self.id, self.term);
        self.term
    }

    pub fn update_term(&mut self, term: u64) {
        self.term = term;
    }

    pub fn faults(&self) -> &FaultFlags {
        &self.faults
    }

    pub fn faults_mut(&mut self) -> &mut FaultFlags {
        &mut self.faults
    }
}

/// Smallest term greater than `term` that is congruent to `id` modulo
/// `cluster_size`.
pub fn next_term(term: u64, cluster_size: u64, id: u64) -> u64 {
    let n = cluster_size.max(1);
    let id = id % n;
    let candidate = term + 1;
    candidate + (id + n - candidate % n) % n
}
