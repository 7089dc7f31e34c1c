use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::fault::FaultKind;
use super::state::{NodeState, SharedNodeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    #[serde(rename = "serverId")]
    pub candidate_id: u64,
    #[serde(rename = "term")]
    pub candidate_term: u64,
    #[serde(rename = "commitIndex")]
    pub candidate_commit_index: u64,
}

/// A voter's decision together with the term it decided against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VoteResponse {
    Accepted {
        #[serde(rename = "serverId")]
        server_id: u64,
        term: u64,
    },
    Rejected {
        #[serde(rename = "serverId")]
        server_id: u64,
        term: u64,
    },
}

impl VoteResponse {
    pub fn new(accepted: bool, server_id: u64, term: u64) -> Self {
        if accepted {
            VoteResponse::Accepted { server_id, term }
        } else {
            VoteResponse::Rejected { server_id, term }
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, VoteResponse::Accepted { .. })
    }

    pub fn server_id(&self) -> u64 {
        match self {
            VoteResponse::Accepted { server_id, .. } | VoteResponse::Rejected { server_id, .. } => {
                *server_id
            }
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            VoteResponse::Accepted { term, .. } | VoteResponse::Rejected { term, .. } => *term,
        }
    }

    /// Same voter and term with the decision inverted.
    pub fn flipped(self) -> Self {
        VoteResponse::new(!self.is_accepted(), self.server_id(), self.term())
    }
}

/// Answers vote requests from other candidates.
pub struct VotingEngine {
    state: SharedNodeState,
}

impl VotingEngine {
    pub fn new(state: SharedNodeState) -> Self {
        Self { state }
    }

    pub async fn vote(&self, request: &VoteRequest) -> VoteResponse {
        let mut state = self.state.lock().await;
        decide(&mut state, request)
    }
}

/// Evaluates a vote request against the locked node state.
///
/// While `INVALID_RESPONSE` is enabled the decision is inverted before it is
/// acted on. The candidate's term is adopted only for a reported acceptance
/// of a strictly higher term, and the reply carries the term actually used.
pub fn decide(state: &mut NodeState, request: &VoteRequest) -> VoteResponse {
    let current = state.term();
    let accepted = request.candidate_term > current;

    let reported = if state.faults().is_enabled(FaultKind::InvalidResponse) {
        warn!(
            "Answering server {} with an inverted vote (true decision: {})",
            request.candidate_id,
            if accepted { "accept" } else { "reject" }
        );
        !accepted
    } else {
        accepted
    };

    if reported && request.candidate_term > current {
        state.update_term(request.candidate_term);
    }

    info!(
        "Server {} {} candidate {} for term {} (local term was {})",
        state.id(),
        if reported { "accepted" } else { "rejected" },
        request.candidate_id,
        request.candidate_term,
        current
    );

    VoteResponse::new(reported, state.id(), state.term())
}
