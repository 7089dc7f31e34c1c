use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};

use super::state::SharedNodeState;
use super::vote::{VoteRequest, VoteResponse};
use crate::network::{ClusterView, PeerClient};

/// Accepted and rejected counts of one election round, self-vote included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub accepted: usize,
    pub rejected: usize,
}

impl Tally {
    pub fn is_majority(&self) -> bool {
        self.accepted > self.rejected
    }
}

/// Re-tags a response whose decision contradicts the term it carries.
///
/// An acceptance must carry the candidate's own term; a rejection must
/// carry a term at least as high as the candidate's.
pub fn correct(response: VoteResponse, candidate_term: u64) -> VoteResponse {
    let inconsistent = match response {
        VoteResponse::Accepted { term, .. } => term != candidate_term,
        VoteResponse::Rejected { term, .. } => term < candidate_term,
    };
    if inconsistent {
        warn!(
            "Vote from server {} is inconsistent with term {} (carried term {}); flipping it",
            response.server_id(),
            candidate_term,
            response.term()
        );
        response.flipped()
    } else {
        response
    }
}

pub fn tally(responses: &[VoteResponse], candidate_term: u64) -> Tally {
    let mut result = Tally {
        accepted: 1,
        rejected: 0,
    };
    for response in responses {
        if correct(*response, candidate_term).is_accepted() {
            result.accepted += 1;
        } else {
            result.rejected += 1;
        }
    }
    result
}

/// Round-robin eligibility over the live part of the cluster.
pub fn is_eligible(term: u64, available: u64, self_id: u64) -> bool {
    available == 0 || term % (available + 1) == self_id
}

/// Runs this node's side of an election round.
pub struct CandidacyCoordinator {
    state: SharedNodeState,
    cluster: ClusterView,
    client: Arc<dyn PeerClient>,
    rpc_timeout: Duration,
}

impl CandidacyCoordinator {
    pub fn new(
        state: SharedNodeState,
        cluster: ClusterView,
        client: Arc<dyn PeerClient>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            state,
            cluster,
            client,
            rpc_timeout,
        }
    }

    pub async fn should_candidate_for_leader(&self) -> bool {
        let (term, id) = {
            let state = self.state.lock().await;
            (state.term(), state.id())
        };
        let available = self.cluster.available_count();
        info!("Number of available servers: {available}, current server term: {term}");

        let eligible = is_eligible(term, available, id);
        info!(
            "Server {} candidate for a leader in the current turn",
            if eligible { "can" } else { "cannot" }
        );
        eligible
    }

    /// Requests votes from every reachable peer and records the outcome in
    /// the leader flag. Returns true iff elected.
    pub async fn run_election(&self) -> bool {
        let request = {
            let state = self.state.lock().await;
            VoteRequest {
                candidate_id: state.id(),
                candidate_term: state.term(),
                candidate_commit_index: state.commit_index(),
            }
        };
        info!(
            "Starting the candidacy of the server with id {} for term {}",
            request.candidate_id, request.candidate_term
        );

        let responses = self.collect_votes(&request).await;
        let result = tally(&responses, request.candidate_term);

        let mut state = self.state.lock().await;
        let elected = if state.term() != request.candidate_term {
            info!(
                "Term moved from {} to {} during the round; discarding it",
                request.candidate_term,
                state.term()
            );
            false
        } else {
            result.is_majority()
        };
        state.set_leader(elected);

        info!(
            "Candidacy of the server with id {} has been {} in term {} ({} accepted, {} rejected)",
            request.candidate_id,
            if elected { "accepted" } else { "rejected" },
            request.candidate_term,
            result.accepted,
            result.rejected
        );
        elected
    }

    async fn collect_votes(&self, request: &VoteRequest) -> Vec<VoteResponse> {
        let peers = self.cluster.reachable_peers();
        let mut calls: FuturesUnordered<_> = peers
            .into_iter()
            .map(|(id, addr)| {
                let client = Arc::clone(&self.client);
                let timeout = self.rpc_timeout;
                async move {
                    let result = tokio::time::timeout(timeout, client.request_vote(&addr, request)).await;
                    (id, addr, result)
                }
            })
            .collect();

        let mut responses = Vec::new();
        while let Some((id, addr, result)) = calls.next().await {
            match result {
                Ok(Ok(response)) => {
                    debug!("Server {id} answered {response:?}");
                    responses.push(response);
                }
                Ok(Err(e)) => warn!("Server {id} at {addr} is not reachable: {e}"),
                Err(_) => warn!("Vote request to server {id} at {addr} timed out"),
            }
        }
        responses
    }
}
