use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::config::ElectionConfig;
use super::fault::FaultKind;
use super::state::SharedNodeState;
use super::task::TaskSlot;
use crate::network::{ClusterView, PeerClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "serverId")]
    pub leader_id: u64,
    pub term: u64,
    #[serde(rename = "commitIndex")]
    pub commit_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatReply {
    Ack { responder_id: u64 },
    /// The responder already considers itself the leader.
    Conflict { responder_id: u64 },
}

/// Signals sent from the heartbeat loop back to the scheduler.
///
/// `generation` identifies the loop that sent the event; the scheduler
/// drops events from a loop that has since been stopped or replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEvent {
    Conflict {
        responder_id: u64,
        term: u64,
        generation: u64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub acks: Vec<u64>,
    pub conflicts: Vec<u64>,
    pub failures: usize,
}

/// Fixed-rate heartbeat loop run while this node leads.
pub struct HeartbeatBroadcaster {
    state: SharedNodeState,
    cluster: ClusterView,
    client: Arc<dyn PeerClient>,
    interval: Duration,
    initial_delay: Duration,
    rpc_timeout: Duration,
    slot: TaskSlot,
    events: mpsc::UnboundedSender<LeadershipEvent>,
}

impl HeartbeatBroadcaster {
    pub fn new(
        state: SharedNodeState,
        cluster: ClusterView,
        client: Arc<dyn PeerClient>,
        config: &ElectionConfig,
        events: mpsc::UnboundedSender<LeadershipEvent>,
    ) -> Self {
        Self {
            state,
            cluster,
            client,
            interval: config.heartbeat_interval,
            initial_delay: config.heartbeat_initial_delay,
            rpc_timeout: config.rpc_timeout,
            slot: TaskSlot::new("heartbeat"),
            events,
        }
    }

    /// Starts (or restarts) the broadcast loop.
    pub async fn start(self: &Arc<Self>) {
        debug!(
            "Scheduling heartbeats with interval of {:?} after {:?}",
            self.interval, self.initial_delay
        );
        let this = Arc::clone(self);
        self.slot
            .replace(move |generation| async move { this.run(generation).await })
            .await;
    }

    /// Stops the broadcast loop. A no-op when nothing is running.
    pub async fn stop(&self) -> bool {
        let stopped = self.slot.cancel().await;
        if stopped {
            info!("Stopped sending heartbeats");
        }
        stopped
    }

    pub async fn is_running(&self) -> bool {
        self.slot.is_active().await
    }

    pub fn generation(&self) -> u64 {
        self.slot.generation()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.slot.is_current(generation)
    }

    async fn run(&self, generation: u64) {
        let mut ticker = interval_at(Instant::now() + self.initial_delay, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.slot.is_current(generation) {
                return;
            }

            let sweep = self.broadcast_once().await;
            let Some(&responder_id) = sweep.conflicts.first() else {
                continue;
            };

            let (term, infinite) = {
                let state = self.state.lock().await;
                (
                    state.term(),
                    state.faults().is_enabled(FaultKind::InfiniteReplies),
                )
            };
            if infinite {
                warn!(
                    "Server {responder_id} also claims leadership; ignoring because of INFINITE_REPLIES"
                );
                continue;
            }

            error!("Leader conflict detected while sending heartbeats to follower nodes!");
            if self.slot.is_current(generation) {
                let _ = self.events.send(LeadershipEvent::Conflict {
                    responder_id,
                    term,
                    generation,
                });
            }
            return;
        }
    }

    /// Sends one heartbeat to every reachable peer and collects the replies.
    pub async fn broadcast_once(&self) -> SweepOutcome {
        let heartbeat = {
            let state = self.state.lock().await;
            Heartbeat {
                leader_id: state.id(),
                term: state.term(),
                commit_index: state.commit_index(),
            }
        };

        let peers = self.cluster.reachable_peers();
        let mut calls: FuturesUnordered<_> = peers
            .into_iter()
            .map(|(id, addr)| {
                let client = Arc::clone(&self.client);
                let timeout = self.rpc_timeout;
                async move {
                    let result = tokio::time::timeout(timeout, client.heartbeat(&addr, &heartbeat)).await;
                    (id, addr, result)
                }
            })
            .collect();

        let mut outcome = SweepOutcome::default();
        while let Some((id, addr, result)) = calls.next().await {
            match result {
                Ok(Ok(HeartbeatReply::Ack { responder_id })) => {
                    debug!("Heartbeat acknowledged by server {responder_id}");
                    outcome.acks.push(responder_id);
                }
                Ok(Ok(HeartbeatReply::Conflict { responder_id })) => {
                    outcome.conflicts.push(responder_id);
                }
                Ok(Err(e)) => {
                    warn!("Heartbeat to server {id} at {addr} failed: {e}");
                    outcome.failures += 1;
                }
                Err(_) => {
                    warn!("Heartbeat to server {id} at {addr} timed out");
                    outcome.failures += 1;
                }
            }
        }

        info!(
            "Heartbeat sweep for term {}: {} acks, {} conflicts, {} failures",
            heartbeat.term,
            outcome.acks.len(),
            outcome.conflicts.len(),
            outcome.failures
        );
        outcome
    }
}
