use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};

use super::candidacy::CandidacyCoordinator;
use super::config::ElectionConfig;
use super::fault::FaultKind;
use super::heartbeat::{HeartbeatBroadcaster, LeadershipEvent};
use super::state::SharedNodeState;
use super::task::TaskSlot;
use super::ElectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    AwaitingTimeout,
    Candidate,
    Leader,
}

impl fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerPhase::Idle => "Idle",
            SchedulerPhase::AwaitingTimeout => "AwaitingTimeout",
            SchedulerPhase::Candidate => "Candidate",
            SchedulerPhase::Leader => "Leader",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidacyOutcome {
    Elected,
    NotElected,
}

/// Drives the election timeout and the transitions between following,
/// candidacy and leadership.
pub struct ElectionScheduler {
    state: SharedNodeState,
    coordinator: CandidacyCoordinator,
    heartbeats: Arc<HeartbeatBroadcaster>,
    config: ElectionConfig,
    timeout: TaskSlot,
    phase: Mutex<SchedulerPhase>,
    round: Mutex<()>,
    stopped: AtomicBool,
}

impl ElectionScheduler {
    pub fn new(
        state: SharedNodeState,
        coordinator: CandidacyCoordinator,
        heartbeats: Arc<HeartbeatBroadcaster>,
        config: ElectionConfig,
    ) -> Self {
        Self {
            state,
            coordinator,
            heartbeats,
            config,
            timeout: TaskSlot::new("election timeout"),
            phase: Mutex::new(SchedulerPhase::Idle),
            round: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Enters `AwaitingTimeout` and starts listening for heartbeat conflicts.
    pub async fn start(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<LeadershipEvent>,
    ) -> tokio::task::JoinHandle<()> {
        info!("Initializing leader election procedure...");
        self.stopped.store(false, Ordering::SeqCst);
        self.schedule_timeout().await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LeadershipEvent::Conflict {
                        responder_id,
                        term,
                        generation,
                    } => {
                        if !this.heartbeats.is_current(generation) {
                            debug!("Ignoring conflict from an earlier heartbeat loop");
                            continue;
                        }
                        info!("Stepping down from term {term} after conflict with server {responder_id}");
                        this.step_down().await;
                    }
                }
            }
        })
    }

    pub async fn phase(&self) -> SchedulerPhase {
        *self.phase.lock().await
    }

    async fn set_phase(&self, phase: SchedulerPhase) {
        *self.phase.lock().await = phase;
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Cancels any pending timeout and schedules a fresh one. Does nothing
    /// once the scheduler has been shut down.
    pub async fn schedule_timeout(self: &Arc<Self>) {
        if self.is_stopped() {
            debug!("Scheduler is shut down; not arming the election timeout");
            return;
        }
        let delay = self.config.random_timeout();
        info!("Follower will start leader candidacy in {} ms", delay.as_millis());
        self.set_phase(SchedulerPhase::AwaitingTimeout).await;

        let this = Arc::clone(self);
        self.timeout
            .replace(move |generation| async move {
                tokio::time::sleep(delay).await;
                if !this.timeout.is_current(generation) {
                    return;
                }
                // Detach the round so a later reset cannot abort it halfway.
                tokio::spawn(this.on_timeout(generation));
            })
            .await;

        // Lost a race with shutdown.
        if self.is_stopped() {
            self.timeout.cancel().await;
            self.set_phase(SchedulerPhase::Idle).await;
        }
    }

    /// Restarts the timeout after hearing from a candidate or a leader.
    pub async fn reset(self: &Arc<Self>) {
        info!("Resetting leader candidacy starting timeout...");
        self.schedule_timeout().await;
    }

    /// Gives up leadership and goes back to waiting for a timeout.
    pub async fn step_down(self: &Arc<Self>) {
        let was_leader = self.state.lock().await.set_leader(false);
        if was_leader {
            info!("Relinquishing leadership");
        }
        self.heartbeats.stop().await;
        self.schedule_timeout().await;
    }

    /// Cancels the timer and the heartbeat loop. A round already in flight
    /// finishes without leading or re-arming the timer.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.timeout.cancel().await;
        self.heartbeats.stop().await;
        self.set_phase(SchedulerPhase::Idle).await;
    }

    // Boxed because the round reschedules the timer that spawned it.
    fn on_timeout(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        async move {
            if !self.timeout.is_current(generation) {
                debug!("Discarding stale election timeout");
                return;
            }
            if self.state.lock().await.is_leader() {
                debug!("Election timeout fired while leading; ignoring it");
                return;
            }
            match self.run_candidacy().await {
                Ok(_) => {}
                Err(ElectionError::RoundInProgress) => {
                    debug!("Election round already running; waiting for the next timeout");
                    self.schedule_timeout().await;
                }
                Err(e) => {
                    error!("Election round failed: {e}");
                    self.schedule_timeout().await;
                }
            }
        }
        .boxed()
    }

    /// One full candidacy: advance the term, check eligibility, run the
    /// election and act on the result.
    pub async fn run_candidacy(self: &Arc<Self>) -> Result<CandidacyOutcome, ElectionError> {
        let _round = self
            .round
            .try_lock()
            .map_err(|_| ElectionError::RoundInProgress)?;

        self.set_phase(SchedulerPhase::Candidate).await;
        let was_leader = {
            let mut state = self.state.lock().await;
            state.increment_term();
            state.is_leader()
        };

        let elected = if self.coordinator.should_candidate_for_leader().await {
            self.coordinator.run_election().await
        } else {
            false
        };

        if self.is_stopped() {
            warn!("Scheduler shut down during the election round; discarding its result");
            self.state.lock().await.set_leader(false);
            if was_leader {
                self.heartbeats.stop().await;
            }
            self.set_phase(SchedulerPhase::Idle).await;
            return Ok(CandidacyOutcome::NotElected);
        }

        if elected {
            self.become_leader().await;
            Ok(CandidacyOutcome::Elected)
        } else {
            self.state.lock().await.set_leader(false);
            if was_leader {
                info!("Lost leadership in the new term");
                self.heartbeats.stop().await;
            }
            self.schedule_timeout().await;
            Ok(CandidacyOutcome::NotElected)
        }
    }

    async fn become_leader(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.faults_mut().disable(FaultKind::InfiniteReplies) {
                info!("Cleared INFINITE_REPLIES on becoming leader");
            }
            info!(
                "Server with id {} has been elected as the leader for term {}",
                state.id(),
                state.term()
            );
        }
        self.timeout.cancel().await;
        self.set_phase(SchedulerPhase::Leader).await;
        self.heartbeats.start().await;

        if self.is_stopped() {
            self.heartbeats.stop().await;
            self.state.lock().await.set_leader(false);
            self.set_phase(SchedulerPhase::Idle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::{Heartbeat, HeartbeatReply, NodeState, VoteRequest, VoteResponse};
    use crate::network::{ClusterView, NetworkError, PeerClient, Reachability};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Accepts every vote, optionally after being released.
    struct Voters {
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl PeerClient for Voters {
        async fn request_vote(
            &self,
            _address: &str,
            request: &VoteRequest,
        ) -> Result<VoteResponse, NetworkError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(VoteResponse::Accepted {
                server_id: 9,
                term: request.candidate_term,
            })
        }

        async fn heartbeat(
            &self,
            _address: &str,
            _heartbeat: &Heartbeat,
        ) -> Result<HeartbeatReply, NetworkError> {
            Ok(HeartbeatReply::Ack { responder_id: 9 })
        }

        async fn probe(&self, _address: &str) -> Result<(), NetworkError> {
            Ok(())
        }
    }

    fn scheduler(
        self_id: u64,
        gate: Option<Arc<Notify>>,
    ) -> (
        Arc<ElectionScheduler>,
        SharedNodeState,
        Reachability,
        mpsc::UnboundedReceiver<LeadershipEvent>,
    ) {
        let members: BTreeMap<u64, String> = (0..3).map(|i| (i, format!("node-{i}"))).collect();
        let (cluster, reachability) = ClusterView::new(self_id, members);
        let state = NodeState::new(self_id, 3).shared();
        let client: Arc<dyn PeerClient> = Arc::new(Voters { gate });
        let config = ElectionConfig::new(
            Duration::from_secs(15),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
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
            cluster,
            client,
            config.rpc_timeout,
        );
        let scheduler = Arc::new(ElectionScheduler::new(
            Arc::clone(&state),
            coordinator,
            heartbeats,
            config,
        ));
        (scheduler, state, reachability, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn lone_node_wins_after_timeout() {
        let (scheduler, state, _, rx) = scheduler(1, None);
        let _listener = scheduler.start(rx).await;
        assert_eq!(scheduler.phase().await, SchedulerPhase::AwaitingTimeout);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(scheduler.phase().await, SchedulerPhase::Leader);
        assert!(state.lock().await.is_leader());
        assert_eq!(state.lock().await.term() % 3, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reset_postpones_the_timeout() {
        let (scheduler, state, _, rx) = scheduler(1, None);
        let _listener = scheduler.start(rx).await;

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(14)).await;
            scheduler.reset().await;
        }
        assert!(!state.lock().await.is_leader());
        assert_eq!(state.lock().await.term(), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_node_returns_to_waiting() {
        let (scheduler, state, reachability, _rx) = scheduler(2, None);
        reachability.set_reachable([0]);

        let outcome = scheduler.run_candidacy().await.unwrap();
        assert_eq!(outcome, CandidacyOutcome::NotElected);
        assert_eq!(state.lock().await.term(), 2);
        assert_eq!(scheduler.phase().await, SchedulerPhase::AwaitingTimeout);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn step_down_stops_heartbeats_and_rearms_timer() {
        let (scheduler, state, reachability, _rx) = scheduler(1, None);
        reachability.mark_all_reachable();

        assert_eq!(
            scheduler.run_candidacy().await.unwrap(),
            CandidacyOutcome::Elected
        );
        assert!(scheduler.heartbeats.is_running().await);

        scheduler.step_down().await;
        assert!(!state.lock().await.is_leader());
        assert!(!scheduler.heartbeats.is_running().await);
        assert_eq!(scheduler.phase().await, SchedulerPhase::AwaitingTimeout);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_round_is_refused() {
        let gate = Arc::new(Notify::new());
        let (scheduler, _, reachability, _rx) = scheduler(1, Some(Arc::clone(&gate)));
        reachability.mark_all_reachable();

        let running = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_candidacy().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            scheduler.run_candidacy().await,
            Err(ElectionError::RoundInProgress)
        ));

        gate.notify_waiters();
        assert_eq!(running.await.unwrap().unwrap(), CandidacyOutcome::Elected);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn round_finishing_after_shutdown_stays_down() {
        let gate = Arc::new(Notify::new());
        let (scheduler, state, reachability, rx) = scheduler(1, Some(Arc::clone(&gate)));
        reachability.mark_all_reachable();
        let _listener = scheduler.start(rx).await;

        let running = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_candidacy().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.phase().await, SchedulerPhase::Candidate);

        scheduler.shutdown().await;
        gate.notify_waiters();
        assert_eq!(running.await.unwrap().unwrap(), CandidacyOutcome::NotElected);

        assert!(!state.lock().await.is_leader());
        assert!(!scheduler.heartbeats.is_running().await);
        assert_eq!(scheduler.phase().await, SchedulerPhase::Idle);

        // Nothing re-arms the timer afterwards either.
        scheduler.reset().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(scheduler.phase().await, SchedulerPhase::Idle);
        assert!(!state.lock().await.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_conflict_does_not_demote_a_new_leadership() {
        let (scheduler, state, reachability, _rx) = scheduler(1, None);
        reachability.mark_all_reachable();
        let (tx, rx) = mpsc::unbounded_channel();
        let _listener = scheduler.start(rx).await;

        scheduler.run_candidacy().await.unwrap();
        let old = scheduler.heartbeats.generation();
        scheduler.step_down().await;
        assert_eq!(
            scheduler.run_candidacy().await.unwrap(),
            CandidacyOutcome::Elected
        );

        tx.send(LeadershipEvent::Conflict {
            responder_id: 2,
            term: 1,
            generation: old,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(state.lock().await.is_leader());
        assert_eq!(scheduler.phase().await, SchedulerPhase::Leader);

        tx.send(LeadershipEvent::Conflict {
            responder_id: 2,
            term: state.lock().await.term(),
            generation: scheduler.heartbeats.generation(),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!state.lock().await.is_leader());
        assert_eq!(scheduler.phase().await, SchedulerPhase::AwaitingTimeout);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn becoming_leader_clears_infinite_replies() {
        let (scheduler, state, _, _rx) = scheduler(0, None);
        state
            .lock()
            .await
            .faults_mut()
            .enable(FaultKind::InfiniteReplies);

        scheduler.run_candidacy().await.unwrap();
        let state = state.lock().await;
        assert!(state.is_leader());
        assert!(!state.faults().is_enabled(FaultKind::InfiniteReplies));
        drop(state);
        scheduler.shutdown().await;
    }
}
