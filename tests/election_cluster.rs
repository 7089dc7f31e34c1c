use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ballot::election::{ElectionConfig, FaultKind, LeaderElection, NodeState, SchedulerPhase};
use ballot::network::{ClusterView, InMemoryNetwork, LivenessProber, PeerClient};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const SIZE: u64 = 3;

struct Cluster {
    network: Arc<InMemoryNetwork>,
    nodes: Vec<Arc<LeaderElection>>,
    probers: Vec<JoinHandle<()>>,
}

fn address(id: u64) -> String {
    format!("node-{id}")
}

fn config() -> ElectionConfig {
    ElectionConfig::new(
        Duration::from_millis(300),
        Duration::from_millis(600),
        Duration::from_millis(100),
    )
    .with_rpc_timeout(Duration::from_millis(50))
}

async fn start_cluster() -> Cluster {
    let network = InMemoryNetwork::new();
    let members: BTreeMap<u64, String> = (0..SIZE).map(|id| (id, address(id))).collect();

    let mut nodes = Vec::new();
    let mut probers = Vec::new();
    for id in 0..SIZE {
        let (cluster, reachability) = ClusterView::new(id, members.clone());
        let state = NodeState::new(id, SIZE).shared();
        let client: Arc<dyn PeerClient> = Arc::new(network.client(Arc::clone(&state)));

        let prober = LivenessProber::new(
            reachability,
            Arc::clone(&client),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );
        probers.push(tokio::spawn(prober.run()));

        let node = Arc::new(LeaderElection::with_state(config(), cluster, client, state));
        network.register(&address(id), Arc::clone(&node)).await;
        nodes.push(node);
    }
    for node in &nodes {
        node.start().await;
    }

    Cluster {
        network,
        nodes,
        probers,
    }
}

impl Cluster {
    async fn leaders(&self) -> Vec<u64> {
        let mut leaders = Vec::new();
        for (id, node) in self.nodes.iter().enumerate() {
            if node.is_leader().await {
                leaders.push(id as u64);
            }
        }
        leaders
    }

    /// Waits until exactly one node leads and returns its id.
    async fn await_single_leader(&self) -> u64 {
        for _ in 0..100 {
            let leaders = self.leaders().await;
            if leaders.len() == 1 {
                return leaders[0];
            }
            sleep(Duration::from_millis(100)).await;
        }
        panic!("no single leader emerged: {:?}", self.leaders().await);
    }

    async fn shutdown(self) {
        for prober in self.probers {
            prober.abort();
        }
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn one_leader_emerges_and_holds() {
    let cluster = start_cluster().await;

    let leader = cluster.await_single_leader().await;
    let term = cluster.nodes[leader as usize].term().await;
    assert_eq!(term % SIZE, leader, "leader owns its term");
    assert_eq!(
        cluster.nodes[leader as usize].phase().await,
        SchedulerPhase::Leader
    );

    // Heartbeats keep the followers quiet well past their timeouts.
    sleep(Duration::from_secs(3)).await;
    assert_eq!(cluster.leaders().await, vec![leader]);
    assert_eq!(cluster.nodes[leader as usize].term().await, term);
    for (id, node) in cluster.nodes.iter().enumerate() {
        if id as u64 != leader {
            assert_eq!(node.term().await, term, "follower {id} adopted the term");
        }
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn followers_take_over_after_leader_loss() {
    let mut cluster = start_cluster().await;
    let old_leader = cluster.await_single_leader().await;
    let old_term = cluster.nodes[old_leader as usize].term().await;

    let gone = cluster
        .network
        .disconnect(&address(old_leader))
        .await
        .expect("leader was registered");
    gone.shutdown().await;

    let mut new_leader = None;
    for _ in 0..100 {
        sleep(Duration::from_millis(100)).await;
        let leaders: Vec<u64> = cluster
            .leaders()
            .await
            .into_iter()
            .filter(|id| *id != old_leader)
            .collect();
        if leaders.len() == 1 {
            new_leader = Some(leaders[0]);
            break;
        }
    }
    let new_leader = new_leader.expect("a surviving node took over");
    assert_ne!(new_leader, old_leader);

    let node = &cluster.nodes[new_leader as usize];
    assert!(node.term().await > old_term);
    assert_eq!(node.available_servers().len(), 1);

    cluster.nodes.remove(old_leader as usize);
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lost_connection_isolates_the_leader() {
    let cluster = start_cluster().await;
    let leader = cluster.await_single_leader().await;

    cluster.nodes[leader as usize]
        .enable_fault("LOST_CONNECTION")
        .await
        .unwrap();

    // The followers stop hearing heartbeats and elect someone else.
    let mut replacement = None;
    for _ in 0..100 {
        sleep(Duration::from_millis(100)).await;
        for (id, node) in cluster.nodes.iter().enumerate() {
            if id as u64 != leader && node.is_leader().await {
                replacement = Some(id as u64);
            }
        }
        if replacement.is_some() {
            break;
        }
    }
    assert!(replacement.is_some(), "followers elected a new leader");

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_to_a_leader_makes_both_step_down() {
    let cluster = start_cluster().await;
    let leader = cluster.await_single_leader().await;
    let follower = (leader + 1) % SIZE;

    // A follower forced to broadcast hits the leader, which replies Conflict
    // and steps down; the forced loop stops at that conflict.
    let rogue = &cluster.nodes[follower as usize];
    rogue.enable_fault("INFINITE_REPLIES").await.unwrap();
    rogue.disable_fault("INFINITE_REPLIES").await.unwrap();
    assert!(rogue.heartbeats().is_running().await);

    sleep(Duration::from_millis(150)).await;
    assert!(!rogue.heartbeats().is_running().await);
    assert!(!cluster.nodes[leader as usize].is_leader().await);

    // Someone leads again afterwards.
    cluster.await_single_leader().await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn infinite_replies_keeps_a_rogue_broadcaster_going() {
    let cluster = start_cluster().await;
    let leader = cluster.await_single_leader().await;
    let follower = (leader + 2) % SIZE;

    let rogue = &cluster.nodes[follower as usize];
    rogue.enable_fault("infinite-replies").await.unwrap();
    assert!(rogue.fault_statuses().await["INFINITE_REPLIES"]);

    // The first forced sweep hits the leader, which steps down; the rogue
    // loop keeps going.
    sleep(Duration::from_millis(150)).await;
    assert!(rogue.heartbeats().is_running().await);
    assert!(!rogue.is_leader().await, "forced heartbeats do not make a leader");
    assert!(!cluster.nodes[leader as usize].is_leader().await);

    rogue.disable_fault("INFINITE_REPLIES").await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_single_lying_voter_does_not_block_the_election() {
    let cluster = start_cluster().await;
    cluster.nodes[2]
        .enable_fault(FaultKind::InvalidResponse.as_str())
        .await
        .unwrap();

    let leader = cluster.await_single_leader().await;
    assert_eq!(cluster.nodes[leader as usize].term().await % SIZE, leader);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lying_majority_is_corrected_by_the_candidate() {
    let cluster = start_cluster().await;
    let leader = cluster.await_single_leader().await;
    // Let heartbeats settle every follower on the leader's term.
    sleep(Duration::from_millis(300)).await;
    let before = cluster.nodes[leader as usize].term().await;
    for (id, node) in cluster.nodes.iter().enumerate() {
        if id as u64 != leader {
            node.enable_fault("INVALID_RESPONSE").await.unwrap();
        }
    }

    let node = &cluster.nodes[leader as usize];
    let outcome = node.trigger_candidacy().await.unwrap();
    assert_eq!(outcome, ballot::election::CandidacyOutcome::Elected);
    assert!(node.is_leader().await);
    let term = node.term().await;
    assert!(term > before);

    // The lying voters reported a rejection, so they kept their term.
    for (id, voter) in cluster.nodes.iter().enumerate() {
        if id as u64 != leader {
            assert_eq!(voter.term().await, before);
        }
    }

    // Heartbeats from the new term bring them along.
    sleep(Duration::from_millis(250)).await;
    for voter in &cluster.nodes {
        assert_eq!(voter.term().await, term);
    }
    assert_eq!(cluster.leaders().await, vec![leader]);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn manual_candidacy_takes_over() {
    let cluster = start_cluster().await;
    let leader = cluster.await_single_leader().await;
    let challenger = (leader + 1) % SIZE;
    let before = cluster.nodes[leader as usize].term().await;

    let outcome = cluster.nodes[challenger as usize]
        .trigger_candidacy()
        .await
        .unwrap();
    assert_eq!(outcome, ballot::election::CandidacyOutcome::Elected);
    assert!(!cluster.nodes[leader as usize].is_leader().await, "vote demoted the old leader");

    assert!(cluster.nodes[challenger as usize].term().await > before);
    cluster.await_single_leader().await;
    cluster.shutdown().await;
}
