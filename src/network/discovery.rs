use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use super::PeerClient;
use crate::election::ElectionError;

/// Membership of the cluster plus the latest liveness snapshot.
///
/// Ids are `port mod hosts.len()`. The reachable set never contains the
/// local id and is refreshed by a [`LivenessProber`].
#[derive(Debug, Clone)]
pub struct ClusterView {
    self_id: u64,
    members: BTreeMap<u64, String>,
    reachable: watch::Receiver<BTreeSet<u64>>,
}

/// Write side of a [`ClusterView`]'s reachable set.
#[derive(Debug, Clone)]
pub struct Reachability {
    members: BTreeMap<u64, String>,
    self_id: u64,
    tx: Arc<watch::Sender<BTreeSet<u64>>>,
}

impl ClusterView {
    pub fn new(self_id: u64, members: BTreeMap<u64, String>) -> (Self, Reachability) {
        let (tx, rx) = watch::channel(BTreeSet::new());
        let view = Self {
            self_id,
            members: members.clone(),
            reachable: rx,
        };
        let handle = Reachability {
            members,
            self_id,
            tx: Arc::new(tx),
        };
        (view, handle)
    }

    /// Builds the membership from configured host URLs and the local
    /// listen port.
    pub fn from_hosts(
        self_port: u16,
        hosts: &[String],
    ) -> Result<(Self, Reachability), ElectionError> {
        if hosts.is_empty() {
            return Err(ElectionError::EmptyCluster);
        }
        let size = hosts.len() as u64;
        let mut members: BTreeMap<u64, String> = BTreeMap::new();
        for host in hosts {
            let address = normalize_address(host)?;
            let id = u64::from(extract_port(&address)?) % size;
            if let Some(first) = members.get(&id) {
                return Err(ElectionError::DuplicateServerId {
                    id,
                    first: first.clone(),
                    second: address,
                });
            }
            members.insert(id, address);
        }

        let self_id = u64::from(self_port) % size;
        info!("Id {self_id} has been assigned to the server");
        if !members.contains_key(&self_id) {
            warn!("Listen port {self_port} does not match any configured host");
        }
        Ok(Self::new(self_id, members))
    }

    pub fn self_id(&self) -> u64 {
        self.self_id
    }

    /// Number of configured nodes, reachable or not, self included.
    pub fn peer_count(&self) -> u64 {
        self.members.len() as u64
    }

    pub fn all_servers(&self) -> BTreeMap<u64, String> {
        self.members.clone()
    }

    /// Every configured node except this one.
    pub fn peers(&self) -> BTreeMap<u64, String> {
        self.members
            .iter()
            .filter(|(id, _)| **id != self.self_id)
            .map(|(id, addr)| (*id, addr.clone()))
            .collect()
    }

    pub fn reachable_peers(&self) -> BTreeMap<u64, String> {
        let reachable = self.reachable.borrow();
        self.members
            .iter()
            .filter(|(id, _)| **id != self.self_id && reachable.contains(id))
            .map(|(id, addr)| (*id, addr.clone()))
            .collect()
    }

    pub fn available_count(&self) -> u64 {
        self.reachable_peers().len() as u64
    }

    pub fn any_available(&self) -> bool {
        self.available_count() > 0
    }
}

impl Reachability {
    /// Publishes a new reachable set. Returns true if it changed.
    pub fn set_reachable<I: IntoIterator<Item = u64>>(&self, ids: I) -> bool {
        let next: BTreeSet<u64> = ids
            .into_iter()
            .filter(|id| *id != self.self_id && self.members.contains_key(id))
            .collect();
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    pub fn mark_all_reachable(&self) -> bool {
        let ids: Vec<u64> = self.members.keys().copied().collect();
        self.set_reachable(ids)
    }

    pub fn current(&self) -> BTreeSet<u64> {
        self.tx.borrow().clone()
    }
}

/// Periodically checks every peer's status endpoint and publishes the
/// result to the cluster view.
pub struct LivenessProber {
    reachability: Reachability,
    client: Arc<dyn PeerClient>,
    interval: Duration,
    timeout: Duration,
}

impl LivenessProber {
    pub fn new(
        reachability: Reachability,
        client: Arc<dyn PeerClient>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            reachability,
            client,
            interval,
            timeout,
        }
    }

    pub async fn run(self) {
        loop {
            self.check_once().await;
            sleep(self.interval).await;
        }
    }

    /// Probes all peers once, publishes and returns the reachable ids.
    pub async fn check_once(&self) -> BTreeSet<u64> {
        let previous = self.reachability.current();
        let probes = self
            .reachability
            .members
            .iter()
            .filter(|(id, _)| **id != self.reachability.self_id)
            .map(|(id, addr)| {
                let client = Arc::clone(&self.client);
                let timeout = self.timeout;
                async move {
                    let alive = matches!(
                        tokio::time::timeout(timeout, client.probe(addr)).await,
                        Ok(Ok(()))
                    );
                    (*id, addr.as_str(), alive)
                }
            });

        let mut reachable = BTreeSet::new();
        for (id, addr, alive) in join_all(probes).await {
            match (alive, previous.contains(&id)) {
                (true, false) => info!("Server {id} at {addr} is reachable"),
                (false, true) => warn!("Server {id} at {addr} is not reachable!"),
                _ => {}
            }
            if alive {
                reachable.insert(id);
            }
        }

        if self.reachability.set_reachable(reachable.iter().copied()) {
            debug!("Reachable peers: {reachable:?}");
        }
        reachable
    }
}

/// Accepts `host:port` or a full `http://host:port` URL.
pub fn normalize_address(host: &str) -> Result<String, ElectionError> {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ElectionError::InvalidAddress(host.to_string()));
    }
    let address = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    extract_port(&address)?;
    Ok(address)
}

pub fn extract_port(address: &str) -> Result<u16, ElectionError> {
    let authority = address
        .split("://")
        .last()
        .and_then(|rest| rest.split('/').next())
        .unwrap_or_default();
    authority
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .ok_or_else(|| ElectionError::InvalidAddress(address.to_string()))
}
