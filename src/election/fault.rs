use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::heartbeat::HeartbeatBroadcaster;
use super::state::SharedNodeState;
use super::ElectionError;

/// Path suffix appended to outbound peer URLs while `LOST_CONNECTION` is on.
pub const LOST_CONNECTION_SUFFIX: &str = "/fake";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultKind {
    LostConnection,
    InvalidResponse,
    InfiniteReplies,
}

impl FaultKind {
    pub const ALL: [FaultKind; 3] = [
        FaultKind::LostConnection,
        FaultKind::InvalidResponse,
        FaultKind::InfiniteReplies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::LostConnection => "LOST_CONNECTION",
            FaultKind::InvalidResponse => "INVALID_RESPONSE",
            FaultKind::InfiniteReplies => "INFINITE_REPLIES",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultKind {
    type Err = ElectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        FaultKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ElectionError::UnknownFault(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultFlags {
    lost_connection: bool,
    invalid_response: bool,
    infinite_replies: bool,
}

impl FaultFlags {
    fn slot(&mut self, kind: FaultKind) -> &mut bool {
        match kind {
            FaultKind::LostConnection => &mut self.lost_connection,
            FaultKind::InvalidResponse => &mut self.invalid_response,
            FaultKind::InfiniteReplies => &mut self.infinite_replies,
        }
    }

    pub fn is_enabled(&self, kind: FaultKind) -> bool {
        match kind {
            FaultKind::LostConnection => self.lost_connection,
            FaultKind::InvalidResponse => self.invalid_response,
            FaultKind::InfiniteReplies => self.infinite_replies,
        }
    }

    /// Returns true if the flag changed.
    pub fn enable(&mut self, kind: FaultKind) -> bool {
        !std::mem::replace(self.slot(kind), true)
    }

    /// Returns true if the flag changed.
    pub fn disable(&mut self, kind: FaultKind) -> bool {
        std::mem::replace(self.slot(kind), false)
    }

    pub fn statuses(&self) -> BTreeMap<String, bool> {
        FaultKind::ALL
            .into_iter()
            .map(|kind| (kind.as_str().to_string(), self.is_enabled(kind)))
            .collect()
    }
}

/// Operator-facing switchboard for the fault flags.
///
/// Besides flipping the flag, toggling `INFINITE_REPLIES` on a node that is
/// not the leader (re)starts a forced heartbeat loop so that leader
/// conflicts can be provoked on purpose.
pub struct FaultInjector {
    state: SharedNodeState,
    heartbeats: Arc<HeartbeatBroadcaster>,
}

impl FaultInjector {
    pub fn new(state: SharedNodeState, heartbeats: Arc<HeartbeatBroadcaster>) -> Self {
        Self { state, heartbeats }
    }

    pub async fn enable(&self, kind: FaultKind) {
        let leader = {
            let mut state = self.state.lock().await;
            if state.faults_mut().enable(kind) {
                info!("Enabled '{kind}' fault");
            } else {
                debug!("Fault '{kind}' was already enabled");
            }
            state.is_leader()
        };

        if kind == FaultKind::InfiniteReplies && !leader {
            info!("Forcing heartbeats from a non-leader node");
            self.heartbeats.start().await;
        }
    }

    pub async fn disable(&self, kind: FaultKind) {
        let leader = {
            let mut state = self.state.lock().await;
            if state.faults_mut().disable(kind) {
                info!("Disabled '{kind}' fault");
            } else {
                debug!("Fault '{kind}' was already disabled");
            }
            state.is_leader()
        };

        if kind == FaultKind::InfiniteReplies && !leader {
            info!("Rescheduling forced heartbeats; the next conflict will stop them");
            self.heartbeats.start().await;
        }
    }

    pub async fn enable_by_name(&self, name: &str) -> Result<FaultKind, ElectionError> {
        let kind = name.parse::<FaultKind>()?;
        self.enable(kind).await;
        Ok(kind)
    }

    pub async fn disable_by_name(&self, name: &str) -> Result<FaultKind, ElectionError> {
        let kind = name.parse::<FaultKind>()?;
        self.disable(kind).await;
        Ok(kind)
    }

    pub async fn is_enabled(&self, kind: FaultKind) -> bool {
        self.state.lock().await.faults().is_enabled(kind)
    }

    pub async fn statuses(&self) -> BTreeMap<String, bool> {
        self.state.lock().await.faults().statuses()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!(
            "lost_connection".parse::<FaultKind>().unwrap(),
            FaultKind::LostConnection
        );
        assert_eq!(
            "Invalid-Response".parse::<FaultKind>().unwrap(),
            FaultKind::InvalidResponse
        );
        assert_eq!(
            "INFINITE_REPLIES".parse::<FaultKind>().unwrap(),
            FaultKind::InfiniteReplies
        );
    }

    #[test]
    fn unknown_name_is_rejected() {
        match "SLOW_DISK".parse::<FaultKind>() {
            Err(ElectionError::UnknownFault(name)) => assert_eq!(name, "SLOW_DISK"),
            other => panic!("expected UnknownFault, got {other:?}"),
        }
    }

    #[test]
    fn enable_and_disable_are_idempotent() {
        let mut flags = FaultFlags::default();
        assert!(flags.enable(FaultKind::InvalidResponse));
        assert!(!flags.enable(FaultKind::InvalidResponse));
        assert!(flags.is_enabled(FaultKind::InvalidResponse));
        assert!(!flags.is_enabled(FaultKind::LostConnection));

        assert!(flags.disable(FaultKind::InvalidResponse));
        assert!(!flags.disable(FaultKind::InvalidResponse));
        assert!(!flags.is_enabled(FaultKind::InvalidResponse));
    }

    #[test]
    fn statuses_list_every_fault() {
        let mut flags = FaultFlags::default();
        flags.enable(FaultKind::InfiniteReplies);

        let statuses = flags.statuses();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses.get("INFINITE_REPLIES"), Some(&true));
        assert_eq!(statuses.get("LOST_CONNECTION"), Some(&false));
        assert_eq!(statuses.get("INVALID_RESPONSE"), Some(&false));
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&FaultKind::LostConnection).unwrap();
        assert_eq!(json, "\"LOST_CONNECTION\"");
    }
}
