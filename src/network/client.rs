use std::time::Duration;

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{header, Body, Client, Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::NetworkError;
use crate::election::{
    FaultKind, Heartbeat, HeartbeatReply, SharedNodeState, VoteRequest, VoteResponse,
    LOST_CONNECTION_SUFFIX,
};

pub const VOTE_PATH: &str = "/leaderElection/vote";
pub const HEARTBEAT_PATH: &str = "/leaderElection/heartbeat";
pub const STATUS_PATH: &str = "/status";

/// Outbound calls a node makes to its peers, addressed by base URL.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn request_vote(
        &self,
        address: &str,
        request: &VoteRequest,
    ) -> Result<VoteResponse, NetworkError>;

    async fn heartbeat(
        &self,
        address: &str,
        heartbeat: &Heartbeat,
    ) -> Result<HeartbeatReply, NetworkError>;

    /// Liveness check used by the discovery prober.
    async fn probe(&self, address: &str) -> Result<(), NetworkError>;
}

/// Body of both heartbeat answers; the HTTP status tells Ack from Conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    #[serde(rename = "serverId")]
    pub server_id: u64,
}

/// JSON-over-HTTP peer client.
///
/// Vote and heartbeat URLs get a bogus suffix while the local
/// `LOST_CONNECTION` fault is enabled, so every such call fails.
pub struct HttpPeerClient {
    client: Client<HttpConnector>,
    state: SharedNodeState,
    timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(state: SharedNodeState, timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_nodelay(true);
        Self {
            client: Client::builder().build(connector),
            state,
            timeout,
        }
    }

    async fn url(&self, address: &str, path: &str) -> String {
        let lost = self
            .state
            .lock()
            .await
            .faults()
            .is_enabled(FaultKind::LostConnection);
        let base = address.trim_end_matches('/');
        if lost {
            format!("{base}{path}{LOST_CONNECTION_SUFFIX}")
        } else {
            format!("{base}{path}")
        }
    }

    async fn post_json<T: Serialize>(
        &self,
        url: String,
        body: &T,
    ) -> Result<(StatusCode, hyper::body::Bytes), NetworkError> {
        let payload = serde_json::to_vec(body)?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload))?;

        let resp = tokio::time::timeout(self.timeout, self.client.request(req)).await??;
        let status = resp.status();
        let bytes = tokio::time::timeout(self.timeout, hyper::body::to_bytes(resp.into_body()))
            .await??;
        Ok((status, bytes))
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, NetworkError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn request_vote(
        &self,
        address: &str,
        request: &VoteRequest,
    ) -> Result<VoteResponse, NetworkError> {
        let url = self.url(address, VOTE_PATH).await;
        let (status, bytes) = self.post_json(url, request).await?;
        if status != StatusCode::OK {
            return Err(NetworkError::UnexpectedStatus(status.as_u16()));
        }
        decode(&bytes)
    }

    async fn heartbeat(
        &self,
        address: &str,
        heartbeat: &Heartbeat,
    ) -> Result<HeartbeatReply, NetworkError> {
        let url = self.url(address, HEARTBEAT_PATH).await;
        let (status, bytes) = self.post_json(url, heartbeat).await?;
        match status {
            StatusCode::OK => {
                let ack: HeartbeatAck = decode(&bytes)?;
                Ok(HeartbeatReply::Ack {
                    responder_id: ack.server_id,
                })
            }
            StatusCode::CONFLICT => {
                let ack: HeartbeatAck = decode(&bytes)?;
                Ok(HeartbeatReply::Conflict {
                    responder_id: ack.server_id,
                })
            }
            other => Err(NetworkError::UnexpectedStatus(other.as_u16())),
        }
    }

    async fn probe(&self, address: &str) -> Result<(), NetworkError> {
        let url = format!("{}{}", address.trim_end_matches('/'), STATUS_PATH);
        let req = Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Body::empty())?;
        let resp = tokio::time::timeout(self.timeout, self.client.request(req)).await??;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NetworkError::UnexpectedStatus(resp.status().as_u16()))
        }
    }
}
