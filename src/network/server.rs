use std::convert::Infallible;
use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;

use hyper::body::HttpBody as _;
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, StatusCode};
use log::{error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::client::{HeartbeatAck, HEARTBEAT_PATH, STATUS_PATH, VOTE_PATH};
use crate::election::{CandidacyOutcome, HeartbeatReply, LeaderElection};

const CANDIDATE_PATH: &str = "/leaderElection/candidate";
const FAULT_STATUSES_PATH: &str = "/error-status/statuses";
const FAULT_ENABLE_PREFIX: &str = "/error-status/enable/";
const FAULT_DISABLE_PREFIX: &str = "/error-status/disable/";
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Serves the peer RPC and operator routes on an already bound listener
/// until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    node: Arc<LeaderElection>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let node = Arc::clone(&node);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let node = Arc::clone(&node);
                async move { handle(req, node).await }
            }))
        }
    });

    hyper::Server::from_tcp(listener)?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await
}

fn respond(status: StatusCode, content_type: &str, body: Body) -> Response<Body> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    if let Ok(value) = header::HeaderValue::from_str(content_type) {
        resp.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    resp
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    resp
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => respond(status, "application/json", Body::from(bytes)),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn json_error(status: StatusCode, msg: &str) -> Response<Body> {
    let body = serde_json::json!({ "error": msg }).to_string();
    respond(status, "application/json", Body::from(body))
}

async fn read_json<T: DeserializeOwned>(mut body: Body) -> Result<T, Response<Body>> {
    let mut out = Vec::new();
    while let Some(next) = body.data().await {
        let chunk = next.map_err(|e| {
            json_error(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {e}"),
            )
        })?;
        if out.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"));
        }
        out.extend_from_slice(&chunk);
    }
    serde_json::from_slice(&out).map_err(|e| {
        warn!("Rejecting malformed request: {e}");
        json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}"))
    })
}

pub(crate) async fn handle(
    req: Request<Body>,
    node: Arc<LeaderElection>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (method, path.as_str()) {
        (Method::POST, VOTE_PATH) => match read_json(req.into_body()).await {
            Ok(request) => json(StatusCode::OK, &node.handle_vote(request).await),
            Err(resp) => resp,
        },
        (Method::POST, HEARTBEAT_PATH) => match read_json(req.into_body()).await {
            Ok(heartbeat) => match node.handle_heartbeat(heartbeat).await {
                HeartbeatReply::Ack { responder_id } => json(
                    StatusCode::OK,
                    &HeartbeatAck {
                        server_id: responder_id,
                    },
                ),
                HeartbeatReply::Conflict { responder_id } => json(
                    StatusCode::CONFLICT,
                    &HeartbeatAck {
                        server_id: responder_id,
                    },
                ),
            },
            Err(resp) => resp,
        },
        (Method::POST, CANDIDATE_PATH) => match node.trigger_candidacy().await {
            Ok(CandidacyOutcome::Elected) => empty(StatusCode::CREATED),
            Ok(CandidacyOutcome::NotElected) => empty(StatusCode::OK),
            Err(e) => {
                error!("Unable to start server candidacy for a leader: {e}");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        },
        (Method::GET, FAULT_STATUSES_PATH) => json(StatusCode::OK, &node.fault_statuses().await),
        (Method::POST, p) if p.starts_with(FAULT_ENABLE_PREFIX) => {
            match node.enable_fault(&p[FAULT_ENABLE_PREFIX.len()..]).await {
                Ok(_) => empty(StatusCode::OK),
                Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
            }
        }
        (Method::POST, p) if p.starts_with(FAULT_DISABLE_PREFIX) => {
            match node.disable_fault(&p[FAULT_DISABLE_PREFIX.len()..]).await {
                Ok(_) => empty(StatusCode::OK),
                Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
            }
        }
        (Method::GET, STATUS_PATH) => json(StatusCode::OK, &node.status().await),
        (Method::GET, "/leader") => respond(
            StatusCode::OK,
            "text/plain",
            Body::from(node.is_leader().await.to_string()),
        ),
        (Method::GET, "/servers") => json(StatusCode::OK, &node.all_servers()),
        (Method::GET, "/available-servers") => json(StatusCode::OK, &node.available_servers()),
        _ => empty(StatusCode::NOT_FOUND),
    };

    Ok(response)
}
