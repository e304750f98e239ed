//! HTTP binding of the request router
//!
//! - `POST /key/{table}/{row}/{column}` with `{"value": "..."}` replicates a write
//! - `GET /key/{table}/{row}` returns every column of the row
//! - `GET /key/{table}/{row}/{column}` returns one cell
//! - `POST /join` with a `Peer-Address` header (and optional `Peer-Id`) adds a voter
//! - `GET /health`, `GET /members` expose node status and the member registry
//!
//! Unknown paths are rejected with 400.

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Result};
use crate::node::fsm::Row;
use crate::node::metadata::NodeRecord;
use crate::node::router::{NodeStatusView, RequestRouter};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

pub const PEER_ADDRESS_HEADER: &str = "Peer-Address";
pub const PEER_ID_HEADER: &str = "Peer-Id";

const MAX_BODY_BYTES: usize = 1024 * 1024;

type AppState = Arc<RequestRouter>;

#[derive(Debug, Deserialize)]
struct WriteRequest {
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RowResponse {
    pub value: Row,
    pub leader: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CellResponse {
    pub value: String,
    pub leader: String,
}

/// Creates the HTTP router with all public endpoints.
pub fn create_router(router: Arc<RequestRouter>) -> Router {
    Router::new()
        .route("/key/:table/:row", get(get_row))
        .route("/key/:table/:row/:column", get(get_cell).post(put_cell))
        .route("/join", post(join))
        .route("/health", get(health))
        .route("/members", get(members))
        .fallback(unknown_route)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_tracing_middleware))
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(router)
}

async fn put_cell(
    State(router): State<AppState>,
    Path((table, row, column)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<StatusCode> {
    let request: WriteRequest = serde_json::from_slice(&body).map_err(|e| {
        tracing::error!(error = %e, "Bad request");
        Error::InvalidRequest(format!("invalid body: {}", e))
    })?;
    router.write(&table, &row, &column, &request.value).await?;
    Ok(StatusCode::OK)
}

async fn get_row(
    State(router): State<AppState>,
    Path((table, row)): Path<(String, String)>,
) -> Result<Json<RowResponse>> {
    let value = router.read(&table, &row)?;
    Ok(Json(RowResponse {
        value,
        leader: router.leader_address().unwrap_or_default(),
    }))
}

async fn get_cell(
    State(router): State<AppState>,
    Path((table, row, column)): Path<(String, String, String)>,
) -> Result<Json<CellResponse>> {
    let value = router.read_cell(&table, &row, &column)?;
    Ok(Json(CellResponse {
        value,
        leader: router.leader_address().unwrap_or_default(),
    }))
}

async fn join(State(router): State<AppState>, headers: HeaderMap) -> Result<StatusCode> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    };
    let peer_address = header(PEER_ADDRESS_HEADER);
    if peer_address.is_empty() {
        tracing::error!("Peer-Address not set on request");
        return Err(Error::InvalidRequest(format!(
            "{} header is required",
            PEER_ADDRESS_HEADER
        )));
    }
    router.join(&header(PEER_ID_HEADER), &peer_address).await?;
    Ok(StatusCode::OK)
}

async fn health(State(router): State<AppState>) -> Json<NodeStatusView> {
    Json(router.status())
}

async fn members(State(router): State<AppState>) -> Json<Vec<NodeRecord>> {
    Json(router.members())
}

async fn unknown_route() -> impl IntoResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "400 bad request" })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::key_path;
    use crate::common::tracing_middleware::REQUEST_ID_HEADER;
    use crate::engine::{ConsensusEngine, MemoryRaft, RaftNetwork};
    use crate::node::admission::VoterAdmission;
    use crate::node::fsm::KvStateMachine;
    use crate::node::leadership::LeadershipTracker;
    use crate::node::metadata::MetadataStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    async fn app(leader: bool) -> Router {
        let network = RaftNetwork::new();
        let fsm = Arc::new(KvStateMachine::new());
        let raft = Arc::new(MemoryRaft::new("n1", "n1:9000", network, fsm.clone()).unwrap());
        let leadership = LeadershipTracker::new();
        tokio::spawn(
            leadership
                .clone()
                .run(raft.take_leader_notify().unwrap(), CancellationToken::new()),
        );
        if leader {
            raft.bootstrap().unwrap();
            while !leadership.is_leader() {
                tokio::task::yield_now().await;
            }
        }
        let timeout = Duration::from_secs(5);
        create_router(Arc::new(RequestRouter::new(
            "n1",
            fsm,
            raft.clone(),
            leadership,
            Arc::new(MetadataStore::new()),
            VoterAdmission::new(raft, timeout),
            timeout,
        )))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn put(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let app = app(true).await;
        let (status, _) = send(&app, put("/key/users/u1/email", r#"{"value":"a@x.com"}"#)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, get("/key/users/u1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"]["email"], "a@x.com");
        assert_eq!(body["leader"], "n1:9000");

        let (status, body) = send(&app, get("/key/users/u1/email")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], "a@x.com");
    }

    #[tokio::test]
    async fn test_get_absent_is_404() {
        let app = app(true).await;
        let (status, body) = send(&app, get("/key/users/nobody")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "404 not found");
    }

    #[tokio::test]
    async fn test_bad_body_is_400() {
        let app = app(true).await;
        let (status, _) = send(&app, put("/key/users/u1/email", "not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, put("/key/users/u1/email", r#"{"val":"x"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_write_on_follower_is_500() {
        let app = app(false).await;
        let (status, body) = send(&app, put("/key/users/u1/email", r#"{"value":"x"}"#)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("not the leader"));
    }

    #[tokio::test]
    async fn test_join_requires_peer_address() {
        let app = app(true).await;
        let missing = Request::builder()
            .method("POST")
            .uri("/join")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, missing).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let join = Request::builder()
            .method("POST")
            .uri("/join")
            .header(PEER_ADDRESS_HEADER, "n2:9000")
            .header(PEER_ID_HEADER, "n2")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, join).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_and_wrong_method() {
        let app = app(true).await;
        let (status, body) = send(&app, get("/nope")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "400 bad request");

        let delete = Request::builder()
            .method("DELETE")
            .uri("/key/users/u1/email")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, delete).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_health_reports_role() {
        let app = app(true).await;
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], "n1");
        assert_eq!(body["role"], "leader");
        assert_eq!(body["is_leader"], true);

        let response = app.clone().oneshot(get("/members")).await.unwrap();
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected_and_traced() {
        let app = app(true).await;
        let value = "x".repeat(MAX_BODY_BYTES + 1);
        let body = format!(r#"{{"value":"{}"}}"#, value);
        let response = app
            .clone()
            .oneshot(put("/key/users/u1/email", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));

        let (status, _) = send(&app, get("/key/users/u1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_padded_key_segments_round_trip() {
        let app = app(true).await;
        let (status, _) = send(&app, put("/key/users/%20u1/email", r#"{"value":"a@x.com"}"#)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, get("/key/users/%20u1/email")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], "a@x.com");

        let (status, _) = send(&app, get("/key/users/u1/email")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_encoded_segments_reach_the_right_key() {
        let app = app(true).await;
        let cell = key_path("a/b", "r?1 #2", Some("100%"));
        let (status, _) = send(&app, put(&cell, r#"{"value":"v"}"#)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, get(&key_path("a/b", "r?1 #2", None))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"]["100%"], "v");
    }
}
