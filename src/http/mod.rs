use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Extension, FromRequest, Path, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::{
    cluster_client::{ClusterClient, JoinRequest},
    error::NodeError,
    membership::JoinOutcome,
    node::{ClusterStatus, KvNode},
    raft::{ClusterMember, NodeMeta},
};

#[derive(Clone)]
pub struct AppState {
    pub node: KvNode,
    pub cluster: ClusterClient,
    /// Bound on a join forwarded to the leader.
    pub forward_timeout: Duration,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn not_leader(message: impl Into<String>, leader: Option<&NodeMeta>) -> Self {
        let mut err = Self::new("not_leader", StatusCode::MISDIRECTED_REQUEST, message);
        if let Some(leader) = leader {
            err.details
                .insert("leader_id".to_string(), Value::String(leader.id.clone()));
            if !leader.api_base_url.is_empty() {
                err.details.insert(
                    "leader_api_base_url".to_string(),
                    Value::String(leader.api_base_url.clone()),
                );
            }
        }
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<NodeError> for ApiError {
    fn from(value: NodeError) -> Self {
        match &value {
            NodeError::Validation(msg) => ApiError::invalid_request(msg.clone()),
            NodeError::NotFound { .. } => ApiError::not_found(value.to_string()),
            NodeError::NotLeader { leader } => {
                ApiError::not_leader(value.to_string(), leader.as_ref())
            }
            NodeError::Consensus(_) => {
                Self::new("consensus_error", StatusCode::INTERNAL_SERVER_ERROR, value.to_string())
            }
            NodeError::Serialization(_) => Self::new(
                "serialization_error",
                StatusCode::INTERNAL_SERVER_ERROR,
                value.to_string(),
            ),
            NodeError::Shutdown { .. } => ApiError::internal(value.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// JSON extractor whose rejections render as `ApiError`.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum JoinResponse {
    AlreadyMember,
    Added { replaced: Vec<ClusterMember> },
    Forwarded { leader_id: String },
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/cluster", get(cluster_status))
        .route("/key/:key/:value", post(set_key))
        .route("/key/:key", get(get_key).delete(delete_key))
        .route("/node", post(join_node))
        .route("/node/:id", axum::routing::delete(remove_node))
        .fallback(fallback_not_found);

    Router::new()
        .nest("/api/v1", api)
        .fallback(fallback_not_found)
        .layer(Extension(state))
}

async fn health(Extension(state): Extension<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node_id": state.node.local().id,
        "is_leader": state.node.is_leader(),
        "version": crate::version::VERSION,
    }))
}

async fn cluster_status(Extension(state): Extension<AppState>) -> Json<ClusterStatus> {
    Json(state.node.status())
}

async fn set_key(
    Extension(state): Extension<AppState>,
    Path((key, value)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.node.set(&key, &value).await.map_err(|err| {
        warn!(key = %key, error = %err, "set failed");
        ApiError::from(err)
    })?;
    Ok(StatusCode::OK)
}

async fn get_key(
    Extension(state): Extension<AppState>,
    Path(key): Path<String>,
) -> Result<String, ApiError> {
    let value = state.node.get(&key)?;
    Ok(format!("{value}\n"))
}

async fn delete_key(
    Extension(state): Extension<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.node.delete(&key).await.map_err(|err| {
        warn!(key = %key, error = %err, "delete failed");
        ApiError::from(err)
    })?;
    Ok(StatusCode::OK)
}

async fn join_node(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let candidate = NodeMeta {
        id: req.node_id.clone(),
        raft_addr: req.address.clone(),
        api_base_url: req.api_base_url.clone().unwrap_or_default(),
    };

    info!(node_id = %candidate.id, address = %candidate.raft_addr, "join request");
    match state.node.join(candidate).await {
        Ok(JoinOutcome::AlreadyMember) => Ok(Json(JoinResponse::AlreadyMember)),
        Ok(JoinOutcome::Added { replaced }) => {
            info!(node_id = %req.node_id, "node joined");
            Ok(Json(JoinResponse::Added { replaced }))
        }
        Err(NodeError::NotLeader {
            leader: Some(leader),
        }) if !leader.api_base_url.is_empty() => {
            info!(node_id = %req.node_id, leader = %leader, "forwarding join to leader");
            state
                .cluster
                .join(&leader.api_base_url, &req, state.forward_timeout)
                .await
                .map_err(|e| ApiError::internal(format!("forward join to leader: {e:#}")))?;
            Ok(Json(JoinResponse::Forwarded {
                leader_id: leader.id,
            }))
        }
        Err(err) => {
            warn!(node_id = %req.node_id, error = %err, "join failed");
            Err(err.into())
        }
    }
}

async fn remove_node(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    info!(node_id = %id, "remove request");
    state.node.remove_node_from_cluster(&id).await.map_err(|err| {
        warn!(node_id = %id, error = %err, "remove failed");
        ApiError::from(err)
    })?;
    Ok(StatusCode::OK)
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}

#[cfg(test)]
mod tests;
