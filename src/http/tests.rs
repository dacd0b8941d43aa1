use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::util::ServiceExt;

use crate::{
    cluster_client::ClusterClient,
    fsm::KvStateMachine,
    http::{AppState, build_router},
    node::{KvNode, NodeSettings},
    raft::{LocalRaft, NodeMeta, RaftFacade as _, raft_node_id},
    store::{KvStore, MemStore},
};

fn meta(id: &str, api_base_url: &str) -> NodeMeta {
    NodeMeta {
        id: id.to_string(),
        raft_addr: format!("{id}.raft:8081"),
        api_base_url: api_base_url.to_string(),
    }
}

fn node_with(local: NodeMeta) -> (LocalRaft, KvNode) {
    let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let raft = LocalRaft::new(raft_node_id(&local.id), KvStateMachine::new(store.clone()));
    let node = KvNode::new(
        local,
        Arc::new(raft.clone()),
        store,
        NodeSettings::default(),
    );
    (raft, node)
}

fn app(node: KvNode) -> axum::Router {
    build_router(AppState {
        node,
        cluster: ClusterClient::new(),
        forward_timeout: Duration::from_secs(2),
    })
}

async fn leader_app() -> (LocalRaft, KvNode, axum::Router) {
    let local = meta("a", "");
    let (raft, node) = node_with(local.clone());
    node.membership().bootstrap(local).await.unwrap();
    let router = app(node.clone());
    (raft, node, router)
}

fn req(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn req_json(method: &str, uri: &str, value: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&value).unwrap()))
        .unwrap()
}

async fn body_bytes(res: axum::response::Response) -> Vec<u8> {
    res.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(res: axum::response::Response) -> Value {
    let bytes = body_bytes(res).await;
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(res: axum::response::Response) -> String {
    let bytes = body_bytes(res).await;
    String::from_utf8(bytes).unwrap()
}

#[tokio::test]
async fn set_then_get_returns_plain_text_value() {
    let (_raft, _node, app) = leader_app().await;

    let res = app
        .clone()
        .oneshot(req("POST", "/api/v1/key/greeting/hello"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(req("GET", "/api/v1/key/greeting"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let content_type = res
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
    assert_eq!(body_text(res).await, "hello\n");
}

#[tokio::test]
async fn get_missing_key_is_404() {
    let (_raft, _node, app) = leader_app().await;
    let res = app
        .oneshot(req("GET", "/api/v1/key/missing"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body = body_json(res).await;
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (_raft, node, app) = leader_app().await;
    node.set("k", "v").await.unwrap();

    for _ in 0..2 {
        let res = app
            .clone()
            .oneshot(req("DELETE", "/api/v1/key/k"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    assert!(node.get("k").is_err());
}

#[tokio::test]
async fn follower_write_is_misdirected_with_leader_hint() {
    let (raft, node, app) = leader_app().await;
    node.join(meta("b", "http://b.api:8000")).await.unwrap();
    raft.set_leader(Some(raft_node_id("b")));

    let res = app
        .clone()
        .oneshot(req("POST", "/api/v1/key/k/v"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::MISDIRECTED_REQUEST);
    let body = body_json(res).await;
    assert_eq!(body["error"]["code"], "not_leader");
    assert_eq!(
        body["error"]["details"]["leader_api_base_url"],
        "http://b.api:8000"
    );

    let res = app
        .oneshot(req("DELETE", "/api/v1/node/b"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::MISDIRECTED_REQUEST);
    assert!(node.get("k").is_err());
}

#[tokio::test]
async fn join_is_idempotent_and_listed_in_cluster_status() {
    let (_raft, _node, app) = leader_app().await;
    let join = json!({"node_id": "b", "address": "10.0.0.2:8081"});

    let res = app
        .clone()
        .oneshot(req_json("POST", "/api/v1/node", join.clone()))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["status"], "added");

    let res = app
        .clone()
        .oneshot(req_json("POST", "/api/v1/node", join))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["status"], "already_member");

    let res = app.oneshot(req("GET", "/api/v1/cluster")).await.unwrap();
    let body = body_json(res).await;
    assert_eq!(body["is_leader"], true);
    assert_eq!(body["leader_id"], "a");
    assert_eq!(
        body["members"],
        json!([
            {"id": "a", "address": "a.raft:8081"},
            {"id": "b", "address": "10.0.0.2:8081"},
        ])
    );
}

#[tokio::test]
async fn join_with_malformed_body_is_400() {
    let (_raft, _node, app) = leader_app().await;
    let res = app
        .oneshot(req_json("POST", "/api/v1/node", json!({"node_id": "b"})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(res).await["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn remove_node_drops_member() {
    let (_raft, node, app) = leader_app().await;
    node.join(meta("b", "")).await.unwrap();

    let res = app
        .oneshot(req("DELETE", "/api/v1/node/b"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(node.status().members.len(), 1);
}

#[tokio::test]
async fn remove_request_reaches_member_with_reserved_characters_in_id() {
    let (_raft, node, router) = leader_app().await;
    node.join(meta("rack/1 b?", "")).await.unwrap();
    assert_eq!(node.status().members.len(), 2);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    ClusterClient::new()
        .remove(&url, "rack/1 b?", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(node.status().members.len(), 1);
}

#[tokio::test]
async fn follower_forwards_join_to_leader() {
    let (_leader_raft, leader_node, leader_router) = leader_app().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let leader_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, leader_router).await.unwrap();
    });

    let follower_meta = meta("f", "");
    let (follower_raft, follower_node) = node_with(follower_meta.clone());
    let leader_meta = meta("a", &leader_url);
    follower_raft
        .initialize(
            [
                (raft_node_id("f"), follower_meta),
                (raft_node_id("a"), leader_meta),
            ]
            .into_iter()
            .collect(),
        )
        .await
        .unwrap();
    follower_raft.set_leader(Some(raft_node_id("a")));

    let res = app(follower_node)
        .oneshot(req_json(
            "POST",
            "/api/v1/node",
            json!({"node_id": "c", "address": "10.0.0.3:8081"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["status"], "forwarded");
    assert_eq!(body["leader_id"], "a");

    assert!(
        leader_node
            .status()
            .members
            .iter()
            .any(|m| m.id == "c" && m.address == "10.0.0.3:8081")
    );
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let (_raft, _node, app) = leader_app().await;

    let res = app
        .clone()
        .oneshot(req("GET", "/api/v1/health"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_id"], "a");
    assert_eq!(body["is_leader"], true);

    let res = app.oneshot(req("GET", "/nope")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
