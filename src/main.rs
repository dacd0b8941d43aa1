use anyhow::{Context as _, Result};
use std::sync::Arc;

use clap::Parser;
use tokio::{net::TcpListener, sync::oneshot};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use raftkv::{
    cluster_client::{ClusterClient, JoinRequest},
    config::{Cli, Config},
    fsm::KvStateMachine,
    http::{AppState, build_router},
    node::{KvNode, NodeSettings},
    raft::{
        NodeMeta, RaftFacade, RaftPaths,
        http_rpc::{RaftRpcState, build_raft_rpc_router},
        network_http::HttpNetworkFactory,
        raft_node_id,
        runtime::{RaftSettings, start_raft},
    },
    store::{KvStore, MemStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    run_server(cli.config).await
}

async fn run_server(config: Config) -> Result<()> {
    let local = NodeMeta {
        id: config.local_id.clone(),
        raft_addr: config.raft_addr.to_string(),
        api_base_url: config.api_base_url(),
    };
    let raft_id = raft_node_id(&local.id);

    let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let fsm = KvStateMachine::new(store.clone());
    let paths = RaftPaths::new(&config.data_dir);
    let settings = RaftSettings {
        snapshot_retain: config.snapshot_retain as usize,
        snapshot_logs_since_last: config.snapshot_logs_since_last,
        ..RaftSettings::default()
    };
    let raft = start_raft(&paths, raft_id, &settings, fsm, HttpNetworkFactory::new()).await?;

    let raft_listener = TcpListener::bind(config.raft_addr)
        .await
        .with_context(|| format!("bind raft listener: {}", config.raft_addr))?;
    let raft_router = build_raft_rpc_router(RaftRpcState { raft: raft.raft() });
    let (raft_stop_tx, raft_stop_rx) = oneshot::channel::<()>();
    let raft_server = tokio::spawn(async move {
        axum::serve(raft_listener, raft_router)
            .with_graceful_shutdown(async move {
                let _ = raft_stop_rx.await;
            })
            .await
    });

    let raft: Arc<dyn RaftFacade> = Arc::new(raft);
    let node = KvNode::new(
        local.clone(),
        raft,
        store,
        NodeSettings {
            apply_timeout: config.apply_timeout(),
            leader_api_endpoint: config.leader_api_endpoint(),
        },
    );
    let cluster = ClusterClient::new();

    match config.leader_api_endpoint() {
        None => {
            let bootstrapped = node
                .membership()
                .bootstrap(local.clone())
                .await
                .context("bootstrap cluster")?;
            if bootstrapped {
                info!(node_id = %local.id, "bootstrapped new cluster");
            }
        }
        Some(endpoint) => {
            let req = JoinRequest {
                node_id: local.id.clone(),
                address: local.raft_addr.clone(),
                api_base_url: Some(local.api_base_url.clone()),
            };
            cluster
                .join(&endpoint, &req, config.join_timeout())
                .await
                .with_context(|| format!("join cluster via {endpoint}"))?;
            info!(node_id = %local.id, leader = %endpoint, "joined cluster");
        }
    }

    let app = build_router(AppState {
        node: node.clone(),
        cluster,
        forward_timeout: config.join_timeout(),
    })
    .layer(TraceLayer::new_for_http());

    info!(
        node_id = %local.id,
        raft_addr = %config.raft_addr,
        api_bind = %config.api_bind,
        data_dir = %config.data_dir.display(),
        version = raftkv::version::VERSION,
        "starting raftkv"
    );
    let listener = TcpListener::bind(config.api_bind)
        .await
        .with_context(|| format!("bind api listener: {}", config.api_bind))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(policy = ?config.shutdown_policy, "shutting down");
    let res = node
        .shutdown(config.shutdown_timeout(), config.shutdown_policy)
        .await;

    let _ = raft_stop_tx.send(());
    if let Err(err) = raft_server.await.context("join raft rpc server")? {
        error!(error = %err, "raft rpc server exited with error");
    }

    if let Err(err) = res {
        error!(step = ?err.shutdown_step(), error = %err, "graceful shutdown failed");
        return Err(err.into());
    }
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
