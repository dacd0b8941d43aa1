//! Outbound control-plane calls between nodes: the startup join request, join forwarding and
//! the self-removal request issued during shutdown.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/v1/node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: String,
    /// Replication address of the joining node.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterClient {
    client: reqwest::Client,
}

impl ClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the node at `api_base_url` to add us as a voter.
    pub async fn join(
        &self,
        api_base_url: &str,
        req: &JoinRequest,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let url = endpoint(api_base_url, "/api/v1/node");
        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(req)
            .send()
            .await
            .with_context(|| format!("send join request: {url}"))?;
        check_status(resp, "join").await
    }

    /// Ask the node at `api_base_url` to drop `node_id` from the configuration.
    pub async fn remove(
        &self,
        api_base_url: &str,
        node_id: &str,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let url = member_url(api_base_url, node_id)?;
        let resp = self
            .client
            .delete(url.clone())
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("send remove request: {url}"))?;
        check_status(resp, "remove").await
    }
}

fn endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}{path}")
    } else {
        format!("http://{base}{path}")
    }
}

/// `/api/v1/node/{node_id}` with the id percent-encoded as one path segment.
fn member_url(base: &str, node_id: &str) -> anyhow::Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(&endpoint(base, "/api/v1/node"))
        .with_context(|| format!("invalid api base url: {base}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("api base url cannot carry a path: {base}"))?
        .push(node_id);
    Ok(url)
}

async fn check_status(resp: reqwest::Response, what: &str) -> anyhow::Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!("{what} request rejected: status={status} body={body}")
}
