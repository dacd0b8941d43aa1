use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser};

/// What `Shutdown` does when a cluster-cleanup step fails.
#[derive(clap::ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Abort at the first failing step; the consensus engine keeps running.
    #[default]
    Strict,
    /// Log cleanup failures and always stop the consensus engine.
    BestEffort,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "raftkv",
    about = "Replicated key/value store",
    version = crate::version::VERSION
)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "RAFTKV_LOCAL_ID",
        value_name = "ID",
        default_value = "node-1"
    )]
    pub local_id: String,

    #[arg(
        long,
        global = true,
        env = "RAFTKV_RAFT_ADDR",
        value_name = "ADDR",
        default_value = "127.0.0.1:8081"
    )]
    pub raft_addr: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "RAFTKV_API_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8000"
    )]
    pub api_bind: SocketAddr,

    /// Advertised control-plane origin; defaults to `http://<api-bind>`.
    #[arg(
        long,
        global = true,
        env = "RAFTKV_API_BASE_URL",
        value_name = "ORIGIN",
        default_value = ""
    )]
    pub api_base_url: String,

    #[arg(
        long,
        global = true,
        env = "RAFTKV_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    /// Control-plane origin of a cluster member to join at startup.
    #[arg(
        long,
        global = true,
        env = "RAFTKV_LEADER_API_ENDPOINT",
        value_name = "ORIGIN",
        default_value = ""
    )]
    pub leader_api_endpoint: String,

    #[arg(
        long = "apply-timeout-ms",
        global = true,
        env = "RAFTKV_APPLY_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 3_000,
        value_parser = clap::value_parser!(u64).range(100..=60_000)
    )]
    pub apply_timeout_ms: u64,

    #[arg(
        long = "snapshot-retain",
        global = true,
        env = "RAFTKV_SNAPSHOT_RETAIN",
        value_name = "N",
        default_value_t = 2,
        value_parser = clap::value_parser!(u64).range(1..=32)
    )]
    pub snapshot_retain: u64,

    #[arg(
        long = "snapshot-logs-since-last",
        global = true,
        env = "RAFTKV_SNAPSHOT_LOGS_SINCE_LAST",
        value_name = "N",
        default_value_t = 1024,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub snapshot_logs_since_last: u64,

    #[arg(
        long = "shutdown-timeout-secs",
        global = true,
        env = "RAFTKV_SHUTDOWN_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 3,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub shutdown_timeout_secs: u64,

    #[arg(
        long = "shutdown-policy",
        global = true,
        env = "RAFTKV_SHUTDOWN_POLICY",
        value_name = "POLICY",
        default_value = "strict",
        value_enum
    )]
    pub shutdown_policy: ShutdownPolicy,

    #[arg(
        long = "join-timeout-secs",
        global = true,
        env = "RAFTKV_JOIN_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 3,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub join_timeout_secs: u64,
}

impl Config {
    pub fn api_base_url(&self) -> String {
        let url = self.api_base_url.trim();
        if url.is_empty() {
            format!("http://{}", self.api_bind)
        } else {
            url.trim_end_matches('/').to_string()
        }
    }

    pub fn leader_api_endpoint(&self) -> Option<String> {
        let endpoint = self.leader_api_endpoint.trim();
        (!endpoint.is_empty()).then(|| endpoint.trim_end_matches('/').to_string())
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["raftkv"]).unwrap();
        let config = cli.config;
        assert_eq!(config.local_id, "node-1");
        assert_eq!(config.raft_addr.to_string(), "127.0.0.1:8081");
        assert_eq!(config.api_base_url(), "http://127.0.0.1:8000");
        assert_eq!(config.leader_api_endpoint(), None);
        assert_eq!(config.apply_timeout(), Duration::from_secs(3));
        assert_eq!(config.snapshot_retain, 2);
        assert_eq!(config.snapshot_logs_since_last, 1024);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(3));
        assert_eq!(config.shutdown_policy, ShutdownPolicy::Strict);
        assert_eq!(config.join_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn explicit_origins_are_normalized() {
        let cli = Cli::try_parse_from([
            "raftkv",
            "--api-base-url",
            "http://kv-1.internal:8000/",
            "--leader-api-endpoint",
            "http://kv-0.internal:8000/",
        ])
        .unwrap();
        assert_eq!(cli.config.api_base_url(), "http://kv-1.internal:8000");
        assert_eq!(
            cli.config.leader_api_endpoint().as_deref(),
            Some("http://kv-0.internal:8000")
        );
    }

    #[test]
    fn parses_best_effort_shutdown_policy() {
        let cli = Cli::try_parse_from(["raftkv", "--shutdown-policy", "best-effort"]).unwrap();
        assert_eq!(cli.config.shutdown_policy, ShutdownPolicy::BestEffort);
    }

    #[test]
    fn rejects_invalid_apply_timeout_ms() {
        let err = Cli::try_parse_from(["raftkv", "--apply-timeout-ms", "10"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--apply-timeout-ms"));
        assert!(msg.contains("100..=60000"));
    }

    #[test]
    fn rejects_invalid_snapshot_retain() {
        let err = Cli::try_parse_from(["raftkv", "--snapshot-retain", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--snapshot-retain"));
        assert!(msg.contains("1..=32"));
    }

    #[test]
    fn rejects_invalid_shutdown_timeout_secs() {
        let err = Cli::try_parse_from(["raftkv", "--shutdown-timeout-secs", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--shutdown-timeout-secs"));
        assert!(msg.contains("1..=300"));
    }
}
