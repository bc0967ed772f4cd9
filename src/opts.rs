use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::controller_manager::ControllerManagerConfig;
use crate::leader::LeaderElectionConfig;

#[derive(Parser, Debug, Clone)]
#[clap(about = "Reconciles MachineSets into Machines")]
pub struct Opts {
    /// Namespace to watch, all namespaces when unset.
    #[clap(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Number of machinesets reconciled concurrently.
    #[clap(long, env = "WORKERS", default_value = "2")]
    pub workers: usize,

    /// Bound on concurrent machine creates or deletes within one reconcile.
    #[clap(long, env = "MAX_CONCURRENT_OPS", default_value = "10")]
    pub max_concurrent_ops: usize,

    /// Timeout for each API call, in seconds.
    #[clap(long, env = "API_TIMEOUT_SECONDS", default_value = "10")]
    pub api_timeout_seconds: u64,

    /// Period to re-enqueue every machineset, in seconds. 0 disables.
    #[clap(long, env = "RESYNC_PERIOD_SECONDS", default_value = "600")]
    pub resync_period_seconds: u64,

    /// Initial per-key retry delay, in milliseconds.
    #[clap(long, env = "BACKOFF_BASE_MILLIS", default_value = "5")]
    pub backoff_base_millis: u64,

    /// Maximum per-key retry delay, in seconds.
    #[clap(long, env = "BACKOFF_MAX_SECONDS", default_value = "1000")]
    pub backoff_max_seconds: u64,

    #[clap(long, env = "LEADER_ELECT")]
    pub leader_elect: bool,

    #[clap(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "default")]
    pub leader_election_namespace: String,

    #[clap(
        long,
        env = "LEADER_ELECTION_NAME",
        default_value = "machineset-controller-leader"
    )]
    pub leader_election_name: String,

    #[clap(long, env = "LEASE_DURATION_SECONDS", default_value = "137")]
    pub lease_duration_seconds: u64,

    #[clap(long, env = "RENEW_DEADLINE_SECONDS", default_value = "107")]
    pub renew_deadline_seconds: u64,

    #[clap(long, env = "RETRY_PERIOD_SECONDS", default_value = "26")]
    pub retry_period_seconds: u64,

    /// Leader election identity. Defaults to the hostname, or a random id.
    #[clap(long, env = "POD_NAME")]
    pub identity: Option<String>,

    #[clap(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:9440")]
    pub health_addr: SocketAddr,
}

impl Opts {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    pub fn identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn manager_config(&self) -> ControllerManagerConfig {
        ControllerManagerConfig {
            namespace: self.namespace.clone(),
            workers: self.workers,
            max_concurrent_ops: self.max_concurrent_ops,
            resync_period: Duration::from_secs(self.resync_period_seconds),
            backoff_base: Duration::from_millis(self.backoff_base_millis),
            backoff_max: Duration::from_secs(self.backoff_max_seconds),
        }
    }

    pub fn leader_election_config(&self) -> LeaderElectionConfig {
        LeaderElectionConfig {
            namespace: self.leader_election_namespace.clone(),
            name: self.leader_election_name.clone(),
            identity: self.identity(),
            lease_duration: Duration::from_secs(self.lease_duration_seconds),
            renew_deadline: Duration::from_secs(self.renew_deadline_seconds),
            retry_period: Duration::from_secs(self.retry_period_seconds),
            api_timeout: self.api_timeout(),
        }
    }
}
