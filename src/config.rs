//! CLI flags and environment variables. Built once in
//! `main`, then handed to every component by `Arc<Config>` — there is no
//! module-level global state.

use std::time::Duration;

use clap::Parser;

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;
const DEFAULT_EVENT_NAMESPACE: &str = "default";
const DEFAULT_PRICE_REPORTER_PORT: u16 = 8080;

/// Default fraction of a group's desired capacity that may be mid-
/// termination at once. Not exposed
/// as a flag in the source CLI contract; kept as a named constant so a
/// future flag can wire it through without touching the scheduler.
pub const DEFAULT_TERMINATE_PERCENTAGE: u32 = 1;

#[derive(Parser, Debug, Clone)]
#[command(name = "asg-lifecycle-agent", about = "Manages spot/on-demand lifecycle policy for cloud autoscaling groups")]
pub struct CliArgs {
    /// Cloud region.
    #[arg(long)]
    pub region: String,

    /// Value matched against the cluster-id tag on groups.
    #[arg(long = "cluster-name")]
    pub cluster_name: String,

    /// Cloud provider selector. Only "aws" is supported.
    #[arg(long, default_value = "aws")]
    pub cloud: String,

    /// Credentials profile.
    #[arg(long)]
    pub profile: Option<String>,

    /// Reconciliation interval, in seconds.
    #[arg(long = "refresh-interval-seconds", default_value_t = DEFAULT_REFRESH_INTERVAL_SECS)]
    pub refresh_interval_seconds: u64,

    /// Never modify launch templates or terminate instances; only emit events.
    #[arg(long = "events-only", default_value_t = false)]
    pub events_only: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub region: String,
    pub cluster_name: String,
    pub cloud: String,
    pub profile: Option<String>,
    pub refresh_interval: Duration,
    pub events_only: bool,
    pub event_namespace: String,
    pub price_reporter_port: u16,
    pub terminate_percentage: u32,
}

impl Config {
    pub fn cloud_label(&self) -> &str {
        &self.cloud
    }
}

impl Config {
    /// Validates and builds a `Config` from parsed CLI args and the
    /// process environment. Returns `Err` for anything that should exit
    /// the process with code 1 before any task is spawned.
    pub fn from_args(args: CliArgs) -> anyhow::Result<Self> {
        if args.cloud.to_lowercase() != "aws" {
            anyhow::bail!("unsupported cloud provider: {} (only 'aws' is supported)", args.cloud);
        }
        if args.cluster_name.trim().is_empty() {
            anyhow::bail!("--cluster-name must not be empty");
        }

        let event_namespace =
            std::env::var("EVENT_NAMESPACE").unwrap_or_else(|_| DEFAULT_EVENT_NAMESPACE.to_string());
        let price_reporter_port = std::env::var("PRICE_REPORTER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PRICE_REPORTER_PORT);

        Ok(Config {
            region: args.region,
            cluster_name: args.cluster_name,
            cloud: args.cloud.to_lowercase(),
            profile: args.profile,
            refresh_interval: Duration::from_secs(args.refresh_interval_seconds),
            events_only: args.events_only,
            event_namespace,
            price_reporter_port,
            terminate_percentage: DEFAULT_TERMINATE_PERCENTAGE,
        })
    }
}
