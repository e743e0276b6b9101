//! Spot/on-demand lifecycle agent: manages bidding policy and instance
//! replacement for a cluster's managed autoscaling groups.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use asg_lifecycle_agent::bid_advisor::BidAdvisor;
use asg_lifecycle_agent::config::{CliArgs, Config};
use asg_lifecycle_agent::http;
use asg_lifecycle_agent::provider::Provider;
use asg_lifecycle_agent::reconciler::Reconciler;
use asg_lifecycle_agent::scheduler::ReplacementScheduler;
use asg_lifecycle_agent::store::GroupStore;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ON_DEMAND_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
const SPOT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let args = CliArgs::parse();
    let config = match Config::from_args(args) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        region = %config.region,
        cluster = %config.cluster_name,
        events_only = config.events_only,
        "starting asg-lifecycle-agent"
    );

    let provider = build_provider(&config).context("failed to construct cloud provider client")?;

    let bid_advisor = BidAdvisor::new(
        provider.clone(),
        config.region.clone(),
        ON_DEMAND_REFRESH_INTERVAL,
        SPOT_REFRESH_INTERVAL,
    );
    bid_advisor.start().await;

    let group_store = Arc::new(GroupStore::new());

    let scheduler = Arc::new(ReplacementScheduler::new(
        provider.clone(),
        bid_advisor.clone(),
        group_store.clone(),
        config.events_only,
        config.terminate_percentage,
    ));

    let reconciler = Arc::new(Reconciler::new(
        provider.clone(),
        bid_advisor.clone(),
        group_store.clone(),
        scheduler.clone(),
        config.cluster_name.clone(),
        config.region.clone(),
        config.refresh_interval,
        config.events_only,
    ));

    let shutdown = Arc::new(Notify::new());
    let price_history = Arc::new(http::PriceHistory::new());

    let collector_shutdown = Arc::clone(&shutdown);
    let collector_task = tokio::spawn(http::run_collector(
        group_store.clone(),
        bid_advisor.clone(),
        price_history.clone(),
        collector_shutdown,
    ));

    let http_shutdown = Arc::clone(&shutdown);
    let http_port = config.price_reporter_port;
    let http_task = tokio::spawn(async move {
        http::serve(price_history, http_port, async move {
            http_shutdown.notified().await;
        })
        .await
    });

    let reconcile_task = tokio::spawn(async move { reconciler.run().await });

    tokio::select! {
        result = reconcile_task => {
            match result {
                Ok(Ok(())) => warn!("reconciliation loop exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "reconciliation loop aborted"),
                Err(e) => error!(error = %e, "reconciliation task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    shutdown.notify_waiters();
    bid_advisor.stop().await;
    let _ = collector_task.await;
    if let Ok(Err(e)) = http_task.await {
        warn!(error = %e, "price reporter exited with error");
    }

    info!("asg-lifecycle-agent stopped");
    Ok(())
}

/// Constructs the concrete cloud-provider client. The real AWS SDK client
/// is an external collaborator this crate depends on as a trait object;
/// wiring a live implementation is left to the deployment that links one
/// in, matching how the provider boundary is drawn in
/// [`asg_lifecycle_agent::provider`].
fn build_provider(config: &Config) -> anyhow::Result<Arc<dyn Provider>> {
    anyhow::bail!(
        "no cloud provider client registered for '{}'; link a concrete Provider implementation before starting the agent",
        config.cloud_label()
    )
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asg_lifecycle_agent=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv::dotenv();
}
