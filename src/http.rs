//! Optional price-reporter HTTP endpoint: periodically samples the current
//! price of every tracked instance and serves its recent history as JSON,
//! built on `axum`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bid_advisor::BidAdvisor;
use crate::store::GroupStore;
use crate::types::Lifecycle;

const MAX_SAMPLES_PER_INSTANCE: usize = 24;
const COLLECTION_INTERVAL: Duration = Duration::from_secs(20 * 60);
const NO_PRICE_SENTINEL: &str = "-1";

/// A single timestamped reading: the fixed `{timestamp: price}` shape.
pub type PriceSample = HashMap<String, String>;

/// Bounded per-instance price history, capped at the last
/// [`MAX_SAMPLES_PER_INSTANCE`] samples.
#[derive(Default)]
pub struct PriceHistory {
    by_instance: RwLock<HashMap<String, VecDeque<PriceSample>>>,
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, instance_id: &str, sample: PriceSample) {
        let mut map = self.by_instance.write();
        let samples = map.entry(instance_id.to_string()).or_insert_with(VecDeque::new);
        if samples.len() == MAX_SAMPLES_PER_INSTANCE {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    fn snapshot(&self) -> HashMap<String, Vec<PriceSample>> {
        self.by_instance
            .read()
            .iter()
            .map(|(id, samples)| (id.clone(), samples.iter().cloned().collect()))
            .collect()
    }
}

/// One collection pass: looks up each tracked instance's current price from
/// the bid advisor's cached tables and appends a sample for it.
fn collect_once(group_store: &GroupStore, bid_advisor: &BidAdvisor, history: &PriceHistory) {
    let current = bid_advisor.current_price();
    let timestamp = chrono::Utc::now().to_rfc3339();

    for group in group_store.snapshot() {
        for instance in group.instances.values() {
            let price = match instance.lifecycle {
                Lifecycle::OnDemand => current.on_demand.get(&instance.instance_type).copied(),
                Lifecycle::Spot => current
                    .spot
                    .get(&instance.availability_zone)
                    .and_then(|by_type| by_type.get(&instance.instance_type))
                    .copied(),
            };
            let price_str = price
                .map(|p| p.to_string())
                .unwrap_or_else(|| NO_PRICE_SENTINEL.to_string());

            let mut sample = PriceSample::new();
            sample.insert(timestamp.clone(), price_str);
            history.record(&instance.id, sample);
        }
    }
}

/// Runs [`collect_once`] every [`COLLECTION_INTERVAL`] until `shutdown`
/// fires.
pub async fn run_collector(
    group_store: Arc<GroupStore>,
    bid_advisor: Arc<BidAdvisor>,
    history: Arc<PriceHistory>,
    shutdown: Arc<Notify>,
) {
    loop {
        collect_once(&group_store, &bid_advisor, &history);
        tokio::select! {
            _ = tokio::time::sleep(COLLECTION_INTERVAL) => {}
            _ = shutdown.notified() => return,
        }
    }
}

#[derive(Clone)]
struct AppState {
    history: Arc<PriceHistory>,
}

/// Serves `GET /`, returning `{instance-id: [{timestamp: price}, ...]}` for
/// every instance this agent has collected a sample for, until `shutdown`
/// resolves.
pub async fn serve(
    history: Arc<PriceHistory>,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let state = AppState { history };
    let app = Router::new()
        .route("/", get(current_prices))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    info!(%addr, "price reporter listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn current_prices(State(state): State<AppState>) -> Json<HashMap<String, Vec<PriceSample>>> {
    Json(state.history.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::{FakeProvider, FakeProviderState};
    use crate::provider::Provider;
    use crate::types::{
        Bid, GroupDescription, InstanceSnapshot, InstanceState, LaunchTemplate, PolicyTag, ScalingGroup,
        SecuritySettings, SpotPricePoint,
    };
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn history_caps_at_max_samples_per_instance() {
        let history = PriceHistory::new();
        for i in 0..30 {
            let mut sample = PriceSample::new();
            sample.insert(format!("t{i}"), "1.0".to_string());
            history.record("i-1", sample);
        }
        let snap = history.snapshot();
        assert_eq!(snap.get("i-1").unwrap().len(), MAX_SAMPLES_PER_INSTANCE);
    }

    fn instance(id: &str, lifecycle: Lifecycle, instance_type: &str, zone: &str) -> InstanceSnapshot {
        InstanceSnapshot {
            id: id.to_string(),
            instance_type: instance_type.to_string(),
            availability_zone: zone.to_string(),
            launch_time: Utc::now(),
            lifecycle,
            state: InstanceState::Running,
            name: None,
        }
    }

    fn group_with(instances: Vec<InstanceSnapshot>) -> ScalingGroup {
        let mut map = indexmap::IndexMap::new();
        for i in instances {
            map.insert(i.id.clone(), i);
        }
        ScalingGroup {
            name: "g".to_string(),
            description: GroupDescription {
                name: "g".to_string(),
                desired_capacity: map.len() as u32,
                availability_zones: vec!["us-west-2a".to_string()],
                launch_template_name: "g-lt".to_string(),
                instance_ids: map.keys().cloned().collect(),
                tags: Default::default(),
            },
            launch_template: LaunchTemplate {
                name: "g-lt".to_string(),
                instance_type: "m3.large".to_string(),
                user_data: "ZGF0YQ==".to_string(),
                security_settings: SecuritySettings {
                    security_group_ids: vec![],
                    iam_instance_profile: None,
                },
                spot_price: None,
            },
            bid: Bid::OnDemand,
            instances: map,
            policy_tag: PolicyTag::NoSpot,
            not_terminate: false,
        }
    }

    #[tokio::test]
    async fn collect_once_records_on_demand_and_spot_prices() {
        let mut state = FakeProviderState::default();
        state.on_demand_catalog = vec![crate::provider::OnDemandCatalogRow {
            term: "OnDemand".to_string(),
            tenancy: "Shared".to_string(),
            pre_installed_software: "NA".to_string(),
            operating_system: "Linux".to_string(),
            location: "us-west-2".to_string(),
            rate_code: "x.y.6YS6EN2CT7".to_string(),
            price_per_unit: "0.20".to_string(),
            instance_type: "m3.large".to_string(),
        }];
        state.spot_history = vec![SpotPricePoint {
            instance_type: "m3.large".to_string(),
            availability_zone: "us-west-2a".to_string(),
            price: Decimal::from_str("0.10").unwrap(),
            timestamp: Utc::now(),
        }];
        let provider: Arc<dyn Provider> = Arc::new(FakeProvider::new(state));
        let advisor = BidAdvisor::new(
            provider,
            "us-west-2".to_string(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        advisor.start().await;
        // Give the refresh tasks a tick to populate the tables.
        tokio::time::sleep(Duration::from_millis(50)).await;
        advisor.stop().await;

        let group_store = GroupStore::new();
        group_store.replace_all(vec![group_with(vec![
            instance("i-od", Lifecycle::OnDemand, "m3.large", "us-west-2a"),
            instance("i-spot", Lifecycle::Spot, "m3.large", "us-west-2a"),
        ])]);

        let history = PriceHistory::new();
        collect_once(&group_store, &advisor, &history);

        let snap = history.snapshot();
        let od_sample = snap.get("i-od").unwrap().first().unwrap();
        assert_eq!(od_sample.values().next().unwrap(), "0.20");

        let spot_sample = snap.get("i-spot").unwrap().first().unwrap();
        assert_eq!(spot_sample.values().next().unwrap(), "0.10");
    }
}
