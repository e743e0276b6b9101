//! Bid advisor: two independently-refreshed price caches
//! and the bid-recommendation algorithm.
//!
//! The price table lives behind an `arc_swap::ArcSwap` so that
//! `recommend()`/`current_price()` read a consistent snapshot without
//! ever blocking on an in-flight refresh.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::provider::{OnDemandCatalogRow, Provider};
use crate::types::{Bid, PriceTable};

/// Spot is only recommended when it beats on-demand by this headroom —
/// the market has to be meaningfully cheaper, not just cheaper, before
/// the agent proposes evicting a group onto it.
const SPOT_HEADROOM_MULTIPLIER: &str = "1.2";

const ON_DEMAND_RATE_CODE_SUFFIX: &str = ".6YS6EN2CT7";
const ON_DEMAND_TERM: &str = "OnDemand";
const ON_DEMAND_TENANCY: &str = "Shared";
const ON_DEMAND_SOFTWARE: &str = "NA";
const ON_DEMAND_OS: &str = "Linux";

/// Snapshot of current prices, shaped for event emission`).
#[derive(Debug, Clone, Default)]
pub struct CurrentPrice {
    pub spot: HashMap<String, HashMap<String, Decimal>>,
    pub on_demand: HashMap<String, Decimal>,
}

pub struct BidAdvisor {
    provider: Arc<dyn Provider>,
    region: String,
    on_demand_interval: Duration,
    spot_interval: Duration,
    table: ArcSwap<PriceTable>,
    stopping: AtomicBool,
    shutdown: Notify,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl BidAdvisor {
    pub fn new(
        provider: Arc<dyn Provider>,
        region: String,
        on_demand_interval: Duration,
        spot_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            region,
            on_demand_interval,
            spot_interval,
            table: ArcSwap::from_pointee(PriceTable::default()),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
            handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawns both refresh tasks. Safe to call once per advisor.
    pub async fn start(self: &Arc<Self>) {
        self.stopping.store(false, Ordering::SeqCst);
        let on_demand_task = {
            let advisor = Arc::clone(self);
            tokio::spawn(async move { advisor.on_demand_refresh_loop().await })
        };
        let spot_task = {
            let advisor = Arc::clone(self);
            tokio::spawn(async move { advisor.spot_refresh_loop().await })
        };
        let mut handles = self.handles.lock().await;
        handles.push(on_demand_task);
        handles.push(spot_task);
    }

    /// Signals both refresh tasks and awaits their termination. After
    /// `stop()` returns, no refresh task remains live.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    async fn on_demand_refresh_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.refresh_on_demand().await {
                error!(error = %e, "on-demand price refresh failed");
            }
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.on_demand_interval) => {}
                _ = self.shutdown.notified() => return,
            }
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn spot_refresh_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.refresh_spot().await {
                error!(error = %e, "spot price refresh failed");
            }
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.spot_interval) => {}
                _ = self.shutdown.notified() => return,
            }
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn refresh_spot(&self) -> anyhow::Result<()> {
        let points = crate::errors::with_retries("get_spot_price_history", || async {
            self.provider.get_spot_price_history(&self.region).await
        })
        .await?;
        let current = self.table.load();
        let mut next = (**current).clone();
        next.spot = points;
        self.table.store(Arc::new(next));
        Ok(())
    }

    async fn refresh_on_demand(&self) -> anyhow::Result<()> {
        let rows = crate::errors::with_retries("get_on_demand_price_catalog", || async {
            self.provider.get_on_demand_price_catalog(&self.region).await
        })
        .await?;
        let current = self.table.load();
        let mut on_demand = current.on_demand.clone();
        for row in &rows {
            apply_on_demand_row(&mut on_demand, row, &self.region);
        }
        let mut next = (**current).clone();
        next.on_demand = on_demand;
        self.table.store(Arc::new(next));
        Ok(())
    }

    /// The five-step bid recommendation.
    pub fn recommend(&self, zones: &[String], instance_type: &str) -> Bid {
        let table = self.table.load();
        if table.on_demand.is_empty() || table.spot.is_empty() {
            return Bid::OnDemand;
        }
        let on_demand_price = match table.on_demand.get(instance_type) {
            Some(p) => *p,
            None => return Bid::OnDemand,
        };

        let mut max_spot: Option<Decimal> = None;
        for point in &table.spot {
            if point.instance_type != instance_type {
                continue;
            }
            if !zones.iter().any(|z| z == &point.availability_zone) {
                continue;
            }
            if max_spot.map_or(true, |m| point.price > m) {
                max_spot = Some(point.price);
            }
        }
        let max_spot = match max_spot {
            Some(p) => p,
            None => return Bid::OnDemand,
        };

        let headroom = Decimal::from_str(SPOT_HEADROOM_MULTIPLIER).expect("valid constant");
        if max_spot * headroom < on_demand_price {
            Bid::Spot {
                price: on_demand_price,
            }
        } else {
            Bid::OnDemand
        }
    }

    pub fn current_price(&self) -> CurrentPrice {
        let table = self.table.load();
        let mut spot: HashMap<String, HashMap<String, Decimal>> = HashMap::new();
        for point in &table.spot {
            spot.entry(point.availability_zone.clone())
                .or_default()
                .entry(point.instance_type.clone())
                .or_insert(point.price);
        }
        CurrentPrice {
            spot,
            on_demand: table.on_demand.clone(),
        }
    }
}

/// Applies a single on-demand catalog row to `on_demand` in place,
/// applying the term/tenancy/OS filter and rejecting zero-price rows.
fn apply_on_demand_row(on_demand: &mut HashMap<String, Decimal>, row: &OnDemandCatalogRow, region: &str) {
    if row.term != ON_DEMAND_TERM
        || row.tenancy != ON_DEMAND_TENANCY
        || row.pre_installed_software != ON_DEMAND_SOFTWARE
        || row.operating_system != ON_DEMAND_OS
        || row.location != region
        || !row.rate_code.ends_with(ON_DEMAND_RATE_CODE_SUFFIX)
    {
        return;
    }
    if row.price_per_unit == "0.00" {
        return;
    }
    let price = match Decimal::from_str(&row.price_per_unit) {
        Ok(p) => p,
        Err(_) => {
            warn!(price = %row.price_per_unit, "unparseable on-demand price, skipping row");
            return;
        }
    };
    on_demand.insert(row.instance_type.clone(), price);
}
