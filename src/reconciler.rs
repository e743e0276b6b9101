//! Reconciliation loop: the periodic pass that evaluates
//! each group and applies updates.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, info_span, Instrument};

use crate::bid_advisor::BidAdvisor;
use crate::capacity::is_insufficient_capacity;
use crate::errors::with_retries;
use crate::events::spot_price_event_payload;
use crate::provider::Provider;
use crate::scheduler::ReplacementScheduler;
use crate::store::{self, GroupStore};
use crate::types::{Bid, InstanceState, LaunchTemplate, PolicyTag, ScalingGroup};

const CONVERGENCE_ATTEMPTS: u32 = 3;
const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct Reconciler {
    provider: Arc<dyn Provider>,
    bid_advisor: Arc<BidAdvisor>,
    group_store: Arc<GroupStore>,
    scheduler: Arc<ReplacementScheduler>,
    cluster_name: String,
    region: String,
    refresh_interval: Duration,
    events_only: bool,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn Provider>,
        bid_advisor: Arc<BidAdvisor>,
        group_store: Arc<GroupStore>,
        scheduler: Arc<ReplacementScheduler>,
        cluster_name: String,
        region: String,
        refresh_interval: Duration,
        events_only: bool,
    ) -> Self {
        Self {
            provider,
            bid_advisor,
            group_store,
            scheduler,
            cluster_name,
            region,
            refresh_interval,
            events_only,
        }
    }

    /// Discovers groups, populates their launch templates, and rebuilds
    /// the group store from scratch. A failure here is unrecoverable
    /// and must abort the process.
    pub async fn discover(&self) -> anyhow::Result<()> {
        let descriptions = with_retries("describe_managed_groups", || async {
            self.provider.describe_managed_groups(&self.cluster_name).await
        })
        .await?;

        let mut groups = Vec::with_capacity(descriptions.len());
        for description in descriptions {
            let template = with_retries("describe_launch_template", || async {
                self.provider
                    .describe_launch_template(&description.launch_template_name)
                    .await
            })
            .await?;

            let policy_tag = store::policy_tag(&description);
            let not_terminate = store::not_terminate(&description);
            let bid = ScalingGroup::bid_from_launch_template(&template);

            info!(
                group = %description.name,
                policy = ?policy_tag,
                not_terminate,
                "discovered managed group"
            );

            groups.push(ScalingGroup {
                name: description.name.clone(),
                description,
                launch_template: template,
                bid,
                instances: Default::default(),
                policy_tag,
                not_terminate,
            });
        }

        self.group_store.replace_all(groups);
        Ok(())
    }

    /// Runs forever at `refresh_interval`, reconciling every managed
    /// group each pass. Any per-pass error is logged and the loop
    /// continues after the sleep; rediscovery failures
    /// propagate out, which aborts the process.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.discover().await?;
        loop {
            let span = info_span!("reconcile_pass");
            async {
                for group in self.group_store.snapshot() {
                    if let Err(e) = self.reconcile_group(&group).await {
                        error!(group = %group.name, error = %e, "reconciliation pass failed for group");
                    }
                }
            }
            .instrument(span)
            .await;

            tokio::time::sleep(self.refresh_interval).await;
            self.discover().await?;
        }
    }

    async fn reconcile_group(self: &Arc<Self>, group: &ScalingGroup) -> anyhow::Result<()> {
        let span = info_span!("reconcile_group", group = %group.name);
        async move {
            self.populate_instances(group).await?;

            let refreshed = self.group_store.get(&group.name).unwrap_or_else(|| group.clone());
            self.scheduler.schedule_replacement(&refreshed).await;

            if !self.update_needed(&refreshed).await? {
                return Ok(());
            }

            if refreshed.policy_tag == PolicyTag::NoSpot && refreshed.bid.is_spot() {
                info!("policy is no-spot but currently spot; forcing on-demand");
                return self.apply_bid(&refreshed, Bid::OnDemand).await;
            }

            let mut new_bid = self.bid_advisor.recommend(
                &refreshed.description.availability_zones,
                &refreshed.launch_template.instance_type,
            );

            if is_insufficient_capacity(self.provider.as_ref(), &refreshed.name).await? {
                info!("insufficient capacity signalled; forcing on-demand");
                new_bid = Bid::OnDemand;
            }

            if new_bid == refreshed.bid {
                info!("recommended bid unchanged; no update applied");
                return Ok(());
            }

            self.apply_bid(&refreshed, new_bid).await
        }
        .instrument(span)
        .await
    }

    /// `populateInstances(group)`: describe the group, describe its
    /// instances, retain only running ones.
    async fn populate_instances(&self, group: &ScalingGroup) -> anyhow::Result<()> {
        let description = with_retries("describe_group", || async {
            self.provider.describe_group(&group.name).await
        })
        .await?;

        if description.instance_ids.is_empty() {
            self.group_store.retain_instances(&group.name, &[]);
            return Ok(());
        }

        let instances = with_retries("describe_instances", || async {
            self.provider.describe_instances(&description.instance_ids).await
        })
        .await?;

        let running: Vec<_> = instances
            .into_iter()
            .filter(|i| i.state == InstanceState::Running)
            .collect();
        let running_ids: Vec<String> = running.iter().map(|i| i.id.clone()).collect();

        self.group_store.retain_instances(&group.name, &running_ids);
        self.group_store.add_instances(&group.name, running);
        Ok(())
    }

    /// `updateNeeded(group)`: step 3. Emits an event on every call.
    async fn update_needed(&self, group: &ScalingGroup) -> anyhow::Result<bool> {
        let needs_update = match (group.policy_tag, &group.bid) {
            (PolicyTag::NoSpot, Bid::Spot { .. }) => true,
            (PolicyTag::NoSpot, Bid::OnDemand) => false,
            (PolicyTag::UseSpot, Bid::OnDemand) => true,
            (PolicyTag::UseSpot, Bid::Spot { .. }) => !self.check_group_converged(group).await,
        };

        let payload = spot_price_event_payload(&group.bid, group.policy_tag);
        self.provider.emit_event(&group.name, &payload).await;

        Ok(needs_update)
    }

    /// `checkGroupConverged`: desired capacity met after up to 3
    /// attempts, sleeping 60s between.
    async fn check_group_converged(&self, group: &ScalingGroup) -> bool {
        for attempt in 0..CONVERGENCE_ATTEMPTS {
            match self.provider.describe_group(&group.name).await {
                Ok(description) => {
                    if description.desired_capacity <= description.instance_ids.len() as u32 {
                        return true;
                    }
                }
                Err(e) => {
                    error!(group = %group.name, error = %e, "failed to check group convergence");
                    return false;
                }
            }
            if attempt + 1 < CONVERGENCE_ATTEMPTS {
                tokio::time::sleep(CONVERGENCE_POLL_INTERVAL).await;
            }
        }
        false
    }

    /// Launch-template rewrite: toggle-suffix naming, create, repoint,
    /// delete the old template.
    async fn apply_bid(&self, group: &ScalingGroup, new_bid: Bid) -> anyhow::Result<()> {
        if self.events_only {
            info!(group = %group.name, "events-only: skipping launch-template rewrite");
            return Ok(());
        }

        let old_name = group.launch_template.name.clone();
        let new_name = toggle_template_name(&old_name);

        let new_template = LaunchTemplate {
            name: new_name.clone(),
            spot_price: match &new_bid {
                Bid::Spot { price } => Some(*price),
                Bid::OnDemand => None,
            },
            ..group.launch_template.clone()
        };

        with_retries("create_launch_template", || {
            let template = new_template.clone();
            async move { self.provider.create_launch_template(&template).await }
        })
        .await?;

        with_retries("update_group_launch_template", || async {
            self.provider
                .update_group_launch_template(&group.name, &new_name)
                .await
        })
        .await?;

        with_retries("delete_launch_template", || async {
            self.provider.delete_launch_template(&old_name).await
        })
        .await?;

        self.group_store.set_launch_template(&group.name, new_template);
        self.group_store.set_bid(&group.name, new_bid);
        info!(group = %group.name, old_template = %old_name, new_template = %new_name, "rewrote launch template");
        Ok(())
    }
}

/// `T' = T` with the `-0` suffix toggled — guarantees the new name never
/// collides with the name being deleted in the same pass.
fn toggle_template_name(current: &str) -> String {
    match current.strip_suffix("-0") {
        Some(stripped) => stripped.to_string(),
        None => format!("{current}-0"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::{FakeProvider, FakeProviderState};
    use crate::provider::GroupActivity;
    use crate::types::{GroupDescription, InstanceState, Lifecycle, SecuritySettings};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::str::FromStr;

    #[test]
    fn toggle_template_name_round_trips() {
        let toggled = toggle_template_name("my-lt");
        assert_eq!(toggled, "my-lt-0");
        assert_ne!(toggled, "my-lt");
        assert_eq!(toggle_template_name(&toggled), "my-lt");
    }

    fn template(name: &str, spot_price: Option<Decimal>) -> LaunchTemplate {
        LaunchTemplate {
            name: name.to_string(),
            instance_type: "m3.large".to_string(),
            user_data: "ZGF0YQ==".to_string(),
            security_settings: SecuritySettings {
                security_group_ids: vec![],
                iam_instance_profile: None,
            },
            spot_price,
        }
    }

    fn group_description(name: &str, tags: HashMap<String, String>) -> GroupDescription {
        GroupDescription {
            name: name.to_string(),
            desired_capacity: 1,
            availability_zones: vec!["us-west-2a".to_string()],
            launch_template_name: format!("{name}-lt"),
            instance_ids: vec!["i-1".to_string()],
            tags,
        }
    }

    fn harness(
        policy: &str,
        template_spot_price: Option<Decimal>,
    ) -> (Arc<Reconciler>, Arc<FakeProvider>, Arc<BidAdvisor>) {
        let mut tags = HashMap::new();
        tags.insert("minion-manager".to_string(), policy.to_string());

        let mut state = FakeProviderState::default();
        state.groups.insert("g".to_string(), group_description("g", tags));
        state
            .launch_templates
            .insert("g-lt".to_string(), template("g-lt", template_spot_price));
        state.instances.insert(
            "i-1".to_string(),
            crate::types::InstanceSnapshot {
                id: "i-1".to_string(),
                instance_type: "m3.large".to_string(),
                availability_zone: "us-west-2a".to_string(),
                launch_time: Utc::now(),
                lifecycle: if template_spot_price.is_some() {
                    Lifecycle::Spot
                } else {
                    Lifecycle::OnDemand
                },
                state: InstanceState::Running,
                name: None,
            },
        );

        let fake = Arc::new(FakeProvider::new(state));
        let provider: Arc<dyn Provider> = fake.clone();
        let bid_advisor = BidAdvisor::new(
            provider.clone(),
            "us-west-2".to_string(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        let group_store = Arc::new(GroupStore::new());
        let scheduler = Arc::new(ReplacementScheduler::new(
            provider.clone(),
            bid_advisor.clone(),
            group_store.clone(),
            true, // events-only: isolate reconciliation logic from the scheduler in these tests
            1,
        ));
        let reconciler = Arc::new(Reconciler::new(
            provider,
            bid_advisor.clone(),
            group_store,
            scheduler,
            "cluster".to_string(),
            "us-west-2".to_string(),
            Duration::from_secs(300),
            false, // scheduler above is isolated via its own events_only=true
        ));
        (reconciler, fake, bid_advisor)
    }

    /// Scenario 1: upgrade on-demand -> spot.
    #[tokio::test]
    async fn reconcile_upgrades_to_spot_when_cheaper() {
        let (reconciler, fake, bid_advisor) = harness("use-spot", None);
        fake.state.lock().on_demand_catalog.push(crate::provider::OnDemandCatalogRow {
            term: "OnDemand".to_string(),
            tenancy: "Shared".to_string(),
            pre_installed_software: "NA".to_string(),
            operating_system: "Linux".to_string(),
            location: "us-west-2".to_string(),
            rate_code: "X.6YS6EN2CT7".to_string(),
            price_per_unit: "0.10".to_string(),
            instance_type: "m3.large".to_string(),
        });
        fake.state.lock().spot_history.push(crate::types::SpotPricePoint {
            instance_type: "m3.large".to_string(),
            availability_zone: "us-west-2a".to_string(),
            price: Decimal::from_str("0.05").unwrap(),
            timestamp: Utc::now(),
        });
        bid_advisor.refresh_on_demand().await.unwrap();
        bid_advisor.refresh_spot().await.unwrap();

        reconciler.discover().await.unwrap();
        let group = reconciler.group_store.get("g").unwrap();
        reconciler.reconcile_group(&group).await.unwrap();

        let state = fake.state.lock();
        assert_eq!(state.created_templates, vec!["g-lt-0".to_string()]);
        assert_eq!(state.deleted_templates, vec!["g-lt".to_string()]);
        assert_eq!(
            state.launch_templates["g-lt-0"].spot_price,
            Some(Decimal::from_str("0.10").unwrap())
        );
    }

    /// Scenario 2: insufficient capacity keeps the group on-demand even
    /// though the bid advisor would otherwise recommend spot.
    #[tokio::test]
    async fn reconcile_stays_on_demand_on_insufficient_capacity() {
        let (reconciler, fake, bid_advisor) = harness("use-spot", None);
        fake.state.lock().on_demand_catalog.push(crate::provider::OnDemandCatalogRow {
            term: "OnDemand".to_string(),
            tenancy: "Shared".to_string(),
            pre_installed_software: "NA".to_string(),
            operating_system: "Linux".to_string(),
            location: "us-west-2".to_string(),
            rate_code: "X.6YS6EN2CT7".to_string(),
            price_per_unit: "0.10".to_string(),
            instance_type: "m3.large".to_string(),
        });
        fake.state.lock().spot_history.push(crate::types::SpotPricePoint {
            instance_type: "m3.large".to_string(),
            availability_zone: "us-west-2a".to_string(),
            price: Decimal::from_str("0.05").unwrap(),
            timestamp: Utc::now(),
        });
        fake.state.lock().activities.insert(
            "g".to_string(),
            vec![GroupActivity {
                progress: 20,
                status_message: Some(
                    "We currently do not have sufficient capacity in the Availability Zone you requested"
                        .to_string(),
                ),
            }],
        );
        bid_advisor.refresh_on_demand().await.unwrap();
        bid_advisor.refresh_spot().await.unwrap();

        reconciler.discover().await.unwrap();
        let group = reconciler.group_store.get("g").unwrap();
        reconciler.reconcile_group(&group).await.unwrap();

        let state = fake.state.lock();
        assert!(state.created_templates.is_empty());
        assert!(state.launch_templates.contains_key("g-lt"));
        assert_eq!(state.launch_templates["g-lt"].spot_price, None);
    }

    /// Scenario 3: policy flips to no-spot while a spot bid is active.
    #[tokio::test]
    async fn reconcile_forces_on_demand_when_policy_is_no_spot() {
        let (reconciler, fake, _bid_advisor) = harness("no-spot", Some(Decimal::from_str("0.10").unwrap()));

        reconciler.discover().await.unwrap();
        let group = reconciler.group_store.get("g").unwrap();
        reconciler.reconcile_group(&group).await.unwrap();

        let state = fake.state.lock();
        assert_eq!(state.launch_templates["g-lt-0"].spot_price, None);

        // The event emitted during `update_needed` must report the policy
        // (no-spot), not the still-current spot bid being replaced.
        let (_, payload) = state.emitted_events.last().unwrap();
        assert!(payload.contains(r#""useSpot":false"#), "payload was: {payload}");
    }
}
