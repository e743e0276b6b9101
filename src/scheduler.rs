//! Instance-replacement scheduler.
//!
//! Each scheduling call builds a fresh per-group `Semaphore`; termination
//! tasks are bounded `tokio::spawn`ed futures admitted through it rather
//! than one OS thread per pending termination.
//! Pending terminations live in a shared, mutex-protected map so that at
//! most one termination is ever in flight per instance, even across
//! concurrent scheduling calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::bid_advisor::BidAdvisor;
use crate::provider::{DrainOutcome, Provider};
use crate::store::GroupStore;
use crate::types::{Bid, InstanceSnapshot, InstanceState, Lifecycle, PendingTermination, PolicyTag, ScalingGroup};

const SECONDS_BEFORE_CHECK: u64 = 10;
const POST_TERMINATION_SLEEP: Duration = Duration::from_secs(180);
const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub type PendingTerminations = Arc<Mutex<HashMap<String, PendingTermination>>>;

pub struct ReplacementScheduler {
    provider: Arc<dyn Provider>,
    bid_advisor: Arc<BidAdvisor>,
    group_store: Arc<GroupStore>,
    pending: PendingTerminations,
    events_only: bool,
    terminate_percentage: u32,
}

/// `set_semaphore`: slots = round(desired * pct/100), clamped to
/// [1, desired].
fn semaphore_slots(desired_capacity: u32, terminate_percentage: u32) -> usize {
    let pct = terminate_percentage.clamp(1, 100) as f64;
    let raw = (desired_capacity as f64 * pct / 100.0).round() as i64;
    let upper = desired_capacity.max(1) as i64;
    raw.clamp(1, upper) as usize
}

fn is_spot(instance: &InstanceSnapshot) -> bool {
    instance.lifecycle == Lifecycle::Spot
}

/// Step-2 guard shared by scheduling and the re-check inside `terminate`:
/// an instance whose current lifecycle already matches policy is left
/// alone.
fn lifecycle_matches_policy(instance: &InstanceSnapshot, policy: PolicyTag) -> bool {
    (is_spot(instance) && policy == PolicyTag::UseSpot) || (!is_spot(instance) && policy == PolicyTag::NoSpot)
}

impl ReplacementScheduler {
    pub fn new(
        provider: Arc<dyn Provider>,
        bid_advisor: Arc<BidAdvisor>,
        group_store: Arc<GroupStore>,
        events_only: bool,
        terminate_percentage: u32,
    ) -> Self {
        Self {
            provider,
            bid_advisor,
            group_store,
            pending: Arc::new(Mutex::new(HashMap::new())),
            events_only,
            terminate_percentage,
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.try_lock().map(|p| p.len()).unwrap_or(usize::MAX)
    }

    /// `scheduleReplacement(group)` — admits eligible instances and
    /// spawns a termination timer for each.
    pub async fn schedule_replacement(self: &Arc<Self>, group: &ScalingGroup) {
        if group.instances.is_empty() {
            return;
        }
        if group.not_terminate || self.events_only {
            return;
        }

        let slots = semaphore_slots(group.description.desired_capacity, self.terminate_percentage);
        let semaphore = Arc::new(Semaphore::new(slots));
        info!(group = %group.name, slots, "built termination semaphore");

        for instance in group.instances.values() {
            if lifecycle_matches_policy(instance, group.policy_tag) {
                continue;
            }
            if instance.state != InstanceState::Running {
                continue;
            }

            let mut pending = self.pending.lock().await;
            if pending.contains_key(&instance.id) {
                continue;
            }
            pending.insert(
                instance.id.clone(),
                PendingTermination {
                    instance_id: instance.id.clone(),
                    group_name: group.name.clone(),
                },
            );
            drop(pending);

            info!(
                instance = %instance.id,
                group = %group.name,
                "scheduling termination in {SECONDS_BEFORE_CHECK}s"
            );

            let scheduler = Arc::clone(self);
            let instance = instance.clone();
            let group_name = group.name.clone();
            let zones = group.description.availability_zones.clone();
            let policy = group.policy_tag;
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(SECONDS_BEFORE_CHECK)).await;
                scheduler
                    .terminate(instance, group_name, zones, policy, semaphore)
                    .await;
            });
        }
    }

    /// `terminate(instance, group, sem)` — the six-step termination
    /// sequence: re-check the guard, acquire the semaphore, drain, then
    /// terminate and wait for convergence.
    async fn terminate(
        self: Arc<Self>,
        instance: InstanceSnapshot,
        group_name: String,
        zones: Vec<String>,
        policy: PolicyTag,
        semaphore: Arc<Semaphore>,
    ) {
        let result = self
            .terminate_inner(&instance, &group_name, &zones, policy, &semaphore)
            .await;
        if let Err(e) = result {
            warn!(instance = %instance.id, group = %group_name, error = %e, "termination attempt failed");
        }
        self.pending.lock().await.remove(&instance.id);
    }

    async fn terminate_inner(
        &self,
        instance: &InstanceSnapshot,
        group_name: &str,
        zones: &[String],
        policy: PolicyTag,
        semaphore: &Semaphore,
    ) -> anyhow::Result<()> {
        // Step 1: re-evaluate the guard against a fresh recommendation.
        if lifecycle_matches_policy(instance, policy) {
            return Ok(());
        }
        if policy == PolicyTag::UseSpot && !is_spot(instance) {
            let fresh = self.bid_advisor.recommend(zones, &instance.instance_type);
            if fresh == Bid::OnDemand {
                info!(
                    instance = %instance.id,
                    group = %group_name,
                    "market no longer supports spot; leaving on-demand instance alone"
                );
                return Ok(());
            }
        }

        // Step 2: acquire the per-group semaphore.
        let _permit = semaphore.acquire().await?;

        // Step 3: best-effort drain before terminating.
        if let Some(node) = self.provider.find_node_by_provider_instance_id(&instance.id).await {
            match self.provider.drain_node(&node).await {
                DrainOutcome::Proceed => {}
                DrainOutcome::Abort => {
                    info!(instance = %instance.id, node, "drain failed but uncordon succeeded; aborting termination");
                    return Ok(());
                }
            }
        }

        // Step 4: terminate and remove from the group's instance map.
        crate::errors::with_retries("terminate_instance_in_group", || async {
            self.provider
                .terminate_instance_in_group(&instance.id, false)
                .await
        })
        .await?;
        self.group_store.remove_instance(group_name, &instance.id);
        info!(instance = %instance.id, group = %group_name, "terminated instance");

        // Step 5: wait for the replacement to become healthy before
        // releasing the semaphore, so a cascade can't drop the group
        // below desired capacity.
        tokio::time::sleep(POST_TERMINATION_SLEEP).await;
        self.wait_for_desired_capacity(group_name).await;

        Ok(())
    }

    async fn wait_for_desired_capacity(&self, group_name: &str) {
        loop {
            match self.provider.describe_group(group_name).await {
                Ok(description) => {
                    if description.instance_ids.len() as u32 >= description.desired_capacity {
                        return;
                    }
                }
                Err(e) => {
                    warn!(group = %group_name, error = %e, "failed to poll group while waiting for convergence");
                    return;
                }
            }
            tokio::time::sleep(CONVERGENCE_POLL_INTERVAL).await;
        }
    }
}
