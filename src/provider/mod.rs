//! The provider adapter: a typed facade over the cloud and
//! orchestrator APIs. Production code depends only on the `Provider`
//! trait; the concrete cloud-SDK client is an external collaborator
//! and is not implemented here. `fake` provides an
//! in-memory implementation used by every test in this crate.

pub mod fake;

use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::types::{GroupDescription, InstanceSnapshot, LaunchTemplate, SpotPricePoint};

/// A single, not-necessarily-complete scaling activity record.
#[derive(Debug, Clone)]
pub struct GroupActivity {
    pub progress: u32,
    pub status_message: Option<String>,
}

/// A spot-instance request's current status code (e.g.
/// `capacity-oversubscribed`).
#[derive(Debug, Clone)]
pub struct SpotRequestStatus {
    pub request_id: String,
    pub status_code: Option<String>,
}

/// One row of the published on-demand price catalog, exactly the fields
/// the filter in needs.
#[derive(Debug, Clone)]
pub struct OnDemandCatalogRow {
    pub term: String,
    pub tenancy: String,
    pub pre_installed_software: String,
    pub operating_system: String,
    pub location: String,
    pub rate_code: String,
    pub price_per_unit: String,
    pub instance_type: String,
}

/// Outcome of attempting to drain a node before terminating its instance
///.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Drain succeeded (or no node was found in the cluster): proceed.
    Proceed,
    /// Drain failed but uncordon succeeded: abort this termination.
    Abort,
}

/// Typed facade over the cloud provider and the orchestrator.
///
/// Every cloud-facing method is expected to be wrapped by its caller in
/// [`crate::errors::with_retries`]; this trait's methods perform a single
/// attempt and return [`ProviderError::Transient`] for anything
/// retry-worthy.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn describe_managed_groups(
        &self,
        cluster_tag: &str,
    ) -> Result<Vec<GroupDescription>, ProviderError>;

    async fn describe_launch_template(&self, name: &str) -> Result<LaunchTemplate, ProviderError>;

    async fn describe_group_activities(
        &self,
        group_name: &str,
    ) -> Result<Vec<GroupActivity>, ProviderError>;

    async fn describe_spot_requests(
        &self,
        ids: &[String],
    ) -> Result<Vec<SpotRequestStatus>, ProviderError>;

    async fn describe_instances(
        &self,
        ids: &[String],
    ) -> Result<Vec<InstanceSnapshot>, ProviderError>;

    /// Idempotent: an "already exists" conflict is surfaced as
    /// `Ok(())`, not an error.
    async fn create_launch_template(&self, spec: &LaunchTemplate) -> Result<(), ProviderError>;

    async fn update_group_launch_template(
        &self,
        group_name: &str,
        template_name: &str,
    ) -> Result<(), ProviderError>;

    async fn delete_launch_template(&self, name: &str) -> Result<(), ProviderError>;

    async fn terminate_instance_in_group(
        &self,
        instance_id: &str,
        decrement_desired: bool,
    ) -> Result<(), ProviderError>;

    /// Spot price history for the last hour in `region`.
    async fn get_spot_price_history(
        &self,
        region: &str,
    ) -> Result<Vec<SpotPricePoint>, ProviderError>;

    async fn get_on_demand_price_catalog(
        &self,
        region: &str,
    ) -> Result<Vec<OnDemandCatalogRow>, ProviderError>;

    /// Drains `node_name`, falling back to uncordon on failure. Not
    /// retried — a drain failure has its own fallback, not a
    /// transient-error retry.
    async fn drain_node(&self, node_name: &str) -> DrainOutcome;

    async fn emit_event(&self, group_name: &str, payload: &str);

    async fn find_node_by_provider_instance_id(&self, instance_id: &str) -> Option<String>;

    /// Re-describes the group to refresh desired capacity / instance
    /// count, used by the convergence poll in §4.E step 5 and §4.F's
    /// `checkGroupConverged`.
    async fn describe_group(&self, group_name: &str) -> Result<GroupDescription, ProviderError>;
}
