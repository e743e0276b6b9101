//! In-memory [`Provider`] used by every test in this crate. No network
//! I/O, no mocking framework — just a plain struct holding the state the
//! test wants the "cloud" to report, guarded by a `parking_lot::Mutex`
//! for short-lived critical sections.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DrainOutcome, GroupActivity, OnDemandCatalogRow, Provider, SpotRequestStatus};
use crate::errors::ProviderError;
use crate::types::{GroupDescription, InstanceSnapshot, LaunchTemplate, SpotPricePoint};

#[derive(Default)]
pub struct FakeProviderState {
    pub groups: HashMap<String, GroupDescription>,
    pub launch_templates: HashMap<String, LaunchTemplate>,
    pub activities: HashMap<String, Vec<GroupActivity>>,
    pub spot_requests: HashMap<String, SpotRequestStatus>,
    pub instances: HashMap<String, InstanceSnapshot>,
    pub spot_history: Vec<SpotPricePoint>,
    pub on_demand_catalog: Vec<OnDemandCatalogRow>,
    pub nodes_by_instance: HashMap<String, String>,
    pub drained_nodes: Vec<String>,
    pub uncordoned_nodes: Vec<String>,
    pub fail_drain: bool,
    pub fail_uncordon: bool,
    pub terminated_instances: Vec<String>,
    pub created_templates: Vec<String>,
    pub deleted_templates: Vec<String>,
    pub updated_group_templates: Vec<(String, String)>,
    pub emitted_events: Vec<(String, String)>,
}

pub struct FakeProvider {
    pub state: Mutex<FakeProviderState>,
}

impl FakeProvider {
    pub fn new(state: FakeProviderState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn describe_managed_groups(
        &self,
        _cluster_tag: &str,
    ) -> Result<Vec<GroupDescription>, ProviderError> {
        Ok(self.state.lock().groups.values().cloned().collect())
    }

    async fn describe_launch_template(&self, name: &str) -> Result<LaunchTemplate, ProviderError> {
        self.state
            .lock()
            .launch_templates
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))
    }

    async fn describe_group_activities(
        &self,
        group_name: &str,
    ) -> Result<Vec<GroupActivity>, ProviderError> {
        Ok(self
            .state
            .lock()
            .activities
            .get(group_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn describe_spot_requests(
        &self,
        ids: &[String],
    ) -> Result<Vec<SpotRequestStatus>, ProviderError> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.spot_requests.get(id).cloned())
            .collect())
    }

    async fn describe_instances(
        &self,
        ids: &[String],
    ) -> Result<Vec<InstanceSnapshot>, ProviderError> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.instances.get(id).cloned())
            .collect())
    }

    async fn create_launch_template(&self, spec: &LaunchTemplate) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        if state.launch_templates.contains_key(&spec.name) {
            return Ok(()); // idempotent: already-exists is success
        }
        state.created_templates.push(spec.name.clone());
        state.launch_templates.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn update_group_launch_template(
        &self,
        group_name: &str,
        template_name: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state
            .updated_group_templates
            .push((group_name.to_string(), template_name.to_string()));
        if let Some(group) = state.groups.get_mut(group_name) {
            group.launch_template_name = template_name.to_string();
        }
        Ok(())
    }

    async fn delete_launch_template(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.deleted_templates.push(name.to_string());
        state.launch_templates.remove(name);
        Ok(())
    }

    async fn terminate_instance_in_group(
        &self,
        instance_id: &str,
        _decrement_desired: bool,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.terminated_instances.push(instance_id.to_string());
        state.instances.remove(instance_id);
        Ok(())
    }

    async fn get_spot_price_history(
        &self,
        _region: &str,
    ) -> Result<Vec<SpotPricePoint>, ProviderError> {
        Ok(self.state.lock().spot_history.clone())
    }

    async fn get_on_demand_price_catalog(
        &self,
        _region: &str,
    ) -> Result<Vec<OnDemandCatalogRow>, ProviderError> {
        Ok(self.state.lock().on_demand_catalog.clone())
    }

    async fn drain_node(&self, node_name: &str) -> DrainOutcome {
        let mut state = self.state.lock();
        if !state.fail_drain {
            state.drained_nodes.push(node_name.to_string());
            return DrainOutcome::Proceed;
        }
        if !state.fail_uncordon {
            state.uncordoned_nodes.push(node_name.to_string());
            DrainOutcome::Abort
        } else {
            DrainOutcome::Proceed
        }
    }

    async fn emit_event(&self, group_name: &str, payload: &str) {
        self.state
            .lock()
            .emitted_events
            .push((group_name.to_string(), payload.to_string()));
    }

    async fn find_node_by_provider_instance_id(&self, instance_id: &str) -> Option<String> {
        self.state.lock().nodes_by_instance.get(instance_id).cloned()
    }

    async fn describe_group(&self, group_name: &str) -> Result<GroupDescription, ProviderError> {
        self.state
            .lock()
            .groups
            .get(group_name)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(group_name.to_string()))
    }
}
