//! Group metadata store. Owned exclusively by the
//! reconciliation loop except for `remove_instance`, which the
//! replacement scheduler also calls; a `parking_lot::RwLock` protects the
//! per-group map.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{GroupDescription, InstanceSnapshot, PolicyTag, ScalingGroup};

const POLICY_TAG_KEY: &str = "minion-manager";
const NOT_TERMINATE_TAG_KEY: &str = "minion-manager/not-terminate";

pub struct GroupStore {
    groups: RwLock<HashMap<String, ScalingGroup>>,
}

impl GroupStore {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// A point-in-time copy of every managed group.
    pub fn snapshot(&self) -> Vec<ScalingGroup> {
        self.groups.read().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<ScalingGroup> {
        self.groups.read().get(name).cloned()
    }

    /// Discards and rebuilds the entire record set — called at the start
    /// of each discovery pass.
    pub fn replace_all(&self, groups: Vec<ScalingGroup>) {
        let mut map = self.groups.write();
        map.clear();
        for group in groups {
            map.insert(group.name.clone(), group);
        }
    }

    /// Adds instances to a group's map, skipping ids already present.
    pub fn add_instances(&self, group_name: &str, instances: Vec<InstanceSnapshot>) {
        let mut map = self.groups.write();
        if let Some(group) = map.get_mut(group_name) {
            for instance in instances {
                group.instances.entry(instance.id.clone()).or_insert(instance);
            }
        }
    }

    /// Retains only the instances whose id is in `keep`, used by
    /// `populateInstances` to drop non-running instances from the map.
    pub fn retain_instances(&self, group_name: &str, keep: &[String]) {
        let mut map = self.groups.write();
        if let Some(group) = map.get_mut(group_name) {
            group.instances.retain(|id, _| keep.contains(id));
        }
    }

    /// Called by the replacement scheduler on successful termination.
    pub fn remove_instance(&self, group_name: &str, instance_id: &str) {
        let mut map = self.groups.write();
        if let Some(group) = map.get_mut(group_name) {
            group.instances.remove(instance_id);
        }
    }

    pub fn set_bid(&self, group_name: &str, bid: crate::types::Bid) {
        let mut map = self.groups.write();
        if let Some(group) = map.get_mut(group_name) {
            group.bid = bid;
        }
    }

    pub fn set_launch_template(&self, group_name: &str, template: crate::types::LaunchTemplate) {
        let mut map = self.groups.write();
        if let Some(group) = map.get_mut(group_name) {
            group.launch_template = template;
        }
    }
}

impl Default for GroupStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Scans a group description's tags for the policy tag, normalizing
/// unknown/absent values to `no-spot`.
pub fn policy_tag(description: &GroupDescription) -> PolicyTag {
    PolicyTag::from_tag_value(description.tags.get(POLICY_TAG_KEY).map(String::as_str))
}

/// `minion-manager/not-terminate == "true"` forbids termination in this
/// group.
pub fn not_terminate(description: &GroupDescription) -> bool {
    description
        .tags
        .get(NOT_TERMINATE_TAG_KEY)
        .map(|v| v == "true")
        .unwrap_or(false)
}
