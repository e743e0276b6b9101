//! Core data model: bids, price tables, scaling groups, instances.
//!
//! Mirrors Kept free of any provider-wire-format detail —
//! `GroupDescription`/`LaunchTemplate` are the typed shapes the provider
//! adapter normalizes raw API responses into.

use std::collections::HashMap;

use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The agent's desired lifecycle for a group, together with the price cap.
///
/// Two bids are equal iff their types match and, for spot, their prices
/// match exactly as strings. `Decimal` derives `PartialEq` on the
/// canonical numeric value, which is exactly the "as strings" comparison
/// once prices are always parsed and re-serialized through the same
/// `Decimal` path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bid {
    OnDemand,
    Spot { price: Decimal },
}

impl Bid {
    pub fn on_demand() -> Self {
        Bid::OnDemand
    }

    pub fn is_spot(&self) -> bool {
        matches!(self, Bid::Spot { .. })
    }

    /// Price as the empty-string-when-on-demand external shape used by
    /// event payloads and the launch-template rewrite.
    pub fn price_string(&self) -> String {
        match self {
            Bid::OnDemand => String::new(),
            Bid::Spot { price } => price.to_string(),
        }
    }
}

/// `Bid` already derives `PartialEq` with these exact semantics; this free
/// function exists so call sites read as the named operation rather than
/// a bare `==`.
pub fn bids_equal(a: &Bid, b: &Bid) -> bool {
    a == b
}

/// A single spot-price observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotPricePoint {
    pub instance_type: String,
    pub availability_zone: String,
    pub price: Decimal,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Two independently-refreshed price sub-tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceTable {
    pub on_demand: HashMap<String, Decimal>,
    /// Most-recent-first, replaced atomically on each spot refresh.
    pub spot: Vec<SpotPricePoint>,
}

/// A group's policy tag: operator intent for spot vs on-demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyTag {
    UseSpot,
    NoSpot,
}

impl PolicyTag {
    /// `minion-manager` tag values other than `use-spot` normalize to
    /// `no-spot`, as do absent tags.
    pub fn from_tag_value(value: Option<&str>) -> Self {
        match value {
            Some("use-spot") => PolicyTag::UseSpot,
            _ => PolicyTag::NoSpot,
        }
    }
}

/// Opaque provider payload describing a group: desired capacity,
/// availability zones, current launch-template name, raw tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDescription {
    pub name: String,
    pub desired_capacity: u32,
    pub availability_zones: Vec<String>,
    pub launch_template_name: String,
    pub instance_ids: Vec<String>,
    pub tags: HashMap<String, String>,
}

/// Opaque provider payload describing a launch template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchTemplate {
    pub name: String,
    pub instance_type: String,
    /// Base64-encoded as received from the provider; never decoded and
    /// re-encoded by anything other than the create path, and never
    /// modified.
    pub user_data: String,
    pub security_settings: SecuritySettings,
    pub spot_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub security_group_ids: Vec<String>,
    pub iam_instance_profile: Option<String>,
}

/// Lifecycle of a single instance, as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Spot,
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Running,
    Other,
}

/// A single instance's observed state within a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub launch_time: chrono::DateTime<chrono::Utc>,
    pub lifecycle: Lifecycle,
    pub state: InstanceState,
    pub name: Option<String>,
}

/// Mutable per-group record. Rebuilt entirely
/// on each discovery pass; mutated afterward only by the reconciliation
/// loop and, via `GroupStore::remove_instance`, by the replacement
/// scheduler.
#[derive(Debug, Clone)]
pub struct ScalingGroup {
    pub name: String,
    pub description: GroupDescription,
    pub launch_template: LaunchTemplate,
    pub bid: Bid,
    /// Insertion-ordered so the replacement scheduler admits terminations
    /// in the order instances were discovered.
    pub instances: IndexMap<String, InstanceSnapshot>,
    pub policy_tag: PolicyTag,
    pub not_terminate: bool,
}

impl ScalingGroup {
    /// Derives the current bid from the launch template's spot price:
    /// presence of `SpotPrice` implies spot.
    pub fn bid_from_launch_template(template: &LaunchTemplate) -> Bid {
        match template.spot_price {
            Some(price) => Bid::Spot { price },
            None => Bid::OnDemand,
        }
    }
}

/// A single outstanding termination timer.
#[derive(Debug, Clone)]
pub struct PendingTermination {
    pub instance_id: String,
    pub group_name: String,
}
