//! Emitted-event payload construction.

use crate::types::{Bid, PolicyTag};

pub const EVENT_KIND: &str = "SpotPriceInfo";
pub const EVENT_REASON: &str = "SpotRecommendationGiven";
pub const EVENT_TYPE: &str = "Normal";
pub const EVENT_SOURCE_COMPONENT: &str = "minion-manager";

/// Builds the fixed-shape JSON payload:
/// `{"apiVersion":"v1alpha1","spotPrice":"<price-or-empty>","useSpot":<bool>}`.
///
/// `useSpot` reflects the group's *policy*, not its current bid — the two
/// diverge exactly when an update is needed, and the event must report the
/// intended state, not the state being replaced.
pub fn spot_price_event_payload(bid: &Bid, policy_tag: PolicyTag) -> String {
    format!(
        "{{\"apiVersion\":\"v1alpha1\",\"spotPrice\":\"{}\",\"useSpot\":{}}}",
        bid.price_string(),
        policy_tag == PolicyTag::UseSpot
    )
}
