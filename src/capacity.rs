//! Insufficient-capacity detector.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::provider::Provider;

const INSUFFICIENT_CAPACITY_SUBSTRINGS: [&str; 2] = [
    "We currently do not have sufficient",
    "capacity in the Availability Zone you requested",
];

const OVERSUBSCRIBED: &str = "capacity-oversubscribed";
const CAPACITY_NOT_AVAILABLE: &str = "capacity-not-available";

static SPOT_REQUEST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Placed Spot instance request: (sir-[A-Za-z0-9]+)\. Waiting for instance\(s\)")
        .expect("valid regex")
});

/// Checks the group's recent scaling activities for an insufficient-
/// capacity signal.
pub async fn is_insufficient_capacity(provider: &dyn Provider, group_name: &str) -> anyhow::Result<bool> {
    let activities = crate::errors::with_retries("describe_group_activities", || async {
        provider.describe_group_activities(group_name).await
    })
    .await?;

    for activity in &activities {
        if activity.progress == 100 {
            continue;
        }
        let Some(message) = &activity.status_message else {
            continue;
        };

        if INSUFFICIENT_CAPACITY_SUBSTRINGS
            .iter()
            .all(|needle| message.contains(needle))
        {
            return Ok(true);
        }

        if let Some(captures) = SPOT_REQUEST_PATTERN.captures(message) {
            let request_id = captures[1].to_string();
            if spot_request_insufficient_capacity(provider, &request_id).await? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

async fn spot_request_insufficient_capacity(
    provider: &dyn Provider,
    request_id: &str,
) -> anyhow::Result<bool> {
    let ids = vec![request_id.to_string()];
    let statuses = crate::errors::with_retries("describe_spot_requests", || async {
        provider.describe_spot_requests(&ids).await
    })
    .await?;

    for status in &statuses {
        if let Some(code) = &status.status_code {
            if code == OVERSUBSCRIBED || code == CAPACITY_NOT_AVAILABLE {
                debug!(request_id, code, "spot request signals insufficient capacity");
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::{FakeProvider, FakeProviderState};
    use crate::provider::{GroupActivity, SpotRequestStatus};

    #[tokio::test]
    async fn completed_activities_never_signal_insufficient_capacity() {
        let mut state = FakeProviderState::default();
        state.activities.insert(
            "g".to_string(),
            vec![GroupActivity {
                progress: 100,
                status_message: Some(
                    "We currently do not have sufficient capacity in the Availability Zone you requested"
                        .to_string(),
                ),
            }],
        );
        let provider = FakeProvider::new(state);
        assert!(!is_insufficient_capacity(&provider, "g").await.unwrap());
    }

    #[tokio::test]
    async fn incomplete_activity_with_literal_message_signals_true() {
        let mut state = FakeProviderState::default();
        state.activities.insert(
            "g".to_string(),
            vec![GroupActivity {
                progress: 20,
                status_message: Some(
                    "We currently do not have sufficient capacity in the Availability Zone you requested"
                        .to_string(),
                ),
            }],
        );
        let provider = FakeProvider::new(state);
        assert!(is_insufficient_capacity(&provider, "g").await.unwrap());
    }

    #[tokio::test]
    async fn spot_request_oversubscribed_signals_true() {
        let mut state = FakeProviderState::default();
        state.activities.insert(
            "g".to_string(),
            vec![GroupActivity {
                progress: 50,
                status_message: Some(
                    "Placed Spot instance request: sir-abc123de. Waiting for instance(s)".to_string(),
                ),
            }],
        );
        state.spot_requests.insert(
            "sir-abc123de".to_string(),
            SpotRequestStatus {
                request_id: "sir-abc123de".to_string(),
                status_code: Some(OVERSUBSCRIBED.to_string()),
            },
        );
        let provider = FakeProvider::new(state);
        assert!(is_insufficient_capacity(&provider, "g").await.unwrap());
    }

    #[tokio::test]
    async fn unrelated_message_signals_false() {
        let mut state = FakeProviderState::default();
        state.activities.insert(
            "g".to_string(),
            vec![GroupActivity {
                progress: 10,
                status_message: Some("Launching a new EC2 instance".to_string()),
            }],
        );
        let provider = FakeProvider::new(state);
        assert!(!is_insufficient_capacity(&provider, "g").await.unwrap());
    }
}
