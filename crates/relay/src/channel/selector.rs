//! Channel selection (spec §4.1): filter, partition by priority, weighted
//! pick, and model_mapping resolution.

use rand::Rng;

use crate::error::RelayError;
use crate::repository::ChannelRecord;

use super::health::ChannelHealth;

/// The outcome of a successful selection: the chosen channel plus the
/// model name to actually send upstream after `model_mapping` is applied.
pub struct SelectedChannel {
    pub channel: ChannelRecord,
    pub actual_model_name: String,
}

/// Select an eligible channel for `(group, model_name)`.
///
/// Filtering order follows spec §4.1: enabled, serves `group`, allows
/// `model_name` (or has an empty allowlist), and is not cooling down.
/// Candidates are partitioned by descending priority; the highest-priority
/// non-empty partition is chosen from by weighted random pick (uniform
/// when every weight in the partition is zero).
pub fn select(
    group: &str,
    model_name: &str,
    channels: &[ChannelRecord],
    health: &ChannelHealth,
) -> Result<SelectedChannel, RelayError> {
    let mut eligible: Vec<&ChannelRecord> = channels
        .iter()
        .filter(|channel| channel.is_enabled())
        .filter(|channel| channel.config.common().groups.contains(group))
        .filter(|channel| channel.config.allows_model(model_name))
        .filter(|channel| !health.is_cooling_down(&channel.id))
        .collect();

    if eligible.is_empty() {
        return Err(RelayError::OneApi(format!(
            "no enabled channel available for group '{group}' and model '{model_name}'"
        )));
    }

    let top_priority = eligible
        .iter()
        .map(|channel| channel.config.common().priority)
        .max()
        .expect("eligible is non-empty");

    eligible.retain(|channel| channel.config.common().priority == top_priority);

    let chosen = weighted_pick(&eligible);
    let actual_model_name = chosen.config.actual_model_name(model_name).to_string();

    Ok(SelectedChannel {
        channel: chosen.clone(),
        actual_model_name,
    })
}

fn weighted_pick<'a>(candidates: &[&'a ChannelRecord]) -> &'a ChannelRecord {
    debug_assert!(!candidates.is_empty());

    if candidates.len() == 1 {
        return candidates[0];
    }

    let total_weight: u64 = candidates.iter().map(|c| c.config.common().weight as u64).sum();

    if total_weight == 0 {
        let index = rand::rng().random_range(0..candidates.len());
        return candidates[index];
    }

    let mut pick = rand::rng().random_range(0..total_weight);

    for candidate in candidates {
        let weight = candidate.config.common().weight as u64;

        if pick < weight {
            return candidate;
        }

        pick -= weight;
    }

    candidates[candidates.len() - 1]
}

#[cfg(test)]
mod tests {
    use indexmap::IndexSet;

    use config::{ApiChannelConfig, ChannelCommon, ChannelConfig, ChannelStatus};
    use secrecy::SecretString;

    use super::*;

    fn channel(id: &str, priority: i32, weight: u32, groups: &[&str]) -> ChannelRecord {
        let common = ChannelCommon {
            name: id.to_string(),
            status: ChannelStatus::Enabled,
            priority,
            weight,
            groups: groups.iter().map(|g| g.to_string()).collect::<IndexSet<_>>(),
            ..ChannelCommon::default()
        };

        let config = ChannelConfig::Openai(ApiChannelConfig {
            common,
            api_key: SecretString::from("sk-test".to_string()),
            base_url: None,
            deployment_id: None,
            api_version: None,
        });

        ChannelRecord {
            id: id.to_string(),
            config,
            auto_disabled: false,
            balance: None,
            balance_updated_at: None,
        }
    }

    #[test]
    fn selects_highest_priority_partition() {
        let channels = vec![channel("low", 1, 1, &["default"]), channel("high", 10, 1, &["default"])];
        let health = ChannelHealth::new();

        let selected = select("default", "gpt-4o", &channels, &health).unwrap();
        assert_eq!(selected.channel.id, "high");
    }

    #[test]
    fn skips_channels_outside_the_group() {
        let channels = vec![channel("other-group", 10, 1, &["enterprise"])];
        let health = ChannelHealth::new();

        let err = select("default", "gpt-4o", &channels, &health).unwrap_err();
        assert!(matches!(err, RelayError::OneApi(_)));
    }

    #[test]
    fn skips_cooling_down_channels() {
        let channels = vec![channel("only", 10, 1, &["default"])];
        let health = ChannelHealth::new();
        health.record_failure("only", super::super::health::FailureKind::Transient);

        let err = select("default", "gpt-4o", &channels, &health).unwrap_err();
        assert!(matches!(err, RelayError::OneApi(_)));
    }

    #[test]
    fn falls_back_to_uniform_pick_when_all_weights_zero() {
        let channels = vec![channel("a", 10, 0, &["default"]), channel("b", 10, 0, &["default"])];
        let health = ChannelHealth::new();

        // Just assert it resolves to one of the two candidates repeatedly.
        for _ in 0..20 {
            let selected = select("default", "gpt-4o", &channels, &health).unwrap();
            assert!(selected.channel.id == "a" || selected.channel.id == "b");
        }
    }
}
