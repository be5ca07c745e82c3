//! Channel cooldown tracking: transient-error windows and exponential
//! backoff (Open Question 1: base 5s, factor 2, cap 10 minutes, ±20%
//! jitter).

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;

const BASE_COOLDOWN: Duration = Duration::from_secs(5);
const BACKOFF_FACTOR: u32 = 2;
const MAX_COOLDOWN: Duration = Duration::from_secs(10 * 60);
const JITTER_FRACTION: f64 = 0.2;

/// A classification of upstream failure, used to decide whether a channel
/// should cool down (spec §4.1: credential/quota failures cool down the
/// channel; capability-mismatch failures do not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Credential/permission error or exhausted-quota error: auto-disable.
    CredentialOrQuota,
    /// Repeated 5xx within the error window: cooldown, escalating.
    Transient,
    /// A provable unsupported-combination error: no cooldown effect.
    CapabilityMismatch,
}

struct ChannelState {
    consecutive_failures: u32,
    cooled_down_until: Option<Instant>,
}

/// Tracks cooldown state per channel id. Shared across requests via a
/// `dashmap`, so unrelated channels never contend on the same shard.
#[derive(Default)]
pub struct ChannelHealth {
    states: DashMap<String, ChannelState>,
}

impl ChannelHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `channel_id` is currently cooled down and should be skipped
    /// by the selector.
    pub fn is_cooling_down(&self, channel_id: &str) -> bool {
        match self.states.get(channel_id) {
            Some(state) => match state.cooled_down_until {
                Some(until) => Instant::now() < until,
                None => false,
            },
            None => false,
        }
    }

    /// Record the outcome of a dispatch attempt against `channel_id`.
    pub fn record_failure(&self, channel_id: &str, kind: FailureKind) {
        if kind == FailureKind::CapabilityMismatch {
            return;
        }

        let mut state = self.states.entry(channel_id.to_string()).or_insert_with(|| ChannelState {
            consecutive_failures: 0,
            cooled_down_until: None,
        });

        state.consecutive_failures += 1;
        let cooldown = backoff_for(state.consecutive_failures);
        state.cooled_down_until = Some(Instant::now() + cooldown);
    }

    /// Record a successful dispatch, clearing any backoff state.
    pub fn record_success(&self, channel_id: &str) {
        if let Some(mut state) = self.states.get_mut(channel_id) {
            state.consecutive_failures = 0;
            state.cooled_down_until = None;
        }
    }

    /// Snapshot of `channel_id`'s cooldown state, for the admin debug
    /// endpoint (spec §6's `POST /api/debug/channel/<id>/debug`).
    pub fn debug(&self, channel_id: &str) -> ChannelDebug {
        match self.states.get(channel_id) {
            Some(state) => ChannelDebug {
                consecutive_failures: state.consecutive_failures,
                cooldown_seconds_remaining: state
                    .cooled_down_until
                    .map(|until| until.saturating_duration_since(Instant::now()).as_secs()),
            },
            None => ChannelDebug {
                consecutive_failures: 0,
                cooldown_seconds_remaining: None,
            },
        }
    }
}

/// Cooldown state for one channel, as reported to an operator.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ChannelDebug {
    pub consecutive_failures: u32,
    /// `None` means the channel isn't currently cooling down.
    pub cooldown_seconds_remaining: Option<u64>,
}

fn backoff_for(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(8);
    let scaled = BASE_COOLDOWN.saturating_mul(BACKOFF_FACTOR.saturating_pow(exponent));
    let capped = scaled.min(MAX_COOLDOWN);

    let jitter = rand::rng().random_range(-JITTER_FRACTION..=JITTER_FRACTION);
    let jittered_secs = capped.as_secs_f64() * (1.0 + jitter);

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_cools_down_roughly_five_seconds() {
        let health = ChannelHealth::new();
        health.record_failure("c1", FailureKind::Transient);

        assert!(health.is_cooling_down("c1"));
    }

    #[test]
    fn capability_mismatch_does_not_cool_down() {
        let health = ChannelHealth::new();
        health.record_failure("c1", FailureKind::CapabilityMismatch);

        assert!(!health.is_cooling_down("c1"));
    }

    #[test]
    fn success_clears_cooldown_state() {
        let health = ChannelHealth::new();
        health.record_failure("c1", FailureKind::CredentialOrQuota);
        assert!(health.is_cooling_down("c1"));

        health.record_success("c1");
        assert!(!health.is_cooling_down("c1"));
    }

    #[test]
    fn backoff_is_capped() {
        let capped = backoff_for(20);
        assert!(capped <= MAX_COOLDOWN + MAX_COOLDOWN.mul_f64(JITTER_FRACTION));
    }

    #[test]
    fn backoff_grows_with_failures() {
        // Compare midpoints (jitter-free) of consecutive backoff levels.
        let first = BASE_COOLDOWN;
        let second = BASE_COOLDOWN.saturating_mul(BACKOFF_FACTOR);
        assert!(second > first);
    }
}
