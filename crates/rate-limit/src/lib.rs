//! Per-channel requests/minute limiting.
//!
//! Each channel carries an optional requests/minute cap (zero means
//! unlimited). The channel selector declines a candidate whose bucket is
//! currently exhausted and tries the next one; if no candidate remains the
//! caller gets a "no enabled channel" error. Contention is bounded to one
//! channel's bucket per request: each channel owns an independent
//! [`governor`] limiter, and the map of limiters is sharded by [`dashmap`]
//! so unrelated channels never contend on the same lock.

use std::num::NonZeroU32;

use dashmap::DashMap;
use governor::{Quota, RateLimiter as GovernorLimiter, clock::DefaultClock, state::InMemoryState};

type DirectLimiter = GovernorLimiter<governor::state::NotKeyed, InMemoryState, DefaultClock>;

struct Bucket {
    requests_per_minute: u32,
    limiter: DirectLimiter,
}

/// A registry of per-channel request-rate limiters.
///
/// Channels are identified by their configuration id. A channel configured
/// with `requests_per_minute == 0` is never rate limited.
#[derive(Default)]
pub struct ChannelRateLimiter {
    buckets: DashMap<String, Bucket>,
}

impl ChannelRateLimiter {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `channel_id` may take one more request right now given
    /// its configured `requests_per_minute` cap, consuming one token if so.
    ///
    /// Returns `true` when the request may proceed. A cap of zero always
    /// returns `true` without allocating a limiter.
    pub fn check(&self, channel_id: &str, requests_per_minute: u32) -> bool {
        if requests_per_minute == 0 {
            return true;
        }

        // Re-create the bucket if the configured cap changed since the last
        // check (e.g. the operator reloaded configuration); this resets the
        // window, which is acceptable for a cap change.
        let needs_rebuild = match self.buckets.get(channel_id) {
            Some(bucket) => bucket.requests_per_minute != requests_per_minute,
            None => true,
        };

        if needs_rebuild {
            let quota = Quota::per_minute(NonZeroU32::new(requests_per_minute).expect("checked nonzero above"));

            self.buckets.insert(
                channel_id.to_string(),
                Bucket {
                    requests_per_minute,
                    limiter: GovernorLimiter::direct(quota),
                },
            );
        }

        match self.buckets.get(channel_id) {
            Some(bucket) => bucket.limiter.check().is_ok(),
            None => true,
        }
    }

    /// Drop the bucket for `channel_id`, if any. Used when a channel is
    /// removed from configuration so its limiter doesn't linger forever.
    pub fn remove(&self, channel_id: &str) {
        self.buckets.remove(channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_channel_always_passes() {
        let limiter = ChannelRateLimiter::new();

        for _ in 0..100 {
            assert!(limiter.check("unlimited", 0));
        }
    }

    #[test]
    fn caps_requests_within_the_window() {
        let limiter = ChannelRateLimiter::new();

        assert!(limiter.check("capped", 1));
        assert!(!limiter.check("capped", 1));
    }

    #[test]
    fn distinct_channels_have_independent_buckets() {
        let limiter = ChannelRateLimiter::new();

        assert!(limiter.check("a", 1));
        assert!(limiter.check("b", 1));
        assert!(!limiter.check("a", 1));
        assert!(!limiter.check("b", 1));
    }

    #[test]
    fn rebuilds_bucket_when_cap_changes() {
        let limiter = ChannelRateLimiter::new();

        assert!(limiter.check("reconfigured", 1));
        assert!(!limiter.check("reconfigured", 1));

        // Raising the cap rebuilds the bucket and resets the window.
        assert!(limiter.check("reconfigured", 5));
    }

    #[test]
    fn remove_drops_the_bucket() {
        let limiter = ChannelRateLimiter::new();

        assert!(limiter.check("gone", 1));
        limiter.remove("gone");
        assert!(limiter.check("gone", 1));
    }
}
