use governor::{
    clock::QuantaClock,
    middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};

use crate::server::client::ClientIdentity;

/// Limits how fast a single client may open WebSocket sessions.
///
/// This guards the upgrade path only; check requests are counted separately
/// by [`CheckRateLimiter`](super::rate_limit::CheckRateLimiter).
#[derive(Clone)]
pub struct UpgradeThrottle {
    /// `None` when the throttle is disabled.
    limiter: Option<
        Arc<RateLimiter<ClientIdentity, DashMapStateStore<ClientIdentity>, QuantaClock, NoOpMiddleware>>,
    >,
}

impl UpgradeThrottle {
    /// Creates a throttle allowing `per_second` upgrades per identity, with
    /// an equal burst. A value of zero disables throttling.
    pub fn new(per_second: u32) -> Self {
        let limiter = NonZeroU32::new(per_second)
            .map(|rate| Arc::new(RateLimiter::dashmap(Quota::per_second(rate))));

        Self { limiter }
    }

    /// Returns `true` if `identity` may open another session right now.
    pub fn check(&self, identity: &ClientIdentity) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check_key(identity).is_ok(),
            None => true,
        }
    }

    /// Discards state for identities that are back at full capacity.
    pub fn cleanup(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
        }
    }
}
