//! Per-channel rate shaping for outbound notifications

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use nonzero_ext::nonzero;

use crate::types::NotifyChannel;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// One direct limiter per channel. Quotas are conservative for SMTP and
/// the SMS provider, looser for webhooks and push endpoints.
pub struct RateLimiterRegistry {
    email: DirectLimiter,
    sms: DirectLimiter,
    chat: DirectLimiter,
    push: DirectLimiter,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            email: RateLimiter::direct(Quota::per_second(nonzero!(5u32)).allow_burst(nonzero!(10u32))),
            sms: RateLimiter::direct(Quota::per_second(nonzero!(10u32)).allow_burst(nonzero!(20u32))),
            chat: RateLimiter::direct(
                Quota::per_second(nonzero!(20u32)).allow_burst(nonzero!(40u32)),
            ),
            push: RateLimiter::direct(
                Quota::per_second(nonzero!(50u32)).allow_burst(nonzero!(100u32)),
            ),
        }
    }

    /// Wait until the channel's quota admits one more send.
    pub async fn acquire(&self, channel: NotifyChannel) {
        let limiter = match channel {
            NotifyChannel::Email => &self.email,
            NotifyChannel::Sms => &self.sms,
            NotifyChannel::Chat => &self.chat,
            NotifyChannel::Push => &self.push,
        };
        limiter.until_ready().await;
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_admits_immediately() {
        let registry = RateLimiterRegistry::new();
        // Within burst allowance this must not block.
        for _ in 0..5 {
            registry.acquire(NotifyChannel::Email).await;
        }
    }
}
