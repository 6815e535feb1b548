use std::{
    num::NonZeroU32,
    time::{Duration, Instant},
};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Token bucket settings shared by every client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// One token is added per period. Zero disables limiting.
    pub refill_period: Duration,
    pub burst: NonZeroU32,
    /// Minimum gap between two "you are being rate limited" notices.
    pub notice_interval: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            refill_period: Duration::from_millis(500),
            burst: NonZeroU32::MIN,
            notice_interval: Duration::from_millis(500),
        }
    }
}

impl RateLimitPolicy {
    fn quota(&self) -> Option<Quota> {
        Quota::with_period(self.refill_period).map(|quota| quota.allow_burst(self.burst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A token was available; forward the frame.
    Allowed,
    /// Denied, and the client has not been told recently.
    Notify,
    /// Denied; a notice already went out within the notice interval.
    Suppressed,
}

/// Per-client limiter. Owned by the client's reader loop and never shared.
pub struct ClientRateLimiter {
    bucket: Option<DefaultDirectRateLimiter>,
    notice_interval: Duration,
    last_notice: Option<Instant>,
}

impl ClientRateLimiter {
    pub fn new(policy: &RateLimitPolicy) -> Self {
        Self {
            bucket: policy.quota().map(RateLimiter::direct),
            notice_interval: policy.notice_interval,
            last_notice: None,
        }
    }

    pub fn check(&mut self) -> Verdict {
        let Some(bucket) = &self.bucket else {
            return Verdict::Allowed;
        };
        if bucket.check().is_ok() {
            return Verdict::Allowed;
        }

        let now = Instant::now();
        match self.last_notice {
            Some(sent) if now.duration_since(sent) <= self.notice_interval => Verdict::Suppressed,
            _ => {
                self.last_notice = Some(now);
                Verdict::Notify
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_allows_one_frame_then_notifies_once() {
        let mut limiter = ClientRateLimiter::new(&RateLimitPolicy::default());

        assert_eq!(limiter.check(), Verdict::Allowed);
        assert_eq!(limiter.check(), Verdict::Notify);
        assert_eq!(limiter.check(), Verdict::Suppressed);
        assert_eq!(limiter.check(), Verdict::Suppressed);
    }

    #[test]
    fn bucket_refills_after_the_period() {
        let policy = RateLimitPolicy {
            refill_period: Duration::from_millis(50),
            notice_interval: Duration::from_millis(50),
            ..RateLimitPolicy::default()
        };
        let mut limiter = ClientRateLimiter::new(&policy);

        assert_eq!(limiter.check(), Verdict::Allowed);
        assert_eq!(limiter.check(), Verdict::Notify);

        std::thread::sleep(Duration::from_millis(120));

        assert_eq!(limiter.check(), Verdict::Allowed);
        assert_eq!(limiter.check(), Verdict::Notify);
    }

    #[test]
    fn larger_burst_admits_that_many_frames() {
        let policy = RateLimitPolicy {
            burst: NonZeroU32::new(3).expect("non-zero"),
            ..RateLimitPolicy::default()
        };
        let mut limiter = ClientRateLimiter::new(&policy);

        for _ in 0..3 {
            assert_eq!(limiter.check(), Verdict::Allowed);
        }
        assert_eq!(limiter.check(), Verdict::Notify);
    }

    #[test]
    fn zero_period_disables_limiting() {
        let policy = RateLimitPolicy {
            refill_period: Duration::ZERO,
            ..RateLimitPolicy::default()
        };
        let mut limiter = ClientRateLimiter::new(&policy);

        for _ in 0..100 {
            assert_eq!(limiter.check(), Verdict::Allowed);
        }
    }
}
