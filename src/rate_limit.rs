use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// In-memory token-bucket limiter keyed by opaque strings such as
/// `ip:1.2.3.4` or `global`. Buckets are created lazily, full, under a
/// single mutex.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `rate` tokens per second with a capacity of `burst`.
    pub fn new(rate: f64, burst: u32) -> RateLimiter {
        RateLimiter {
            rate,
            burst: f64::from(burst),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1)
    }

    pub fn allow_n(&self, key: &str, n: u32) -> bool {
        self.allow_n_at(key, n, Instant::now())
    }

    fn allow_n_at(&self, key: &str, n: u32, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        if !buckets.contains_key(key) {
            buckets.insert(
                key.to_string(),
                TokenBucket {
                    tokens: self.burst,
                    last_refill: now,
                },
            );
        }
        let bucket = buckets.get_mut(key).expect("bucket just inserted");

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        bucket.last_refill = now;

        let cost = f64::from(n);
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_then_deny() {
        let limiter = RateLimiter::new(1.0, 3);
        let now = Instant::now();
        assert!(limiter.allow_n_at("k", 1, now));
        assert!(limiter.allow_n_at("k", 1, now));
        assert!(limiter.allow_n_at("k", 1, now));
        assert!(!limiter.allow_n_at("k", 1, now));
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::new(2.0, 2);
        let now = Instant::now();
        assert!(limiter.allow_n_at("k", 2, now));
        assert!(!limiter.allow_n_at("k", 1, now));
        let later = now + Duration::from_millis(600);
        assert!(limiter.allow_n_at("k", 1, later));
        assert!(!limiter.allow_n_at("k", 1, later));
    }

    #[test]
    fn refill_caps_at_burst() {
        let limiter = RateLimiter::new(100.0, 2);
        let now = Instant::now();
        assert!(limiter.allow_n_at("k", 1, now));
        let much_later = now + Duration::from_secs(60);
        assert!(limiter.allow_n_at("k", 2, much_later));
        assert!(!limiter.allow_n_at("k", 1, much_later));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1.0, 1);
        let now = Instant::now();
        assert!(limiter.allow_n_at("ip:1.2.3.4", 1, now));
        assert!(limiter.allow_n_at("ip:5.6.7.8", 1, now));
        assert!(!limiter.allow_n_at("ip:1.2.3.4", 1, now));
    }

    #[test]
    fn oversized_request_never_admits() {
        let limiter = RateLimiter::new(1.0, 2);
        assert!(!limiter.allow_n("k", 5));
    }
}
