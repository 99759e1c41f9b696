//! Per-entity rate limiting
//!
//! Token buckets, one map per entity kind. On check the bucket refills
//! proportionally to elapsed time (capped at burst capacity), then consumes
//! atomically; a shortfall raises `QuotaExceeded` with a retry-after hint of
//! `(needed - available) / rate` seconds.

use localbus_core::{BusError, BusResult, QuotaError, RateConfig};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst_multiplier: f64) -> Self {
        let capacity = rate * burst_multiplier;
        Self {
            capacity,
            rate,
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    fn consume(&mut self, tokens: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Seconds until `tokens` would be available. Zero when they already are.
    fn retry_after(&self, tokens: f64) -> f64 {
        if self.tokens >= tokens {
            0.0
        } else {
            (tokens - self.tokens) / self.rate
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BucketKind {
    Queue,
    Topic,
    Subscription,
}

#[derive(Debug, Default)]
struct Buckets {
    queues: HashMap<String, TokenBucket>,
    topics: HashMap<String, TokenBucket>,
    subscriptions: HashMap<String, TokenBucket>,
}

/// Rate limiter gating producer and consumer operations.
///
/// One global mutex, held only inside the refill-and-consume fast path.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateConfig,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(Buckets::default()),
        }
    }

    pub fn check_queue(&self, queue_name: &str, count: u32) -> BusResult<()> {
        self.check(BucketKind::Queue, queue_name, self.config.queue_rate, count)
    }

    pub fn check_topic(&self, topic_name: &str, count: u32) -> BusResult<()> {
        self.check(BucketKind::Topic, topic_name, self.config.topic_rate, count)
    }

    pub fn check_subscription(
        &self,
        topic_name: &str,
        subscription_name: &str,
        count: u32,
    ) -> BusResult<()> {
        let key = format!("{}/{}", topic_name, subscription_name);
        self.check(
            BucketKind::Subscription,
            &key,
            self.config.subscription_rate,
            count,
        )
    }

    fn check(&self, kind: BucketKind, key: &str, rate: f64, count: u32) -> BusResult<()> {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex");
        let map = match kind {
            BucketKind::Queue => &mut buckets.queues,
            BucketKind::Topic => &mut buckets.topics,
            BucketKind::Subscription => &mut buckets.subscriptions,
        };
        let bucket = map
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(rate, self.config.burst_multiplier));

        let now = Instant::now();
        if bucket.consume(count as f64, now) {
            return Ok(());
        }
        let retry_after = bucket.retry_after(count as f64);
        let capacity = bucket.capacity as u64;
        Err(BusError::Quota(QuotaError::rate_limit(
            key,
            capacity,
            retry_after,
        )))
    }

    /// Override the rate for one queue. Burst capacity follows the
    /// configured multiplier.
    pub fn set_queue_rate(&self, queue_name: &str, rate: f64) {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex");
        buckets.queues.insert(
            queue_name.to_string(),
            TokenBucket::new(rate, self.config.burst_multiplier),
        );
    }

    pub fn set_topic_rate(&self, topic_name: &str, rate: f64) {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex");
        buckets.topics.insert(
            topic_name.to_string(),
            TokenBucket::new(rate, self.config.burst_multiplier),
        );
    }

    pub fn set_subscription_rate(&self, topic_name: &str, subscription_name: &str, rate: f64) {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex");
        buckets.subscriptions.insert(
            format!("{}/{}", topic_name, subscription_name),
            TokenBucket::new(rate, self.config.burst_multiplier),
        );
    }

    /// Forget all buckets (tests).
    pub fn reset(&self) {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex");
        *buckets = Buckets::default();
    }

    /// Drop the bucket for a deleted entity.
    pub fn forget_queue(&self, queue_name: &str) {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex");
        buckets.queues.remove(queue_name);
    }

    pub fn forget_topic(&self, topic_name: &str) {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex");
        buckets.topics.remove(topic_name);
        buckets
            .subscriptions
            .retain(|key, _| !key.starts_with(&format!("{}/", topic_name)));
    }
}
