//! Property-style tests for broker invariants
//!
//! - Fan-out completeness: every matching subscription gets exactly one
//!   copy, non-matching subscriptions get none.
//! - Rate-limiter admission: over any window, admissions stay within
//!   capacity plus refill.
//! - Delivery counts rise monotonically across abandons.

use localbus_broker::{Broker, SubQueue};
use localbus_core::{
    PropertyValue, RateConfig, ReceiveMode, RuleFilter, SendMessageRequest,
};
use localbus_broker::RateLimiter;
use proptest::prelude::*;
use std::time::Instant;

fn tagged(priority: &str, region: &str) -> SendMessageRequest {
    let mut request = SendMessageRequest::with_body("x");
    request.user_properties.insert(
        "priority".to_string(),
        PropertyValue::String(priority.to_string()),
    );
    request.user_properties.insert(
        "region".to_string(),
        PropertyValue::String(region.to_string()),
    );
    request
}

fn routed_broker() -> Broker {
    let broker = Broker::with_defaults();
    broker.create_or_update_topic("events", None).expect("topic");
    for (name, rule) in [
        ("high", "priority = 'high'"),
        ("us", "region = 'us'"),
        ("high-us", "priority = 'high' AND region = 'us'"),
    ] {
        broker
            .create_or_update_subscription("events", name, None)
            .expect("subscription");
        broker
            .create_or_update_rule("events", name, "match", RuleFilter::sql(rule), None)
            .expect("rule");
        broker
            .delete_rule("events", name, "$Default")
            .expect("default rule removed");
    }
    broker
        .create_or_update_subscription("events", "all", None)
        .expect("catch-all");
    broker
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// For a random publication mix, each subscription holds exactly the
    /// messages its rule admits, and the catch-all holds everything.
    #[test]
    fn fan_out_completeness(mix in prop::collection::vec((any::<bool>(), any::<bool>()), 1..24)) {
        let broker = routed_broker();

        let mut expected_high = 0usize;
        let mut expected_us = 0usize;
        let mut expected_high_us = 0usize;

        for (is_high, is_us) in &mix {
            let priority = if *is_high { "high" } else { "low" };
            let region = if *is_us { "us" } else { "eu" };
            broker
                .publish("events", tagged(priority, region))
                .expect("publishes");
            if *is_high {
                expected_high += 1;
            }
            if *is_us {
                expected_us += 1;
            }
            if *is_high && *is_us {
                expected_high_us += 1;
            }
        }

        let drain = |sub: &str| {
            broker
                .receive_from_subscription(
                    "events",
                    sub,
                    SubQueue::Active,
                    ReceiveMode::ReceiveAndDelete,
                    mix.len() + 1,
                )
                .expect("drains")
                .len()
        };

        prop_assert_eq!(drain("high"), expected_high);
        prop_assert_eq!(drain("us"), expected_us);
        prop_assert_eq!(drain("high-us"), expected_high_us);
        prop_assert_eq!(drain("all"), mix.len());
    }

    /// Delivery count is exactly the number of lock acquisitions.
    #[test]
    fn delivery_count_tracks_lock_acquisitions(rounds in 1u32..8) {
        let broker = Broker::with_defaults();
        let properties = localbus_core::QueueProperties {
            max_delivery_count: rounds + 1,
            ..Default::default()
        };
        broker
            .create_or_update_queue("counts", Some(properties))
            .expect("queue");
        broker
            .send("counts", SendMessageRequest::with_body("x"))
            .expect("send");

        for round in 1..=rounds {
            let received = broker
                .receive("counts", SubQueue::Active, ReceiveMode::PeekLock, 1)
                .expect("receive");
            prop_assert_eq!(received.len(), 1);
            prop_assert_eq!(received[0].delivery_count, round);
            broker
                .abandon(
                    "counts",
                    SubQueue::Active,
                    &received[0].message_id,
                    &received[0].lock_token.unwrap(),
                )
                .expect("abandon");
        }
    }
}

/// Admission bound: for a bucket with rate r and capacity c, admissions over
/// an observed window W never exceed c + r * W (with a small timing margin).
#[test]
fn rate_limiter_admission_bound() {
    let rate = 200.0;
    let limiter = RateLimiter::new(RateConfig {
        queue_rate: rate,
        topic_rate: 1000.0,
        subscription_rate: 100.0,
        burst_multiplier: 2.0,
    });
    let capacity = rate * 2.0;

    let started = Instant::now();
    let mut admitted = 0u64;
    for _ in 0..200_000 {
        if limiter.check_queue("hammered", 1).is_ok() {
            admitted += 1;
        }
    }
    let window = started.elapsed().as_secs_f64();

    let bound = capacity + rate * (window + 0.05);
    assert!(
        (admitted as f64) <= bound,
        "admitted {} over {:.3}s, bound {:.1}",
        admitted,
        window,
        bound
    );
    // And the burst capacity itself was admitted.
    assert!(admitted as f64 >= capacity);
}
