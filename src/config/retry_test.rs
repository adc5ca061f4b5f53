use std::time::Duration;

use super::*;

#[test]
fn delays_double_until_capped() {
    let policy = BackoffPolicy {
        max_retries: 6,
        timeout_ms: 100,
        base_delay_ms: 10,
        max_delay_ms: 50,
    };

    let delays: Vec<Duration> = policy.delays().collect();

    // one sleep between each pair of attempts
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(50),
            Duration::from_millis(50),
        ]
    );
}

#[test]
fn single_attempt_has_no_delay() {
    let policy = BackoffPolicy {
        max_retries: 1,
        ..BackoffPolicy::default()
    };

    assert_eq!(policy.delays().count(), 0);
}

#[test]
fn unlimited_retries_keep_yielding() {
    let policy = BackoffPolicy {
        max_retries: 0,
        timeout_ms: 100,
        base_delay_ms: 1,
        max_delay_ms: 4,
    };

    let delays: Vec<Duration> = policy.delays().take(100).collect();
    assert_eq!(delays.len(), 100);
    assert_eq!(delays.last(), Some(&Duration::from_millis(4)));
}

#[test]
fn validate_rejects_inverted_delays() {
    let policy = BackoffPolicy {
        max_retries: 3,
        timeout_ms: 100,
        base_delay_ms: 500,
        max_delay_ms: 10,
    };

    assert!(policy.validate("liveness").is_err());
}

#[test]
fn default_liveness_policy_is_valid() {
    assert!(RetryPolicies::default().validate().is_ok());
}
