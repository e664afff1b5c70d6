use ash_warden::RestartPolicy;
use std::time::Duration;

#[test]
fn test_restart_policy_defaults() {
    let policy = RestartPolicy::default();
    assert_eq!(policy.max_retries, 3);
    assert_eq!(policy.backoff_base, Duration::from_secs(1));
    assert_eq!(policy.backoff_max, Duration::from_secs(30));
}

#[test]
fn test_backoff_doubles_until_capped() {
    let policy = RestartPolicy::new(10, Duration::from_secs(1), Duration::from_secs(30));

    let delays: Vec<u64> = (0..7).map(|n| policy.backoff(n).as_secs()).collect();
    assert_eq!(delays, [1, 2, 4, 8, 16, 30, 30]);
}

#[test]
fn test_backoff_never_overflows() {
    let policy = RestartPolicy::new(3, Duration::from_millis(250), Duration::from_secs(60));
    assert_eq!(policy.backoff(31), Duration::from_secs(60));
    assert_eq!(policy.backoff(64), Duration::from_secs(60));
    assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
}

#[test]
fn test_zero_base_means_immediate_restart() {
    let policy = RestartPolicy::new(3, Duration::ZERO, Duration::from_secs(5));
    assert_eq!(policy.backoff(0), Duration::ZERO);
    assert_eq!(policy.backoff(4), Duration::ZERO);
}

#[test]
fn test_exhausted_after_max_retries() {
    let policy = RestartPolicy::new(2, Duration::from_secs(1), Duration::from_secs(10));
    assert!(!policy.is_exhausted(0));
    assert!(!policy.is_exhausted(2));
    assert!(policy.is_exhausted(3));

    let strict = RestartPolicy::new(0, Duration::from_secs(1), Duration::from_secs(10));
    assert!(strict.is_exhausted(1));
}
