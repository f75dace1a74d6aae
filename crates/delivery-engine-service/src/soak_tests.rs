//! Tests for the soak run.

use super::*;

fn args(messages: u64) -> SoakArgs {
    SoakArgs {
        queue: "soak-test".to_string(),
        messages,
        body_size: 16,
        batch: 0,
        requeue_every: 0,
        prefetch: None,
        durable: false,
        timeout_secs: 10,
    }
}

/// Verify that every published message is acknowledged.
#[tokio::test]
async fn test_auto_commit_run() {
    let report = run(&DeliveryConfig::default(), args(20)).await.unwrap();

    assert_eq!(report.published, 20);
    assert_eq!(report.acknowledged, 20);
    assert_eq!(report.remaining, 0);
}

/// Verify a transactional, prefetch-limited run with requeues.
#[tokio::test]
async fn test_transactional_run_with_requeues() {
    let soak = SoakArgs {
        batch: 3,
        requeue_every: 4,
        prefetch: Some(2),
        durable: true,
        ..args(10)
    };

    let report = run(&DeliveryConfig::default(), soak).await.unwrap();

    assert_eq!(report.acknowledged, 10);
    assert!(report.requeued > 0);
    assert_eq!(report.delivered, report.acknowledged + report.requeued);
    assert_eq!(report.remaining, 0);
}

/// Verify that an invalid queue name is refused.
#[tokio::test]
async fn test_invalid_queue_name() {
    let soak = SoakArgs {
        queue: String::new(),
        ..args(1)
    };

    assert!(run(&DeliveryConfig::default(), soak).await.is_err());
}
