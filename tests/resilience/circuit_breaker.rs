use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use unitflow::config::CircuitBreakerSettings;
use unitflow::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerManager,
    CircuitState, GuardedOperation,
};

fn breaker(threshold: u32, cooldown_ms: u64) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        "conversion".to_string(),
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
        },
    ))
}

async fn fail(breaker: &CircuitBreaker) {
    let result = breaker
        .call(|| async { Err::<(), _>("converter crashed".to_string()) })
        .await;
    assert!(matches!(result, Err(CircuitBreakerError::OperationFailed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_rejects_and_recovers() {
    let breaker = breaker(2, 1_000);
    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Closed);
    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = breaker.call(|| async { Ok::<_, String>(()) }).await;
    match rejected {
        Err(CircuitBreakerError::CircuitOpen { retry_after, .. }) => {
            assert!(retry_after <= Duration::from_millis(1_000));
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }

    tokio::time::advance(Duration::from_millis(1_001)).await;
    let trial = breaker.call(|| async { Ok::<_, String>("converted") }).await;
    assert!(matches!(trial, Ok("converted")));
    assert_eq!(breaker.state(), CircuitState::Closed);

    let metrics = breaker.metrics();
    assert_eq!(metrics.failure_count, 2);
    assert_eq!(metrics.rejected_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_a_single_trial() {
    let breaker = breaker(1, 100);
    fail(&breaker).await;
    tokio::time::advance(Duration::from_millis(150)).await;

    let (release, released) = oneshot::channel::<()>();
    let trial_breaker = Arc::clone(&breaker);
    let trial = tokio::spawn(async move {
        trial_breaker
            .call(|| async move {
                released.await.ok();
                Ok::<_, String>(())
            })
            .await
    });
    tokio::task::yield_now().await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let second = breaker.call(|| async { Ok::<_, String>(()) }).await;
    assert!(matches!(second, Err(CircuitBreakerError::CircuitOpen { .. })));

    release.send(()).unwrap();
    assert!(trial.await.unwrap().is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens() {
    let breaker = breaker(1, 100);
    fail(&breaker).await;
    tokio::time::advance(Duration::from_millis(150)).await;

    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(breaker.time_until_half_open().is_some());
}

#[test]
fn test_manager_keeps_families_independent() {
    let manager = CircuitBreakerManager::from_settings(&CircuitBreakerSettings::default());
    manager.breaker(GuardedOperation::Conversion).force_open();

    assert_eq!(
        manager.breaker(GuardedOperation::Conversion).state(),
        CircuitState::Open
    );
    assert_eq!(
        manager.breaker(GuardedOperation::Extraction).state(),
        CircuitState::Closed
    );
    assert_eq!(manager.system_metrics().open_circuits(), vec!["conversion"]);
}
