use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;
use crumple_core::cache::ResultCache;
use crumple_core::image_data::to_data_uri;
use crumple_core::retry::RetryPolicy;
use crumple_core::{
    ErrorKind, TransformError, TransformOptions, TransformPhase, TransformProfiles, TransformRequest,
    TransformType,
};
use crate::client::{RemoteImage, TransformClient};
use crate::error::OrchestratorError;
use crate::events::TransformEvent;
use crate::orchestrator::{TransformOrchestrator, TransformServices};
use crate::prepare::tests::png_base64;
use crate::prepare::DataUriPreparer;

/// Scripted stand-in for the remote service
struct MockClient {
    calls: AtomicUsize,
    delay: Duration,
    failures: Mutex<VecDeque<TransformError>>,
    image: String,
}

impl MockClient {
    fn new(delay: Duration) -> Arc<Self> {
        Self::failing(delay, Vec::new())
    }

    fn failing(delay: Duration, failures: Vec<TransformError>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            failures: Mutex::new(failures.into()),
            image: png_base64(2, 2),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransformClient for MockClient {
    async fn execute(
        &self,
        _request: &TransformRequest,
        _attempt_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteImage, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransformError::cancelled()),
            _ = tokio::time::sleep(self.delay) => {}
        }

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(RemoteImage {
            image: self.image.clone(),
            seed: Some(42),
            message: "ok".to_string(),
        })
    }
}

fn services(client: Arc<MockClient>) -> TransformServices {
    TransformServices::new(
        client,
        Arc::new(DataUriPreparer),
        ResultCache::new(50, TimeDelta::hours(24)).unwrap(),
        RetryPolicy::default(),
    )
}

fn orchestrator(services: TransformServices, history_cap: usize) -> TransformOrchestrator {
    TransformOrchestrator::new(services, TransformProfiles::default(), history_cap)
}

fn source_image() -> String {
    to_data_uri("image/png", &png_base64(8, 8))
}

fn strength(value: f32) -> TransformOptions {
    TransformOptions {
        strength: Some(value),
        ..TransformOptions::default()
    }
}

fn server_error() -> TransformError {
    TransformError::new(ErrorKind::ServerError, "HTTP 503: busy")
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<TransformEvent>) -> Vec<TransformEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_success_populates_result_and_state() {
    let client = MockClient::new(Duration::from_millis(50));
    let orch = orchestrator(services(client.clone()), 20);

    let result = orch
        .transform(source_image(), TransformType::Light, TransformOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.original_image, source_image());
    assert_eq!(result.transformed_image, Some(to_data_uri("image/png", &png_base64(2, 2))));
    assert!(result.error.is_none());
    assert_eq!(client.calls(), 1);

    let state = orch.state();
    assert!(!state.is_transforming);
    assert_eq!(state.phase, TransformPhase::Completed);
    assert_eq!(state.progress, 100);
    assert_eq!(state.last_transform_time, Some(result.completed_at));
    assert_eq!(orch.history(), vec![result]);
    assert_eq!(orch.estimated_time_remaining(), None);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_request_is_served_from_cache() {
    let client = MockClient::new(Duration::from_millis(50));
    let orch = orchestrator(services(client.clone()), 20);

    let first = orch
        .transform(source_image(), TransformType::Light, strength(0.4))
        .await
        .unwrap();
    let mut events = orch.subscribe();
    let second = orch
        .transform(source_image(), TransformType::Light, strength(0.4))
        .await
        .unwrap();

    assert_eq!(client.calls(), 1);
    assert_eq!(second.transformed_image, first.transformed_image);
    assert_eq!(second.request_key, first.request_key);
    assert_eq!(second.attempts, 0);
    assert!(drain(&mut events).contains(&TransformEvent::CacheHit(first.request_key.clone())));
    assert_eq!(orch.services().cache_stats().entries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_different_params_miss_the_cache() {
    let client = MockClient::new(Duration::from_millis(50));
    let orch = orchestrator(services(client.clone()), 20);

    orch.transform(source_image(), TransformType::Light, strength(0.4)).await.unwrap();
    orch.transform(source_image(), TransformType::Light, strength(0.5)).await.unwrap();
    orch.transform(source_image(), TransformType::Heavy, strength(0.4)).await.unwrap();

    assert_eq!(client.calls(), 3);
    assert_eq!(orch.services().cache_stats().entries, 3);
}

#[tokio::test(start_paused = true)]
async fn test_cleared_cache_goes_back_to_the_service() {
    let client = MockClient::new(Duration::from_millis(50));
    let orch = orchestrator(services(client.clone()), 20);

    orch.transform(source_image(), TransformType::Light, strength(0.4)).await.unwrap();
    orch.clear_cache();
    orch.transform(source_image(), TransformType::Light, strength(0.4)).await.unwrap();

    assert_eq!(client.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_identical_concurrent_requests_share_one_call() {
    let client = MockClient::new(Duration::from_millis(50));
    let shared = services(client.clone());
    let a = orchestrator(shared.clone(), 20);
    let b = orchestrator(shared.clone(), 20);
    let mut b_events = b.subscribe();

    let (ra, rb) = tokio::join!(
        a.transform(source_image(), TransformType::Light, strength(0.4)),
        b.transform(source_image(), TransformType::Light, strength(0.4)),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(client.calls(), 1);
    assert_eq!(ra.transform_type, TransformType::Light);
    assert_eq!(rb.transform_type, TransformType::Light);
    assert_eq!(ra.transformed_image, rb.transformed_image);
    assert_eq!(ra.request_key, rb.request_key);
    assert!(drain(&mut b_events).contains(&TransformEvent::JoinedInFlight(rb.request_key.clone())));
    assert_eq!(shared.in_flight(), 0);
    assert_eq!(shared.cache_stats().entries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_concurrent_requests_run_separately() {
    let client = MockClient::new(Duration::from_millis(50));
    let shared = services(client.clone());
    let a = orchestrator(shared.clone(), 20);
    let b = orchestrator(shared.clone(), 20);

    let (ra, rb) = tokio::join!(
        a.transform(source_image(), TransformType::Light, TransformOptions::default()),
        b.transform(source_image(), TransformType::Heavy, TransformOptions::default()),
    );

    assert!(ra.unwrap().success && rb.unwrap().success);
    assert_eq!(client.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_stop_at_max_attempts() {
    let client = MockClient::failing(Duration::ZERO, vec![server_error(); 5]);
    let orch = orchestrator(services(client.clone()), 20);
    let mut events = orch.subscribe();

    let err = orch
        .transform(source_image(), TransformType::Light, TransformOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.transform_error().unwrap().kind, ErrorKind::ServerError);
    assert_eq!(client.calls(), 3);

    let delays: Vec<Option<Duration>> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            TransformEvent::AttemptFailed { retry_in, .. } => Some(retry_in),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![Some(Duration::from_secs(1)), Some(Duration::from_secs(2)), None]
    );

    let state = orch.state();
    assert_eq!(state.phase, TransformPhase::Error);
    assert_eq!(state.failed_attempts, 3);
    assert!(!state.is_transforming);

    let last = orch.history().pop().unwrap();
    assert!(!last.success);
    assert_eq!(last.attempts, 3);
    assert_eq!(last.error.unwrap().kind, ErrorKind::ServerError);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_then_success() {
    let client = MockClient::failing(Duration::ZERO, vec![server_error()]);
    let orch = orchestrator(services(client.clone()), 20);

    let result = orch
        .transform(source_image(), TransformType::Light, TransformOptions::default())
        .await
        .unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(client.calls(), 2);
    assert_eq!(orch.history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_is_not_retried() {
    let auth = TransformError::new(ErrorKind::AuthError, "HTTP 401: bad key");
    let client = MockClient::failing(Duration::ZERO, vec![auth.clone()]);
    let orch = orchestrator(services(client.clone()), 20);
    let mut events = orch.subscribe();

    let err = orch
        .transform(source_image(), TransformType::Light, TransformOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err, OrchestratorError::Transform(auth.clone()));
    assert_eq!(client.calls(), 1);
    assert!(drain(&mut events).contains(&TransformEvent::AttemptFailed {
        attempt: 1,
        error: auth,
        retry_in: None,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_processing() {
    let client = MockClient::new(Duration::from_secs(30));
    let shared = services(client.clone());
    let orch = orchestrator(shared.clone(), 20);

    let (result, _) = tokio::join!(
        orch.transform(source_image(), TransformType::Light, TransformOptions::default()),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(orch.state().phase, TransformPhase::Processing);
            orch.cancel_transform();
        }
    );

    let err = result.unwrap_err();
    assert_eq!(err.transform_error().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(client.calls(), 1);

    let state = orch.state();
    assert!(!state.is_transforming);
    assert_eq!(state.phase, TransformPhase::Cancelled);
    assert_eq!(orch.history().len(), 1);
    assert_eq!(shared.in_flight(), 0);
    assert_eq!(shared.cache_stats().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_idle_is_a_no_op() {
    let client = MockClient::new(Duration::ZERO);
    let orch = orchestrator(services(client.clone()), 20);

    orch.cancel_transform();
    let result = orch
        .transform(source_image(), TransformType::Light, TransformOptions::default())
        .await;
    assert!(result.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_transform_releases_state() {
    let client = MockClient::new(Duration::from_secs(30));
    let shared = services(client.clone());
    let orch = orchestrator(shared.clone(), 20);

    let timed_out = tokio::time::timeout(
        Duration::from_secs(1),
        orch.transform(source_image(), TransformType::Light, TransformOptions::default()),
    )
    .await;
    assert!(timed_out.is_err());

    let state = orch.state();
    assert!(!state.is_transforming);
    assert_eq!(state.phase, TransformPhase::Cancelled);
    assert_eq!(shared.in_flight(), 0);
    assert!(orch.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_call_while_busy_is_rejected() {
    let client = MockClient::new(Duration::from_millis(200));
    let orch = orchestrator(services(client.clone()), 20);

    let (first, second) = tokio::join!(
        orch.transform(source_image(), TransformType::Light, TransformOptions::default()),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            orch.transform(source_image(), TransformType::Heavy, TransformOptions::default())
                .await
        }
    );

    assert!(first.unwrap().success);
    assert_eq!(second.unwrap_err(), OrchestratorError::AlreadyInProgress);
    assert_eq!(orch.history().len(), 1);
    assert_eq!(client.calls(), 1);
}

#[tokio::test]
async fn test_invalid_request_is_not_recorded() {
    let client = MockClient::new(Duration::ZERO);
    let orch = orchestrator(services(client.clone()), 20);

    let err = orch
        .transform("", TransformType::Light, TransformOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidRequest(_)));

    let err = orch
        .transform(source_image(), TransformType::Named("origami".into()), TransformOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidRequest(_)));

    assert!(orch.history().is_empty());
    assert!(!orch.state().is_transforming);
    assert_eq!(client.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_source_fails_without_calling_service() {
    let client = MockClient::new(Duration::ZERO);
    let orch = orchestrator(services(client.clone()), 20);

    let err = orch
        .transform("data:image/png;base64,***", TransformType::Light, TransformOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.transform_error().unwrap().kind, ErrorKind::InvalidRequest);
    assert_eq!(client.calls(), 0);
    assert_eq!(orch.state().phase, TransformPhase::Error);
    assert_eq!(orch.history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic_and_ends_at_100() {
    let client = MockClient::failing(Duration::from_millis(50), vec![server_error()]);
    let orch = orchestrator(services(client.clone()), 20);
    let mut events = orch.subscribe();

    orch.transform(source_image(), TransformType::Light, TransformOptions::default())
        .await
        .unwrap();

    let events = drain(&mut events);
    assert!(matches!(events.first(), Some(TransformEvent::Started { .. })));
    assert!(matches!(events.last(), Some(TransformEvent::Completed(_))));

    let progress: Vec<u8> = events.iter().filter_map(TransformEvent::progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&100));

    let phases: Vec<TransformPhase> = events
        .iter()
        .filter_map(|event| match event {
            TransformEvent::Progress { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    for phase in [
        TransformPhase::Preparing,
        TransformPhase::Uploading,
        TransformPhase::Processing,
        TransformPhase::Downloading,
        TransformPhase::Completed,
    ] {
        assert!(phases.contains(&phase), "missing {phase:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_history_keeps_most_recent_entries() {
    let client = MockClient::new(Duration::ZERO);
    let orch = orchestrator(services(client.clone()), 2);

    for value in [0.1, 0.2, 0.3] {
        orch.transform(source_image(), TransformType::Light, strength(value))
            .await
            .unwrap();
    }

    let strengths: Vec<f32> = orch.history().iter().map(|r| r.params.strength).collect();
    assert_eq!(strengths, vec![0.2, 0.3]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_last_transform_only_replays_failures() {
    let auth = TransformError::new(ErrorKind::AuthError, "HTTP 401: bad key");
    let client = MockClient::failing(Duration::ZERO, vec![auth]);
    let orch = orchestrator(services(client.clone()), 20);

    assert_eq!(orch.retry_last_transform().await.unwrap(), None);

    orch.transform(source_image(), TransformType::Heavy, strength(0.7))
        .await
        .unwrap_err();

    let replayed = orch.retry_last_transform().await.unwrap().unwrap();
    assert!(replayed.success);
    assert_eq!(replayed.original_image, source_image());
    assert_eq!(replayed.transform_type, TransformType::Heavy);
    assert_eq!(replayed.params.strength, 0.7);
    assert_eq!(client.calls(), 2);

    assert_eq!(orch.retry_last_transform().await.unwrap(), None);
    assert_eq!(client.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stats_follow_history() {
    let client = MockClient::failing(Duration::ZERO, vec![TransformError::new(ErrorKind::InvalidRequest, "HTTP 400: no")]);
    let orch = orchestrator(services(client.clone()), 20);

    orch.transform(source_image(), TransformType::Light, strength(0.1))
        .await
        .unwrap_err();
    orch.transform(source_image(), TransformType::Light, strength(0.2))
        .await
        .unwrap();

    let stats = orch.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.successful, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.success_rate, 0.5);
    assert!(stats.average_processing_ms.is_some());
    assert_eq!(stats.last_transform_at, orch.state().last_transform_time);
}

#[tokio::test(start_paused = true)]
async fn test_late_identical_request_reuses_settled_flight() {
    let client = MockClient::new(Duration::from_millis(50));
    let shared = services(client.clone());
    let a = orchestrator(shared.clone(), 20);
    let b = orchestrator(shared.clone(), 20);
    let mut b_events = b.subscribe();

    // b misses the cache on entry; a's flight settles while b is uploading
    let (ra, rb) = tokio::join!(
        a.transform(source_image(), TransformType::Light, strength(0.4)),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            b.transform(source_image(), TransformType::Light, strength(0.4)).await
        }
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(client.calls(), 1);
    assert_eq!(ra.attempts, 1);
    assert_eq!(rb.attempts, 0);
    assert_eq!(rb.transformed_image, ra.transformed_image);
    assert!(drain(&mut b_events).contains(&TransformEvent::CacheHit(rb.request_key.clone())));
    assert_eq!(b.state().phase, TransformPhase::Completed);
    assert_eq!(shared.cache_stats().entries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_starter_cancel_leaves_joiner_running() {
    let client = MockClient::new(Duration::from_secs(2));
    let shared = services(client.clone());
    let a = orchestrator(shared.clone(), 20);
    let b = orchestrator(shared.clone(), 20);

    let (ra, rb, _) = tokio::join!(
        a.transform(source_image(), TransformType::Light, strength(0.4)),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            b.transform(source_image(), TransformType::Light, strength(0.4)).await
        },
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            a.cancel_transform();
        }
    );

    assert_eq!(ra.unwrap_err().transform_error().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(a.state().phase, TransformPhase::Cancelled);

    let rb = rb.unwrap();
    assert!(rb.success);
    assert_eq!(rb.attempts, 1);
    assert_eq!(b.state().phase, TransformPhase::Completed);
    assert!(b.history().iter().all(|r| r.success));

    assert_eq!(client.calls(), 1);
    assert_eq!(shared.cache_stats().entries, 1);
    assert_eq!(shared.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_joiner_cancel_leaves_flight_running() {
    let client = MockClient::new(Duration::from_secs(2));
    let shared = services(client.clone());
    let a = orchestrator(shared.clone(), 20);
    let b = orchestrator(shared.clone(), 20);

    let (ra, rb, _) = tokio::join!(
        a.transform(source_image(), TransformType::Light, strength(0.4)),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            b.transform(source_image(), TransformType::Light, strength(0.4)).await
        },
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(shared.in_flight(), 1);
            b.cancel_transform();
        }
    );

    assert_eq!(rb.unwrap_err().transform_error().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(b.state().phase, TransformPhase::Cancelled);

    let ra = ra.unwrap();
    assert!(ra.success);
    assert_eq!(a.state().phase, TransformPhase::Completed);
    assert_eq!(client.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_joiner_sees_flight_retries() {
    let client = MockClient::failing(Duration::from_millis(200), vec![server_error()]);
    let shared = services(client.clone());
    let a = orchestrator(shared.clone(), 20);
    let b = orchestrator(shared.clone(), 20);
    let mut b_events = b.subscribe();

    // b joins at 550ms, before the first attempt fails at 650ms
    let (ra, rb) = tokio::join!(
        a.transform(source_image(), TransformType::Light, strength(0.4)),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            b.transform(source_image(), TransformType::Light, strength(0.4)).await
        }
    );
    assert_eq!(ra.unwrap().attempts, 2);
    assert_eq!(rb.unwrap().attempts, 2);
    assert_eq!(client.calls(), 2);

    let events = drain(&mut b_events);
    assert!(events.contains(&TransformEvent::AttemptFailed {
        attempt: 1,
        error: server_error(),
        retry_in: Some(Duration::from_secs(1)),
    }));
    assert!(events.iter().filter_map(TransformEvent::progress).any(|p| p == 60));
    assert_eq!(a.state().failed_attempts, 1);
    assert_eq!(b.state().failed_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let client = MockClient::failing(Duration::ZERO, vec![server_error()]);
    let shared = services(client.clone());
    let orch = orchestrator(shared.clone(), 20);

    // first attempt fails at 450ms; the 1s backoff runs until 1450ms
    let (result, _) = tokio::join!(
        orch.transform(source_image(), TransformType::Light, TransformOptions::default()),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(orch.state().failed_attempts, 1);
            orch.cancel_transform();
        }
    );

    assert_eq!(result.unwrap_err().transform_error().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(orch.state().phase, TransformPhase::Cancelled);
    assert_eq!(orch.history().pop().unwrap().attempts, 1);
    assert_eq!(shared.in_flight(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(client.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_upload() {
    let client = MockClient::new(Duration::ZERO);
    let shared = services(client.clone());
    let orch = orchestrator(shared.clone(), 20);

    let (result, _) = tokio::join!(
        orch.transform(source_image(), TransformType::Light, TransformOptions::default()),
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(orch.state().phase, TransformPhase::Uploading);
            orch.cancel_transform();
        }
    );

    assert_eq!(result.unwrap_err().transform_error().unwrap().kind, ErrorKind::Cancelled);
    let state = orch.state();
    assert!(!state.is_transforming);
    assert_eq!(state.phase, TransformPhase::Cancelled);
    assert!(state.progress < 40);
    assert_eq!(orch.history().pop().unwrap().attempts, 0);
    assert_eq!(client.calls(), 0);
    assert_eq!(shared.in_flight(), 0);
}
