//! Transform orchestration: cache → single-flight → retried remote attempts.
//!
//! One [`TransformOrchestrator`] runs one transform at a time. Callers that
//! want parallel transforms build several orchestrators over the same
//! [`TransformServices`], which is where the cache and the in-flight registry
//! live.
//!
//! The remote part of a transform (attempts, backoff, download, cache store)
//! is a *flight*. Identical requests share one flight; the flight belongs to
//! none of them, reports its progress to all of them, and is dropped only
//! once every waiting orchestrator has gone.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use chrono::Utc;
use log::{info, warn};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crumple_core::cache::{CacheStats, ResultCache};
use crumple_core::progress::{
    processing_progress, COMPLETE_PROGRESS, DOWNLOADING_PROGRESS, PREPARING_PROGRESS, UPLOAD_PROGRESS,
};
use crumple_core::retry::{RetryDecision, RetryPolicy};
use crumple_core::stats::TransformStats;
use crumple_core::{
    ErrorKind, RequestKey, TransformError, TransformOptions, TransformPhase, TransformProfiles,
    TransformRequest, TransformResult, TransformState, TransformType,
};
use crate::client::TransformClient;
use crate::error::OrchestratorError;
use crate::events::TransformEvent;
use crate::inflight::{Flight, InFlightRegistry, Lookup};
use crate::prepare::{materialize, ImagePreparer};

/// Synthetic upload steps between preparing and processing
pub const UPLOAD_STEPS: u8 = 3;
pub const DEFAULT_UPLOAD_STEP_DELAY: Duration = Duration::from_millis(150);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Completion {
    /// Data URI
    image: String,
    attempts: u32,
}

#[derive(Debug, Clone)]
struct ChainFailure {
    error: TransformError,
    attempts: u32,
}

type FlightOutcome = Result<Completion, ChainFailure>;

/// What a flight reports to the orchestrators waiting on it
#[derive(Debug, Clone)]
enum FlightEvent {
    AttemptStarted,
    AttemptFailed {
        attempt: u32,
        error: TransformError,
        retry_in: Option<Duration>,
    },
    Retrying(u32),
    Downloading,
}

type FlightEvents = broadcast::Sender<FlightEvent>;

/// Collaborators shared between orchestrators
#[derive(Clone)]
pub struct TransformServices {
    client: Arc<dyn TransformClient>,
    preparer: Arc<dyn ImagePreparer>,
    cache: Arc<Mutex<ResultCache<String>>>,
    inflight: InFlightRegistry<FlightOutcome, FlightEvents>,
    retry: RetryPolicy,
}

impl TransformServices {
    pub fn new(
        client: Arc<dyn TransformClient>,
        preparer: Arc<dyn ImagePreparer>,
        cache: ResultCache<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            preparer,
            cache: Arc::new(Mutex::new(cache)),
            inflight: InFlightRegistry::new(),
            retry,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        lock(&self.cache).stats()
    }

    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }

    /// Number of distinct requests currently executing
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn cached(&self, key: &RequestKey) -> Option<String> {
        lock(&self.cache).get(key, Utc::now())
    }

    /// Join the flight for `key`, reuse a result it already stored, or launch it
    fn flight(&self, key: &RequestKey, request: TransformRequest) -> Lookup<FlightOutcome, FlightEvents> {
        self.inflight.get_or_start(
            key,
            || self.cached(key).map(|image| Ok(Completion { image, attempts: 0 })),
            || {
                let (events, _) = broadcast::channel(EVENT_CAPACITY);
                let work = run_flight(
                    self.client.clone(),
                    self.retry,
                    self.cache.clone(),
                    key.clone(),
                    request,
                    events.clone(),
                );
                (work, events)
            },
        )
    }
}

pub struct TransformOrchestrator {
    services: TransformServices,
    profiles: TransformProfiles,
    tracker: Arc<Tracker>,
    upload_step_delay: Duration,
}

impl TransformOrchestrator {
    pub fn new(services: TransformServices, profiles: TransformProfiles, history_cap: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            services,
            profiles,
            tracker: Arc::new(Tracker {
                inner: Mutex::new(TrackerInner {
                    state: TransformState::with_history_cap(history_cap),
                    generation: 0,
                    cancel: None,
                }),
                events,
            }),
            upload_step_delay: DEFAULT_UPLOAD_STEP_DELAY,
        }
    }

    pub fn with_upload_step_delay(mut self, delay: Duration) -> Self {
        self.upload_step_delay = delay;
        self
    }

    pub fn services(&self) -> &TransformServices {
        &self.services
    }

    /// Receive events for every transform started after subscribing
    pub fn subscribe(&self) -> broadcast::Receiver<TransformEvent> {
        self.tracker.events.subscribe()
    }

    /// Run one transform to completion.
    ///
    /// Terminal failures come back as [`OrchestratorError::Transform`] and
    /// are recorded in history once. Validation failures and calls made while
    /// another transform runs are rejected without touching history.
    pub async fn transform(
        &self,
        image: impl Into<String>,
        transform_type: TransformType,
        options: TransformOptions,
    ) -> Result<TransformResult, OrchestratorError> {
        let request = TransformRequest::resolve(image, transform_type, &options, &self.profiles)?;
        let key = request.key();
        let op = self.tracker.begin(&request, &key)?;
        let _guard = AbandonOnDrop(op.clone());

        info!("Transform {} started ({}, key {})", op.id, request.transform_type, key);
        let started = Instant::now();
        let outcome = self.run(&request, &key, &op).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(done) => {
                let result = TransformResult::succeeded(&request, key, done.image, done.attempts, elapsed);
                info!(
                    "Transform {} completed in {} ms after {} attempt(s)",
                    op.id, result.processing_time_ms, result.attempts
                );
                op.finish(result.clone(), TransformPhase::Completed);
                Ok(result)
            }
            Err(ChainFailure { error, attempts }) => {
                let phase = if error.kind == ErrorKind::Cancelled {
                    TransformPhase::Cancelled
                } else {
                    TransformPhase::Error
                };
                warn!("Transform {} failed after {} attempt(s): {}", op.id, attempts, error);
                let result = TransformResult::failed(&request, key, error.clone(), attempts, elapsed);
                op.finish(result, phase);
                Err(error.into())
            }
        }
    }

    /// Best-effort; does nothing when no transform is running. Other
    /// orchestrators sharing the same flight are unaffected.
    pub fn cancel_transform(&self) {
        let inner = lock(&self.tracker.inner);
        if let Some(cancel) = &inner.cancel {
            if !cancel.is_cancelled() {
                info!("Cancelling transform");
                cancel.cancel();
            }
        }
    }

    /// Replay the last transform if it failed; `Ok(None)` otherwise
    pub async fn retry_last_transform(&self) -> Result<Option<TransformResult>, OrchestratorError> {
        let last = lock(&self.tracker.inner).state.history.last().cloned();
        let Some(last) = last.filter(|result| !result.success) else {
            return Ok(None);
        };

        self.transform(last.original_image, last.transform_type, last.params.to_options())
            .await
            .map(Some)
    }

    pub fn state(&self) -> TransformState {
        lock(&self.tracker.inner).state.clone()
    }

    /// Oldest first
    pub fn history(&self) -> Vec<TransformResult> {
        lock(&self.tracker.inner).state.history.to_vec()
    }

    pub fn stats(&self) -> TransformStats {
        TransformStats::from_history(lock(&self.tracker.inner).state.history.iter())
    }

    pub fn clear_cache(&self) {
        self.services.clear_cache();
    }

    pub fn estimated_time_remaining(&self) -> Option<Duration> {
        self.state().estimated_time_remaining(Utc::now())
    }

    async fn run(
        &self,
        request: &TransformRequest,
        key: &RequestKey,
        op: &Operation,
    ) -> Result<Completion, ChainFailure> {
        if let Some(image) = self.services.cached(key) {
            info!("Cache hit for {}", key);
            op.emit(TransformEvent::CacheHit(key.clone()));
            op.advance(TransformPhase::Completed, COMPLETE_PROGRESS);
            return Ok(Completion { image, attempts: 0 });
        }

        op.advance(TransformPhase::Preparing, PREPARING_PROGRESS);
        let prepared = op
            .cancellable(self.services.preparer.prepare(&request.image))
            .await?
            .map_err(|error| ChainFailure { error, attempts: 0 })?;

        let step = (UPLOAD_PROGRESS - PREPARING_PROGRESS) / UPLOAD_STEPS;
        for i in 1..=UPLOAD_STEPS {
            op.cancellable(tokio::time::sleep(self.upload_step_delay)).await?;
            let progress = if i == UPLOAD_STEPS {
                UPLOAD_PROGRESS
            } else {
                PREPARING_PROGRESS + step * i
            };
            op.advance(TransformPhase::Uploading, progress);
        }

        op.advance(TransformPhase::Processing, processing_progress(1));
        let wire_request = TransformRequest {
            image: prepared,
            ..request.clone()
        };
        let lookup = self.services.flight(key, wire_request);
        match lookup.flight {
            Flight::Started => {}
            Flight::Joined => {
                info!("Transform {} joined an identical request in flight", op.id);
                op.emit(TransformEvent::JoinedInFlight(key.clone()));
            }
            Flight::Settled => {
                info!("Transform {} found {} cached while uploading", op.id, key);
                op.emit(TransformEvent::CacheHit(key.clone()));
            }
        }

        let done = op.follow(lookup).await?;
        op.advance(TransformPhase::Completed, COMPLETE_PROGRESS);
        Ok(done)
    }
}

/// Drive the client through the retry policy, then decode and cache the
/// image. The cache write happens before the flight settles, so a caller
/// arriving after the registry entry is gone finds the result cached.
///
/// Runs on its own token, fired only when the flight is dropped.
async fn run_flight(
    client: Arc<dyn TransformClient>,
    policy: RetryPolicy,
    cache: Arc<Mutex<ResultCache<String>>>,
    key: RequestKey,
    request: TransformRequest,
    events: FlightEvents,
) -> FlightOutcome {
    let cancel = CancellationToken::new();
    let _abort = cancel.clone().drop_guard();
    let flight_id = Uuid::new_v4();

    let mut attempt = 1;
    let remote = loop {
        let _ = events.send(FlightEvent::AttemptStarted);
        let attempt_id = format!("{flight_id}-{attempt}");

        let error = match client.execute(&request, &attempt_id, &cancel).await {
            Ok(remote) => break remote,
            Err(error) => error,
        };

        let retry_in = match policy.next_delay(attempt, &error) {
            RetryDecision::RetryAfter(delay) => Some(delay),
            RetryDecision::Stop => None,
        };
        let _ = events.send(FlightEvent::AttemptFailed {
            attempt,
            error: error.clone(),
            retry_in,
        });

        let Some(delay) = retry_in else {
            return Err(ChainFailure { error, attempts: attempt });
        };
        warn!("Attempt {} failed ({}), retrying in {:?}", attempt_id, error, delay);

        tokio::time::sleep(delay).await;
        attempt += 1;
        let _ = events.send(FlightEvent::Retrying(attempt));
    };

    let _ = events.send(FlightEvent::Downloading);
    let image = materialize(&remote.image).map_err(|error| ChainFailure { error, attempts: attempt })?;
    lock(&cache).put(key, image.clone(), Utc::now());

    Ok(Completion { image, attempts: attempt })
}

struct Tracker {
    inner: Mutex<TrackerInner>,
    events: broadcast::Sender<TransformEvent>,
}

struct TrackerInner {
    state: TransformState,
    /// Bumped for every accepted transform; stale handles are ignored
    generation: u64,
    cancel: Option<CancellationToken>,
}

impl Tracker {
    fn begin(self: &Arc<Self>, request: &TransformRequest, key: &RequestKey) -> Result<Operation, OrchestratorError> {
        let mut inner = lock(&self.inner);
        if inner.state.is_transforming {
            return Err(OrchestratorError::AlreadyInProgress);
        }

        inner.generation += 1;
        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());

        let state = &mut inner.state;
        state.is_transforming = true;
        state.phase = TransformPhase::Idle;
        state.progress = 0;
        state.started_at = Some(Utc::now());
        state.failed_attempts = 0;

        let _ = self.events.send(TransformEvent::Started {
            key: key.clone(),
            transform_type: request.transform_type.clone(),
        });

        Ok(Operation {
            id: Uuid::new_v4(),
            generation: inner.generation,
            cancel,
            attempts: Arc::new(AtomicU32::new(0)),
            tracker: self.clone(),
        })
    }

    /// Run `f` only while `generation` is the live operation
    fn with_current(&self, generation: u64, f: impl FnOnce(&mut TrackerInner, &broadcast::Sender<TransformEvent>)) {
        let mut inner = lock(&self.inner);
        if inner.generation == generation && inner.state.is_transforming {
            f(&mut *inner, &self.events);
        }
    }
}

/// Handle on one accepted transform
#[derive(Clone)]
struct Operation {
    id: Uuid,
    generation: u64,
    cancel: CancellationToken,
    /// Attempts seen from the flight; a joiner only counts those made after it joined
    attempts: Arc<AtomicU32>,
    tracker: Arc<Tracker>,
}

impl Operation {
    /// Progress never moves backwards within one operation
    fn advance(&self, phase: TransformPhase, progress: u8) {
        self.tracker.with_current(self.generation, |inner, events| {
            let state = &mut inner.state;
            state.phase = phase;
            state.progress = state.progress.max(progress.min(COMPLETE_PROGRESS));
            let _ = events.send(TransformEvent::Progress {
                phase,
                progress: state.progress,
                eta: state.estimated_time_remaining(Utc::now()),
            });
        });
    }

    fn emit(&self, event: TransformEvent) {
        self.tracker.with_current(self.generation, |_, events| {
            let _ = events.send(event);
        });
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn attempt_failed(&self, attempt: u32, error: TransformError, retry_in: Option<Duration>) {
        self.tracker.with_current(self.generation, |inner, events| {
            inner.state.failed_attempts += 1;
            let _ = events.send(TransformEvent::AttemptFailed { attempt, error, retry_in });
        });
    }

    /// Mirror a flight report into this operation's state and events
    fn observe(&self, event: FlightEvent) {
        match event {
            FlightEvent::AttemptStarted => {
                self.attempts.fetch_add(1, Ordering::SeqCst);
            }
            FlightEvent::AttemptFailed { attempt, error, retry_in } => {
                self.attempt_failed(attempt, error, retry_in);
            }
            FlightEvent::Retrying(attempt) => {
                self.advance(TransformPhase::Processing, processing_progress(attempt));
            }
            FlightEvent::Downloading => {
                self.advance(TransformPhase::Downloading, DOWNLOADING_PROGRESS);
            }
        }
    }

    /// Wait for the flight while relaying its reports. Cancelling stops only
    /// this wait; the flight itself ends once nobody waits on it.
    async fn follow(&self, lookup: Lookup<FlightOutcome, FlightEvents>) -> FlightOutcome {
        let mut outcome = lookup.outcome;
        let mut reports = lookup.watch.map(|events| events.subscribe());

        loop {
            let next = async {
                match reports.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                result = &mut outcome => {
                    if let Some(rx) = reports.as_mut() {
                        while let Ok(event) = rx.try_recv() {
                            self.observe(event);
                        }
                    }
                    return result;
                }
                report = next => match report {
                    Ok(event) => self.observe(event),
                    Err(RecvError::Lagged(missed)) => warn!("Transform {} missed {} flight report(s)", self.id, missed),
                    Err(RecvError::Closed) => reports = None,
                },
            }
        }
    }

    fn cancelled(&self) -> ChainFailure {
        ChainFailure {
            error: TransformError::cancelled(),
            attempts: self.attempts(),
        }
    }

    /// Race `fut` against this operation's cancellation
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, ChainFailure> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancelled()),
            out = fut => Ok(out),
        }
    }

    fn finish(&self, result: TransformResult, phase: TransformPhase) {
        self.tracker.with_current(self.generation, |inner, events| {
            inner.cancel = None;
            let state = &mut inner.state;
            state.is_transforming = false;
            state.phase = phase;
            state.last_transform_time = Some(result.completed_at);
            state.history.push(result.clone());

            let event = if result.success {
                TransformEvent::Completed(result)
            } else {
                TransformEvent::Failed(result)
            };
            let _ = events.send(event);
        });
    }

    /// Tear down an operation whose `transform` future was dropped
    fn abandon(&self) {
        self.tracker.with_current(self.generation, |inner, _| {
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            inner.state.is_transforming = false;
            inner.state.phase = TransformPhase::Cancelled;
            warn!("Transform {} dropped before completion", self.id);
        });
    }
}

struct AbandonOnDrop(Operation);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
