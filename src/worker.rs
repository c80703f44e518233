use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, RedisBroker};
use crate::config::{ConfigError, QueueConfig};
use crate::error::{QueueError, RuntimeError};
use crate::job::{after, ClaimedJob, JobEnvelope, JobResult, JobState, JobTransition, Lease};
use crate::lifecycle::RuntimeState;
use crate::registry::{HandlerRegistry, JobError};
use crate::retry::{infra_policy, with_backoff, INFRA_TRIES};
use crate::scheduler::Scheduler;
use crate::store::{ResultStore, SqliteResultStore, StoreError};

const EVENT_CAPACITY: usize = 1024;

/// Builds the handler table. Called at start and again on every reload.
pub type RegistryFactory = Arc<dyn Fn() -> HandlerRegistry + Send + Sync>;

/// Consumer side of the queue: claims jobs, runs them with bounded
/// concurrency, records outcomes and hosts the [`Scheduler`].
///
/// # Example
/// ```ignore
/// let runtime = WorkerRuntime::connect(QueueConfig::from_env(), || {
///     let mut registry = HandlerRegistry::new();
///     registry.register("send_email", send_email);
///     registry
/// })
/// .await?;
/// runtime.start().await?;
/// ```
#[derive(Clone)]
pub struct WorkerRuntime {
    inner: Arc<Inner>,
}

struct Inner {
    worker_id: String,
    config: QueueConfig,
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultStore>,
    factory: RegistryFactory,
    registry: RwLock<Arc<HandlerRegistry>>,
    permits: Arc<Semaphore>,
    state: watch::Sender<RuntimeState>,
    events: broadcast::Sender<JobTransition>,
    shutdown: CancellationToken,
    tasks: Mutex<Tasks>,
}

#[derive(Default)]
struct Tasks {
    claim_loop: Option<(JoinHandle<()>, CancellationToken)>,
    scheduler: Option<JoinHandle<()>>,
}

impl WorkerRuntime {
    pub fn new<F>(
        config: QueueConfig,
        broker: Arc<dyn Broker>,
        results: Arc<dyn ResultStore>,
        factory: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn() -> HandlerRegistry + Send + Sync + 'static,
    {
        config.validate()?;
        let (state, _) = watch::channel(RuntimeState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let worker_id = format!(
            "worker-{}-{}",
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        Ok(Self {
            inner: Arc::new(Inner {
                worker_id,
                permits: Arc::new(Semaphore::new(config.concurrency)),
                config,
                broker,
                results,
                factory: Arc::new(factory),
                registry: RwLock::new(Arc::new(HandlerRegistry::new())),
                state,
                events,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Tasks::default()),
            }),
        })
    }

    /// Connect to the broker and result store named in `config`.
    pub async fn connect<F>(config: QueueConfig, factory: F) -> Result<Self, QueueError>
    where
        F: Fn() -> HandlerRegistry + Send + Sync + 'static,
    {
        config.validate()?;
        let broker = RedisBroker::connect(&config.broker_url, &config.namespace, config.connect_timeout).await?;
        let results = SqliteResultStore::connect(&config.store_url)
            .await
            .map_err(StoreError::from)?;
        Ok(Self::new(config, Arc::new(broker), Arc::new(results), factory)?)
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn state(&self) -> RuntimeState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RuntimeState> {
        self.inner.state.subscribe()
    }

    /// Every job transition made by this runtime or its scheduler.
    pub fn subscribe(&self) -> broadcast::Receiver<JobTransition> {
        self.inner.events.subscribe()
    }

    /// Build the handler table, then start claiming and scheduling.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let mut tasks = self.inner.tasks.lock().await;
        if self.state() != RuntimeState::Idle {
            return Err(RuntimeError::AlreadyStarted);
        }

        self.inner.rebuild_registry();

        let scheduler = Scheduler::new(
            Arc::clone(&self.inner.broker),
            Arc::clone(&self.inner.results),
            self.inner.events.clone(),
            &self.inner.config,
        );
        let shutdown = self.inner.shutdown.clone();
        tasks.scheduler = Some(tokio::spawn(async move { scheduler.run(shutdown).await }));

        self.inner.set_state(RuntimeState::Running);
        tasks.claim_loop = Some(self.inner.spawn_claim_loop());

        info!(
            worker_id = %self.inner.worker_id,
            concurrency = self.inner.config.concurrency,
            "Worker runtime started"
        );
        Ok(())
    }

    /// Swap in a fresh handler table without dropping leased jobs.
    ///
    /// Claiming stops, in-flight attempts get up to `drain_timeout` to finish,
    /// the registry is rebuilt and claiming resumes. Attempts still running
    /// after the drain keep their lease and finish on the old handlers.
    pub async fn reload(&self) -> Result<(), RuntimeError> {
        let mut tasks = self.inner.tasks.lock().await;
        match self.state() {
            RuntimeState::Running => {}
            RuntimeState::Idle => return Err(RuntimeError::NotRunning),
            other => return Err(RuntimeError::ReloadUnsupported(other.to_string())),
        }

        info!(worker_id = %self.inner.worker_id, "Reloading worker runtime");
        self.inner.set_state(RuntimeState::Draining);
        stop_claim_loop(&mut tasks).await;
        self.inner.drain().await;

        self.inner.set_state(RuntimeState::Reloading);
        self.inner.rebuild_registry();

        self.inner.set_state(RuntimeState::Running);
        tasks.claim_loop = Some(self.inner.spawn_claim_loop());
        info!(worker_id = %self.inner.worker_id, "Worker runtime reloaded");
        Ok(())
    }

    /// Stop claiming, drain in-flight attempts and stop the scheduler.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let mut tasks = self.inner.tasks.lock().await;
        match self.state() {
            RuntimeState::Stopped => return Ok(()),
            RuntimeState::Idle => {
                self.inner.shutdown.cancel();
                self.inner.set_state(RuntimeState::Stopped);
                return Ok(());
            }
            _ => {}
        }

        info!(worker_id = %self.inner.worker_id, "Worker runtime shutting down");
        self.inner.set_state(RuntimeState::Draining);
        stop_claim_loop(&mut tasks).await;
        self.inner.drain().await;

        self.inner.shutdown.cancel();
        if let Some(handle) = tasks.scheduler.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler task failed");
            }
        }

        self.inner.set_state(RuntimeState::Stopped);
        info!(worker_id = %self.inner.worker_id, "Worker runtime stopped");
        Ok(())
    }
}

async fn stop_claim_loop(tasks: &mut Tasks) {
    if let Some((handle, stop)) = tasks.claim_loop.take() {
        stop.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "Claim loop task failed");
        }
    }
}

impl Inner {
    fn set_state(&self, next: RuntimeState) {
        let previous = self.state.send_replace(next);
        if !previous.can_transition_to(next) {
            warn!(worker_id = %self.worker_id, from = %previous, to = %next, "Unexpected runtime transition");
        }
        debug!(worker_id = %self.worker_id, from = %previous, to = %next, "Runtime state changed");
    }

    fn registry(&self) -> Arc<HandlerRegistry> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*registry)
    }

    fn rebuild_registry(&self) {
        let fresh = Arc::new((self.factory)());
        info!(worker_id = %self.worker_id, job_types = ?fresh.job_types(), "Handler registry built");
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        *registry = fresh;
    }

    fn spawn_claim_loop(self: &Arc<Self>) -> (JoinHandle<()>, CancellationToken) {
        let stop = CancellationToken::new();
        let inner = Arc::clone(self);
        let token = stop.clone();
        (tokio::spawn(async move { inner.claim_loop(token).await }), stop)
    }

    /// Waits for every permit, which means no attempt is running.
    async fn drain(&self) {
        let total = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        let in_flight = self.config.concurrency.saturating_sub(self.permits.available_permits());
        if in_flight > 0 {
            info!(worker_id = %self.worker_id, in_flight, "Draining in-flight jobs");
        }

        match tokio::time::timeout(self.config.drain_timeout, self.permits.acquire_many(total)).await {
            Ok(Ok(_all)) => debug!(worker_id = %self.worker_id, "Drained"),
            Ok(Err(e)) => error!(error = %e, "Semaphore closed while draining"),
            Err(_) => warn!(
                worker_id = %self.worker_id,
                still_running = self.config.concurrency.saturating_sub(self.permits.available_permits()),
                "Drain timed out, leaving remaining jobs to finish or to the lease reaper"
            ),
        }
    }

    async fn claim_loop(self: Arc<Self>, stop: CancellationToken) {
        debug!(worker_id = %self.worker_id, "Claim loop started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if stop.is_cancelled() || !self.state.borrow().is_claiming() {
                break;
            }

            match self
                .broker
                .claim(&self.worker_id, self.config.lease_duration, Utc::now())
                .await
            {
                Ok(Some(job)) => {
                    let inner = Arc::clone(&self);
                    let registry = self.registry();
                    tokio::spawn(async move { inner.process(job, registry, permit).await });
                }
                Ok(None) => {
                    drop(permit);
                    self.idle(&stop).await;
                }
                Err(e) => {
                    drop(permit);
                    error!(worker_id = %self.worker_id, error = %e, "Failed to claim job");
                    self.idle(&stop).await;
                }
            }
        }

        debug!(worker_id = %self.worker_id, "Claim loop stopped");
    }

    async fn idle(&self, stop: &CancellationToken) {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    /// Runs one claimed attempt to its outcome. `_permit` is held until the attempt is settled.
    async fn process(&self, job: ClaimedJob, registry: Arc<HandlerRegistry>, _permit: OwnedSemaphorePermit) {
        let ClaimedJob { mut envelope, lease } = job;
        self.emit(&envelope, JobState::InProgress);

        // result written but ack lost on an earlier delivery
        match self.results.fetch(&envelope.job_id).await {
            Ok(Some(existing)) => {
                info!(
                    job_id = %envelope.job_id,
                    state = %existing.state,
                    "Job already finished, acknowledging redelivery"
                );
                self.ack(&envelope, &lease).await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(job_id = %envelope.job_id, error = %e, "Could not check for an existing result");
            }
        }

        debug!(
            job_id = %envelope.job_id,
            job_type = %envelope.job_type,
            attempt = envelope.attempt,
            worker_id = %self.worker_id,
            "Processing job"
        );

        let lost = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            Arc::clone(&self.broker),
            lease.clone(),
            self.config.lease_duration,
            lost.clone(),
        ));
        let outcome = registry.execute(&envelope, &lost).await;
        heartbeat.abort();

        match outcome {
            Ok(value) => {
                info!(
                    job_id = %envelope.job_id,
                    job_type = %envelope.job_type,
                    attempt = envelope.attempt,
                    "Job succeeded"
                );
                let result = JobResult::succeeded(&envelope, value);
                self.finish(&mut envelope, &lease, result).await;
            }
            Err(JobError::LeaseLost(_)) => {
                // someone else owns the job now; never ack or release it
                warn!(
                    job_id = %envelope.job_id,
                    job_type = %envelope.job_type,
                    attempt = envelope.attempt,
                    "Lease lost, abandoning attempt"
                );
            }
            Err(e) => {
                warn!(
                    job_id = %envelope.job_id,
                    job_type = %envelope.job_type,
                    attempt = envelope.attempt,
                    error = %e,
                    "Job failed"
                );
                self.handle_failure(&mut envelope, &lease, e).await;
            }
        }
    }

    /// Handle a job failure with retry logic
    async fn handle_failure(&self, envelope: &mut JobEnvelope, lease: &Lease, error: JobError) {
        if !error.is_retryable() || envelope.tries_exhausted() {
            warn!(
                job_id = %envelope.job_id,
                attempt = envelope.attempt,
                max_tries = envelope.max_tries,
                retryable = error.is_retryable(),
                "Job failed permanently"
            );
            let result = JobResult::failed(envelope, error.to_string());
            self.finish(envelope, lease, result).await;
            return;
        }

        let delay = self.config.retry.delay(envelope.attempt);
        let requeue_at = after(Utc::now(), delay);
        info!(
            job_id = %envelope.job_id,
            attempt = envelope.attempt,
            max_tries = envelope.max_tries,
            ?delay,
            "Scheduling job for retry"
        );

        let message = error.to_string();
        let (broker, message) = (&self.broker, &message);
        let released = with_backoff("release", INFRA_TRIES, infra_policy(), BrokerError::is_unavailable, move || {
            broker.release(lease, requeue_at, Some(message.clone()))
        })
        .await;

        match released {
            Ok(()) => self.transition(envelope, JobState::FailedRetryable),
            Err(BrokerError::LeaseLost(_)) => {
                warn!(job_id = %envelope.job_id, "Lease lost before release");
            }
            Err(e) => {
                error!(job_id = %envelope.job_id, error = %e, "Failed to release job, leaving it to the lease reaper");
            }
        }
    }

    /// Record the terminal result, then ack. Without a durable result the job
    /// is not acked, so the lease reaper brings it back.
    async fn finish(&self, envelope: &mut JobEnvelope, lease: &Lease, result: JobResult) {
        let state = result.state;
        let (results, result) = (&self.results, &result);
        let recorded = with_backoff("record result", INFRA_TRIES, infra_policy(), |_: &StoreError| true, move || {
            results.record(result)
        })
        .await;

        match recorded {
            Ok(true) => {}
            Ok(false) => debug!(job_id = %envelope.job_id, "Result already recorded"),
            Err(e) => {
                error!(job_id = %envelope.job_id, error = %e, "Failed to record job result");
                return;
            }
        }

        if self.ack(envelope, lease).await {
            self.transition(envelope, state);
        }
    }

    async fn ack(&self, envelope: &JobEnvelope, lease: &Lease) -> bool {
        let broker = &self.broker;
        match with_backoff("ack", INFRA_TRIES, infra_policy(), BrokerError::is_unavailable, move || {
            broker.ack(lease)
        })
        .await
        {
            Ok(()) => true,
            Err(BrokerError::LeaseLost(_)) => {
                // the reaper owns it; the stored result short-circuits the next delivery
                warn!(job_id = %envelope.job_id, "Lease lost before ack");
                false
            }
            Err(e) => {
                error!(job_id = %envelope.job_id, error = %e, "Failed to ack job");
                false
            }
        }
    }

    fn transition(&self, envelope: &mut JobEnvelope, next: JobState) {
        if let Err(e) = envelope.transition(next) {
            error!(job_id = %envelope.job_id, error = %e, "Unexpected job transition");
            return;
        }
        self.emit(envelope, next);
    }

    fn emit(&self, envelope: &JobEnvelope, state: JobState) {
        let _ = self.events.send(JobTransition {
            job_id: envelope.job_id.clone(),
            state,
            attempt: envelope.attempt,
            at: Utc::now(),
        });
    }
}

/// Renews `lease` every third of `lease_duration` until aborted.
/// Cancels `lost` once the lease is gone.
async fn heartbeat(
    broker: Arc<dyn Broker>,
    mut lease: Lease,
    lease_duration: Duration,
    lost: CancellationToken,
) {
    let period = (lease_duration / 3).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(period).await;
        match broker.renew(&lease, lease_duration, Utc::now()).await {
            Ok(renewed) => {
                debug!(job_id = %lease.job_id, expires_at = %renewed.expires_at, "Lease renewed");
                lease = renewed;
            }
            Err(BrokerError::LeaseLost(_)) => {
                warn!(job_id = %lease.job_id, "Lease renewal refused");
                lost.cancel();
                return;
            }
            Err(e) => {
                warn!(job_id = %lease.job_id, error = %e, "Failed to renew lease");
            }
        }
    }
}
