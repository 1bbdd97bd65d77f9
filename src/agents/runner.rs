//! Producer runner - timeout, retry and short-circuit around producer calls

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::traits::{ProduceResult, Producer};
use crate::coordinator::state::CycleContext;
use crate::error::{FailureKind, ProducerFailure};
use crate::events::{CycleEvent, EventBus, EventPayload, ProducerFailedEvent};

/// Retry policy for producer calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Per-attempt timeout
    pub attempt_timeout_ms: u64,
    /// Retries after the first attempt (transient failures only)
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_backoff_ms: u64,
    /// Maximum backoff delay
    pub max_backoff_ms: u64,
    /// Consecutive failures of one source before its retries are skipped
    pub source_failure_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 5_000,
            max_retries: 2,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            source_failure_threshold: 5,
        }
    }
}

impl RetryPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let delay = self
            .base_backoff_ms
            .saturating_mul(2u64.saturating_pow(retry_count));
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Per-cycle consecutive failure counts by source name
#[derive(Debug, Default)]
pub struct SourceHealth {
    failures: DashMap<String, u32>,
}

impl SourceHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, source: &str) -> u32 {
        let mut entry = self.failures.entry(source.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn record_success(&self, source: &str) {
        self.failures.remove(source);
    }

    pub fn failures(&self, source: &str) -> u32 {
        self.failures.get(source).map(|v| *v).unwrap_or(0)
    }
}

/// Wraps producer calls for one cycle.
#[derive(Clone)]
pub struct ProducerRunner {
    policy: RetryPolicy,
    bus: EventBus,
    halt: watch::Receiver<bool>,
    health: Arc<SourceHealth>,
    cycle_id: Uuid,
}

impl ProducerRunner {
    pub fn new(
        policy: RetryPolicy,
        bus: EventBus,
        halt: watch::Receiver<bool>,
        cycle_id: Uuid,
    ) -> Self {
        Self {
            policy,
            bus,
            halt,
            health: Arc::new(SourceHealth::new()),
            cycle_id,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn health(&self) -> &SourceHealth {
        &self.health
    }

    pub fn is_halted(&self) -> bool {
        *self.halt.borrow()
    }

    fn is_tripped(&self, source: &str) -> bool {
        self.health.failures(source) >= self.policy.source_failure_threshold
    }

    /// Run a [`Producer`] for one instrument.
    pub async fn call<P: Producer>(
        &self,
        ctx: &CycleContext,
        producer: &P,
        symbol: &str,
        input: &P::Input,
    ) -> ProduceResult<P::Output> {
        self.run(producer.name(), symbol, || producer.produce(ctx, input))
            .await
    }

    /// Run any producer-shaped call with the cycle's retry policy.
    ///
    /// Every failed attempt is published as `ProducerFailed`. Only
    /// `Timeout` and `SourceUnavailable` are retried; a halt observed during
    /// backoff ends the call with `Cancelled`.
    pub async fn run<T, F, Fut>(&self, source: &str, symbol: &str, mut call: F) -> ProduceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProduceResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if self.is_halted() {
                return Err(ProducerFailure::new(
                    FailureKind::Cancelled,
                    format!("{}: halt requested", source),
                ));
            }
            attempt += 1;

            let outcome = match tokio::time::timeout(self.policy.attempt_timeout(), call()).await {
                Ok(result) => result,
                Err(_) => Err(ProducerFailure::timeout(format!(
                    "{} exceeded {}ms for {}",
                    source, self.policy.attempt_timeout_ms, symbol
                ))),
            };

            let failure = match outcome {
                Ok(value) => {
                    self.health.record_success(source);
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            // Checked before counting this failure so the attempt that trips
            // the source still follows the normal retry rule.
            let already_tripped = self.is_tripped(source);
            self.health.record_failure(source);

            let terminal = !failure.kind.is_retryable()
                || attempt > self.policy.max_retries
                || already_tripped;
            self.report_failure(source, symbol, &failure, attempt, terminal)
                .await;

            if terminal {
                if already_tripped {
                    debug!("{} short-circuited for {} after repeated failures", source, symbol);
                }
                return Err(failure);
            }

            let delay = self.policy.backoff_duration(attempt - 1);
            debug!(
                "{} failed for {} ({}), retry {} in {:?}",
                source, symbol, failure.kind, attempt, delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_halt(self.halt.clone()) => {
                    let cancelled = ProducerFailure::new(
                        FailureKind::Cancelled,
                        format!("{}: halt observed during backoff", source),
                    );
                    self.report_failure(source, symbol, &cancelled, attempt, true).await;
                    return Err(cancelled);
                }
            }
        }
    }

    /// Publish a `ProducerFailed` event, logging terminal failures.
    pub async fn report_failure(
        &self,
        source: &str,
        symbol: &str,
        failure: &ProducerFailure,
        attempt: u32,
        terminal: bool,
    ) {
        if terminal {
            warn!(
                producer = source,
                symbol,
                kind = %failure.kind,
                attempt,
                "producer failed: {}",
                failure.message
            );
        }
        let event = ProducerFailedEvent {
            producer: source.to_string(),
            symbol: symbol.to_string(),
            kind: failure.kind,
            message: failure.message.clone(),
            attempt,
            terminal,
        };
        self.bus
            .publish(CycleEvent::new(
                self.cycle_id,
                source,
                EventPayload::ProducerFailed(event),
            ))
            .await;
    }
}

/// Resolves once the halt flag is set. Never resolves if the sender is gone.
pub async fn wait_for_halt(mut halt: watch::Receiver<bool>) {
    loop {
        if *halt.borrow_and_update() {
            return;
        }
        if halt.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempt_timeout_ms: 50,
            max_retries: 2,
            base_backoff_ms: 5,
            max_backoff_ms: 20,
            source_failure_threshold: 100,
        }
    }

    fn runner(policy: RetryPolicy) -> (ProducerRunner, watch::Sender<bool>, EventBus) {
        let bus = EventBus::new();
        let (tx, rx) = watch::channel(false);
        (ProducerRunner::new(policy, bus.clone(), rx, Uuid::nil()), tx, bus)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_duration(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_duration(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_duration(40), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_until_success() {
        let (runner, _halt, _bus) = runner(fast_policy());
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = runner
            .run("kis", "005930", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProducerFailure::unavailable("503"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(runner.health().failures("kis"), 0);
    }

    #[tokio::test]
    async fn invalid_data_is_not_retried() {
        let (runner, _halt, bus) = runner(fast_policy());
        let mut failures = bus.subscribe(Topic::ProducerFailed, "test").await;
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: ProduceResult<()> = runner
            .run("kis", "005930", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProducerFailure::invalid("negative volume"))
            })
            .await;
        assert_eq!(result.unwrap_err().kind, FailureKind::InvalidData);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let event = failures.next().await.unwrap();
        match event.payload {
            EventPayload::ProducerFailed(f) => {
                assert!(f.terminal);
                assert_eq!(f.symbol, "005930");
                assert_eq!(f.attempt, 1);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_call_times_out_after_all_retries() {
        let (runner, _halt, bus) = runner(fast_policy());
        let mut failures = bus.subscribe(Topic::ProducerFailed, "test").await;
        let result: ProduceResult<()> = runner
            .run("kis", "000660", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;
        assert_eq!(result.unwrap_err().kind, FailureKind::Timeout);

        bus.close().await;
        let events: Vec<_> = failures.by_ref().collect().await;
        assert_eq!(events.len(), 3);
        let terminal: Vec<bool> = events
            .iter()
            .map(|e| match &e.payload {
                EventPayload::ProducerFailed(f) => f.terminal,
                _ => false,
            })
            .collect();
        assert_eq!(terminal, vec![false, false, true]);
    }

    #[tokio::test]
    async fn tripped_source_skips_retries() {
        let policy = RetryPolicy {
            source_failure_threshold: 2,
            ..fast_policy()
        };
        let (runner, _halt, _bus) = runner(policy);
        runner.health().record_failure("news");
        runner.health().record_failure("news");

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: ProduceResult<()> = runner
            .run("news", "005930", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProducerFailure::unavailable("down"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn halt_during_backoff_cancels_within_one_interval() {
        let policy = RetryPolicy {
            base_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..fast_policy()
        };
        let (runner, halt, _bus) = runner(policy);
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .run("kis", "005930", || async {
                        Err::<(), _>(ProducerFailure::unavailable("503"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        halt.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("runner should observe halt")
            .unwrap();
        assert_eq!(result.unwrap_err().kind, FailureKind::Cancelled);
    }

    #[tokio::test]
    async fn halted_runner_does_not_call() {
        let (runner, halt, _bus) = runner(fast_policy());
        halt.send(true).unwrap();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: ProduceResult<()> = runner
            .run("kis", "005930", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(result.unwrap_err().kind, FailureKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
