//! Typed convenience layer over [`WorkerPool`].
//!
//! [`Calculator`] submits [`CalculationTask`] values, decodes their outputs and
//! retries failed attempts from the caller's side. The pool itself never
//! re-enqueues a task.

use crate::core::{TaskHandle, WorkerPool};
use crate::error::{PoolError, PoolResult};
use crate::task::{CalculationTask, Task, TaskErrorKind, TaskOutcome};
use crate::utils::calculate_backoff;
use futures::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

/// Base delay between caller-side retries, in milliseconds
const RETRY_BASE_MS: u64 = 100;

/// A [`TaskHandle`] that decodes the output into `O`.
#[derive(Debug)]
pub struct TypedHandle<O> {
    inner: TaskHandle,
    _output: PhantomData<fn() -> O>,
}

impl<O: DeserializeOwned> TypedHandle<O> {
    /// Id of the submitted task
    pub fn task_id(&self) -> &str {
        self.inner.task_id()
    }

    /// The raw outcome, without decoding.
    pub async fn outcome(self) -> PoolResult<TaskOutcome> {
        self.inner.await
    }

    /// Wait at most `limit`; see [`TaskHandle::wait_timeout`].
    pub async fn wait_timeout(self, limit: Duration) -> PoolResult<O> {
        decode(self.inner.wait_timeout(limit).await?)
    }
}

impl<O: DeserializeOwned> Future for TypedHandle<O> {
    type Output = PoolResult<O>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|outcome| outcome.and_then(decode))
    }
}

fn decode<O: DeserializeOwned>(outcome: TaskOutcome) -> PoolResult<O> {
    Ok(serde_json::from_value(outcome.into_result()?)?)
}

/// Timing summary of [`Calculator::benchmark`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    /// Runs submitted
    pub iterations: usize,
    /// Runs that completed successfully
    pub successes: usize,
    /// Runs that failed, timed out or were lost
    pub failures: usize,
    /// Fastest execution among successful runs
    pub min: Option<Duration>,
    /// Slowest execution among successful runs
    pub max: Option<Duration>,
    /// Mean execution time of successful runs
    pub mean: Option<Duration>,
    /// Submit of the first run to the last outcome
    pub wall_time: Duration,
    /// Finished runs per second of wall time
    pub throughput: f64,
}

/// Typed front end for calculation tasks.
#[derive(Clone)]
pub struct Calculator {
    pool: Arc<WorkerPool>,
}

impl Calculator {
    /// Wrap a pool. The pool must be started before submitting.
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    /// The underlying pool
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Submit once and return a typed handle.
    pub async fn submit<T: CalculationTask>(&self, task: &T) -> PoolResult<TypedHandle<T::Output>> {
        let inner = self.pool.submit(build_task(task)?).await?;
        Ok(TypedHandle {
            inner,
            _output: PhantomData,
        })
    }

    /// Run a calculation to completion, retrying failed attempts.
    ///
    /// The retry budget is the smaller of the task's own budget and the
    /// pool's `max_retries`. Cancelled and shut-down tasks are not retried.
    pub async fn run<T: CalculationTask>(&self, task: T) -> PoolResult<T::Output> {
        let budget = task.max_retries().min(self.pool.config().workers.max_retries);
        let template = build_task(&task)?;

        let mut attempt = 0;
        loop {
            let mut submitted = template.clone();
            submitted.id = uuid::Uuid::new_v4().to_string();
            submitted.retry_attempts = attempt;

            let outcome = self.pool.submit(submitted).await?.await?;
            let retryable = outcome.error.as_ref().is_some_and(|error| {
                !matches!(error.kind, TaskErrorKind::Cancelled | TaskErrorKind::Shutdown)
            });

            match decode(outcome) {
                Err(e) if retryable && attempt < budget => {
                    attempt += 1;
                    let delay = calculate_backoff(attempt, RETRY_BASE_MS);
                    tracing::warn!(
                        "🔨 {} attempt {} failed, retrying in {}ms: {}",
                        template.task_type,
                        attempt,
                        delay,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                result => return result,
            }
        }
    }

    /// Run several calculations concurrently. Results keep the input order.
    pub async fn run_batch<T: CalculationTask>(&self, tasks: Vec<T>) -> Vec<PoolResult<T::Output>> {
        join_all(tasks.into_iter().map(|task| self.run(task))).await
    }

    /// Submit `iterations` copies of `task` at once and time their execution.
    pub async fn benchmark<T: CalculationTask>(
        &self,
        task: &T,
        iterations: usize,
    ) -> PoolResult<BenchmarkReport> {
        if iterations == 0 {
            return Err(PoolError::validation("benchmark needs at least one iteration"));
        }

        let started = Instant::now();
        let mut handles = Vec::with_capacity(iterations);
        for _ in 0..iterations {
            handles.push(self.pool.submit(build_task(task)?).await?);
        }
        let outcomes = join_all(handles).await;
        let wall_time = started.elapsed();

        let mut durations = Vec::with_capacity(iterations);
        let mut failures = 0;
        for outcome in outcomes {
            match outcome {
                Ok(outcome) if outcome.success => {
                    durations.extend(outcome.execution_time);
                }
                _ => failures += 1,
            }
        }

        let successes = iterations - failures;
        let mean = (!durations.is_empty())
            .then(|| durations.iter().sum::<Duration>() / durations.len() as u32);
        let report = BenchmarkReport {
            iterations,
            successes,
            failures,
            min: durations.iter().min().copied(),
            max: durations.iter().max().copied(),
            mean,
            wall_time,
            throughput: if wall_time.is_zero() {
                0.0
            } else {
                iterations as f64 / wall_time.as_secs_f64()
            },
        };

        tracing::info!(
            "🔨 Benchmark {}: {}/{} succeeded in {:?} ({:.1} tasks/s)",
            T::task_type(),
            successes,
            iterations,
            wall_time,
            report.throughput
        );
        Ok(report)
    }
}

fn build_task<T: CalculationTask>(task: &T) -> PoolResult<Task> {
    let mut builder = Task::builder()
        .with_type(T::task_type())
        .with_json(task)?
        .with_priority(task.priority())
        .with_retries(task.max_retries());
    if let Some(timeout) = task.timeout() {
        builder = builder.with_timeout(timeout);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::core::{HandlerRegistry, TaskContext};
    use crate::task::TaskPriority;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Multiply {
        a: i64,
        b: i64,
    }

    #[async_trait]
    impl CalculationTask for Multiply {
        type Output = i64;

        async fn forge(self, _ctx: TaskContext) -> PoolResult<i64> {
            Ok(self.a * self.b)
        }

        fn task_type() -> &'static str {
            "multiply"
        }

        fn priority(&self) -> TaskPriority {
            TaskPriority::High
        }
    }

    static FLAKY_CALLS: AtomicU32 = AtomicU32::new(0);

    /// Fails on its first two executions.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Flaky;

    #[async_trait]
    impl CalculationTask for Flaky {
        type Output = u32;

        async fn forge(self, _ctx: TaskContext) -> PoolResult<u32> {
            let call = FLAKY_CALLS.fetch_add(1, Ordering::SeqCst);
            if call < 2 {
                return Err(PoolError::task_execution("not yet", None));
            }
            Ok(call)
        }

        fn task_type() -> &'static str {
            "flaky"
        }

        fn max_retries(&self) -> u32 {
            5
        }
    }

    async fn start_calculator(max_retries: u32) -> Calculator {
        let mut registry = HandlerRegistry::new();
        registry.register_typed::<Multiply>().unwrap();
        registry.register_typed::<Flaky>().unwrap();

        let mut config = PoolConfig::testing();
        config.workers.max_retries = max_retries;
        let pool = WorkerPool::new(config, registry).unwrap();
        pool.start().await.unwrap();
        Calculator::new(Arc::new(pool))
    }

    #[tokio::test]
    async fn test_typed_submit_and_batch() {
        let calculator = start_calculator(0).await;

        let handle = calculator.submit(&Multiply { a: 6, b: 7 }).await.unwrap();
        assert_eq!(assert_ok!(handle.await), 42);

        let results = calculator
            .run_batch((1..=4).map(|a| Multiply { a, b: 10 }).collect())
            .await;
        let values: Vec<i64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, [10, 20, 30, 40]);

        calculator.pool().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_retries_within_budget() {
        // the pool budget caps the task's own budget of 5
        let capped = start_calculator(1).await;
        FLAKY_CALLS.store(0, Ordering::SeqCst);
        let err = assert_err!(capped.run(Flaky).await);
        assert!(matches!(err, PoolError::TaskFailed { .. }));
        assert_eq!(FLAKY_CALLS.load(Ordering::SeqCst), 2);
        capped.pool().shutdown().await.unwrap();

        let generous = start_calculator(3).await;
        FLAKY_CALLS.store(0, Ordering::SeqCst);
        assert_eq!(generous.run(Flaky).await.unwrap(), 2);
        generous.pool().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_benchmark_report() {
        let calculator = start_calculator(0).await;

        let report = calculator
            .benchmark(&Multiply { a: 2, b: 3 }, 5)
            .await
            .unwrap();
        assert_eq!(report.iterations, 5);
        assert_eq!(report.successes, 5);
        assert_eq!(report.failures, 0);
        assert!(report.min <= report.mean && report.mean <= report.max);
        assert!(report.throughput > 0.0);

        assert!(calculator.benchmark(&Multiply { a: 1, b: 1 }, 0).await.is_err());
        calculator.pool().shutdown().await.unwrap();
    }
}
