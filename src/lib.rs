//! # forgepool
//!
//! A priority-aware worker pool for CPU-heavy calculations.
//!
//! ## Features
//!
//! - **Isolated workers**: every worker is its own OS thread with its own
//!   runtime; a panicking handler takes down one worker, never the pool
//! - **Priority queue**: four priority levels, FIFO within a level, optional
//!   capacity and per-task queue timeouts
//! - **Load balancing**: round-robin, least-busy or random worker selection
//! - **Crash recovery**: lost workers fail their task exactly once and are
//!   replaced with backoff
//! - **Resource limits**: per-attempt timeouts, wall-clock CPU budget and
//!   reported memory limits
//! - **Observability**: `tracing` logs, a broadcast event stream, pool metrics
//!   and optional Prometheus gauges (`metrics` feature)
//!
//! ## Quick Start
//!
//! ```rust
//! use forgepool::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Fibonacci {
//!     n: u32,
//! }
//!
//! #[async_trait]
//! impl CalculationTask for Fibonacci {
//!     type Output = u64;
//!
//!     async fn forge(self, _ctx: TaskContext) -> PoolResult<u64> {
//!         let (mut a, mut b) = (0u64, 1u64);
//!         for _ in 0..self.n {
//!             (a, b) = (b, a + b);
//!         }
//!         Ok(a)
//!     }
//!
//!     fn task_type() -> &'static str {
//!         "fibonacci"
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> PoolResult<()> {
//!     let mut registry = HandlerRegistry::new();
//!     registry.register_typed::<Fibonacci>()?;
//!
//!     let pool = Arc::new(WorkerPool::new(PoolConfig::testing(), registry)?);
//!     pool.start().await?;
//!
//!     let calculator = Calculator::new(Arc::clone(&pool));
//!     assert_eq!(calculator.run(Fibonacci { n: 10 }).await?, 55);
//!
//!     pool.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod facade;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod task;
pub mod utils;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::core::{
        HandlerRegistry, PoolEvent, ShutdownSummary, TaskContext, TaskHandle, TaskHandler,
        WorkerPool,
    };
    pub use crate::error::{PoolError, PoolResult};
    pub use crate::facade::{BenchmarkReport, Calculator, TypedHandle};
    pub use crate::metrics::{PoolHealth, PoolMetrics, WorkerInfo};
    pub use crate::queue::QueueStats;
    pub use crate::task::{
        CalculationTask, Task, TaskError, TaskErrorKind, TaskId, TaskOutcome, TaskPriority,
        TaskStatus,
    };
    pub use async_trait::async_trait;

    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub use crate::metrics::PrometheusExporter;
}

pub use crate::config::*;
pub use crate::core::{HandlerRegistry, PoolEvent, ShutdownSummary, TaskContext, TaskHandle, WorkerPool};
pub use crate::error::{PoolError, PoolResult};
pub use crate::facade::Calculator;
pub use crate::task::{CalculationTask, Task, TaskId, TaskOutcome, TaskPriority, TaskStatus};
pub use async_trait::async_trait;
