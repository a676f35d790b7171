//! Handler registry for task types.
//!
//! A [`HandlerRegistry`] maps type tags to [`TaskHandler`]s. It is built by the
//! pool owner before the pool starts and frozen afterwards: submission resolves
//! each task's type tag to a dense [`HandlerId`] once, and workers receive the
//! handler table at startup and index into it directly.
//!
//! # Examples
//!
//! ```rust
//! use forgepool::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Square {
//!     value: i64,
//! }
//!
//! #[async_trait]
//! impl CalculationTask for Square {
//!     type Output = i64;
//!
//!     async fn forge(self, _ctx: TaskContext) -> PoolResult<i64> {
//!         Ok(self.value * self.value)
//!     }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_typed::<Square>()?;
//! registry.register_fn("echo", |payload, _ctx| async move {
//!     Ok::<_, PoolError>(payload)
//! })?;
//! assert!(registry.resolve("echo").is_some());
//! # Ok::<(), PoolError>(())
//! ```

use crate::core::worker::TaskContext;
use crate::error::{PoolError, PoolResult};
use crate::task::CalculationTask;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Executes tasks of one type from their serialized payload.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task and return its serialized output.
    async fn execute(&self, payload: Value, ctx: TaskContext) -> PoolResult<Value>;

    /// Type tag this handler serves.
    fn task_type(&self) -> &str;
}

/// Position of a handler in the frozen handler table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerId(u32);

impl HandlerId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    task_type: String,
    handler: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PoolResult<Value>> + Send + 'static,
{
    async fn execute(&self, payload: Value, ctx: TaskContext) -> PoolResult<Value> {
        (self.handler)(payload, ctx).await
    }

    fn task_type(&self) -> &str {
        &self.task_type
    }
}

/// Handler that decodes the payload into a [`CalculationTask`]
pub struct TypedHandler<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for TypedHandler<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: CalculationTask> TaskHandler for TypedHandler<T> {
    async fn execute(&self, payload: Value, ctx: TaskContext) -> PoolResult<Value> {
        let task: T = serde_json::from_value(payload)?;
        let output = task.forge(ctx).await?;
        Ok(serde_json::to_value(output)?)
    }

    fn task_type(&self) -> &str {
        T::task_type()
    }
}

/// Type tag → handler table
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn TaskHandler>>,
    index: HashMap<String, HandlerId>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own type tag.
    ///
    /// Registering the same tag twice is a configuration error.
    pub fn register(&mut self, handler: impl TaskHandler + 'static) -> PoolResult<HandlerId> {
        let task_type = handler.task_type().to_string();
        if task_type.trim().is_empty() {
            return Err(PoolError::config("handler type tag must not be empty"));
        }
        if self.index.contains_key(&task_type) {
            return Err(PoolError::config(format!(
                "a handler for task type '{task_type}' is already registered"
            )));
        }

        let id = HandlerId(self.handlers.len() as u32);
        self.handlers.push(Arc::new(handler));
        self.index.insert(task_type.clone(), id);

        tracing::debug!("🔨 Registered handler for task type: {}", task_type);
        Ok(id)
    }

    /// Register an async closure as the handler for `task_type`.
    pub fn register_fn<F, Fut>(
        &mut self,
        task_type: impl Into<String>,
        handler: F,
    ) -> PoolResult<HandlerId>
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PoolResult<Value>> + Send + 'static,
    {
        self.register(FnHandler {
            task_type: task_type.into(),
            handler,
        })
    }

    /// Register a typed calculation under [`CalculationTask::task_type`].
    pub fn register_typed<T: CalculationTask>(&mut self) -> PoolResult<HandlerId> {
        self.register(TypedHandler::<T>::default())
    }

    /// Resolve a type tag.
    pub fn resolve(&self, task_type: &str) -> Option<HandlerId> {
        self.index.get(task_type).copied()
    }

    /// Check if a task type is registered
    pub fn is_registered(&self, task_type: &str) -> bool {
        self.index.contains_key(task_type)
    }

    /// All registered type tags, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.index.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The frozen table handed to workers at startup.
    pub(crate) fn handler_table(&self) -> Arc<[Arc<dyn TaskHandler>]> {
        self.handlers.iter().cloned().collect()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::worker::TaskContext;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, Serialize, Deserialize)]
    struct AddTask {
        a: i64,
        b: i64,
    }

    #[async_trait]
    impl CalculationTask for AddTask {
        type Output = i64;

        async fn forge(self, _ctx: TaskContext) -> PoolResult<Self::Output> {
            Ok(self.a + self.b)
        }

        fn task_type() -> &'static str {
            "add"
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct DivideTask {
        a: i64,
        b: i64,
    }

    #[async_trait]
    impl CalculationTask for DivideTask {
        type Output = i64;

        async fn forge(self, _ctx: TaskContext) -> PoolResult<Self::Output> {
            if self.b == 0 {
                return Err(PoolError::task_execution("division by zero", None));
            }
            Ok(self.a / self.b)
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        let add = registry.register_typed::<AddTask>().unwrap();
        let echo = registry
            .register_fn("echo", |payload, _ctx| async move {
                Ok::<_, PoolError>(payload)
            })
            .unwrap();

        assert_ne!(add, echo);
        assert_eq!(registry.resolve("add"), Some(add));
        assert_eq!(registry.resolve("echo"), Some(echo));
        assert_eq!(registry.resolve("missing"), None);
        assert_eq!(registry.task_types(), ["add", "echo"]);
        assert_eq!(registry.handler_table().len(), 2);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = HandlerRegistry::new();
        assert_ok!(registry.register_typed::<AddTask>());
        let err = assert_err!(registry.register_typed::<AddTask>());
        assert!(matches!(err, PoolError::ConfigError { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_default_type_tag_is_type_name() {
        let mut registry = HandlerRegistry::new();
        registry.register_typed::<DivideTask>().unwrap();
        assert!(registry.is_registered(std::any::type_name::<DivideTask>()));
    }

    #[tokio::test]
    async fn test_typed_handler_execution() {
        let handler = TypedHandler::<AddTask>::default();
        let result = handler
            .execute(json!({"a": 2, "b": 40}), TaskContext::detached("t1"))
            .await
            .unwrap();
        assert_eq!(result, json!(42));

        let bad = handler
            .execute(json!({"a": "two"}), TaskContext::detached("t2"))
            .await;
        assert!(matches!(bad, Err(PoolError::SerializationError(_))));
    }

    #[tokio::test]
    async fn test_typed_handler_error() {
        let handler = TypedHandler::<DivideTask>::default();
        let err = handler
            .execute(json!({"a": 1, "b": 0}), TaskContext::detached("t"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }
}
