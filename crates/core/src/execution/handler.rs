//! Job handlers and the kind registry

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::job::{Job, JobId};

/// What a handler knows about the attempt it is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: JobId,
    pub kind: String,

    /// 1-based number of this attempt
    pub attempt: u32,

    pub max_attempts: u32,

    /// Worker running the attempt
    pub worker_id: String,
}

impl JobContext {
    pub fn for_job(job: &Job, worker_id: impl Into<String>) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind.clone(),
            attempt: job.attempt_count + 1,
            max_attempts: job.max_attempts,
            worker_id: worker_id.into(),
        }
    }

    /// Whether a failure now dead-letters the job
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A failed attempt; drives retry and backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExecutionFailure {}

impl From<anyhow::Error> for ExecutionFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for ExecutionFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid payload: {err}"))
    }
}

/// The work unit behind a job kind
///
/// Executions are at-least-once: a handler may run again for the same job
/// after a crash or lease loss, so side effects should be idempotent.
///
/// # Example
///
/// ```ignore
/// use taskflow_core::prelude::*;
///
/// struct SendEmail;
///
/// #[async_trait]
/// impl JobHandler for SendEmail {
///     async fn execute(&self, ctx: &JobContext, payload: Value) -> Result<(), ExecutionFailure> {
///         // Send email...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn execute(&self, ctx: &JobContext, payload: Value) -> Result<(), ExecutionFailure>;
}

/// A handler with a typed payload and a fixed kind
#[async_trait]
pub trait TypedJobHandler: Send + Sync + 'static {
    /// Kind this handler is registered under
    const KIND: &'static str;

    type Payload: DeserializeOwned + Send;

    async fn execute(&self, ctx: &JobContext, payload: Self::Payload) -> Result<(), ExecutionFailure>;
}

/// Adapts a [`TypedJobHandler`]: malformed payloads fail the attempt
struct Typed<H>(H);

#[async_trait]
impl<H: TypedJobHandler> JobHandler for Typed<H> {
    async fn execute(&self, ctx: &JobContext, payload: Value) -> Result<(), ExecutionFailure> {
        let payload: H::Payload = serde_json::from_value(payload)?;
        self.0.execute(ctx, payload).await
    }
}

/// Adapts an async closure
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ExecutionFailure>> + Send + 'static,
{
    async fn execute(&self, ctx: &JobContext, payload: Value) -> Result<(), ExecutionFailure> {
        (self.0)(ctx.clone(), payload).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler already registered for kind: {0}")]
    Duplicate(String),

    #[error("job kind must not be empty")]
    EmptyKind,
}

/// Maps job kinds to handlers
///
/// Built before the dispatcher starts and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: JobHandler>(
        &mut self,
        kind: impl Into<String>,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_arc(kind, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        kind: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        let kind = kind.into();
        if kind.trim().is_empty() {
            return Err(RegistryError::EmptyKind);
        }
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::Duplicate(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(&mut self, kind: impl Into<String>, f: F) -> Result<(), RegistryError>
    where
        F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ExecutionFailure>> + Send + 'static,
    {
        self.register(kind, FnHandler(f))
    }

    /// Register a typed handler under its own kind
    pub fn register_typed<H: TypedJobHandler>(&mut self, handler: H) -> Result<(), RegistryError> {
        self.register(H::KIND, Typed(handler))
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(kind: &str, attempt: u32, max_attempts: u32) -> JobContext {
        JobContext {
            job_id: JobId::new(),
            kind: kind.to_string(),
            attempt,
            max_attempts,
            worker_id: "test".to_string(),
        }
    }

    #[derive(Deserialize)]
    struct Greeting {
        name: String,
    }

    struct Greeter;

    #[async_trait]
    impl TypedJobHandler for Greeter {
        const KIND: &'static str = "greet";
        type Payload = Greeting;

        async fn execute(&self, _ctx: &JobContext, payload: Greeting) -> Result<(), ExecutionFailure> {
            if payload.name.is_empty() {
                return Err(ExecutionFailure::new("name is empty"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_fn_and_execute() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("echo", |ctx, payload| async move {
                assert_eq!(ctx.kind, "echo");
                if payload["fail"] == json!(true) {
                    Err(ExecutionFailure::new("asked to fail"))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        let handler = registry.get("echo").unwrap();
        assert!(handler.execute(&ctx("echo", 1, 3), json!({})).await.is_ok());
        let err = handler
            .execute(&ctx("echo", 1, 3), json!({"fail": true}))
            .await
            .unwrap_err();
        assert_eq!(err.message, "asked to fail");
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_malformed_payload() {
        let mut registry = HandlerRegistry::new();
        registry.register_typed(Greeter).unwrap();
        let handler = registry.get("greet").unwrap();

        assert!(handler
            .execute(&ctx("greet", 1, 1), json!({"name": "ada"}))
            .await
            .is_ok());

        let err = handler
            .execute(&ctx("greet", 1, 1), json!({"nom": "ada"}))
            .await
            .unwrap_err();
        assert!(err.message.starts_with("invalid payload"));
    }

    #[test]
    fn test_duplicate_and_empty_kinds_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register_typed(Greeter).unwrap();

        assert_eq!(
            registry.register_typed(Greeter).unwrap_err(),
            RegistryError::Duplicate("greet".to_string())
        );
        assert_eq!(
            registry
                .register_fn(" ", |_, _| async { Ok(()) })
                .unwrap_err(),
            RegistryError::EmptyKind
        );
        assert_eq!(registry.kinds(), vec!["greet".to_string()]);
    }

    #[test]
    fn test_context_attempt_numbering() {
        assert!(!ctx("k", 1, 3).is_last_attempt());
        assert!(ctx("k", 3, 3).is_last_attempt());
    }

    #[test]
    fn test_failure_from_anyhow_keeps_chain() {
        let err = anyhow::anyhow!("disk full").context("writing report");
        let failure = ExecutionFailure::from(err);
        assert_eq!(failure.message, "writing report: disk full");
    }
}
