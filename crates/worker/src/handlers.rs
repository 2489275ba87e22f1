//! Built-in job kinds shipped with the worker binary

use std::time::Duration;

use serde::Deserialize;
use taskflow_core::prelude::*;
use taskflow_core::RegistryError;
use tracing::info;

/// Logs the payload and succeeds
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn execute(&self, ctx: &JobContext, payload: Value) -> Result<(), ExecutionFailure> {
        info!(job_id = %ctx.job_id, attempt = ctx.attempt, %payload, "log job");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct SleepPayload {
    pub millis: u64,

    /// Fail every attempt before this one (1-based)
    #[serde(default)]
    pub succeed_on_attempt: Option<u32>,
}

/// Sleeps, then optionally fails; useful for exercising retries and leases
pub struct SleepHandler;

#[async_trait]
impl TypedJobHandler for SleepHandler {
    const KIND: &'static str = "sleep";

    type Payload = SleepPayload;

    async fn execute(&self, ctx: &JobContext, payload: SleepPayload) -> Result<(), ExecutionFailure> {
        tokio::time::sleep(Duration::from_millis(payload.millis)).await;

        match payload.succeed_on_attempt {
            Some(n) if ctx.attempt < n => Err(ExecutionFailure::new(format!(
                "attempt {} of {}: not yet",
                ctx.attempt, ctx.max_attempts
            ))),
            _ => Ok(()),
        }
    }
}

pub fn registry() -> Result<HandlerRegistry, RegistryError> {
    let mut registry = HandlerRegistry::new();
    registry.register("log", LogHandler)?;
    registry.register_typed(SleepHandler)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(attempt: u32) -> JobContext {
        JobContext {
            job_id: JobId::new(),
            kind: "sleep".to_string(),
            attempt,
            max_attempts: 3,
            worker_id: "test".to_string(),
        }
    }

    #[test]
    fn test_registry_kinds() {
        let registry = registry().unwrap();
        assert!(registry.contains("log"));
        assert!(registry.contains("sleep"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_succeeds_on_attempt() {
        let registry = registry().unwrap();
        let handler = registry.get("sleep").unwrap();
        let payload = json!({"millis": 10, "succeed_on_attempt": 2});

        assert!(handler.execute(&ctx(1), payload.clone()).await.is_err());
        assert!(handler.execute(&ctx(2), payload).await.is_ok());
    }

    #[tokio::test]
    async fn test_sleep_rejects_bad_payload() {
        let registry = registry().unwrap();
        let handler = registry.get("sleep").unwrap();

        let err = handler.execute(&ctx(1), json!({"millis": "soon"})).await.unwrap_err();
        assert!(err.message.starts_with("invalid payload"));
    }
}
