//! Queued-unit-of-work abstraction: a task descriptor with a bounded retry
//! policy and timeout ceiling, executed by the runner.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::warn;
use vegops_core::SyncTrigger;

#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub operation: String,
    pub parameters: serde_json::Value,
    /// Total attempts, including the first.
    pub tries: u32,
    pub timeout: Duration,
}

impl JobDescriptor {
    pub fn new(operation: &str, parameters: serde_json::Value) -> Self {
        Self {
            operation: operation.to_string(),
            parameters,
            tries: 3,
            timeout: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct JobContext {
    pub trigger: SyncTrigger,
    /// 1-based attempt number.
    pub attempt: u32,
}

#[async_trait]
pub trait PipelineJob: Send + Sync {
    fn descriptor(&self) -> JobDescriptor;
    async fn execute(&self, ctx: &JobContext) -> Result<()>;
}

/// Executes a job with the descriptor's bounded-attempt retry and per-attempt
/// timeout. Re-runs only on error; the final error is propagated.
#[derive(Debug, Default, Clone, Copy)]
pub struct JobRunner;

impl JobRunner {
    pub async fn run(&self, job: &dyn PipelineJob, trigger: SyncTrigger) -> Result<()> {
        let descriptor = job.descriptor();
        let tries = descriptor.tries.max(1);
        let mut last_error = None;

        for attempt in 1..=tries {
            let ctx = JobContext { trigger, attempt };
            match tokio::time::timeout(descriptor.timeout, job.execute(&ctx)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => {
                    warn!(
                        operation = %descriptor.operation,
                        attempt,
                        tries,
                        error = %format!("{err:#}"),
                        "job attempt failed"
                    );
                    last_error = Some(err);
                }
                Err(_) => {
                    warn!(operation = %descriptor.operation, attempt, tries, "job attempt timed out");
                    last_error = Some(anyhow!(
                        "operation {} timed out after {:?}",
                        descriptor.operation,
                        descriptor.timeout
                    ));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("job produced no attempts")))
    }
}
