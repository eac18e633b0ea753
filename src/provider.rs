//! Queue-based inference providers: submit a job, poll it, fetch the output.

pub mod fal;

use std::time::Duration;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub request_id: String,
    pub model: String,
    pub status_url: Option<String>,
    pub response_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued { position: Option<u64> },
    Running,
    Completed,
    Failed { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Could not reach the provider at all.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected provider response: {0}")]
    Decode(String),

    #[error("generation failed: {0}")]
    Failed(String),

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait::async_trait]
pub trait QueueProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(
        &self,
        model: &str,
        input: &Value,
    ) -> Result<JobHandle, ProviderError>;

    async fn status(&self, job: &JobHandle) -> Result<JobStatus, ProviderError>;

    async fn result(&self, job: &JobHandle) -> Result<Value, ProviderError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Status errors tolerated in a row before the wait is abandoned.
const MAX_STATUS_ERRORS: u32 = 3;

/// Polls until the job completes, fails, or `poll.timeout` elapses.
pub async fn wait_for_completion(
    provider: &dyn QueueProvider,
    job: &JobHandle,
    poll: PollSettings,
) -> Result<Value, ProviderError> {
    let waiting = async {
        let mut status_errors = 0;
        loop {
            tokio::time::sleep(poll.interval).await;
            match provider.status(job).await {
                Ok(JobStatus::Completed) => return provider.result(job).await,
                Ok(JobStatus::Failed { reason }) => {
                    return Err(ProviderError::Failed(reason));
                }
                Ok(status) => {
                    status_errors = 0;
                    tracing::debug!(
                        request_id = job.request_id,
                        ?status,
                        "Job not done yet."
                    );
                }
                Err(error) => {
                    status_errors += 1;
                    tracing::warn!(
                        request_id = job.request_id,
                        ?error,
                        status_errors,
                        "Status check failed."
                    );
                    if status_errors >= MAX_STATUS_ERRORS {
                        return Err(error);
                    }
                }
            }
        }
    };
    tokio::time::timeout(poll.timeout, waiting)
        .await
        .map_err(|_| ProviderError::Timeout(poll.timeout))?
}
