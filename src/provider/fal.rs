//! fal.ai queue API.

use reqwest::{header, Client, Response};
use serde_json::Value;

use crate::conf::ConfProvider;

use super::{JobHandle, JobStatus, ProviderError, QueueProvider};

#[derive(serde::Deserialize)]
struct SubmitResponse {
    request_id: String,
    status_url: Option<String>,
    response_url: Option<String>,
}

#[derive(serde::Deserialize)]
struct StatusResponse {
    status: String,
    queue_position: Option<u64>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Clone)]
pub struct FalClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl FalClient {
    pub fn new(conf: &ConfProvider) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(conf.request_timeout())
            .connect_timeout(conf.connect_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: conf.base_url.trim_end_matches('/').to_string(),
            api_key: conf.api_key.clone(),
        })
    }

    /// Queue paths are keyed by the app id, i.e. the first two segments of
    /// the model path: `fal-ai/flux/schnell` is queued under `fal-ai/flux`.
    fn requests_url(&self, job: &JobHandle) -> String {
        let app_id = job.model.splitn(3, '/').take(2).collect::<Vec<_>>();
        format!(
            "{}/{}/requests/{}",
            self.base_url,
            app_id.join("/"),
            job.request_id
        )
    }

    async fn get(&self, url: &str) -> Result<Response, ProviderError> {
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, format!("Key {}", self.api_key))
            .send()
            .await?;
        ok_or_api_error(response).await
    }
}

#[async_trait::async_trait]
impl QueueProvider for FalClient {
    fn name(&self) -> &str {
        "fal"
    }

    async fn submit(
        &self,
        model: &str,
        input: &Value,
    ) -> Result<JobHandle, ProviderError> {
        let url = format!("{}/{model}", self.base_url);
        tracing::debug!(?url, "Submitting job.");
        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, format!("Key {}", self.api_key))
            .json(input)
            .send()
            .await?;
        let SubmitResponse {
            request_id,
            status_url,
            response_url,
        } = ok_or_api_error(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        tracing::info!(model, request_id, "Job submitted.");
        Ok(JobHandle {
            request_id,
            model: model.to_string(),
            status_url,
            response_url,
        })
    }

    async fn status(&self, job: &JobHandle) -> Result<JobStatus, ProviderError> {
        let url = job
            .status_url
            .clone()
            .unwrap_or_else(|| format!("{}/status", self.requests_url(job)));
        let StatusResponse {
            status,
            queue_position,
            error,
        } = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let status = match (status.as_str(), error) {
            (_, Some(error)) if !error.is_null() => JobStatus::Failed {
                reason: error
                    .as_str()
                    .map_or_else(|| error.to_string(), ToString::to_string),
            },
            ("IN_QUEUE", _) => JobStatus::Queued {
                position: queue_position,
            },
            ("IN_PROGRESS", _) => JobStatus::Running,
            ("COMPLETED", _) => JobStatus::Completed,
            ("FAILED" | "ERROR" | "CANCELLED", _) => JobStatus::Failed {
                reason: status.to_lowercase(),
            },
            (other, _) => {
                return Err(ProviderError::Decode(format!(
                    "unknown job status: {other:?}"
                )));
            }
        };
        Ok(status)
    }

    async fn result(&self, job: &JobHandle) -> Result<Value, ProviderError> {
        let url = job
            .response_url
            .clone()
            .unwrap_or_else(|| self.requests_url(job));
        match self.get(&url).await {
            Ok(response) => response
                .json()
                .await
                .map_err(|e| ProviderError::Decode(e.to_string())),
            // fal reports a failed job's error when its output is fetched.
            Err(ProviderError::Api { status, message })
                if (400..500).contains(&status) =>
            {
                Err(ProviderError::Failed(message))
            }
            Err(error) => Err(error),
        }
    }
}

async fn ok_or_api_error(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let message = response.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }
}
