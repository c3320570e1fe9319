use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::workflow::{JobRunner, WorkflowDefinition, WorkflowHandle};

const DEFAULT_BASE_URL: &str = "https://api.groundx.ai/api";
const ENV_BASE_URL: &str = "GROUNDX_BASE_URL";
const ENV_API_KEY: &str = "GROUNDX_API_KEY";

#[derive(Debug, Clone)]
pub struct RemoteRunnerConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl RemoteRunnerConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var(ENV_API_KEY)
            .map_err(|_| PipelineError::Config(format!("{} is not set", ENV_API_KEY)))?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var(ENV_BASE_URL) {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        Ok(config)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowEnvelope {
    workflow: Option<WorkflowBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowBody {
    workflow_id: Option<String>,
    name: Option<String>,
}

/// Job runner reached over HTTP. Create posts the full definition, update puts it to the
/// workflow's id; the service replaces its stored copy either way.
#[derive(Clone)]
pub struct HttpJobRunner {
    client: Client,
    config: RemoteRunnerConfig,
}

impl HttpJobRunner {
    pub fn new(config: RemoteRunnerConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn read_handle(
        &self,
        res: reqwest::Response,
        workflow: &str,
        fallback_id: Option<&str>,
    ) -> Result<WorkflowHandle> {
        let status = res.status();
        if !status.is_success() {
            let error_text = res.text().await?;
            return Err(PipelineError::Runner {
                workflow: workflow.to_string(),
                details: format!("status {}: {}", status, error_text),
            });
        }

        let body: WorkflowEnvelope = res.json().await?;
        let body = body.workflow.ok_or_else(|| PipelineError::Runner {
            workflow: workflow.to_string(),
            details: "response missing 'workflow'".to_string(),
        })?;

        let workflow_id = body
            .workflow_id
            .or_else(|| fallback_id.map(str::to_string))
            .ok_or_else(|| PipelineError::Runner {
                workflow: workflow.to_string(),
                details: "response missing 'workflowId'".to_string(),
            })?;

        Ok(WorkflowHandle {
            workflow_id,
            name: body.name.unwrap_or_else(|| workflow.to_string()),
        })
    }
}

#[async_trait]
impl JobRunner for HttpJobRunner {
    async fn create(&self, definition: &WorkflowDefinition) -> Result<WorkflowHandle> {
        let url = format!("{}/v1/workflow", self.config.base_url);
        debug!("POST {}", url);

        let res = self
            .client
            .post(&url)
            .header("X-API-Key", &self.config.api_key)
            .json(definition)
            .send()
            .await?;

        let handle = self.read_handle(res, definition.name(), None).await?;
        info!("Job runner accepted workflow {}", handle.workflow_id);
        Ok(handle)
    }

    async fn update(
        &self,
        handle: &WorkflowHandle,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowHandle> {
        let url = format!("{}/v1/workflow/{}", self.config.base_url, handle.workflow_id);
        debug!("PUT {}", url);

        let res = self
            .client
            .put(&url)
            .header("X-API-Key", &self.config.api_key)
            .json(definition)
            .send()
            .await?;

        self.read_handle(res, definition.name(), Some(&handle.workflow_id))
            .await
    }
}
