//! Browser-automation workflow client used by the playbooks phase.
use crate::context::RunContext;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Ceiling for one workflow call when the context has no deadline.
const DEFAULT_WORKFLOW_TIMEOUT: Duration = Duration::from_secs(300);

/// One playbook execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRequest {
    /// BAS API base, e.g. `http://localhost:19770`.
    pub base_url: String,
    pub name: String,
    pub flow_definition: Value,
    /// UI base URL the playbook navigates from.
    pub start_url: String,
    pub seed_state: Option<Value>,
}

impl WorkflowRequest {
    pub fn payload(&self) -> Value {
        json!({
            "flow_definition": self.flow_definition,
            "parameters": {
                "start_url": self.start_url,
                "seed_state": self.seed_state.clone().unwrap_or(Value::Null),
            },
            "wait_for_completion": true,
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct WorkflowOutcome {
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowOutcome {
    /// An explicit `success` wins; otherwise the status decides.
    pub fn succeeded(&self) -> bool {
        self.success.unwrap_or_else(|| {
            matches!(
                self.status.to_ascii_lowercase().as_str(),
                "completed" | "success" | "succeeded" | "passed"
            )
        })
    }
}

/// Executes playbook workflows; opaque to the orchestrator.
pub trait WorkflowClient: Send + Sync {
    fn execute(&self, ctx: &RunContext, request: &WorkflowRequest) -> Result<WorkflowOutcome>;
}

/// BAS over HTTP.
#[derive(Debug, Clone)]
pub struct HttpWorkflowClient {
    pub max_timeout: Duration,
}

impl Default for HttpWorkflowClient {
    fn default() -> Self {
        Self {
            max_timeout: DEFAULT_WORKFLOW_TIMEOUT,
        }
    }
}

impl WorkflowClient for HttpWorkflowClient {
    fn execute(&self, ctx: &RunContext, request: &WorkflowRequest) -> Result<WorkflowOutcome> {
        ctx.check()?;
        let timeout = ctx
            .remaining()
            .map_or(self.max_timeout, |remaining| remaining.min(self.max_timeout));
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        let url = format!(
            "{}/api/v1/workflows/execute-adhoc",
            request.base_url.trim_end_matches('/')
        );
        tracing::debug!(playbook = request.name.as_str(), url = url.as_str(), "execute workflow");
        let mut response = agent
            .post(&url)
            .send_json(request.payload())
            .with_context(|| format!("POST {url}"))?;
        let status = response.status();
        let body = response
            .body_mut()
            .read_to_string()
            .with_context(|| format!("read response from {url}"))?;
        if !status.is_success() {
            return Err(anyhow!(
                "workflow {} rejected with HTTP {}: {}",
                request.name,
                status.as_u16(),
                body.trim()
            ));
        }
        serde_json::from_str(&body).with_context(|| format!("parse workflow response from {url}"))
    }
}
