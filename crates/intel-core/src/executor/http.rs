use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{ExecutionContext, ExecutorError, ModuleExecutor};
use crate::tracker::LogLevel;

#[derive(Debug, Clone)]
pub struct HttpExecutorConfig {
    /// Endpoint that performs the module's data gathering.
    pub url: String,
    pub request_timeout: Duration,
}

/// Delegates a module to a remote worker over HTTP.
///
/// POSTs `{entity_id, module, entity}` and expects a JSON object back. The
/// request is made while holding an automation session, so cancelling the
/// run aborts the request in flight.
pub struct HttpExecutor {
    config: HttpExecutorConfig,
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(config: HttpExecutorConfig) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ExecutorError::Http(e.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl ModuleExecutor for HttpExecutor {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutorError> {
        if ctx.is_cancelled() {
            debug!(module = %ctx.module(), "run already cancelled, not dispatching");
            return Err(ExecutorError::SessionClosed);
        }
        let session = ctx.acquire_session();
        let body = json!({
            "entity_id": ctx.entity_id(),
            "module": ctx.module(),
            "entity": ctx.entity,
        });
        debug!(module = %ctx.module(), url = %self.config.url, "dispatching module request");
        ctx.log(
            format!("requesting {}", ctx.entity.display_name()),
            LogLevel::Info,
        );

        let response = session
            .run(self.client.post(&self.config.url).json(&body).send())
            .await?
            .map_err(|e| ExecutorError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = session
                .run(response.text())
                .await?
                .unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(ExecutorError::Http(format!("{status}: {snippet}")));
        }

        let value: serde_json::Value = session
            .run(response.json())
            .await?
            .map_err(|e| ExecutorError::InvalidResult(e.to_string()))?;
        ctx.log("response received", LogLevel::Success);
        Ok(value)
    }
}
