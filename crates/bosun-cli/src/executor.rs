//! Build executors: where started builds are handed off.

use async_trait::async_trait;
use bosun_core::build::{BuildAssignment, StartOutcome};
use bosun_core::ids::BuildId;
use bosun_core::ports::BuildExecutor;
use bosun_core::{Error, Result};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Accepts every build and only logs it.
pub struct LoggingExecutor;

#[async_trait]
impl BuildExecutor for LoggingExecutor {
    async fn start_build(&self, assignment: &BuildAssignment) -> Result<StartOutcome> {
        info!(
            build_id = %assignment.build_id,
            builder = %assignment.builder,
            worker = %assignment.worker,
            requests = assignment.request_ids.len(),
            reason = %assignment.reason,
            "Build assigned"
        );
        Ok(StartOutcome::Started)
    }

    async fn cancel_build(&self, build_id: BuildId, reason: &str) -> Result<()> {
        info!(build_id = %build_id, reason = %reason, "Build cancellation requested");
        Ok(())
    }
}

#[derive(Serialize)]
struct CancelBody<'a> {
    reason: &'a str,
}

/// Posts assignments to an external execution service.
///
/// `POST {url}/builds` starts a build: 2xx means started, 409 or 503 means
/// the worker refused it. `POST {url}/builds/{id}/cancel` cancels one.
pub struct WebhookExecutor {
    client: Client,
    base_url: String,
}

impl WebhookExecutor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Executor(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BuildExecutor for WebhookExecutor {
    async fn start_build(&self, assignment: &BuildAssignment) -> Result<StartOutcome> {
        let res = self
            .client
            .post(format!("{}/builds", self.base_url))
            .json(assignment)
            .send()
            .await
            .map_err(|e| Error::Executor(e.to_string()))?;

        let status = res.status();
        if status.is_success() {
            debug!(build_id = %assignment.build_id, "Webhook accepted build");
            return Ok(StartOutcome::Started);
        }
        match status {
            StatusCode::CONFLICT | StatusCode::SERVICE_UNAVAILABLE => {
                let body = res.text().await.unwrap_or_default();
                let reason = if body.is_empty() {
                    status.to_string()
                } else {
                    body
                };
                Ok(StartOutcome::Rejected { reason })
            }
            _ => Err(Error::Executor(format!("webhook returned {status}"))),
        }
    }

    async fn cancel_build(&self, build_id: BuildId, reason: &str) -> Result<()> {
        let res = self
            .client
            .post(format!("{}/builds/{}/cancel", self.base_url, build_id))
            .json(&CancelBody { reason })
            .send()
            .await
            .map_err(|e| Error::Executor(e.to_string()))?;
        if res.status().is_success() || res.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Error::Executor(format!("cancel returned {}", res.status())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_core::properties::Properties;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn assignment() -> BuildAssignment {
        BuildAssignment {
            build_id: BuildId::new(),
            builder: "b1".into(),
            worker: "w1".into(),
            request_ids: vec![],
            sourcestamps: vec![],
            properties: Properties::new(),
            reason: "test".into(),
        }
    }

    async fn executor_for(server: &MockServer) -> WebhookExecutor {
        WebhookExecutor::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_accepted_build() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/builds"))
            .and(body_partial_json(serde_json::json!({"builder": "b1", "worker": "w1"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = executor_for(&server).await.start_build(&assignment()).await.unwrap();
        assert_eq!(outcome, StartOutcome::Started);
    }

    #[tokio::test]
    async fn test_busy_worker_rejects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/builds"))
            .respond_with(ResponseTemplate::new(409).set_body_string("worker busy"))
            .mount(&server)
            .await;

        let outcome = executor_for(&server).await.start_build(&assignment()).await.unwrap();
        assert_eq!(
            outcome,
            StartOutcome::Rejected {
                reason: "worker busy".into()
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_is_executor_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = executor_for(&server).await.start_build(&assignment()).await;
        assert!(matches!(result, Err(Error::Executor(_))));
    }

    #[tokio::test]
    async fn test_cancel_posts_reason() {
        let server = MockServer::start().await;
        let build_id = BuildId::new();
        Mock::given(method("POST"))
            .and(path(format!("/builds/{build_id}/cancel")))
            .and(body_partial_json(serde_json::json!({"reason": "superseded"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        executor_for(&server)
            .await
            .cancel_build(build_id, "superseded")
            .await
            .unwrap();
    }
}
