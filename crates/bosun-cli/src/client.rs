//! HTTP client for a running master.

use bosun_core::change::{Change, NewChange};
use reqwest::{Client, StatusCode};
use std::fmt;

#[derive(Debug)]
pub enum ApiError {
    Request(reqwest::Error),
    Server(String),
    Rejected(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Request(e) => write!(f, "Request failed: {}", e),
            ApiError::Server(msg) => write!(f, "Server error: {}", msg),
            ApiError::Rejected(msg) => write!(f, "Rejected: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/api/v1{}", self.base_url, path);
        self.client.request(method, &url)
    }

    pub async fn add_change(&self, change: &NewChange) -> Result<Change, ApiError> {
        let res = self
            .request(reqwest::Method::POST, "/changes")
            .json(change)
            .send()
            .await
            .map_err(ApiError::Request)?;

        match res.status() {
            StatusCode::OK | StatusCode::CREATED => res.json().await.map_err(ApiError::Request),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(ApiError::Rejected(res.text().await.unwrap_or_default()))
            }
            status => Err(ApiError::Server(status.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_add_change_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/changes"))
            .and(body_partial_json(serde_json::json!({"who": "dev", "branch": "main"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "number": 7,
                "who": "dev",
                "branch": "main",
                "when": "2026-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri());
        let change = client
            .add_change(&NewChange::new("dev").with_branch("main"))
            .await
            .unwrap();
        assert_eq!(change.number, 7);
    }

    #[tokio::test]
    async fn test_add_change_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri());
        let err = client.add_change(&NewChange::new("dev")).await.unwrap_err();
        assert!(matches!(err, ApiError::Server(_)));
    }
}
