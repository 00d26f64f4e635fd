//! Serving a master over HTTP and polling for asynchronous outcomes.

use bosun_api::{AppState, create_router};
use bosun_scheduler::Master;
use reqwest::{Client, Response};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Serve the API for `master` on an ephemeral local port.
pub async fn start_test_server(master: Arc<Master>) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = create_router(Arc::new(AppState::new(master)));
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            panic!("test server failed: {e}");
        }
    });
    Ok((addr, handle))
}

/// Thin reqwest wrapper rooted at a served master.
#[derive(Clone)]
pub struct ApiTestClient {
    http: Client,
    base: String,
}

impl ApiTestClient {
    pub fn new(addr: SocketAddr) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            http,
            base: format!("http://{addr}"),
        }
    }

    pub async fn get(&self, path: &str) -> reqwest::Result<Response> {
        self.http.get(format!("{}{path}", self.base)).send().await
    }

    pub async fn post<T: Serialize>(&self, path: &str, body: &T) -> reqwest::Result<Response> {
        self.http
            .post(format!("{}{path}", self.base))
            .json(body)
            .send()
            .await
    }

    /// POST with no body.
    pub async fn post_empty(&self, path: &str) -> reqwest::Result<Response> {
        self.http.post(format!("{}{path}", self.base)).send().await
    }

    pub async fn health(&self) -> anyhow::Result<bool> {
        Ok(self.get("/health").await?.status().is_success())
    }
}

/// Poll `condition` every `interval` until it holds or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// [`wait_for`] with a five second budget, panicking with `what` on timeout.
pub async fn eventually<F, Fut>(what: &str, condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    if !wait_for(Duration::from_secs(5), Duration::from_millis(10), condition).await {
        panic!("timed out waiting for {what}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_checks_before_sleeping() {
        let start = Instant::now();
        assert!(wait_for(Duration::from_secs(1), Duration::from_secs(1), || async { true }).await);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_wait_for_gives_up() {
        let mut polls = 0;
        let held = wait_for(Duration::from_millis(50), Duration::from_millis(10), || {
            polls += 1;
            async { false }
        })
        .await;
        assert!(!held);
        assert!(polls >= 2);
    }
}
