use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use listq_core::ExtractionError;
use reqwest::StatusCode;
use tracing::debug;

use crate::engine::{AutomationEngine, CaptureRequest, EngineCapabilities, PageCapture};

/// Slack on top of the page budget for the sidecar to answer.
const RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// Headless-browser sidecar reached over HTTP:
/// `GET {base}/capabilities` and `POST {base}/capture`.
#[derive(Debug, Clone)]
pub struct RemoteBrowserEngine {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteBrowserEngine {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building engine http client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

fn request_error(err: reqwest::Error, budget: Duration) -> ExtractionError {
    if err.is_timeout() {
        ExtractionError::Timeout(budget)
    } else {
        ExtractionError::NetworkFailure(err.to_string())
    }
}

fn status_error(status: StatusCode, endpoint: &str, budget: Duration) -> ExtractionError {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ExtractionError::Timeout(budget),
        _ => ExtractionError::NetworkFailure(format!("engine answered {status} at {endpoint}")),
    }
}

#[async_trait]
impl AutomationEngine for RemoteBrowserEngine {
    fn name(&self) -> &str {
        "remote-browser"
    }

    async fn capabilities(&self) -> Result<EngineCapabilities, ExtractionError> {
        let endpoint = self.endpoint("capabilities");
        let budget = Duration::from_secs(10);
        let resp = self
            .client
            .get(&endpoint)
            .timeout(budget)
            .send()
            .await
            .map_err(|err| request_error(err, budget))?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &endpoint, budget));
        }
        resp.json::<EngineCapabilities>()
            .await
            .map_err(|err| ExtractionError::NetworkFailure(format!("decoding capabilities: {err}")))
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<PageCapture, ExtractionError> {
        let endpoint = self.endpoint("capture");
        let budget = request.timeout();
        debug!(url = %request.url, mode = %request.mode, "requesting page capture");
        let resp = self
            .client
            .post(&endpoint)
            .timeout(budget + RESPONSE_GRACE)
            .json(request)
            .send()
            .await
            .map_err(|err| request_error(err, budget))?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &endpoint, budget));
        }
        resp.json::<PageCapture>()
            .await
            .map_err(|err| request_error(err, budget))
    }
}
