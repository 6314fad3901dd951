use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use listq_core::ExtractionError;

use crate::engine::{AutomationEngine, CaptureRequest, EngineCapabilities, PageCapture};

/// In-memory engine answering from recorded captures, keyed by requested URL.
#[derive(Debug)]
pub struct FixtureEngine {
    captures: HashMap<String, Result<PageCapture, ExtractionError>>,
    capabilities: EngineCapabilities,
    delay: Option<Duration>,
    requests: Mutex<Vec<CaptureRequest>>,
}

impl Default for FixtureEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureEngine {
    pub fn new() -> Self {
        Self {
            captures: HashMap::new(),
            capabilities: EngineCapabilities {
                network_capture: true,
                markup: true,
            },
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Every capture sleeps this long first, for timeout tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert_capture(&mut self, url: impl Into<String>, capture: PageCapture) {
        self.captures.insert(url.into(), Ok(capture));
    }

    pub fn insert_failure(&mut self, url: impl Into<String>, error: ExtractionError) {
        self.captures.insert(url.into(), Err(error));
    }

    pub fn insert_html(&mut self, url: &str, html: impl Into<String>) {
        self.insert_capture(
            url,
            PageCapture {
                final_url: url.to_string(),
                status: 200,
                html: html.into(),
                responses: Vec::new(),
            },
        );
    }

    /// Loads a `PageCapture` JSON file recorded from a real sidecar.
    pub fn load_capture_file(&mut self, url: &str, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let capture: PageCapture =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        self.insert_capture(url, capture);
        Ok(())
    }

    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.requests
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AutomationEngine for FixtureEngine {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn capabilities(&self) -> Result<EngineCapabilities, ExtractionError> {
        Ok(self.capabilities)
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<PageCapture, ExtractionError> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.captures.get(&request.url) {
            Some(recorded) => recorded.clone(),
            None => Err(ExtractionError::NetworkFailure(format!(
                "no capture recorded for {}",
                request.url
            ))),
        }
    }
}
