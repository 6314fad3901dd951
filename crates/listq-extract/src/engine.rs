//! Boundary to the page-rendering engine and the request-metadata collaborator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use listq_core::{ExtractionError, StrategyKind};
use serde::{Deserialize, Serialize};

/// Network identity the engine should present for one page load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestProfile {
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
}

pub trait ProfileProvider: Send + Sync {
    fn next_profile(&self) -> RequestProfile;
}

/// Round-robin over configured user agents and proxies. The two pools
/// rotate independently.
#[derive(Debug, Default)]
pub struct RotatingProfiles {
    user_agents: Vec<String>,
    proxies: Vec<String>,
    cursor: AtomicUsize,
}

impl RotatingProfiles {
    pub fn new(user_agents: Vec<String>, proxies: Vec<String>) -> Self {
        Self {
            user_agents,
            proxies,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Builds the pools from comma-separated lists; blank entries are skipped.
    pub fn from_lists(user_agents: &str, proxies: &str) -> Self {
        Self::new(split_list(user_agents), split_list(proxies))
    }

    pub fn is_empty(&self) -> bool {
        self.user_agents.is_empty() && self.proxies.is_empty()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn pick(pool: &[String], n: usize) -> Option<String> {
    if pool.is_empty() {
        None
    } else {
        Some(pool[n % pool.len()].clone())
    }
}

impl ProfileProvider for RotatingProfiles {
    fn next_profile(&self) -> RequestProfile {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        RequestProfile {
            user_agent: pick(&self.user_agents, n),
            proxy: pick(&self.proxies, n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub url: String,
    pub mode: StrategyKind,
    pub timeout_ms: u64,
    pub profile: RequestProfile,
    /// URL substrings of the internal responses worth keeping.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_filter: Vec<String>,
}

impl CaptureRequest {
    pub fn new(url: &str, mode: StrategyKind, timeout: Duration, profile: RequestProfile) -> Self {
        Self {
            url: url.to_string(),
            mode,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            profile,
            response_filter: Vec::new(),
        }
    }

    pub fn with_response_filter(mut self, filter: &[String]) -> Self {
        self.response_filter = filter.to_vec();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub url: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub content_type: String,
    pub body: String,
}

/// What the engine saw while loading one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCapture {
    pub final_url: String,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub responses: Vec<CapturedResponse>,
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    #[serde(default)]
    pub network_capture: bool,
    #[serde(default)]
    pub markup: bool,
}

impl EngineCapabilities {
    pub fn supports(&self, kind: StrategyKind) -> bool {
        match kind {
            StrategyKind::Network => self.network_capture,
            StrategyKind::Markup => self.markup,
        }
    }
}

#[async_trait]
pub trait AutomationEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn capabilities(&self) -> Result<EngineCapabilities, ExtractionError>;

    async fn capture(&self, request: &CaptureRequest) -> Result<PageCapture, ExtractionError>;
}

const CAPTCHA_MARKERS: &[&str] = &["showcaptcha", "/captcha", "smart-captcha", "checkcaptcha"];
const LOGIN_PATH_MARKERS: &[&str] = &["/login", "/auth", "/signin", "/passport"];

/// Classifies a loaded page as an anti-bot challenge or a login redirect.
pub fn detect_challenge(capture: &PageCapture) -> Option<ExtractionError> {
    let final_url = capture.final_url.to_ascii_lowercase();
    let html = capture.html.to_ascii_lowercase();

    if CAPTCHA_MARKERS
        .iter()
        .any(|marker| final_url.contains(marker) || html.contains(marker))
    {
        return Some(ExtractionError::CaptchaChallenge {
            final_url: capture.final_url.clone(),
        });
    }

    let host = final_url
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("");
    let on_login_host = host.starts_with("passport.") || host.starts_with("login.");
    if on_login_host || LOGIN_PATH_MARKERS.iter().any(|marker| final_url.contains(marker)) {
        return Some(ExtractionError::LoginWall {
            final_url: capture.final_url.clone(),
        });
    }
    None
}

/// Rejects captures that cannot carry listing data.
pub fn inspect_capture(capture: &PageCapture) -> Result<(), ExtractionError> {
    if let Some(challenge) = detect_challenge(capture) {
        return Err(challenge);
    }
    if capture.status == 401 {
        return Err(ExtractionError::LoginWall {
            final_url: capture.final_url.clone(),
        });
    }
    if capture.status >= 400 {
        return Err(ExtractionError::NetworkFailure(format!(
            "target answered {} for {}",
            capture.status, capture.final_url
        )));
    }
    Ok(())
}
