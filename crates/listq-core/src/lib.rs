//! Core job model, failure taxonomy and result validation for listq.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod status;
mod validate;

pub use status::{is_finished, normalize, JobStatus, NormalizedStatus};
pub use validate::{
    classify, extract_id_from_payload, extract_id_from_url, identity_check, IdentityCheck,
    Outcome,
};

pub const CRATE_NAME: &str = "listq-core";

/// One queued extraction request, as read back from the job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub url: String,
    pub user_id: Option<String>,
    pub status: NormalizedStatus,
    pub retry_after: Option<DateTime<Utc>>,
    pub warnings: Option<String>,
    /// Attempt number of the current (or last) claim, starting at 1.
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceItem {
    pub name: String,
    pub price: Option<String>,
}

/// Listing data pulled out of one page load.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub title: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub site: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub services: Vec<ServiceItem>,
    /// Object identifier as found in the fetched content itself.
    pub source_id: Option<String>,
}

impl ExtractedRecord {
    pub fn is_sparse(&self) -> bool {
        self.title.is_none() && self.address.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Parse the structured responses the page requests internally.
    Network,
    /// Walk the rendered markup.
    Markup,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Network => "network",
            StrategyKind::Markup => "markup",
        }
    }

    pub fn other(&self) -> StrategyKind {
        match self {
            StrategyKind::Network => StrategyKind::Markup,
            StrategyKind::Markup => StrategyKind::Network,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "network" | "capture" | "network-capture" => Ok(StrategyKind::Network),
            "markup" | "dom" | "markup-parse" => Ok(StrategyKind::Markup),
            other => Err(format!("unknown extraction strategy: {other}")),
        }
    }
}

/// What an extraction strategy hands to the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    pub requested_url: String,
    pub final_url: String,
    pub strategy: StrategyKind,
    pub record: ExtractedRecord,
    /// Raw markup or captured JSON the record was parsed from.
    pub snapshot: String,
    pub content_type: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("extraction timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("redirected to login page {final_url}")]
    LoginWall { final_url: String },
    #[error("anti-bot challenge served at {final_url}")]
    CaptchaChallenge { final_url: String },
}

impl ExtractionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractionError::NetworkFailure(_) => FailureKind::NetworkFailure,
            ExtractionError::Timeout(_) => FailureKind::Timeout,
            ExtractionError::LoginWall { .. } => FailureKind::LoginWall,
            ExtractionError::CaptchaChallenge { .. } => FailureKind::CaptchaChallenge,
        }
    }
}

/// Every way a job attempt can fail to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NetworkFailure,
    Timeout,
    LoginWall,
    CaptchaChallenge,
    IdentityMismatch,
    EmptyPayload,
    StorageFailure,
}

impl FailureKind {
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::NetworkFailure => "network_failure",
            FailureKind::Timeout => "timeout",
            FailureKind::LoginWall => "login_wall",
            FailureKind::CaptchaChallenge => "captcha_challenge",
            FailureKind::IdentityMismatch => "identity_mismatch",
            FailureKind::EmptyPayload => "empty_payload",
            FailureKind::StorageFailure => "storage_failure",
        }
    }

    /// Will most likely succeed on a plain retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::NetworkFailure | FailureKind::Timeout | FailureKind::StorageFailure
        )
    }

    /// The request pattern was flagged; a quick retry repeats the challenge.
    pub fn needs_intervention(&self) -> bool {
        matches!(self, FailureKind::LoginWall | FailureKind::CaptchaChallenge)
    }

    /// Page loaded but the data is not what we asked for; the strategy may need updating.
    pub fn indicates_shape_change(&self) -> bool {
        matches!(self, FailureKind::IdentityMismatch | FailureKind::EmptyPayload)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

pub const WARNING_SEPARATOR: &str = "; ";
pub const ATTEMPT_CODE: &str = "attempt";
pub const RETRIES_EXHAUSTED_CODE: &str = "retries_exhausted";

/// One machine-parsable diagnostic, rendered as `code` or `code:detail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub code: String,
    pub detail: Option<String>,
}

impl Warning {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: None,
        }
    }

    pub fn with_detail(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn attempt(attempt: u32) -> Self {
        Self::with_detail(ATTEMPT_CODE, attempt.to_string())
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) if self.code == ATTEMPT_CODE => write!(f, "{}={}", self.code, detail),
            Some(detail) => write!(f, "{}:{}", self.code, detail),
            None => f.write_str(&self.code),
        }
    }
}

pub fn render_warnings(warnings: &[Warning]) -> Option<String> {
    if warnings.is_empty() {
        return None;
    }
    Some(
        warnings
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(WARNING_SEPARATOR),
    )
}

pub fn parse_warnings(text: &str) -> Vec<Warning> {
    text.split(';')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            if let Some(rest) = token.strip_prefix("attempt=") {
                return Warning::with_detail(ATTEMPT_CODE, rest.trim());
            }
            match token.split_once(':') {
                Some((code, detail)) => Warning::with_detail(code.trim(), detail.trim()),
                None => Warning::new(token),
            }
        })
        .collect()
}

/// Attempt number carried in warnings text, for job tables without an attempts column.
pub fn attempt_from_warnings(text: &str) -> Option<u32> {
    parse_warnings(text)
        .into_iter()
        .filter(|w| w.code == ATTEMPT_CODE)
        .filter_map(|w| w.detail.and_then(|d| d.parse().ok()))
        .last()
}

/// `text` with its attempt token replaced by `attempt`.
pub fn with_attempt_token(text: Option<&str>, attempt: u32) -> String {
    let mut warnings: Vec<Warning> = text
        .map(parse_warnings)
        .unwrap_or_default()
        .into_iter()
        .filter(|w| w.code != ATTEMPT_CODE)
        .collect();
    warnings.push(Warning::attempt(attempt));
    render_warnings(&warnings).unwrap_or_default()
}
