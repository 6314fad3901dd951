//! Job lifecycle vocabulary.
//!
//! Reads tolerate historical drift (legacy tokens, casing, blanks); writes
//! only ever use [`JobStatus::as_str`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical job status. This is the only vocabulary the core writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Captcha,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Error,
        JobStatus::Captcha,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Captcha => "captcha",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Error)
                | (Processing, Captcha)
                | (Processing, Pending)
                | (Error, Pending)
                | (Captcha, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(Some(s)) {
            NormalizedStatus::Canonical(status) => Ok(status),
            NormalizedStatus::Unrecognized(raw) => Err(raw),
        }
    }
}

/// Result of reading a raw status value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizedStatus {
    Canonical(JobStatus),
    /// Token outside the vocabulary, returned verbatim so callers can log drift.
    Unrecognized(String),
}

impl NormalizedStatus {
    pub fn canonical(&self) -> Option<JobStatus> {
        match self {
            NormalizedStatus::Canonical(status) => Some(*status),
            NormalizedStatus::Unrecognized(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NormalizedStatus::Canonical(status) => status.as_str(),
            NormalizedStatus::Unrecognized(raw) => raw.as_str(),
        }
    }
}

impl PartialEq<JobStatus> for NormalizedStatus {
    fn eq(&self, other: &JobStatus) -> bool {
        self.canonical() == Some(*other)
    }
}

/// Legacy tokens that map onto a canonical status.
const LEGACY_ALIASES: &[(&str, JobStatus)] = &[("done", JobStatus::Completed)];

pub fn normalize(raw: Option<&str>) -> NormalizedStatus {
    let Some(raw) = raw else {
        return NormalizedStatus::Canonical(JobStatus::Pending);
    };
    let token = raw.trim().to_lowercase();
    if token.is_empty() {
        return NormalizedStatus::Canonical(JobStatus::Pending);
    }
    if let Some((_, status)) = LEGACY_ALIASES.iter().find(|(alias, _)| *alias == token) {
        return NormalizedStatus::Canonical(*status);
    }
    JobStatus::ALL
        .iter()
        .find(|status| status.as_str() == token)
        .map(|status| NormalizedStatus::Canonical(*status))
        .unwrap_or_else(|| NormalizedStatus::Unrecognized(raw.to_string()))
}

/// Exact, case-sensitive match on the finished tokens.
pub fn is_finished(raw: &str) -> bool {
    matches!(raw.trim(), "completed" | "done")
}
