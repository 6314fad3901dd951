//! Identity verification and outcome classification for one extraction attempt.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ExtractionError, FailureKind, JobStatus, RawPayload, Warning};

/// Object identifiers embedded in listing URLs.
static URL_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"/org/(?:[^/?#]+/)?(\d{6,})(?:[/?#]|$)",
        r"[?&](?:oid|orgId|businessId)=(\d{6,})",
        r"/firm/(\d{6,})(?:[/?#]|$)",
    ])
});

/// Canonical page references inside fetched markup.
static CANONICAL_REF_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r#"<link[^>]*rel=["']canonical["'][^>]*href=["']([^"']+)["']"#,
        r#"<link[^>]*href=["']([^"']+)["'][^>]*rel=["']canonical["']"#,
        r#"<meta[^>]*property=["']og:url["'][^>]*content=["']([^"']+)["']"#,
        r#"<meta[^>]*content=["']([^"']+)["'][^>]*property=["']og:url["']"#,
    ])
});

/// Identifier keys inside captured JSON.
static PAYLOAD_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[r#""(?:businessId|oid|orgId)"\s*:\s*"?(\d{6,})"#])
});

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

fn first_capture(patterns: &[Regex], haystack: &str) -> Option<String> {
    patterns.iter().find_map(|re| {
        re.captures(haystack)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Identifier implied by a listing URL. `None` for URLs that carry no id (short links, redirects).
pub fn extract_id_from_url(url: &str) -> Option<String> {
    first_capture(&URL_ID_PATTERNS, url.trim())
}

fn normalize_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(id) = extract_id_from_url(trimmed) {
        return Some(id);
    }
    Some(trimmed.to_string())
}

/// Identifier the fetched content claims for itself.
///
/// Looks at the structured record first, then canonical references in the
/// snapshot, then id keys in captured JSON, and finally the URL the engine
/// ended up on.
pub fn extract_id_from_payload(payload: &RawPayload) -> Option<String> {
    if let Some(id) = payload.record.source_id.as_deref().and_then(normalize_id) {
        return Some(id);
    }
    if let Some(id) =
        first_capture(&CANONICAL_REF_PATTERNS, &payload.snapshot).and_then(|href| extract_id_from_url(&href))
    {
        return Some(id);
    }
    if let Some(id) = first_capture(&PAYLOAD_ID_PATTERNS, &payload.snapshot) {
        return Some(id);
    }
    extract_id_from_url(&payload.final_url)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCheck {
    pub expected: Option<String>,
    pub extracted: Option<String>,
}

impl IdentityCheck {
    /// Only a disagreement between two known ids counts; unknown on either side does not.
    pub fn is_mismatch(&self) -> bool {
        match (&self.expected, &self.extracted) {
            (Some(expected), Some(extracted)) => expected != extracted,
            _ => false,
        }
    }
}

pub fn identity_check(url: &str, payload: &RawPayload) -> IdentityCheck {
    IdentityCheck {
        expected: extract_id_from_url(url),
        extracted: extract_id_from_payload(payload),
    }
}

/// Terminal state the worker should write for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: JobStatus,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
    pub warnings: Vec<Warning>,
    pub identity: Option<IdentityCheck>,
}

impl Outcome {
    fn failed(status: JobStatus, kind: FailureKind, message: String, warning: Warning) -> Self {
        Self {
            status,
            failure: Some(kind),
            message: Some(message),
            warnings: vec![warning],
            identity: None,
        }
    }
}

/// Classify an extraction attempt for `url`. First matching rule wins.
pub fn classify(url: &str, result: &Result<RawPayload, ExtractionError>) -> Outcome {
    let payload = match result {
        Err(err) => {
            let kind = err.kind();
            let warning = match err {
                ExtractionError::LoginWall { final_url }
                | ExtractionError::CaptchaChallenge { final_url } => {
                    Warning::with_detail(kind.code(), final_url.clone())
                }
                ExtractionError::NetworkFailure(_) | ExtractionError::Timeout(_) => {
                    Warning::new(kind.code())
                }
            };
            let status = if kind.needs_intervention() {
                JobStatus::Captcha
            } else {
                JobStatus::Error
            };
            return Outcome::failed(status, kind, err.to_string(), warning);
        }
        Ok(payload) => payload,
    };

    let identity = identity_check(url, payload);
    if identity.is_mismatch() {
        let expected = identity.expected.as_deref().unwrap_or_default();
        let extracted = identity.extracted.as_deref().unwrap_or_default();
        let mut outcome = Outcome::failed(
            JobStatus::Error,
            FailureKind::IdentityMismatch,
            format!("requested listing {expected} but the page served listing {extracted}"),
            Warning::with_detail(
                FailureKind::IdentityMismatch.code(),
                format!("expected={expected},extracted={extracted}"),
            ),
        );
        outcome.identity = Some(identity);
        return outcome;
    }

    if payload.record.is_sparse() {
        let mut outcome = Outcome::failed(
            JobStatus::Error,
            FailureKind::EmptyPayload,
            format!(
                "page loaded via {} strategy but neither title nor address was found",
                payload.strategy
            ),
            Warning::with_detail(
                FailureKind::EmptyPayload.code(),
                format!("strategy={}", payload.strategy),
            ),
        );
        outcome.identity = Some(identity);
        return outcome;
    }

    let record = &payload.record;
    let mut warnings = Vec::new();
    let gaps = [
        ("missing_title", record.title.is_none()),
        ("missing_address", record.address.is_none()),
        ("missing_phone", record.phone.is_none()),
        ("missing_site", record.site.is_none()),
        ("missing_rating", record.rating.is_none()),
    ];
    warnings.extend(
        gaps.iter()
            .filter(|(_, missing)| *missing)
            .map(|(code, _)| Warning::new(*code)),
    );
    if identity.expected.is_none() {
        warnings.push(Warning::new("unknown_expected_id"));
    }
    if identity.extracted.is_none() {
        warnings.push(Warning::new("unknown_extracted_id"));
    }

    Outcome {
        status: JobStatus::Completed,
        failure: None,
        message: None,
        warnings,
        identity: Some(identity),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{ExtractedRecord, StrategyKind};

    const REQUESTED: &str = "https://yandex.ru/maps/org/kofeynya_zerno/203293742306/";

    fn payload(record: ExtractedRecord, snapshot: &str) -> RawPayload {
        RawPayload {
            requested_url: REQUESTED.to_string(),
            final_url: REQUESTED.to_string(),
            strategy: StrategyKind::Markup,
            record,
            snapshot: snapshot.to_string(),
            content_type: "text/html".to_string(),
            captured_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap(),
        }
    }

    fn full_record(source_id: Option<&str>) -> ExtractedRecord {
        ExtractedRecord {
            title: Some("Kofeynya Zerno".to_string()),
            address: Some("Tverskaya ulitsa, 7".to_string()),
            phone: Some("+7 495 000-00-00".to_string()),
            site: Some("https://zerno.example".to_string()),
            rating: Some(4.8),
            review_count: Some(311),
            services: Vec::new(),
            source_id: source_id.map(ToString::to_string),
        }
    }

    #[test]
    fn url_ids_parse_from_known_shapes() {
        assert_eq!(extract_id_from_url(REQUESTED).as_deref(), Some("203293742306"));
        assert_eq!(
            extract_id_from_url("https://yandex.ru/maps/org/203293742306").as_deref(),
            Some("203293742306")
        );
        assert_eq!(
            extract_id_from_url("https://yandex.ru/maps/?ll=37.6,55.7&oid=1124715036&z=17")
                .as_deref(),
            Some("1124715036")
        );
        assert_eq!(
            extract_id_from_url("https://2gis.ru/moscow/firm/70000001012345678/tab/reviews")
                .as_deref(),
            Some("70000001012345678")
        );
    }

    #[test]
    fn redirect_style_urls_have_unknown_id() {
        assert_eq!(extract_id_from_url("https://yandex.ru/maps/-/CCUkZ6T~3D"), None);
        assert_eq!(extract_id_from_url("not a url"), None);
    }

    #[test]
    fn payload_id_falls_back_to_canonical_link() {
        let html = r#"<html><head><link rel="canonical" href="https://yandex.ru/maps/org/other/999999999999/"></head></html>"#;
        let p = payload(full_record(None), html);
        assert_eq!(extract_id_from_payload(&p).as_deref(), Some("999999999999"));
    }

    #[test]
    fn payload_id_reads_captured_json_keys() {
        let json = r#"{"data":{"businessId":"555555555555","title":"x"}}"#;
        let mut p = payload(full_record(None), json);
        p.final_url = "https://yandex.ru/maps/-/CCUkZ6T~3D".to_string();
        assert_eq!(extract_id_from_payload(&p).as_deref(), Some("555555555555"));
    }

    #[test]
    fn mismatched_identity_is_an_error_not_completion() {
        let p = payload(full_record(Some("999999999999")), "");
        let outcome = classify(REQUESTED, &Ok(p));
        assert_eq!(outcome.status, JobStatus::Error);
        assert_eq!(outcome.failure, Some(FailureKind::IdentityMismatch));
        assert_eq!(
            outcome.warnings[0].to_string(),
            "identity_mismatch:expected=203293742306,extracted=999999999999"
        );
    }

    #[test]
    fn complete_core_fields_complete_despite_gaps() {
        let mut record = full_record(Some("203293742306"));
        record.phone = None;
        let outcome = classify(REQUESTED, &Ok(payload(record, "")));
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.failure, None);
        assert!(outcome.warnings.contains(&Warning::new("missing_phone")));
    }

    #[test]
    fn unknown_ids_do_not_block_completion() {
        let outcome = classify(
            "https://yandex.ru/maps/-/CCUkZ6T~3D",
            &Ok(payload(full_record(None), "")),
        );
        assert_eq!(outcome.status, JobStatus::Completed);
        assert!(outcome.warnings.contains(&Warning::new("unknown_expected_id")));
    }

    #[test]
    fn sparse_payload_is_distinct_from_fetch_failure() {
        let record = ExtractedRecord {
            phone: Some("+7 495 000-00-00".to_string()),
            source_id: Some("203293742306".to_string()),
            ..Default::default()
        };
        let outcome = classify(REQUESTED, &Ok(payload(record, "")));
        assert_eq!(outcome.status, JobStatus::Error);
        assert_eq!(outcome.failure, Some(FailureKind::EmptyPayload));
    }

    #[test]
    fn challenges_land_in_captcha_and_keep_their_kind() {
        let captcha = classify(
            REQUESTED,
            &Err(ExtractionError::CaptchaChallenge {
                final_url: "https://yandex.ru/showcaptcha?retpath=x".to_string(),
            }),
        );
        assert_eq!(captcha.status, JobStatus::Captcha);
        assert_eq!(captcha.warnings[0].code, "captcha_challenge");

        let login = classify(
            REQUESTED,
            &Err(ExtractionError::LoginWall {
                final_url: "https://passport.yandex.ru/auth".to_string(),
            }),
        );
        assert_eq!(login.status, JobStatus::Captcha);
        assert_eq!(login.warnings[0].code, "login_wall");
    }

    #[test]
    fn transport_failures_are_plain_errors() {
        let outcome = classify(REQUESTED, &Err(ExtractionError::Timeout(Duration::from_secs(90))));
        assert_eq!(outcome.status, JobStatus::Error);
        assert_eq!(outcome.message.as_deref(), Some("extraction timed out after 90s"));
    }

    #[test]
    fn all_patterns_compile() {
        assert_eq!(URL_ID_PATTERNS.len(), 3);
        assert_eq!(CANONICAL_REF_PATTERNS.len(), 4);
        assert_eq!(PAYLOAD_ID_PATTERNS.len(), 1);
    }
}
