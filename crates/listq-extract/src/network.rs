use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use listq_core::{ExtractedRecord, ExtractionError, RawPayload, ServiceItem, StrategyKind};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::engine::{inspect_capture, AutomationEngine, CaptureRequest, CapturedResponse, ProfileProvider};
use crate::{ExtractionConfig, ExtractionStrategy};

/// Internal API calls a listing page issues for its business card.
pub const DEFAULT_RESPONSE_FILTER: &[&str] = &["/maps/api/business", "/maps/api/search", "/org/"];

/// Reads listing data out of the structured responses the page fetched.
pub struct NetworkCaptureStrategy {
    engine: Arc<dyn AutomationEngine>,
    profiles: Arc<dyn ProfileProvider>,
    response_filter: Vec<String>,
}

impl NetworkCaptureStrategy {
    pub fn new(engine: Arc<dyn AutomationEngine>, profiles: Arc<dyn ProfileProvider>) -> Self {
        Self {
            engine,
            profiles,
            response_filter: DEFAULT_RESPONSE_FILTER.iter().map(ToString::to_string).collect(),
        }
    }
}

#[async_trait]
impl ExtractionStrategy for NetworkCaptureStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Network
    }

    async fn extract(&self, url: &str, config: &ExtractionConfig) -> Result<RawPayload, ExtractionError> {
        let request = CaptureRequest::new(url, StrategyKind::Network, config.timeout, self.profiles.next_profile())
            .with_response_filter(&self.response_filter);
        let capture = self.engine.capture(&request).await?;
        inspect_capture(&capture)?;

        let (record, snapshot, content_type) = match parse_captured_responses(&capture.responses) {
            Some((record, body)) => (record, body, "application/json"),
            None => {
                debug!(url, responses = capture.responses.len(), "no listing object in captured responses");
                (ExtractedRecord::default(), capture.html.clone(), "text/html")
            }
        };
        Ok(RawPayload {
            requested_url: url.to_string(),
            final_url: capture.final_url,
            strategy: StrategyKind::Network,
            record,
            snapshot,
            content_type: content_type.to_string(),
            captured_at: Utc::now(),
        })
    }
}

/// First listing object found across the JSON responses, with the body it came from.
pub fn parse_captured_responses(responses: &[CapturedResponse]) -> Option<(ExtractedRecord, String)> {
    for response in responses {
        let Ok(root) = serde_json::from_str::<JsonValue>(&response.body) else {
            continue;
        };
        let found = candidates(&root)
            .into_iter()
            .map(record_from_object)
            .find(|record| !record.is_sparse());
        if let Some(record) = found {
            return Some((record, response.body.clone()));
        }
    }
    None
}

fn candidates(root: &JsonValue) -> Vec<&JsonValue> {
    let mut out = vec![root];
    if let Some(data) = root.get("data") {
        out.push(data);
        if let Some(items) = data.get("items").and_then(JsonValue::as_array) {
            out.extend(items);
        }
    }
    if let Some(items) = root.get("items").and_then(JsonValue::as_array) {
        out.extend(items);
    }
    out
}

fn first_str<'a>(value: &'a JsonValue, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .filter_map(|pointer| value.pointer(pointer))
        .filter_map(JsonValue::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn first_f64(value: &JsonValue, pointers: &[&str]) -> Option<f64> {
    pointers.iter().filter_map(|pointer| value.pointer(pointer)).find_map(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().replace(',', ".").parse().ok()))
    })
}

fn first_id(value: &JsonValue, pointers: &[&str]) -> Option<String> {
    pointers.iter().filter_map(|pointer| value.pointer(pointer)).find_map(|v| match v {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn record_from_object(object: &JsonValue) -> ExtractedRecord {
    ExtractedRecord {
        title: first_str(object, &["/title", "/name", "/shortTitle"]).map(ToString::to_string),
        address: first_str(object, &["/address", "/fullAddress", "/address/formatted"]).map(ToString::to_string),
        phone: first_str(object, &["/phones/0/number", "/phones/0/formatted", "/phone"]).map(ToString::to_string),
        site: first_str(object, &["/urls/0", "/urls/0/value", "/url", "/site"]).map(ToString::to_string),
        rating: first_f64(object, &["/ratingData/ratingValue", "/rating/score", "/rating"]),
        review_count: first_f64(object, &["/ratingData/reviewCount", "/reviewCount", "/rating/count"])
            .filter(|n| *n >= 0.0)
            .map(|n| n as u32),
        services: services(object),
        source_id: first_id(object, &["/id", "/businessId", "/oid", "/orgId"]),
    }
}

fn services(object: &JsonValue) -> Vec<ServiceItem> {
    let Some(items) = ["/services", "/goods", "/features/services"]
        .iter()
        .filter_map(|pointer| object.pointer(pointer))
        .find_map(JsonValue::as_array)
    else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = match item {
                JsonValue::String(s) => s.trim(),
                _ => first_str(item, &["/name", "/title"])?,
            };
            if name.is_empty() {
                return None;
            }
            let price = first_str(item, &["/price/text", "/price"])
                .map(ToString::to_string)
                .or_else(|| first_f64(item, &["/price/value", "/price"]).map(|p| p.to_string()));
            Some(ServiceItem {
                name: name.to_string(),
                price,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> CapturedResponse {
        CapturedResponse {
            url: "https://yandex.ru/maps/api/business/fetchCard".into(),
            status: 200,
            content_type: "application/json".into(),
            body: body.into(),
        }
    }

    #[test]
    fn nested_items_are_found() {
        let body = r#"{"data":{"items":[{"id":"203293742306","title":"Zerno","address":"Lenina 1",
            "phones":[{"number":"+7 900 000-00-00"}],"ratingData":{"ratingValue":4.8,"reviewCount":312},
            "services":[{"name":"Espresso","price":{"text":"150 ₽"}},"Filter"]}]}}"#;
        let (record, snapshot) = parse_captured_responses(&[response("not json"), response(body)]).unwrap();
        assert_eq!(record.title.as_deref(), Some("Zerno"));
        assert_eq!(record.phone.as_deref(), Some("+7 900 000-00-00"));
        assert_eq!(record.rating, Some(4.8));
        assert_eq!(record.review_count, Some(312));
        assert_eq!(record.source_id.as_deref(), Some("203293742306"));
        assert_eq!(record.services.len(), 2);
        assert_eq!(record.services[0].price.as_deref(), Some("150 ₽"));
        assert_eq!(record.services[1].price, None);
        assert_eq!(snapshot, body);
    }

    #[test]
    fn numeric_ids_and_string_ratings() {
        let body = r#"{"businessId":203293742306,"name":"Zerno","rating":"4,6"}"#;
        let (record, _) = parse_captured_responses(&[response(body)]).unwrap();
        assert_eq!(record.source_id.as_deref(), Some("203293742306"));
        assert_eq!(record.rating, Some(4.6));
        assert!(record.address.is_none());
    }

    #[test]
    fn responses_without_listing_fields_yield_nothing() {
        assert!(parse_captured_responses(&[response(r#"{"data":{"items":[]}}"#)]).is_none());
    }

    #[tokio::test]
    async fn page_without_listing_response_keeps_html_snapshot() {
        let url = "https://yandex.ru/maps/org/kofeynya_zerno/203293742306/";
        let mut engine = crate::FixtureEngine::new();
        engine.insert_html(url, "<html><body>loading</body></html>");
        let strategy = NetworkCaptureStrategy::new(
            Arc::new(engine),
            Arc::new(crate::RotatingProfiles::default()),
        );

        let payload = strategy
            .extract(url, &ExtractionConfig::default())
            .await
            .unwrap();
        assert_eq!(payload.content_type, "text/html");
        assert_eq!(payload.snapshot, "<html><body>loading</body></html>");
        assert!(payload.record.is_sparse());
    }
}
