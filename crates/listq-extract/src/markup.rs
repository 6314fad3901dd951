use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use listq_core::{
    extract_id_from_url, ExtractedRecord, ExtractionError, RawPayload, ServiceItem, StrategyKind,
};
use scraper::{ElementRef, Html, Selector};

use crate::engine::{inspect_capture, AutomationEngine, CaptureRequest, ProfileProvider};
use crate::{ExtractionConfig, ExtractionStrategy};

const TITLE: &[&str] = &["h1[itemprop='name']", "h1.orgpage-header-view__header", "h1"];
const ADDRESS: &[&str] = &[
    "[itemprop='address']",
    ".business-contacts-view__address-link",
    ".orgpage-header-view__address",
];
const PHONE: &[&str] = &["[itemprop='telephone']", ".orgpage-phones-view__phone-number"];
const SITE: &[&str] = &["a[itemprop='url']", "a.business-urls-view__link"];
const RATING: &[&str] = &["[itemprop='ratingValue']", ".business-rating-badge-view__rating-text"];
const REVIEWS: &[&str] = &["[itemprop='reviewCount']", ".business-header-rating-view__text"];
const SERVICE_ITEMS: &[&str] = &["[itemprop='makesOffer']", ".related-product-view"];
const SERVICE_NAME: &[&str] = &["[itemprop='name']", ".related-product-view__title"];
const SERVICE_PRICE: &[&str] = &["[itemprop='price']", ".related-product-view__price"];

/// Walks the rendered markup of the listing page. Slower and more
/// layout-sensitive than network capture.
pub struct MarkupParseStrategy {
    engine: Arc<dyn AutomationEngine>,
    profiles: Arc<dyn ProfileProvider>,
}

impl MarkupParseStrategy {
    pub fn new(engine: Arc<dyn AutomationEngine>, profiles: Arc<dyn ProfileProvider>) -> Self {
        Self { engine, profiles }
    }
}

#[async_trait]
impl ExtractionStrategy for MarkupParseStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Markup
    }

    async fn extract(&self, url: &str, config: &ExtractionConfig) -> Result<RawPayload, ExtractionError> {
        let request = CaptureRequest::new(url, StrategyKind::Markup, config.timeout, self.profiles.next_profile());
        let capture = self.engine.capture(&request).await?;
        inspect_capture(&capture)?;

        let record = parse_listing_markup(&capture.html);
        Ok(RawPayload {
            requested_url: url.to_string(),
            final_url: capture.final_url,
            strategy: StrategyKind::Markup,
            record,
            snapshot: capture.html,
            content_type: "text/html".to_string(),
            captured_at: Utc::now(),
        })
    }
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn compile(selectors: &[&str]) -> Vec<Selector> {
    selectors.iter().filter_map(|s| Selector::parse(s).ok()).collect()
}

/// Content of an element: its `content` attribute for meta-style tags, else its text.
fn element_value(element: ElementRef<'_>) -> Option<String> {
    element
        .value()
        .attr("content")
        .and_then(|s| text_or_none(s.to_string()))
        .or_else(|| text_or_none(element.text().collect::<String>()))
}

fn select_first_text(scope: ElementRef<'_>, selectors: &[&str]) -> Option<String> {
    compile(selectors)
        .iter()
        .find_map(|sel| scope.select(sel).find_map(element_value))
}

fn select_first_attr(document: &Html, selectors: &[&str], attr: &str) -> Option<String> {
    compile(selectors).iter().find_map(|sel| {
        document
            .select(sel)
            .find_map(|n| n.value().attr(attr).and_then(|s| text_or_none(s.to_string())))
    })
}

fn parse_decimal(text: &str) -> Option<f64> {
    let number: String = text
        .trim()
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    number.trim_end_matches('.').parse().ok()
}

fn parse_count(text: &str) -> Option<u32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || c.is_whitespace())
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn source_id(document: &Html) -> Option<String> {
    select_first_attr(document, &["link[rel='canonical']"], "href")
        .or_else(|| select_first_attr(document, &["meta[property='og:url']"], "content"))
        .and_then(|href| extract_id_from_url(&href))
        .or_else(|| select_first_attr(document, &["[data-business-id]"], "data-business-id"))
        .or_else(|| select_first_attr(document, &["[data-oid]"], "data-oid"))
}

fn services(root: ElementRef<'_>) -> Vec<ServiceItem> {
    compile(SERVICE_ITEMS)
        .iter()
        .map(|sel| {
            root.select(sel)
                .filter_map(|item| {
                    Some(ServiceItem {
                        name: select_first_text(item, SERVICE_NAME)?,
                        price: select_first_text(item, SERVICE_PRICE),
                    })
                })
                .collect::<Vec<_>>()
        })
        .find(|items| !items.is_empty())
        .unwrap_or_default()
}

/// Synchronous so the non-`Send` document never lives across an await.
pub fn parse_listing_markup(html: &str) -> ExtractedRecord {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let title = select_first_text(root, TITLE)
        .or_else(|| select_first_attr(&document, &["meta[property='og:title']"], "content"));
    let phone = select_first_text(root, PHONE).or_else(|| {
        select_first_attr(&document, &["a[href^='tel:']"], "href")
            .map(|href| href.trim_start_matches("tel:").to_string())
    });
    let site = select_first_attr(&document, SITE, "href").or_else(|| select_first_text(root, SITE));

    ExtractedRecord {
        title,
        address: select_first_text(root, ADDRESS),
        phone,
        site,
        rating: select_first_text(root, RATING).and_then(|t| parse_decimal(&t)),
        review_count: select_first_text(root, REVIEWS).and_then(|t| parse_count(&t)),
        services: services(root),
        source_id: source_id(&document),
    }
}
