//! Extraction strategies over a pluggable page-rendering engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use listq_core::{ExtractionError, RawPayload, StrategyKind};
use tracing::{info, warn};

mod engine;
mod fixture;
mod markup;
mod network;
mod remote;

pub use engine::{
    detect_challenge, inspect_capture, AutomationEngine, CaptureRequest, CapturedResponse,
    EngineCapabilities, PageCapture, ProfileProvider, RequestProfile, RotatingProfiles,
};
pub use fixture::FixtureEngine;
pub use markup::{parse_listing_markup, MarkupParseStrategy};
pub use network::{parse_captured_responses, NetworkCaptureStrategy, DEFAULT_RESPONSE_FILTER};
pub use remote::RemoteBrowserEngine;

pub const CRATE_NAME: &str = "listq-extract";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionConfig {
    /// Hard budget for one page load, including engine round-trips.
    pub timeout: Duration,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
        }
    }
}

#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn extract(&self, url: &str, config: &ExtractionConfig) -> Result<RawPayload, ExtractionError>;
}

/// Runs `strategy` under the hard timeout; an overrun becomes
/// [`ExtractionError::Timeout`] instead of a hung worker.
pub async fn extract_with_timeout(
    strategy: &dyn ExtractionStrategy,
    url: &str,
    config: &ExtractionConfig,
) -> Result<RawPayload, ExtractionError> {
    match tokio::time::timeout(config.timeout, strategy.extract(url, config)).await {
        Ok(result) => result,
        Err(_) => Err(ExtractionError::Timeout(config.timeout)),
    }
}

pub fn build_strategy(
    kind: StrategyKind,
    engine: Arc<dyn AutomationEngine>,
    profiles: Arc<dyn ProfileProvider>,
) -> Arc<dyn ExtractionStrategy> {
    match kind {
        StrategyKind::Network => Arc::new(NetworkCaptureStrategy::new(engine, profiles)),
        StrategyKind::Markup => Arc::new(MarkupParseStrategy::new(engine, profiles)),
    }
}

/// The strategy a worker runs for its whole lifetime.
#[derive(Clone)]
pub struct StrategySelection {
    pub strategy: Arc<dyn ExtractionStrategy>,
    pub requested: StrategyKind,
    pub substituted: bool,
}

impl std::fmt::Debug for StrategySelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategySelection")
            .field("active", &self.strategy.kind())
            .field("requested", &self.requested)
            .field("substituted", &self.substituted)
            .finish()
    }
}

impl StrategySelection {
    pub fn active(&self) -> StrategyKind {
        self.strategy.kind()
    }
}

/// Probes the engine once and settles on a strategy. Falls back to the other
/// variant when the preferred one is unsupported; an engine that cannot be
/// probed gets the markup variant.
pub async fn select_strategy(
    preferred: StrategyKind,
    engine: Arc<dyn AutomationEngine>,
    profiles: Arc<dyn ProfileProvider>,
) -> StrategySelection {
    let active = match engine.capabilities().await {
        Ok(caps) if caps.supports(preferred) => preferred,
        Ok(caps) if caps.supports(preferred.other()) => {
            warn!(
                engine = engine.name(),
                requested = %preferred,
                strategy = %preferred.other(),
                "preferred extraction strategy unsupported by engine; falling back"
            );
            preferred.other()
        }
        Ok(_) => {
            warn!(
                engine = engine.name(),
                strategy = %preferred,
                "engine reports no capture support; keeping requested strategy"
            );
            preferred
        }
        Err(err) => {
            warn!(
                engine = engine.name(),
                requested = %preferred,
                strategy = %StrategyKind::Markup,
                error = %err,
                "engine capability probe failed; using markup strategy"
            );
            StrategyKind::Markup
        }
    };
    info!(strategy = %active, engine = engine.name(), "extraction strategy selected");
    StrategySelection {
        strategy: build_strategy(active, engine, profiles),
        requested: preferred,
        substituted: active != preferred,
    }
}
