//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;
use snapdiff::core::model::Snapshot;
use snapdiff::infra::store::SnapshotStore;
use snapdiff::llm::service::TextCompletionService;
use snapdiff::{Config, Engine};

/// Two-section report page with a price line
pub fn report_text(price: u32) -> String
{
    format!("# Report\nPrice: {price} PLN\n\n# Notes\nNothing else.")
}

pub fn report_snapshot(
    id: &str,
    price: u32,
) -> Snapshot
{
    Snapshot::from_extracted(id, report_text(price))
}

/// Deterministic chunking with a fixed window of `lines`
pub fn window_config(lines: usize) -> Config
{
    let mut cfg = Config::default();
    cfg.chunking
        .window
        .fixed_lines = lines;
    cfg
}

pub fn engine(
    store: Arc<dyn SnapshotStore>,
    service: Arc<dyn TextCompletionService>,
    cfg: Config,
) -> Engine
{
    Engine::new(store, service, cfg)
}

/// Semantic ranges response as the model would return it
pub fn ranges_response(ranges: &[(usize, usize, &str)]) -> String
{
    let chunks: Vec<_> = ranges
        .iter()
        .map(|(from, to, title)| json!({ "from": from, "to": to, "title": title }))
        .collect();

    json!({ "chunks": chunks }).to_string()
}

/// Product page long enough for a template with several sections
pub fn product_page(price: u32) -> String
{
    format!(
        "Kettle Pro 2000 product page\n\n\
         Price of the product is {price} PLN today\nFree delivery over 200 PLN\n\n\
         Customer reviews and ratings from buyers\nGreat kettle, boils fast\n\n\
         Technical specification of the device\nPower 2200 W, capacity 1.7 l"
    )
}

pub fn product_template_response() -> String
{
    json!({
        "chunks": [
            { "key": "price", "title": "Price", "anchor_candidates": ["Price of the product is"] },
            { "key": "reviews", "title": "Reviews", "anchor_candidates": ["Customer reviews and ratings"] },
            { "key": "spec", "title": "Specification", "anchor_candidates": ["Technical specification of the device"] }
        ]
    })
    .to_string()
}
