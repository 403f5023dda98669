use std::time::Duration;

use anyhow::Result;
use chromiumoxide::Page;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::models::{ProductVariationRecord, PRICE_UNRESOLVED};
use crate::session::wait_for_selector;

const MAINTENANCE_MARKER: &str = "メンテナンス中";
const HEADING_WAIT: Duration = Duration::from_secs(15);

static NUMERIC_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9][0-9,]*").expect("price regex"));

/// Raw texts pulled from one variation row in a single DOM pass. The price
/// candidates are the fallback chain in priority order; resolution happens
/// on the Rust side so it stays testable.
#[derive(Debug, Deserialize)]
struct RawVariationRow {
    detail_text: String,
    jan_text: String,
    price_row: String,
    price_sibling: String,
    price_span: String,
}

/// Per-URL extraction state. The retry counter lives next to it rather than
/// being implied by loop position.
#[derive(Debug, PartialEq)]
enum ExtractState {
    Navigating,
    MaintenanceWait,
    AwaitingContent,
    Extracting,
    Succeeded(Vec<ProductVariationRecord>),
    Failed,
}

/// What one step against the page produced. The transition table below is
/// pure; the async driver only supplies outcomes and sleeps.
#[derive(Debug)]
enum StepOutcome {
    MaintenancePage,
    PageLoaded,
    NavigationError,
    HeadingFound,
    HeadingMissing,
    Extracted(Vec<ProductVariationRecord>),
    ExtractionError,
}

/// Spend one attempt. False means the budget is exhausted.
fn take_attempt(attempts: &mut u32, max_retries: u32) -> bool {
    if *attempts >= max_retries {
        return false;
    }
    *attempts += 1;
    true
}

fn next_state(outcome: StepOutcome) -> ExtractState {
    match outcome {
        StepOutcome::MaintenancePage => ExtractState::MaintenanceWait,
        StepOutcome::PageLoaded => ExtractState::AwaitingContent,
        StepOutcome::HeadingFound => ExtractState::Extracting,
        StepOutcome::Extracted(records) => ExtractState::Succeeded(records),
        StepOutcome::NavigationError
        | StepOutcome::HeadingMissing
        | StepOutcome::ExtractionError => ExtractState::Navigating,
    }
}

/// Scrape every variation row of one product page. Exhausting all attempts
/// returns an empty vec; this is never fatal to the run.
pub async fn extract(page: &Page, cfg: &Config, url: &str) -> Vec<ProductVariationRecord> {
    let mut attempts: u32 = 0;
    let mut state = ExtractState::Navigating;

    loop {
        state = match state {
            ExtractState::Navigating => {
                if !take_attempt(&mut attempts, cfg.max_retries) {
                    ExtractState::Failed
                } else {
                    let outcome = match navigate(page, url).await {
                        Ok(true) => StepOutcome::MaintenancePage,
                        Ok(false) => StepOutcome::PageLoaded,
                        Err(e) => {
                            warn!(
                                "Navigation failed for {} (attempt {}/{}): {:#}",
                                url, attempts, cfg.max_retries, e
                            );
                            tokio::time::sleep(cfg.error_cooldown).await;
                            StepOutcome::NavigationError
                        }
                    };
                    next_state(outcome)
                }
            }
            ExtractState::MaintenanceWait => {
                warn!(
                    "Maintenance page detected; cooling down {:?} ({}/{})",
                    cfg.maintenance_cooldown, attempts, cfg.max_retries
                );
                tokio::time::sleep(cfg.maintenance_cooldown).await;
                ExtractState::Navigating
            }
            ExtractState::AwaitingContent => {
                if wait_for_selector(page, "h1", HEADING_WAIT).await {
                    next_state(StepOutcome::HeadingFound)
                } else {
                    warn!("Primary heading missing on {}; retrying", url);
                    next_state(StepOutcome::HeadingMissing)
                }
            }
            ExtractState::Extracting => match scrape_variations(page, url).await {
                Ok(records) => next_state(StepOutcome::Extracted(records)),
                Err(e) => {
                    warn!("Extraction error on {}: {:#}", url, e);
                    tokio::time::sleep(cfg.error_cooldown).await;
                    next_state(StepOutcome::ExtractionError)
                }
            },
            ExtractState::Succeeded(records) => return records,
            ExtractState::Failed => {
                error!(
                    "Giving up on {} after {} attempts",
                    url, cfg.max_retries
                );
                return Vec::new();
            }
        };
    }
}

/// Navigate and report whether the maintenance interstitial was served.
async fn navigate(page: &Page, url: &str) -> Result<bool> {
    page.goto(url).await?;
    let html = page.content().await?;
    Ok(html.contains(MAINTENANCE_MARKER))
}

async fn scrape_variations(page: &Page, url: &str) -> Result<Vec<ProductVariationRecord>> {
    let product_name = page
        .evaluate(
            r#"
            (() => {
                const h = document.querySelector('h1');
                return h ? h.innerText.trim() : '';
            })()
            "#,
        )
        .await?
        .into_value::<String>()?;

    let rows = page
        .evaluate(
            r#"
            (() => {
                const text = el => el ? (el.textContent || '').trim() : '';
                return Array.from(document.querySelectorAll('tr[data-product-set-code]'))
                    .map(row => {
                        const detail = row.querySelector('.td-set-detail');
                        if (!detail) return null;
                        const sibling = row.nextElementSibling;
                        return {
                            detail_text: text(detail),
                            jan_text: text(detail.querySelector('.td-jan')),
                            price_row: text(row.querySelector('td.td-price02')),
                            price_sibling: sibling ? text(sibling.querySelector('td.td-price02')) : '',
                            price_span: text(row.querySelector('span.maker-wholesale-set-price')),
                        };
                    })
                    .filter(r => r !== null);
            })()
            "#,
        )
        .await?
        .into_value::<Vec<RawVariationRow>>()?;

    info!("Extracted {} variation rows from {}", rows.len(), url);

    Ok(rows
        .into_iter()
        .map(|raw| build_record(&product_name, url, raw))
        .collect())
}

fn build_record(product_name: &str, url: &str, raw: RawVariationRow) -> ProductVariationRecord {
    let (variation_name, model_number) = split_name_and_model(&raw.detail_text);
    ProductVariationRecord {
        product_name: product_name.to_string(),
        variation_name,
        jan_code: digits_only(&raw.jan_text),
        model_number,
        wholesale_price: resolve_price(&[&raw.price_row, &raw.price_sibling, &raw.price_span]),
        source_url: url.to_string(),
    }
}

/// Detail-cell text carries both the variation name and, in full-width
/// parentheses, the model number: "Widget A（MDL-22）".
pub fn split_name_and_model(detail_text: &str) -> (String, String) {
    let name = detail_text
        .split('（')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    let model = detail_text
        .split_once('（')
        .and_then(|(_, rest)| rest.split_once('）'))
        .map(|(model, _)| model.trim().to_string())
        .unwrap_or_default();
    (name, model)
}

/// JAN codes arrive with labels and separators mixed in; keep digits only.
pub fn digits_only(text: &str) -> String {
    text.chars().filter(char::is_ascii_digit).collect()
}

/// First fallback candidate carrying a numeric run wins; thousands
/// separators are stripped. No match yields the sentinel.
pub fn resolve_price(candidates: &[&str]) -> String {
    for candidate in candidates {
        if let Some(m) = NUMERIC_RUN_RE.find(candidate) {
            return m.as_str().replace(',', "");
        }
    }
    PRICE_UNRESOLVED.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_and_model_split_on_fullwidth_parens() {
        let (name, model) = split_name_and_model("Widget A（MDL-22）");
        assert_eq!(name, "Widget A");
        assert_eq!(model, "MDL-22");
    }

    #[test]
    fn missing_parens_leave_model_empty() {
        let (name, model) = split_name_and_model("Plain Widget");
        assert_eq!(name, "Plain Widget");
        assert_eq!(model, "");
    }

    #[test]
    fn jan_extraction_keeps_digits_only() {
        assert_eq!(digits_only("JAN: 4901-2345 6789"), "490123456789");
        assert_eq!(digits_only("型番のみ"), "");
    }

    #[test]
    fn price_fallback_takes_first_numeric_candidate() {
        assert_eq!(resolve_price(&["", "¥1,200", "¥999"]), "1200");
        assert_eq!(resolve_price(&["¥350", "", ""]), "350");
        assert_eq!(resolve_price(&["会員限定", "", "2,480円"]), "2480");
    }

    #[test]
    fn unresolved_price_uses_sentinel() {
        assert_eq!(resolve_price(&["", "", ""]), PRICE_UNRESOLVED);
        assert_eq!(resolve_price(&["要問合せ", "非公開", ""]), PRICE_UNRESOLVED);
    }

    #[test]
    fn outcomes_map_to_expected_states() {
        assert_eq!(
            next_state(StepOutcome::MaintenancePage),
            ExtractState::MaintenanceWait
        );
        assert_eq!(next_state(StepOutcome::PageLoaded), ExtractState::AwaitingContent);
        assert_eq!(next_state(StepOutcome::HeadingFound), ExtractState::Extracting);
        assert_eq!(next_state(StepOutcome::NavigationError), ExtractState::Navigating);
        assert_eq!(next_state(StepOutcome::HeadingMissing), ExtractState::Navigating);
        assert_eq!(next_state(StepOutcome::ExtractionError), ExtractState::Navigating);
        assert_eq!(
            next_state(StepOutcome::Extracted(Vec::new())),
            ExtractState::Succeeded(Vec::new())
        );
    }

    #[test]
    fn attempt_budget_is_spent_once_per_navigation() {
        let mut attempts = 0;
        assert!(take_attempt(&mut attempts, 2));
        assert!(take_attempt(&mut attempts, 2));
        assert!(!take_attempt(&mut attempts, 2));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn persistent_maintenance_ends_in_failed_after_max_retries() {
        let max_retries = 3;
        let mut attempts = 0;
        let mut maintenance_waits = 0;
        let mut state = ExtractState::Navigating;

        loop {
            state = match state {
                ExtractState::Navigating => {
                    if !take_attempt(&mut attempts, max_retries) {
                        ExtractState::Failed
                    } else {
                        next_state(StepOutcome::MaintenancePage)
                    }
                }
                ExtractState::MaintenanceWait => {
                    maintenance_waits += 1;
                    ExtractState::Navigating
                }
                ExtractState::Failed => break,
                other => panic!("unexpected state {:?}", other),
            };
        }

        assert_eq!(attempts, max_retries);
        assert_eq!(maintenance_waits, max_retries);
    }

    #[test]
    fn record_assembly_applies_all_rules() {
        let raw = RawVariationRow {
            detail_text: "青 Mサイズ（ABC-1）".to_string(),
            jan_text: "JAN 4512345678901".to_string(),
            price_row: String::new(),
            price_sibling: "¥1,200".to_string(),
            price_span: String::new(),
        };
        let rec = build_record("親商品", "https://example/p/1", raw);
        assert_eq!(rec.product_name, "親商品");
        assert_eq!(rec.variation_name, "青 Mサイズ");
        assert_eq!(rec.model_number, "ABC-1");
        assert_eq!(rec.jan_code, "4512345678901");
        assert_eq!(rec.wholesale_price, "1200");
        assert_eq!(rec.source_url, "https://example/p/1");
    }
}
