use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::Page;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use tracing::{error, info, warn};

use crate::config::ITEMS_PER_PAGE;
use crate::session::wait_for_selector;

/// Localized "(total N items)" banner on the listing page.
static TOTAL_COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"（全([0-9]+)件）").expect("total-count regex"));

const PRODUCT_LINK_SELECTOR: &str = r#"a[href*="/p/r/pd_p/"]"#;
const PRODUCT_LINK_WAIT: Duration = Duration::from_secs(10);

/// Load the listing root and read the site-reported total item count.
/// A missing banner is a per-organization error, not fatal to the run.
pub async fn discover_total_count(page: &Page, listing_url: &str) -> Result<u64> {
    page.goto(listing_url).await?;
    let html = page.content().await?;
    parse_total_count(&html).context("item-count banner not found on listing page")
}

pub fn parse_total_count(html: &str) -> Option<u64> {
    TOTAL_COUNT_RE
        .captures(html)
        .and_then(|c| c[1].parse().ok())
}

pub fn compute_last_page(total_count: u64, items_per_page: u64) -> u64 {
    total_count.div_ceil(items_per_page)
}

/// Page 1 is the root URL verbatim; later pages insert `/all/{n}/` before the
/// original query string. The site 404s on any other shape.
pub fn page_url(base_url: &str, page_num: u64) -> String {
    if page_num == 1 {
        return base_url.to_string();
    }
    let (main, query) = match base_url.split_once('?') {
        Some((m, q)) => (m, format!("?{q}")),
        None => (base_url, String::new()),
    };
    format!("{}/all/{}/{}", main.trim_end_matches('/'), page_num, query)
}

/// Walk listing pages `start_page..=end_page` (clamped to the site's last
/// page) and collect every product detail URL.
pub async fn collect_urls(
    page: &Page,
    base_url: &str,
    start_page: u64,
    end_page: u64,
) -> Result<Vec<String>> {
    let total = discover_total_count(page, base_url).await?;
    let site_last = compute_last_page(total, ITEMS_PER_PAGE);
    info!("Total items: {} -> last page: {}", total, site_last);

    let end_page = end_page.min(site_last);
    if start_page > end_page {
        warn!(
            "Start page ({}) is past the last page ({}); nothing to collect",
            start_page, end_page
        );
        return Ok(Vec::new());
    }

    info!("Collecting URLs from page {} to {}", start_page, end_page);
    let mut all_urls = Vec::new();

    for page_num in start_page..=end_page {
        let url = page_url(base_url, page_num);
        match collect_page_links(page, &url).await {
            Ok(links) => {
                info!(
                    "Page {}/{} done: +{} urls (running total: {})",
                    page_num,
                    end_page,
                    links.len(),
                    all_urls.len() + links.len()
                );
                all_urls.extend(links);
            }
            Err(e) => {
                // A broken page is skipped, not retried; the rest continue.
                error!("Page {} failed: {:#}", page_num, e);
            }
        }

        if page_num < end_page {
            let delay = rand::thread_rng().gen_range(1.0..2.0);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
    }

    info!("URL collection finished: {} urls", all_urls.len());
    Ok(all_urls)
}

/// Extract product links from one listing page. Waits for the first matching
/// link rather than network idle; slow trailing requests are tolerated.
async fn collect_page_links(page: &Page, list_url: &str) -> Result<Vec<String>> {
    page.goto(list_url).await?;

    if !wait_for_selector(page, PRODUCT_LINK_SELECTOR, PRODUCT_LINK_WAIT).await {
        info!("Page is slow to render product links; continuing anyway");
    }

    let hrefs = page
        .evaluate(
            r#"
            Array.from(document.querySelectorAll('a[href*="/p/r/pd_p/"]'))
                .map(a => a.href)
                .filter(href => href && href.length > 0)
            "#,
        )
        .await?
        .into_value::<Vec<String>>()?;

    Ok(dedup_urls(hrefs))
}

// Preserves first-seen order.
pub fn dedup_urls(urls: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    urls.into_iter().filter(|u| seen.insert(u.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_page_is_ceiling_division() {
        assert_eq!(compute_last_page(28020, 120), 234);
        assert_eq!(compute_last_page(1, 120), 1);
        assert_eq!(compute_last_page(120, 120), 1);
        assert_eq!(compute_last_page(121, 120), 2);
        assert_eq!(compute_last_page(0, 120), 0);
    }

    #[test]
    fn banner_parses_total_count() {
        let html = "<div>検索結果（全28020件）を表示</div>";
        assert_eq!(parse_total_count(html), Some(28020));
        assert_eq!(parse_total_count("<div>no banner here</div>"), None);
    }

    #[test]
    fn page_one_is_root_verbatim() {
        assert_eq!(
            page_url("https://site/x?region=jp", 1),
            "https://site/x?region=jp"
        );
    }

    #[test]
    fn later_pages_insert_all_segment_before_query() {
        assert_eq!(
            page_url("https://site/x?region=jp", 3),
            "https://site/x/all/3/?region=jp"
        );
        assert_eq!(page_url("https://site/x/", 2), "https://site/x/all/2/");
        assert_eq!(page_url("https://site/x", 5), "https://site/x/all/5/");
    }

    #[test]
    fn duplicate_links_contribute_once() {
        let urls = vec![
            "https://a/1".to_string(),
            "https://a/2".to_string(),
            "https://a/1".to_string(),
        ];
        assert_eq!(dedup_urls(urls), vec!["https://a/1", "https://a/2"]);
    }
}
