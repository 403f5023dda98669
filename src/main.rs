mod config;
mod csv_writer;
mod detail;
mod distributor;
mod excel_writer;
mod listing;
mod models;
mod session;
mod storage;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::models::{CrawlTask, ProductVariationRecord};
use crate::session::SessionDriver;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env()?;
    storage::prepare_dirs(&cfg)?;
    let _log_guard = init_logging(&cfg.tmp_log_dir)?;

    info!("Starting SuperDelivery catalog scraper");
    if !cfg.headless {
        info!("Running in headed mode (browser visible)");
    }

    let tasks = read_input(&cfg.input_file)?;

    let driver = SessionDriver::open(None, cfg.headless).await?;
    if !driver.login(&cfg.user_id, &cfg.password).await {
        error!("Login failed; aborting before any scraping");
        driver.close().await;
        anyhow::bail!("login failed");
    }
    tokio::time::sleep(cfg.login_settle).await;
    info!("Login succeeded");

    if let Err(e) = driver.persist_auth(&cfg.auth_state_path).await {
        error!("Could not persist auth state: {:#}", e);
        driver.close().await;
        return Err(e);
    }

    if let Err(e) = run_organizations(&driver, &cfg, &tasks).await {
        error!("Unexpected error during the organization loop: {:#}", e);
    }

    driver.close().await;
    info!(
        "Run complete. Final output: {}",
        cfg.output_file().display()
    );
    Ok(())
}

/// Stdout plus a date-stamped log file. The returned guard flushes the file
/// writer when dropped at the end of the run.
fn init_logging(log_dir: &Path) -> Result<WorkerGuard> {
    let file_name = format!("{}.log", Local::now().format("%Y%m%d"));
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false),
        )
        .init();
    Ok(guard)
}

/// Two columns, no header: organization name, listing root URL. A missing
/// file aborts the run.
fn read_input(path: &Path) -> Result<Vec<CrawlTask>> {
    if !path.exists() {
        anyhow::bail!("input file not found: {}", path.display());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open input file {}", path.display()))?;

    let mut tasks = Vec::new();
    for result in reader.records() {
        let row = result?;
        let name = row.get(0).unwrap_or_default().trim();
        let url = row.get(1).unwrap_or_default().trim();
        if name.is_empty() || url.is_empty() {
            warn!("Skipping malformed input row: {:?}", row);
            continue;
        }
        tasks.push(CrawlTask {
            organization_name: name.to_string(),
            listing_root_url: url.to_string(),
        });
    }
    info!("Loaded {} organizations from input", tasks.len());
    Ok(tasks)
}

async fn run_organizations(
    driver: &SessionDriver,
    cfg: &Config,
    tasks: &[CrawlTask],
) -> Result<()> {
    for task in tasks {
        if !cfg.is_targeted(&task.organization_name) {
            info!("=== [skipped] {} ===", task.organization_name);
            continue;
        }
        if let Err(e) = run_organization(driver, cfg, task).await {
            error!("{}: {:#}", task.organization_name, e);
        }
    }

    let consolidated = excel_writer::consolidate(&cfg.tmp_csv_dir, &cfg.output_file())?;
    storage::remove_stores(&consolidated);
    storage::cleanup_old_logs(&cfg.tmp_log_dir, cfg.retention_days);
    Ok(())
}

/// Crawl one organization end to end: listing pages, detail pages, then the
/// per-organization store. Errors here skip the organization only.
async fn run_organization(driver: &SessionDriver, cfg: &Config, task: &CrawlTask) -> Result<()> {
    info!("=== [start] {} ===", task.organization_name);
    let store = storage::store_path(cfg, &task.organization_name);

    let urls = listing::collect_urls(
        driver.page(),
        &task.listing_root_url,
        cfg.start_page,
        cfg.end_page,
    )
    .await
    .context("pagination discovery failed")?;
    info!("{}: {} product urls found", task.organization_name, urls.len());

    if cfg.worker_count > 1 {
        let records = distributor::distribute(
            urls,
            cfg.worker_count,
            cfg.auth_state_path.clone(),
            cfg.clone(),
        )
        .await;
        for batch in records.chunks(cfg.save_interval.max(1)) {
            csv_writer::append_records(batch, &store)?;
        }
        info!(
            "{}: {} records stored",
            task.organization_name,
            records.len()
        );
    } else {
        extract_serially(driver, cfg, &urls, &store).await?;
    }

    info!("=== [done] {} ===", task.organization_name);
    Ok(())
}

/// Sequential extraction on the coordinator session, flushing the buffer to
/// the store at every save interval. A failed interim flush keeps the buffer
/// for the next flush point, so extracted records are never silently dropped.
async fn extract_serially(
    driver: &SessionDriver,
    cfg: &Config,
    urls: &[String],
    store: &Path,
) -> Result<()> {
    let mut buffer: Vec<ProductVariationRecord> = Vec::new();
    let mut stored = 0usize;

    for (i, url) in urls.iter().enumerate() {
        buffer.extend(detail::extract(driver.page(), cfg, url).await);

        if buffer.len() >= cfg.save_interval.max(1) {
            match csv_writer::append_records(&buffer, store) {
                Ok(()) => {
                    stored += buffer.len();
                    buffer.clear();
                    info!("[interim save] {}/{} urls done", i + 1, urls.len());
                }
                Err(e) => error!("Interim flush failed, keeping buffer: {:#}", e),
            }
        }

        if i + 1 < urls.len() {
            tokio::time::sleep(cfg.request_delay()).await;
        }
    }

    if !buffer.is_empty() {
        csv_writer::append_records(&buffer, store)?;
        stored += buffer.len();
    }
    info!("{} records stored to {}", stored, store.display());
    Ok(())
}
