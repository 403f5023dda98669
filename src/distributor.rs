use std::path::PathBuf;

use tracing::{error, info};

use crate::config::Config;
use crate::detail;
use crate::models::ProductVariationRecord;
use crate::session::SessionDriver;

/// Contiguous chunks of size ceil(len / worker_count); the last chunk may be
/// shorter. Chunk order matches input order.
pub fn chunk_urls(urls: &[String], worker_count: usize) -> Vec<Vec<String>> {
    let worker_count = worker_count.max(1);
    if urls.is_empty() {
        return Vec::new();
    }
    let size = urls.len().div_ceil(worker_count);
    urls.chunks(size).map(|c| c.to_vec()).collect()
}

/// Run one isolated extraction loop per chunk and concatenate the results in
/// chunk-submission order. Each worker owns its own browser session restored
/// from the shared read-only auth artifact; one worker failing does not
/// cancel its siblings.
pub async fn distribute(
    urls: Vec<String>,
    worker_count: usize,
    auth_state_path: PathBuf,
    cfg: Config,
) -> Vec<ProductVariationRecord> {
    let chunks = chunk_urls(&urls, worker_count);
    info!(
        "Distributing {} urls across {} workers",
        urls.len(),
        chunks.len()
    );

    let mut handles = Vec::with_capacity(chunks.len());
    for (worker_id, chunk) in chunks.into_iter().enumerate() {
        let auth = auth_state_path.clone();
        let cfg = cfg.clone();
        handles.push(tokio::spawn(run_worker(worker_id, chunk, auth, cfg)));
    }

    let mut all_records = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(records) => all_records.extend(records),
            Err(e) => error!("Worker task panicked: {}", e),
        }
    }
    all_records
}

/// Sequential loop over one chunk. The session is closed on every exit path.
async fn run_worker(
    worker_id: usize,
    urls: Vec<String>,
    auth_state_path: PathBuf,
    cfg: Config,
) -> Vec<ProductVariationRecord> {
    if urls.is_empty() {
        return Vec::new();
    }

    let driver = match SessionDriver::open(Some(&auth_state_path), cfg.headless).await {
        Ok(d) => d,
        Err(e) => {
            error!("Worker {}: failed to open session: {:#}", worker_id, e);
            return Vec::new();
        }
    };

    info!("Worker {}: starting on {} urls", worker_id, urls.len());
    let mut records = Vec::new();
    for (i, url) in urls.iter().enumerate() {
        records.extend(detail::extract(driver.page(), &cfg, url).await);
        if i + 1 < urls.len() {
            tokio::time::sleep(cfg.request_delay()).await;
        }
    }

    info!(
        "Worker {}: done, {} records from {} urls",
        worker_id,
        records.len(),
        urls.len()
    );
    driver.close().await;
    records
}
