//! Dataset lifecycle: freshness decisioning, single-writer download, atomic
//! promotion, and the optional background refresh loop.
//!
//! Coordination across processes (and across hosts sharing the data
//! directory) happens through the exclusive-create lock owned by
//! [`SnapshotStore`]. Readers never take the lock; a loser of the race waits
//! for the snapshot to appear instead of downloading twice.

use futures_util::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::store::{sha256_of_file, LockAttempt, Metadata, SnapshotStore};

/// Canonical download URL for the Open Food Facts Parquet shard on the
/// dataset hub. Hub-style configured URLs resolve here.
const HUB_DOWNLOAD_URL: &str =
    "https://huggingface.co/datasets/openfoodfacts/product-database/resolve/main/food.parquet";

const HEAD_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(2);
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("snapshot verification failed: {0}")]
    VerifyFailed(String),
    #[error("timed out waiting for another instance to finish downloading")]
    Timeout,
    #[error("dataset refresh cancelled")]
    Cancelled,
}

/// Remote facts gathered from a `HEAD` probe.
struct RemoteMetadata {
    etag: String,
    size: i64,
}

/// Downloads and refreshes the snapshot consumed by the query engine.
pub struct DatasetManager {
    url: String,
    store: SnapshotStore,
    tmp_dir: PathBuf,
    disable_remote_check: bool,
    ignore_lock: bool,
    client: reqwest::Client,
}

impl DatasetManager {
    pub fn new(config: &Config) -> Self {
        let store = SnapshotStore::new(
            config.parquet_path.clone(),
            config.metadata_path.clone(),
            config.lock_path.clone(),
        );
        // Staged downloads live next to the data directory so promotion is a
        // same-filesystem rename.
        let tmp_dir = config
            .data_dir
            .parent()
            .map(|p| p.join("tmp-data"))
            .unwrap_or_else(|| PathBuf::from("tmp-data"));

        Self {
            url: config.parquet_url.clone(),
            store,
            tmp_dir,
            disable_remote_check: config.disable_remote_check,
            ignore_lock: config.ignore_lock,
            client: reqwest::Client::new(),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Returns once a usable snapshot exists at the configured path.
    ///
    /// Safe to call concurrently within one process and across processes;
    /// the refresh lock picks a single writer and everyone else waits.
    pub async fn ensure_snapshot(&self, cancel: &CancellationToken) -> Result<(), DatasetError> {
        let start = std::time::Instant::now();
        info!(path = %self.store.snapshot_path().display(), "ensuring dataset is available");

        if self.store.snapshot_exists() {
            if self.disable_remote_check {
                info!("remote checks disabled, using local snapshot");
                return Ok(());
            }
            match self.is_up_to_date(cancel).await {
                Ok(true) => {
                    info!(elapsed = ?start.elapsed(), "snapshot is up-to-date");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    // A probe failure never invalidates a snapshot we
                    // already have.
                    warn!(error = %e, "freshness probe failed, keeping local snapshot");
                    return Ok(());
                }
            }
        }

        self.download_with_lock(cancel).await?;
        info!(elapsed = ?start.elapsed(), "dataset ensured");
        Ok(())
    }

    /// Spawns the periodic refresh task. Errors are logged and the loop
    /// keeps running; it exits when `cancel` fires.
    pub fn spawn_refresh_loop(
        self: std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(?interval, "starting dataset refresh loop");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so the loop
            // waits a full interval before the first refresh.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("refresh loop stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        info!("refresh tick: checking dataset");
                        match self.ensure_snapshot(&cancel).await {
                            Ok(()) => info!("refresh completed"),
                            Err(DatasetError::Cancelled) => return,
                            Err(e) => error!(error = %e, "dataset refresh failed"),
                        }
                    }
                }
            }
        })
    }

    /// Resolves hub-style URLs to the canonical Parquet shard; anything else
    /// is used verbatim.
    fn download_url(&self) -> &str {
        if self.url.contains("huggingface.co/datasets/") {
            debug!(url = HUB_DOWNLOAD_URL, "resolved dataset hub URL");
            HUB_DOWNLOAD_URL
        } else {
            &self.url
        }
    }

    async fn is_up_to_date(&self, cancel: &CancellationToken) -> Result<bool, DatasetError> {
        let Some(local) = self.store.read_metadata() else {
            debug!("no local metadata, treating snapshot as stale");
            return Ok(false);
        };

        let remote = self.remote_metadata(cancel).await?;

        if !remote.etag.is_empty() && !local.etag.is_empty() {
            let fresh = remote.etag == local.etag;
            debug!(local = %local.etag, remote = %remote.etag, fresh, "etag comparison");
            return Ok(fresh);
        }

        let fresh = remote.size == local.size;
        debug!(local = local.size, remote = remote.size, fresh, "size comparison");
        Ok(fresh)
    }

    async fn remote_metadata(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RemoteMetadata, DatasetError> {
        let url = self.download_url();
        debug!(%url, "probing remote metadata");

        let request = self.client.head(url).timeout(HEAD_TIMEOUT).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DatasetError::Cancelled),
            r = request => r.map_err(|e| DatasetError::DownloadFailed(format!("HEAD {url}: {e}")))?,
        };

        if !response.status().is_success() {
            return Err(DatasetError::DownloadFailed(format!(
                "HEAD {url} returned {}",
                response.status()
            )));
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let size = response
            .content_length()
            .map(|n| n as i64)
            .unwrap_or(-1);

        debug!(%etag, size, "remote metadata fetched");
        Ok(RemoteMetadata { etag, size })
    }

    async fn download_with_lock(&self, cancel: &CancellationToken) -> Result<(), DatasetError> {
        info!("attempting to acquire download lock");

        if self.ignore_lock {
            warn!("IGNORE_LOCK enabled, force-removing any existing lock file");
            self.store.force_unlock();
        }

        let handle = match self.store.acquire_lock() {
            Ok(LockAttempt::Acquired(h)) => Some(h),
            Ok(LockAttempt::Busy) => {
                if self.ignore_lock {
                    // Override set but someone re-created the lock between
                    // the unlink and our create; proceed unguarded.
                    warn!("IGNORE_LOCK enabled but lock reappeared, downloading without it");
                    None
                } else {
                    info!("another instance is downloading, waiting for the snapshot");
                    return self.wait_for_snapshot(cancel).await;
                }
            }
            Err(e) => {
                return Err(DatasetError::DownloadFailed(format!(
                    "failed to create lock file: {e}"
                )))
            }
        };

        let result = self.download_and_promote(cancel).await;
        if let Some(h) = handle {
            self.store.release_lock(h);
        }
        result
    }

    async fn download_and_promote(&self, cancel: &CancellationToken) -> Result<(), DatasetError> {
        tokio::fs::create_dir_all(&self.tmp_dir)
            .await
            .map_err(|e| DatasetError::DownloadFailed(format!("creating tmp dir: {e}")))?;
        let tmp_path = self.tmp_dir.join("product-database.parquet.tmp");

        let result = self.download_verify_promote(&tmp_path, cancel).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn download_verify_promote(
        &self,
        tmp_path: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<(), DatasetError> {
        let written = self.stream_to_file(tmp_path, cancel).await?;

        let hash_path = tmp_path.to_path_buf();
        let sha = tokio::task::spawn_blocking(move || sha256_of_file(&hash_path))
            .await
            .map_err(|e| DatasetError::VerifyFailed(e.to_string()))?
            .map_err(|e| DatasetError::VerifyFailed(e.to_string()))?;

        let size = tokio::fs::metadata(tmp_path)
            .await
            .map_err(|e| DatasetError::VerifyFailed(format!("stat tmp file: {e}")))?
            .len() as i64;

        // Second probe just to capture the ETag; tolerated failure leaves it
        // empty and freshness falls back to size comparison.
        let etag = match self.remote_metadata(cancel).await {
            Ok(remote) => remote.etag,
            Err(DatasetError::Cancelled) => return Err(DatasetError::Cancelled),
            Err(e) => {
                warn!(error = %e, "could not capture ETag after download");
                String::new()
            }
        };

        self.store
            .promote(tmp_path)
            .map_err(|e| DatasetError::DownloadFailed(format!("promotion failed: {e}")))?;

        let meta = Metadata {
            sha256: sha.clone(),
            downloaded_at: chrono::Utc::now(),
            etag,
            size,
        };
        if let Err(e) = self.store.write_metadata(&meta) {
            warn!(error = %e, "failed to write snapshot metadata");
        }

        let _ = tokio::fs::remove_file(tmp_path).await;
        info!(size, sha256 = &sha[..16], bytes = written, "dataset downloaded");
        Ok(())
    }

    async fn stream_to_file(
        &self,
        path: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<u64, DatasetError> {
        let url = self.download_url();
        info!(%url, path = %path.display(), "downloading dataset");

        let request = self.client.get(url).timeout(DOWNLOAD_TIMEOUT).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DatasetError::Cancelled),
            r = request => r.map_err(|e| DatasetError::DownloadFailed(format!("GET {url}: {e}")))?,
        };

        if !response.status().is_success() {
            return Err(DatasetError::DownloadFailed(format!(
                "download returned status {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| DatasetError::DownloadFailed(format!("creating tmp file: {e}")))?;

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(DatasetError::Cancelled),
                c = stream.next() => c,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes)
                        .await
                        .map_err(|e| DatasetError::DownloadFailed(format!("writing body: {e}")))?;
                    written += bytes.len() as u64;
                }
                Some(Err(e)) => {
                    return Err(DatasetError::DownloadFailed(format!("reading body: {e}")))
                }
                None => break,
            }
        }
        file.flush()
            .await
            .map_err(|e| DatasetError::DownloadFailed(format!("flushing body: {e}")))?;

        info!(bytes = written, "download completed");
        Ok(written)
    }

    /// Polls for the snapshot while another instance downloads it.
    async fn wait_for_snapshot(&self, cancel: &CancellationToken) -> Result<(), DatasetError> {
        let deadline = tokio::time::Instant::now() + LOCK_WAIT_TIMEOUT;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DatasetError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(DatasetError::Timeout),
                _ = tokio::time::sleep(LOCK_POLL_INTERVAL) => {
                    if self.store.snapshot_exists() {
                        info!("snapshot available after other instance completed");
                        return Ok(());
                    }
                }
            }
        }
    }
}
