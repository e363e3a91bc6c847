//! Streaming artifact download into a staging area.
//!
//! Artifacts are never written into the plugin directory directly. They land
//! in a temporary file under the staging directory and are only copied into
//! place once the manifest has been validated and no conflict blocks the
//! install. The temporary file is removed when the [`StagedArtifact`] drops.

use crate::error::PluginError;
use crate::events::{DownloadProgress, OperationContext};
use crate::transport::HttpTransport;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

/// Limits applied to a single download.
#[derive(Debug, Clone)]
pub struct DownloadLimits {
    /// Largest accepted artifact
    pub max_bytes: u64,
    /// Longest wait for the next chunk
    pub stall_timeout: Duration,
}

/// A downloaded artifact waiting to be committed.
#[derive(Debug)]
pub struct StagedArtifact {
    path: TempPath,
    size: u64,
}

impl StagedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Downloads `url` into a fresh file under `staging_dir`.
///
/// Progress is reported in 10% steps when the length is known. The
/// cancellation token of `ctx` is observed while waiting for the response and
/// between chunks.
pub async fn download_to_staging(
    transport: &dyn HttpTransport,
    url: &str,
    staging_dir: &Path,
    limits: &DownloadLimits,
    ctx: &OperationContext,
) -> Result<StagedArtifact, PluginError> {
    let url = Url::parse(url).map_err(|e| PluginError::InvalidUrl(format!("{}: {}", url, e)))?;

    tokio::fs::create_dir_all(staging_dir)
        .await
        .map_err(|e| PluginError::io(staging_dir, e))?;
    let staged = tempfile::Builder::new()
        .prefix("download-")
        .suffix(".jar.part")
        .tempfile_in(staging_dir)
        .map_err(|e| PluginError::io(staging_dir, e))?;
    let (file, path) = staged.into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let cancel = ctx.cancellation().clone();
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(cancelled()),
        response = transport.get_stream(&url) => response?,
    };

    let total = response.content_length;
    if let Some(total) = total {
        if total > limits.max_bytes {
            return Err(too_large(limits.max_bytes));
        }
    }

    let mut body = response.body;
    let mut downloaded: u64 = 0;
    let mut last_reported: Option<u8> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            next = tokio::time::timeout(limits.stall_timeout, body.next()) => next,
        };
        let chunk = match next {
            Err(_) => {
                return Err(PluginError::DownloadTimeout(format!(
                    "no data received from {} for {:?}",
                    url, limits.stall_timeout
                )))
            }
            Ok(None) => break,
            Ok(Some(chunk)) => chunk?,
        };

        downloaded += chunk.len() as u64;
        if downloaded > limits.max_bytes {
            return Err(too_large(limits.max_bytes));
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| PluginError::io(&*path, e))?;

        if let Some(total) = total.filter(|t| *t > 0) {
            let percentage = ((downloaded.min(total) * 100) / total) as u8;
            let step = percentage / 10;
            if last_reported.map_or(true, |last| step > last / 10) {
                last_reported = Some(percentage);
                ctx.progress(DownloadProgress {
                    downloaded,
                    total: Some(total),
                    percentage: Some(percentage),
                });
            }
        }
    }

    if let Some(total) = total {
        if downloaded != total {
            return Err(PluginError::Network(format!(
                "download {} ended after {} of {} bytes",
                url, downloaded, total
            )));
        }
    } else {
        ctx.progress(DownloadProgress {
            downloaded,
            total: None,
            percentage: None,
        });
    }

    file.flush().await.map_err(|e| PluginError::io(&*path, e))?;
    file.sync_all()
        .await
        .map_err(|e| PluginError::io(&*path, e))?;
    drop(file);

    debug!("Downloaded {} bytes from {} to {}", downloaded, url, path.display());
    Ok(StagedArtifact {
        path,
        size: downloaded,
    })
}

fn cancelled() -> PluginError {
    PluginError::Cancelled("stopped during download".to_string())
}

fn too_large(max_bytes: u64) -> PluginError {
    PluginError::Validation(format!(
        "artifact exceeds the maximum download size of {} bytes",
        max_bytes
    ))
}
