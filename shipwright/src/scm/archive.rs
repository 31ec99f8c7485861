//! Archive and object storage downloads

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::errors::DeployError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Fetches archives over http(s), or copies them for `file://` URLs
#[derive(Debug, Clone, Default)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Download `url` to `dest`
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<(), DeployError> {
        let parsed = Url::parse(url)
            .map_err(|e| DeployError::CheckoutFailed(format!("invalid archive URL {}: {}", url, e)))?;
        info!("Downloading archive from {}://{}", parsed.scheme(), parsed.host_str().unwrap_or(""));

        match parsed.scheme() {
            "file" => {
                let source = parsed.to_file_path().map_err(|_| {
                    DeployError::CheckoutFailed(format!("invalid file URL {}", url))
                })?;
                tokio::fs::copy(&source, dest).await.map_err(|e| {
                    DeployError::CheckoutFailed(format!("copy {}: {}", source.display(), e))
                })?;
            }
            "http" | "https" => {
                let bytes = self
                    .client
                    .get(parsed)
                    .send()
                    .await
                    .and_then(|response| response.error_for_status())
                    .map_err(|e| DeployError::CheckoutFailed(format!("download failed: {}", e)))?
                    .bytes()
                    .await
                    .map_err(|e| DeployError::CheckoutFailed(format!("download failed: {}", e)))?;

                let mut file = tokio::fs::File::create(dest).await?;
                file.write_all(&bytes).await?;
                file.sync_all().await?;
            }
            other => {
                return Err(DeployError::CheckoutFailed(format!(
                    "unsupported archive URL scheme {}",
                    other
                )));
            }
        }

        Ok(())
    }
}

/// URL of an object in S3-compatible storage
pub fn object_storage_url(bucket: &str, key: &str, region: Option<&str>) -> String {
    let key = key.trim_start_matches('/');
    match region {
        None | Some("") | Some("us-east-1") => format!("https://{}.s3.amazonaws.com/{}", bucket, key),
        Some(region) => format!("https://{}.s3.{}.amazonaws.com/{}", bucket, region, key),
    }
}

/// Unpack a tarball, gzip-compressed or not, into `dest`
pub async fn unpack(archive: &Path, dest: &Path) -> Result<(), DeployError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&archive, &dest)).await?
}

fn unpack_blocking(archive: &Path, dest: &Path) -> Result<(), DeployError> {
    std::fs::create_dir_all(dest)?;

    let mut magic = [0u8; 2];
    let is_gzip = {
        let mut file = std::fs::File::open(archive)?;
        file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC
    };

    let file = std::fs::File::open(archive)?;
    let result = if is_gzip {
        tar::Archive::new(GzDecoder::new(file)).unpack(dest)
    } else {
        tar::Archive::new(file).unpack(dest)
    };

    result.map_err(|e| {
        DeployError::CheckoutFailed(format!("unpack {}: {}", archive.display(), e))
    })?;
    debug!("Unpacked {} into {}", archive.display(), dest.display());
    Ok(())
}

/// The directory holding the unpacked sources.
///
/// Archives often wrap everything in one top-level directory; in that case the
/// wrapper is skipped.
pub async fn source_root(unpacked: &Path) -> Result<PathBuf, DeployError> {
    let mut entries = tokio::fs::read_dir(unpacked).await?;
    let mut only: Option<PathBuf> = None;
    let mut count = 0;

    while let Some(entry) = entries.next_entry().await? {
        count += 1;
        if entry.file_type().await?.is_dir() {
            only = Some(entry.path());
        }
    }

    match (count, only) {
        (1, Some(dir)) => Ok(dir),
        _ => Ok(unpacked.to_path_buf()),
    }
}
