//! In-process HTTP downloader
//!
//! Fetches the blocklist files with reqwest. Interrupted files are kept as
//! `<name>.partial` in the staging area and resumed with a `Range` request on
//! the next attempt.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::state::VersionStamp;
use super::transport::{
    Attempt, DownloadRequest, RemoteEndpoints, Transport, TransportError, TransportKind,
};
use crate::engine::config::RemoteConfig;

/// Download manager for blocklist files
pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: RemoteEndpoints,
    operation_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &RemoteConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("blocklist-updater/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.request_timeout())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            endpoints: RemoteEndpoints::new(&config.base_url, config.files.clone()),
            operation_timeout: config.operation_timeout(),
        })
    }

    /// Bound a whole operation; the inner future is dropped on expiry
    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        tokio::time::timeout(self.operation_timeout, operation)
            .await
            .map_err(|_| TransportError::Timeout(self.operation_timeout))?
    }

    async fn fetch_latest(&self, hint: VersionStamp) -> Result<VersionStamp, TransportError> {
        let url = self.endpoints.update_url(hint);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::InvalidResponse(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }
        let body = response.bytes().await?;
        RemoteEndpoints::parse_update(&body)
    }

    async fn run(&self, request: DownloadRequest<'_>) -> Result<Attempt, TransportError> {
        let latest = self.fetch_latest(request.hint).await?;
        if !request.force && latest == request.hint {
            return Ok(Attempt::Skipped);
        }

        let payload = request.payload_dir(latest);
        fs::create_dir_all(&payload).await?;

        for file in self.endpoints.files() {
            let dest = payload.join(file);
            if fs::try_exists(&dest).await? {
                continue;
            }
            let url = self.endpoints.file_url(latest, file);
            let (bytes, resumed) = self.download_file(&url, &dest).await?;
            debug!(file = %file, bytes, resumed, "blocklist file downloaded");
        }

        Ok(Attempt::Downloaded {
            version: latest,
            payload,
        })
    }

    /// Download a single file, resuming a previous partial download
    async fn download_file(&self, url: &str, dest: &Path) -> Result<(u64, bool), TransportError> {
        let partial_path = partial_path(dest);
        let mut start_byte = match fs::metadata(&partial_path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        let response = loop {
            let mut request = self.client.get(url);
            if start_byte > 0 {
                request = request.header(RANGE, format!("bytes={}-", start_byte));
            }
            let response = request.send().await?;
            if start_byte == 0 || response.status() != StatusCode::RANGE_NOT_SATISFIABLE {
                break response;
            }

            // Nothing left past the partial file: it was complete before the rename
            if complete_length(&response) == Some(start_byte) {
                fs::rename(&partial_path, dest).await?;
                return Ok((start_byte, true));
            }
            debug!(url = %url, start_byte, "partial file does not match remote, restarting");
            fs::remove_file(&partial_path).await?;
            start_byte = 0;
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::InvalidResponse(format!(
                "HTTP {} for {}",
                status, url
            )));
        }

        // A plain 200 means the server ignored the range; start over
        let resumed = start_byte > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut file = if resumed {
            OpenOptions::new().append(true).open(&partial_path).await?
        } else {
            fs::File::create(&partial_path).await?
        };

        let mut downloaded = if resumed { start_byte } else { 0 };
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }

        file.flush().await?;
        drop(file);

        fs::rename(&partial_path, dest).await?;
        Ok((downloaded, resumed))
    }
}

/// Total size from a `Content-Range: bytes */<len>` header
fn complete_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes */")?
        .trim()
        .parse()
        .ok()
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    dest.with_file_name(name)
}

impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }

    fn latest_version(&self, hint: VersionStamp) -> BoxFuture<'_, Result<VersionStamp, TransportError>> {
        self.bounded(self.fetch_latest(hint)).boxed()
    }

    fn attempt<'a>(
        &'a self,
        request: DownloadRequest<'a>,
    ) -> BoxFuture<'a, Result<Attempt, TransportError>> {
        self.bounded(self.run(request)).boxed()
    }
}
