//! System download facility
//!
//! Fallback transport that hands every request to the platform's download
//! program (`curl` unless configured otherwise). It cannot resume, and a
//! timed-out or cancelled child process is killed.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::state::VersionStamp;
use super::transport::{
    Attempt, DownloadRequest, RemoteEndpoints, Transport, TransportError, TransportKind,
};
use crate::engine::config::{RemoteConfig, SystemDownloaderConfig};

pub struct SystemTransport {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    endpoints: RemoteEndpoints,
}

impl SystemTransport {
    pub fn new(remote: &RemoteConfig, downloader: &SystemDownloaderConfig) -> Self {
        Self {
            program: downloader.program.clone(),
            args: downloader.args.clone(),
            timeout: downloader.timeout(),
            endpoints: RemoteEndpoints::new(&remote.base_url, remote.files.clone()),
        }
    }

    /// Run the download program with `extra` appended; returns stdout
    async fn invoke<I, S>(&self, extra: I) -> Result<Vec<u8>, TransportError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(TransportError::Command {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn fetch_latest(&self, hint: VersionStamp) -> Result<VersionStamp, TransportError> {
        let stdout = self.invoke([self.endpoints.update_url(hint)]).await?;
        RemoteEndpoints::parse_update(&stdout)
    }

    async fn run(&self, request: DownloadRequest<'_>) -> Result<Attempt, TransportError> {
        let latest = self.fetch_latest(request.hint).await?;
        if !request.force && latest == request.hint {
            return Ok(Attempt::Skipped);
        }

        let payload = request.payload_dir(latest);
        // No resume: whatever an earlier attempt left behind is discarded
        match tokio::fs::remove_dir_all(&payload).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        tokio::fs::create_dir_all(&payload).await?;

        for file in self.endpoints.files() {
            let dest = payload.join(file);
            let url = self.endpoints.file_url(latest, file);
            self.invoke([
                OsStr::new("-o"),
                dest.as_os_str(),
                OsStr::new(url.as_str()),
            ])
            .await?;
            debug!(file = %file, program = %self.program, "blocklist file downloaded");
        }

        Ok(Attempt::Downloaded {
            version: latest,
            payload,
        })
    }
}

impl Transport for SystemTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::System
    }

    fn latest_version(&self, hint: VersionStamp) -> BoxFuture<'_, Result<VersionStamp, TransportError>> {
        self.fetch_latest(hint).boxed()
    }

    fn attempt<'a>(
        &'a self,
        request: DownloadRequest<'a>,
    ) -> BoxFuture<'a, Result<Attempt, TransportError>> {
        self.run(request).boxed()
    }
}
