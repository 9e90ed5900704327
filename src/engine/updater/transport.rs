//! Transports and transport selection
//!
//! Two downloaders can fetch the blocklist: the in-process HTTP client,
//! which routes through the enforced tunnel, and the platform's own download
//! program. Which one runs depends on whether outbound traffic is currently
//! policy-restricted and on what the user opted into.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::state::VersionStamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Built-in HTTP client
    InProcess,
    /// Platform download program
    System,
}

impl TransportKind {
    pub fn description(&self) -> &'static str {
        match self {
            Self::InProcess => "in-app downloader",
            Self::System => "system downloader",
        }
    }
}

/// One download attempt handed to a transport
#[derive(Debug, Clone, Copy)]
pub struct DownloadRequest<'a> {
    /// Currently installed version
    pub hint: VersionStamp,
    /// Download even if the remote version equals `hint`
    pub force: bool,
    /// Scratch area owned by the coordinator for this artifact
    pub staging_dir: &'a Path,
}

impl DownloadRequest<'_> {
    /// Where the files of `version` are staged
    pub fn payload_dir(&self, version: VersionStamp) -> PathBuf {
        self.staging_dir.join(version.as_millis().to_string())
    }
}

/// What a transport did with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Files of `version` are complete in `payload`
    Downloaded {
        version: VersionStamp,
        payload: PathBuf,
    },
    /// The remote version equals the hint and the request was not forced
    Skipped,
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// A blocklist downloader
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Newest version advertised by the remote
    fn latest_version(&self, hint: VersionStamp) -> BoxFuture<'_, Result<VersionStamp, TransportError>>;

    /// Stage the newest version under `request.staging_dir`
    fn attempt<'a>(
        &'a self,
        request: DownloadRequest<'a>,
    ) -> BoxFuture<'a, Result<Attempt, TransportError>>;
}

/// Remote layout shared by both transports
#[derive(Debug, Clone)]
pub struct RemoteEndpoints {
    base_url: String,
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    latest: u64,
}

impl RemoteEndpoints {
    pub fn new(base_url: &str, files: Vec<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            files,
        }
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn update_url(&self, hint: VersionStamp) -> String {
        format!("{}/update/blocklists?tstamp={}", self.base_url, hint.as_millis())
    }

    pub fn file_url(&self, version: VersionStamp, file: &str) -> String {
        format!("{}/blocklists/{}/{}", self.base_url, version.as_millis(), file)
    }

    /// Parse the body of the update endpoint
    pub fn parse_update(body: &[u8]) -> Result<VersionStamp, TransportError> {
        let response: UpdateResponse = serde_json::from_slice(body)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        let latest = VersionStamp::from_millis(response.latest);
        if !latest.is_set() {
            return Err(TransportError::InvalidResponse(
                "remote advertised no blocklist version".to_string(),
            ));
        }
        Ok(latest)
    }
}

/// Whether outbound traffic is forced through the tunnel
pub trait NetworkPolicy: Send + Sync {
    fn is_restricted(&self) -> bool;
}

/// Policy flag set by the tunnel runtime
#[derive(Debug, Default)]
pub struct StaticPolicy {
    restricted: AtomicBool,
}

impl StaticPolicy {
    pub fn new(restricted: bool) -> Self {
        Self {
            restricted: AtomicBool::new(restricted),
        }
    }

    pub fn set_restricted(&self, restricted: bool) {
        self.restricted.store(restricted, Ordering::SeqCst);
    }
}

impl NetworkPolicy for StaticPolicy {
    fn is_restricted(&self) -> bool {
        self.restricted.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Use(TransportKind),
    /// The user has to pick a downloader first
    NeedsConfirmation,
}

/// Pick a transport for the current network mode
pub fn select(policy_restricted: bool, prefers_in_process: bool) -> Selection {
    match (policy_restricted, prefers_in_process) {
        (false, _) => Selection::Use(TransportKind::InProcess),
        (true, true) => Selection::Use(TransportKind::InProcess),
        (true, false) => Selection::NeedsConfirmation,
    }
}

/// Holds both transports and the policy source
#[derive(Clone)]
pub struct TransportSelector {
    in_process: Arc<dyn Transport>,
    system: Arc<dyn Transport>,
    policy: Arc<dyn NetworkPolicy>,
}

impl TransportSelector {
    pub fn new(
        in_process: Arc<dyn Transport>,
        system: Arc<dyn Transport>,
        policy: Arc<dyn NetworkPolicy>,
    ) -> Self {
        Self {
            in_process,
            system,
            policy,
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.policy.is_restricted()
    }

    pub fn selection(&self, prefers_in_process: bool) -> Selection {
        select(self.policy.is_restricted(), prefers_in_process)
    }

    pub fn transport(&self, kind: TransportKind) -> &Arc<dyn Transport> {
        match kind {
            TransportKind::InProcess => &self.in_process,
            TransportKind::System => &self.system,
        }
    }
}
