//! Update Coordinator
//!
//! Drives the local blocklist through its lifecycle. Every state-mutating
//! command (check, download, redownload, delete, recover) runs under the
//! process-wide [`OperationLock`]; a second command is refused, never queued.
//! `evaluate()` only reads a snapshot of the markers and never waits.
//!
//! Ordering of a download:
//! 1. lock acquired, before any I/O
//! 2. transport stages the payload in `<artifact>/.staging`
//! 3. payload renamed into its version directory
//! 4. markers written in one atomic replace
//! 5. older version directories pruned
//! 6. lock released and a single event published
//!
//! A crash between 3 and 4 leaves a version directory the markers do not
//! point at; [`UpdateCoordinator::recover`] prunes it on the next start.
//!
//! Filesystem work runs on the blocking pool and carries the guard with it,
//! so the lock outlives a cancelled caller until that work is done.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use super::artifact_store::ArtifactStore;
use super::download::HttpTransport;
use super::state::{LifecycleState, StoreError, TimestampStore, VersionMarkers, VersionStamp};
use super::system::SystemTransport;
use super::transport::{
    Attempt, DownloadRequest, NetworkPolicy, Selection, TransportError, TransportKind,
    TransportSelector,
};
use crate::engine::config::UpdaterConfig;
use crate::engine::locks::{LockError, OperationGuard, OperationInfo, OperationKind, OperationLock};

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "updater.lock";

/// Result of a download attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadOutcome {
    Succeeded { version: VersionStamp },
    Failed { reason: String },
    /// The remote had nothing newer than the installed version
    NotStarted,
}

/// Reply to a download command
#[derive(Debug)]
pub enum DownloadReply {
    Completed(DownloadOutcome),
    /// The network is policy-restricted and the user has not picked a
    /// downloader; nothing was touched
    ConfirmationRequired(Confirmation),
}

/// A paused download waiting for the user's choice.
///
/// Either continuation consumes the confirmation, so it is resolved at most
/// once, and neither consults the selector again.
#[derive(Debug)]
#[must_use = "a confirmation must be resolved or explicitly dropped"]
pub struct Confirmation {
    force: bool,
}

impl Confirmation {
    pub fn force(&self) -> bool {
        self.force
    }

    /// Opt into the in-process downloader for good, then download
    pub async fn enable_in_process(
        self,
        coordinator: &UpdateCoordinator,
    ) -> Result<DownloadOutcome, UpdateError> {
        let guard = coordinator.acquire(download_kind(self.force))?;
        coordinator.store.set_prefers_in_process(true)?;
        info!(id = %guard.id(), "in-process downloader enabled by user");
        Ok(coordinator
            .run_download(guard, self.force, TransportKind::InProcess)
            .await)
    }

    /// Download once through the system downloader; the preference is kept
    pub async fn use_system(
        self,
        coordinator: &UpdateCoordinator,
    ) -> Result<DownloadOutcome, UpdateError> {
        let guard = coordinator.acquire(download_kind(self.force))?;
        Ok(coordinator
            .run_download(guard, self.force, TransportKind::System)
            .await)
    }
}

/// Result of a check for a newer blocklist
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckOutcome {
    UpdateAvailable { remote: VersionStamp },
    UpToDate { remote: VersionStamp },
    Failed { reason: String },
}

/// What startup recovery repaired
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Markers pointed at a version that is not on disk
    pub markers_reset: bool,
    /// Version directories removed
    pub pruned: usize,
}

/// Terminal result carried by an [`UpdateEvent`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "detail", rename_all = "snake_case")]
pub enum EventResult {
    Checked(CheckOutcome),
    Downloaded(DownloadOutcome),
    Deleted,
    DeleteFailed { reason: String },
    Recovered(RecoveryReport),
}

/// Published once per completed operation
#[derive(Debug, Clone, Serialize)]
pub struct UpdateEvent {
    pub operation: OperationInfo,
    pub transport: Option<TransportKind>,
    pub result: EventResult,
    pub markers: VersionMarkers,
    pub state: LifecycleState,
    pub finished_at: DateTime<Utc>,
}

/// Coordinator errors
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("another blocklist operation is in progress: {0}")]
    OperationInProgress(LockError),

    #[error(transparent)]
    Lock(LockError),

    #[error("failed to delete local blocklist: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to set up downloader: {0}")]
    Transport(#[from] TransportError),
}

/// Run filesystem work on the blocking pool; the guard comes back with the result
async fn run_blocking<T, F>(guard: OperationGuard, work: F) -> Result<(OperationGuard, T), JoinError>
where
    F: FnOnce(&OperationGuard) -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = work(&guard);
        (guard, result)
    })
    .await
}

fn download_kind(force: bool) -> OperationKind {
    if force {
        OperationKind::Redownload
    } else {
        OperationKind::Download
    }
}

/// Coordinates check, download and delete of one blocklist artifact
pub struct UpdateCoordinator {
    artifact_name: String,
    store: Arc<TimestampStore>,
    artifacts: ArtifactStore,
    selector: TransportSelector,
    lock: OperationLock,
    events: broadcast::Sender<UpdateEvent>,
}

impl UpdateCoordinator {
    pub fn new(
        artifact_name: &str,
        store: TimestampStore,
        artifacts: ArtifactStore,
        selector: TransportSelector,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            artifact_name: artifact_name.to_string(),
            store: Arc::new(store),
            artifacts,
            selector,
            lock: OperationLock::new(),
            events,
        }
    }

    /// Build the coordinator for `data_dir` with both real transports
    pub fn open(
        config: &UpdaterConfig,
        data_dir: &Path,
        policy: Arc<dyn NetworkPolicy>,
    ) -> Result<Self, UpdateError> {
        let store = TimestampStore::open(&data_dir.join(STATE_FILE))?;
        let artifacts = ArtifactStore::new(data_dir.to_path_buf());
        let selector = TransportSelector::new(
            Arc::new(HttpTransport::new(&config.remote)?),
            Arc::new(SystemTransport::new(
                &config.remote,
                &config.system_downloader,
            )),
            policy,
        );
        Ok(Self::new(
            &config.artifact_name,
            store,
            artifacts,
            selector,
            config.event_capacity,
        )
        .with_lock(OperationLock::with_lock_file(&data_dir.join(LOCK_FILE))))
    }

    /// Replace the process-local lock, typically with one backed by a lock file
    pub fn with_lock(mut self, lock: OperationLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn artifact_name(&self) -> &str {
        &self.artifact_name
    }

    pub fn store(&self) -> &TimestampStore {
        &self.store
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn is_policy_restricted(&self) -> bool {
        self.selector.is_restricted()
    }

    /// The operation currently in flight, if any
    pub fn active_operation(&self) -> Option<OperationInfo> {
        self.lock.active()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state, derived fresh from the markers
    pub fn evaluate(&self) -> LifecycleState {
        self.store.markers().lifecycle()
    }

    fn acquire(&self, kind: OperationKind) -> Result<OperationGuard, UpdateError> {
        let guard = self.lock.try_acquire(kind).map_err(|e| match e {
            LockError::AlreadyLocked { .. } => {
                info!(requested = ?kind, error = %e, "blocklist operation refused");
                UpdateError::OperationInProgress(e)
            }
            LockError::Io { .. } => UpdateError::Lock(e),
        })?;
        // Another process may have written the markers since we loaded them
        if self.lock.lock_file().is_some() {
            self.store.refresh(&guard)?;
        }
        Ok(guard)
    }

    fn emit(&self, operation: &OperationInfo, transport: Option<TransportKind>, result: EventResult) {
        let markers = self.store.markers();
        let event = UpdateEvent {
            operation: operation.clone(),
            transport,
            result,
            markers,
            state: markers.lifecycle(),
            finished_at: Utc::now(),
        };
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Ask the remote for its newest version and record it.
    ///
    /// Never prompts: when the in-process downloader is not allowed the
    /// check goes through the system downloader.
    pub async fn check(&self) -> Result<CheckOutcome, UpdateError> {
        let guard = self.acquire(OperationKind::Check)?;
        let operation = guard.info().clone();
        let kind = match self.selector.selection(self.store.prefers_in_process()) {
            Selection::Use(kind) => kind,
            Selection::NeedsConfirmation => {
                info!(
                    id = %operation.id,
                    reason = "network is policy-restricted and the in-app downloader is not enabled",
                    "checking through the system downloader instead of asking"
                );
                TransportKind::System
            }
        };
        let installed = self.store.markers().installed;
        info!(id = %operation.id, transport = ?kind, %installed, "checking for blocklist update");

        let outcome = match self.selector.transport(kind).latest_version(installed).await {
            Ok(remote) => {
                let store = Arc::clone(&self.store);
                match run_blocking(guard, move |guard| store.record_remote(guard, remote)).await {
                    Ok((_, Ok(markers))) if remote > markers.installed => {
                        CheckOutcome::UpdateAvailable { remote }
                    }
                    Ok((_, Ok(_))) => CheckOutcome::UpToDate { remote },
                    Ok((_, Err(e))) => CheckOutcome::Failed {
                        reason: e.to_string(),
                    },
                    Err(e) => CheckOutcome::Failed {
                        reason: e.to_string(),
                    },
                }
            }
            Err(e) => CheckOutcome::Failed {
                reason: e.to_string(),
            },
        };

        match &outcome {
            CheckOutcome::Failed { reason } => warn!(id = %operation.id, %reason, "blocklist check failed"),
            _ => info!(id = %operation.id, ?outcome, "blocklist check finished"),
        }
        self.emit(&operation, Some(kind), EventResult::Checked(outcome.clone()));
        Ok(outcome)
    }

    /// Download the newest blocklist, or re-download the current one when
    /// `force_redownload` is set
    pub async fn download(&self, force_redownload: bool) -> Result<DownloadReply, UpdateError> {
        let guard = self.acquire(download_kind(force_redownload))?;

        match self.selector.selection(self.store.prefers_in_process()) {
            Selection::Use(kind) => Ok(DownloadReply::Completed(
                self.run_download(guard, force_redownload, kind).await,
            )),
            Selection::NeedsConfirmation => {
                info!(id = %guard.id(), "network is policy-restricted, downloader choice required");
                drop(guard);
                Ok(DownloadReply::ConfirmationRequired(Confirmation {
                    force: force_redownload,
                }))
            }
        }
    }

    async fn run_download(
        &self,
        guard: OperationGuard,
        force: bool,
        kind: TransportKind,
    ) -> DownloadOutcome {
        let operation = guard.info().clone();
        let installed = self.store.markers().installed;
        info!(id = %operation.id, transport = ?kind, force, %installed, "downloading blocklist");

        let outcome = match self.stage_and_install(guard, force, kind, installed).await {
            Ok(outcome) => outcome,
            Err(reason) => DownloadOutcome::Failed { reason },
        };

        match &outcome {
            DownloadOutcome::Succeeded { version } => {
                info!(id = %operation.id, %version, "blocklist installed")
            }
            DownloadOutcome::NotStarted => {
                info!(id = %operation.id, "blocklist already current, nothing downloaded")
            }
            DownloadOutcome::Failed { reason } => {
                warn!(id = %operation.id, %reason, "blocklist download failed")
            }
        }
        self.emit(&operation, Some(kind), EventResult::Downloaded(outcome.clone()));
        outcome
    }

    /// Consumes the guard; the lock is released when this returns
    async fn stage_and_install(
        &self,
        guard: OperationGuard,
        force: bool,
        kind: TransportKind,
        installed: VersionStamp,
    ) -> Result<DownloadOutcome, String> {
        let name = self.artifact_name.clone();
        let staging = self.artifacts.staging_path(&name);

        let artifacts = self.artifacts.clone();
        let (prepare_name, prepare_dir) = (name.clone(), staging.clone());
        let (guard, prepared) = run_blocking(guard, move |_| -> io::Result<()> {
            if force {
                artifacts.clear_staging(&prepare_name)?;
            }
            std::fs::create_dir_all(&prepare_dir)
        })
        .await
        .map_err(|e| e.to_string())?;
        prepared.map_err(|e| format!("failed to prepare staging area: {}", e))?;

        let request = DownloadRequest {
            hint: installed,
            force,
            staging_dir: &staging,
        };
        let (version, payload) = match self.selector.transport(kind).attempt(request).await {
            Ok(Attempt::Downloaded { version, payload }) => (version, payload),
            Ok(Attempt::Skipped) => return Ok(DownloadOutcome::NotStarted),
            Err(e) => return Err(e.to_string()),
        };

        if !version.is_set() || version < installed {
            return Err(format!(
                "remote version {} is older than installed {}",
                version, installed
            ));
        }

        let artifacts = self.artifacts.clone();
        let store = Arc::clone(&self.store);
        let (_guard, committed) = run_blocking(guard, move |guard| -> Result<(), String> {
            artifacts
                .install(&name, &payload, version)
                .map_err(|e| format!("failed to install blocklist {}: {}", version, e))?;
            store
                .record_install(guard, version)
                .map_err(|e| e.to_string())?;

            if let Err(e) = artifacts.prune_except(&name, Some(version)) {
                warn!(error = %e, "failed to prune old blocklist versions");
            }
            if let Err(e) = artifacts.clear_staging(&name) {
                warn!(error = %e, "failed to clear staging area");
            }
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())?;
        committed?;

        Ok(DownloadOutcome::Succeeded { version })
    }

    /// Remove the local blocklist and return to the pristine state.
    ///
    /// On a removal error the markers are left as they were and the call is
    /// safe to retry.
    pub async fn delete(&self) -> Result<(), UpdateError> {
        let guard = self.acquire(OperationKind::Delete)?;
        let operation = guard.info().clone();
        let location = self.artifacts.path(&self.artifact_name);
        info!(id = %operation.id, path = %location.display(), "deleting local blocklist");

        let artifacts = self.artifacts.clone();
        let store = Arc::clone(&self.store);
        let result = run_blocking(guard, move |guard| -> Result<(), UpdateError> {
            artifacts.remove_all(&location)?;
            store.reset(guard)?;
            Ok(())
        })
        .await
        .map_err(|e| UpdateError::Io(io::Error::other(e)))
        .and_then(|(_guard, result)| result);

        match &result {
            Ok(()) => {
                info!(id = %operation.id, "local blocklist deleted");
                self.emit(&operation, None, EventResult::Deleted);
            }
            Err(e) => {
                error!(id = %operation.id, error = %e, "local blocklist delete failed");
                self.emit(
                    &operation,
                    None,
                    EventResult::DeleteFailed {
                        reason: e.to_string(),
                    },
                );
            }
        }
        result
    }

    /// Repair what an interrupted operation may have left behind.
    ///
    /// Meant to run once at startup. The staging area is kept so an
    /// interrupted in-process download can resume.
    pub fn recover(&self) -> Result<RecoveryReport, UpdateError> {
        let guard = self.acquire(OperationKind::Recover)?;
        let name = self.artifact_name.as_str();
        let markers = self.store.markers();
        let mut report = RecoveryReport::default();

        if markers.installed.is_set() && !self.artifacts.has_version(name, markers.installed) {
            warn!(installed = %markers.installed, "installed blocklist missing on disk, resetting markers");
            self.store.reset(&guard)?;
            report.markers_reset = true;
        }

        let keep = (!report.markers_reset).then_some(markers.installed);
        report.pruned = self.artifacts.prune_except(name, keep)?;
        if report.markers_reset || report.pruned > 0 {
            info!(?report, "blocklist state recovered");
        }

        self.emit(guard.info(), None, EventResult::Recovered(report.clone()));
        Ok(report)
    }
}
