use blocklist_updater::engine::config::UpdaterConfig;
use blocklist_updater::engine::locks::OperationLock;
use blocklist_updater::engine::updater::transport::{Attempt, DownloadRequest, TransportError};
use blocklist_updater::engine::updater::{
    ArtifactStore, CheckOutcome, DownloadOutcome, DownloadReply, EventResult, LifecycleState,
    StaticPolicy, TimestampStore, Transport, TransportKind, TransportSelector, UpdateCoordinator,
    UpdateError, VersionMarkers, VersionStamp,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

const NAME: &str = "local_blocklist";

/// Fake remote. Optionally parks inside `attempt` until released.
struct FakeRemote {
    kind: TransportKind,
    latest: AtomicU64,
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
    attempts: AtomicUsize,
    queries: AtomicUsize,
}

impl FakeRemote {
    fn new(kind: TransportKind, latest: u64) -> Arc<Self> {
        Arc::new(Self {
            kind,
            latest: AtomicU64::new(latest),
            gated: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
            attempts: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
        })
    }

    fn gated(kind: TransportKind, latest: u64) -> Arc<Self> {
        let remote = Self::new(kind, latest);
        remote.gated.store(true, Ordering::SeqCst);
        remote
    }

    fn calls(&self) -> usize {
        self.attempts.load(Ordering::SeqCst) + self.queries.load(Ordering::SeqCst)
    }

    fn stage(&self, request: DownloadRequest<'_>) -> Result<Attempt, TransportError> {
        let version = VersionStamp::from_millis(self.latest.load(Ordering::SeqCst));
        if !request.force && version == request.hint {
            return Ok(Attempt::Skipped);
        }
        let payload = request.payload_dir(version);
        fs::create_dir_all(&payload)?;
        fs::write(payload.join("td.txt"), version.to_string())?;
        Ok(Attempt::Downloaded { version, payload })
    }
}

impl Transport for FakeRemote {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn latest_version(&self, _hint: VersionStamp) -> BoxFuture<'_, Result<VersionStamp, TransportError>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let latest = VersionStamp::from_millis(self.latest.load(Ordering::SeqCst));
        futures_util::future::ready(Ok(latest)).boxed()
    }

    fn attempt<'a>(
        &'a self,
        request: DownloadRequest<'a>,
    ) -> BoxFuture<'a, Result<Attempt, TransportError>> {
        async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.gated.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.stage(request)
        }
        .boxed()
    }
}

struct Harness {
    coordinator: Arc<UpdateCoordinator>,
    in_process: Arc<FakeRemote>,
    system: Arc<FakeRemote>,
    policy: Arc<StaticPolicy>,
}

fn harness(
    dir: &Path,
    markers: VersionMarkers,
    in_process: Arc<FakeRemote>,
    restricted: bool,
) -> Harness {
    let system = FakeRemote::new(TransportKind::System, in_process.latest.load(Ordering::SeqCst));
    let policy = Arc::new(StaticPolicy::new(restricted));
    let selector = TransportSelector::new(in_process.clone(), system.clone(), policy.clone());
    let coordinator = UpdateCoordinator::new(
        NAME,
        TimestampStore::in_memory(markers),
        ArtifactStore::new(dir.to_path_buf()),
        selector,
        16,
    );
    Harness {
        coordinator: Arc::new(coordinator),
        in_process,
        system,
        policy,
    }
}

#[tokio::test]
async fn test_concurrent_downloads_one_refused() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::gated(TransportKind::InProcess, 100);
    let h = harness(dir.path(), VersionMarkers::UNSET, remote.clone(), false);

    let first = tokio::spawn({
        let coordinator = h.coordinator.clone();
        async move { coordinator.download(false).await }
    });
    remote.entered.notified().await;

    let second = h.coordinator.download(false).await;
    assert!(matches!(second, Err(UpdateError::OperationInProgress(_))));
    assert!(h.coordinator.active_operation().is_some());

    remote.release.notify_one();
    let reply = first.await.unwrap().unwrap();
    assert!(matches!(
        reply,
        DownloadReply::Completed(DownloadOutcome::Succeeded { version }) if version.as_millis() == 100
    ));
    assert_eq!(remote.attempts.load(Ordering::SeqCst), 1);
    assert!(h.coordinator.active_operation().is_none());
}

#[tokio::test]
async fn test_delete_refused_during_download() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::gated(TransportKind::InProcess, 100);
    let h = harness(dir.path(), VersionMarkers::UNSET, remote.clone(), false);

    let download = tokio::spawn({
        let coordinator = h.coordinator.clone();
        async move { coordinator.download(false).await }
    });
    remote.entered.notified().await;

    assert!(matches!(
        h.coordinator.delete().await,
        Err(UpdateError::OperationInProgress(_))
    ));
    // Readers are never blocked
    assert_eq!(h.coordinator.evaluate(), LifecycleState::NeedsInitialDownload);

    remote.release.notify_one();
    download.await.unwrap().unwrap();
    assert_eq!(h.coordinator.store().markers(), VersionMarkers::new(100, 100, 0));
}

#[tokio::test]
async fn test_cancelled_download_releases_lock() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::gated(TransportKind::InProcess, 100);
    let h = harness(dir.path(), VersionMarkers::UNSET, remote.clone(), false);

    let task = tokio::spawn({
        let coordinator = h.coordinator.clone();
        async move { coordinator.download(false).await }
    });
    remote.entered.notified().await;
    assert!(h.coordinator.active_operation().is_some());

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert!(h.coordinator.active_operation().is_none());
    assert_eq!(h.coordinator.store().markers(), VersionMarkers::UNSET);

    remote.release.notify_one();
    let reply = h.coordinator.download(false).await.unwrap();
    assert!(matches!(
        reply,
        DownloadReply::Completed(DownloadOutcome::Succeeded { .. })
    ));
}

#[tokio::test]
async fn test_first_download_from_pristine() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new(TransportKind::InProcess, 100);
    let h = harness(dir.path(), VersionMarkers::UNSET, remote, false);
    assert_eq!(h.coordinator.evaluate(), LifecycleState::NeedsInitialDownload);

    let reply = h.coordinator.download(false).await.unwrap();
    assert!(matches!(
        reply,
        DownloadReply::Completed(DownloadOutcome::Succeeded { .. })
    ));
    assert_eq!(h.coordinator.store().markers(), VersionMarkers::new(100, 100, 0));
    assert_eq!(h.coordinator.evaluate(), LifecycleState::NeedsCheck);

    let installed = h
        .coordinator
        .artifacts()
        .version_path(NAME, VersionStamp::from_millis(100));
    assert_eq!(fs::read_to_string(installed.join("td.txt")).unwrap(), "100");
}

#[tokio::test]
async fn test_forced_redownload_of_fetched_version() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new(TransportKind::InProcess, 150);
    let h = harness(dir.path(), VersionMarkers::new(100, 150, 150), remote, false);
    fs::create_dir_all(
        h.coordinator
            .artifacts()
            .version_path(NAME, VersionStamp::from_millis(100)),
    )
    .unwrap();
    assert_eq!(h.coordinator.evaluate(), LifecycleState::UpdateAvailable);

    let reply = h.coordinator.download(true).await.unwrap();
    assert!(matches!(
        reply,
        DownloadReply::Completed(DownloadOutcome::Succeeded { version }) if version.as_millis() == 150
    ));
    assert_eq!(h.coordinator.store().markers(), VersionMarkers::new(150, 150, 150));
    assert_eq!(h.coordinator.evaluate(), LifecycleState::UpToDate);
    assert_eq!(
        h.coordinator.artifacts().list_versions(NAME).unwrap(),
        vec![VersionStamp::from_millis(150)]
    );
}

#[tokio::test]
async fn test_restricted_network_asks_before_any_io() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new(TransportKind::InProcess, 100);
    let h = harness(dir.path(), VersionMarkers::new(50, 50, 50), remote, true);

    let reply = h.coordinator.download(false).await.unwrap();
    let DownloadReply::ConfirmationRequired(confirmation) = reply else {
        panic!("expected a confirmation");
    };
    assert_eq!(h.in_process.calls(), 0);
    assert_eq!(h.system.calls(), 0);
    assert_eq!(h.coordinator.store().markers(), VersionMarkers::new(50, 50, 50));
    assert!(!h.coordinator.artifacts().path(NAME).exists());
    assert!(h.coordinator.active_operation().is_none());

    // Declining is just dropping the continuation
    drop(confirmation);
    assert_eq!(h.in_process.calls(), 0);
    assert_eq!(h.system.calls(), 0);
}

#[tokio::test]
async fn test_policy_lifted_uses_in_process() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new(TransportKind::InProcess, 100);
    let h = harness(dir.path(), VersionMarkers::UNSET, remote, true);
    assert!(h.coordinator.is_policy_restricted());

    h.policy.set_restricted(false);
    let reply = h.coordinator.download(false).await.unwrap();
    assert!(matches!(
        reply,
        DownloadReply::Completed(DownloadOutcome::Succeeded { .. })
    ));
    assert_eq!(h.in_process.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(h.system.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new(TransportKind::InProcess, 100);
    let h = harness(dir.path(), VersionMarkers::UNSET, remote, false);

    h.coordinator.delete().await.unwrap();
    h.coordinator.delete().await.unwrap();
    assert_eq!(h.coordinator.store().markers(), VersionMarkers::UNSET);
    assert_eq!(h.coordinator.evaluate(), LifecycleState::NeedsInitialDownload);
}

#[tokio::test]
async fn test_delete_removes_artifact_and_resets() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new(TransportKind::InProcess, 100);
    let h = harness(dir.path(), VersionMarkers::UNSET, remote, false);
    h.coordinator.download(false).await.unwrap();
    h.coordinator.check().await.unwrap();
    assert_eq!(h.coordinator.evaluate(), LifecycleState::UpToDate);

    h.coordinator.delete().await.unwrap();
    assert!(!h.coordinator.artifacts().path(NAME).exists());
    assert_eq!(h.coordinator.store().markers(), VersionMarkers::UNSET);
    assert!(h.coordinator.store().last_check().is_none());
}

#[tokio::test]
async fn test_delete_failure_keeps_markers() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new(TransportKind::InProcess, 100);
    let h = harness(dir.path(), VersionMarkers::new(100, 150, 150), remote, false);
    assert_eq!(h.coordinator.evaluate(), LifecycleState::UpdateAvailable);
    // A regular file where the artifact directory should be
    fs::write(h.coordinator.artifacts().path(NAME), b"not a directory").unwrap();
    let mut events = h.coordinator.subscribe();

    let result = h.coordinator.delete().await;
    assert!(matches!(result, Err(UpdateError::Io(_))));
    assert_eq!(h.coordinator.store().markers(), VersionMarkers::new(100, 150, 150));
    assert_eq!(h.coordinator.evaluate(), LifecycleState::UpdateAvailable);
    assert!(h.coordinator.active_operation().is_none());

    let event = events.recv().await.unwrap();
    assert!(matches!(event.result, EventResult::DeleteFailed { .. }));
    assert_eq!(event.markers, VersionMarkers::new(100, 150, 150));
}

#[tokio::test]
async fn test_one_event_per_operation() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new(TransportKind::InProcess, 100);
    let h = harness(dir.path(), VersionMarkers::UNSET, remote, false);
    let mut events = h.coordinator.subscribe();

    h.coordinator.download(false).await.unwrap();
    h.coordinator.check().await.unwrap();
    h.coordinator.delete().await.unwrap();

    let downloaded = events.recv().await.unwrap();
    assert_eq!(downloaded.transport, Some(TransportKind::InProcess));
    assert_eq!(
        downloaded.result,
        EventResult::Downloaded(DownloadOutcome::Succeeded {
            version: VersionStamp::from_millis(100)
        })
    );
    assert_eq!(downloaded.state, LifecycleState::NeedsCheck);

    let checked = events.recv().await.unwrap();
    assert_eq!(
        checked.result,
        EventResult::Checked(CheckOutcome::UpToDate {
            remote: VersionStamp::from_millis(100)
        })
    );
    assert_eq!(checked.state, LifecycleState::UpToDate);

    let deleted = events.recv().await.unwrap();
    assert_eq!(deleted.result, EventResult::Deleted);
    assert_eq!(deleted.state, LifecycleState::NeedsInitialDownload);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_markers_stay_consistent_across_operations() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new(TransportKind::InProcess, 100);
    let h = harness(dir.path(), VersionMarkers::UNSET, remote.clone(), false);
    let coordinator = &h.coordinator;

    let mut seen = vec![coordinator.store().markers()];
    coordinator.download(false).await.unwrap();
    seen.push(coordinator.store().markers());

    remote.latest.store(200, Ordering::SeqCst);
    assert!(matches!(
        coordinator.check().await.unwrap(),
        CheckOutcome::UpdateAvailable { .. }
    ));
    seen.push(coordinator.store().markers());

    coordinator.download(false).await.unwrap();
    seen.push(coordinator.store().markers());
    assert_eq!(coordinator.evaluate(), LifecycleState::UpToDate);

    // An older remote never rolls the install back
    remote.latest.store(150, Ordering::SeqCst);
    assert!(matches!(
        coordinator.download(true).await.unwrap(),
        DownloadReply::Completed(DownloadOutcome::Failed { .. })
    ));
    seen.push(coordinator.store().markers());

    coordinator.delete().await.unwrap();
    seen.push(coordinator.store().markers());

    for markers in &seen {
        assert!(markers.is_consistent(), "inconsistent markers: {:?}", markers);
    }
    assert_eq!(seen[3], VersionMarkers::new(200, 200, 200));
    assert_eq!(seen[4], seen[3]);
    assert_eq!(seen[5], VersionMarkers::UNSET);
}

#[tokio::test]
async fn test_open_persists_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = UpdaterConfig::default();

    {
        let coordinator =
            UpdateCoordinator::open(&config, dir.path(), Arc::new(StaticPolicy::new(false)))
                .unwrap();
        coordinator.store().set_prefers_in_process(true).unwrap();
        assert_eq!(coordinator.artifact_name(), "local_blocklist");
    }

    let reopened =
        UpdateCoordinator::open(&config, dir.path(), Arc::new(StaticPolicy::new(true))).unwrap();
    assert!(reopened.store().prefers_in_process());
    assert!(reopened.is_policy_restricted());
    assert_eq!(reopened.evaluate(), LifecycleState::NeedsInitialDownload);
    assert!(dir.path().join("state.json").exists());
}

/// Two coordinators on one data directory, as two CLI processes would be
fn shared_dir_coordinator(dir: &Path, remote: Arc<FakeRemote>) -> UpdateCoordinator {
    let system = FakeRemote::new(TransportKind::System, remote.latest.load(Ordering::SeqCst));
    let selector = TransportSelector::new(remote, system, Arc::new(StaticPolicy::new(false)));
    UpdateCoordinator::new(
        NAME,
        TimestampStore::open(&dir.join("state.json")).unwrap(),
        ArtifactStore::new(dir.to_path_buf()),
        selector,
        16,
    )
    .with_lock(OperationLock::with_lock_file(&dir.join("updater.lock")))
}

#[tokio::test]
async fn test_coordinators_sharing_a_directory_exclude_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let first_remote = FakeRemote::gated(TransportKind::InProcess, 200);
    let first = Arc::new(shared_dir_coordinator(dir.path(), first_remote.clone()));
    let second = shared_dir_coordinator(dir.path(), FakeRemote::new(TransportKind::InProcess, 200));

    let download = tokio::spawn({
        let first = first.clone();
        async move { first.download(false).await }
    });
    first_remote.entered.notified().await;

    assert!(matches!(
        second.delete().await,
        Err(UpdateError::OperationInProgress(_))
    ));
    assert!(matches!(
        second.recover(),
        Err(UpdateError::OperationInProgress(_))
    ));
    assert_eq!(second.active_operation().unwrap().pid, std::process::id());

    first_remote.release.notify_one();
    download.await.unwrap().unwrap();
    assert!(second.active_operation().is_none());
    assert!(!dir.path().join("updater.lock").exists());

    // The second coordinator sees the install once it holds the lock
    let reply = second.download(false).await.unwrap();
    assert!(matches!(
        reply,
        DownloadReply::Completed(DownloadOutcome::NotStarted)
    ));
    assert_eq!(second.store().markers(), VersionMarkers::new(200, 200, 0));

    second.delete().await.unwrap();
    let on_disk = TimestampStore::open(&dir.path().join("state.json")).unwrap();
    assert_eq!(on_disk.markers(), VersionMarkers::UNSET);
}
