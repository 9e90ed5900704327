//! Update State
//!
//! Version markers for the local blocklist, the lifecycle state derived from
//! them, and the store that persists them across restarts.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

use crate::engine::locks::OperationGuard;

/// Epoch-millisecond version of the blocklist. Zero means unset.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VersionStamp(u64);

impl VersionStamp {
    pub const UNSET: Self = Self(0);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    pub const fn is_set(self) -> bool {
        self.0 != 0
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        if !self.is_set() {
            return None;
        }
        i64::try_from(self.0)
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    }

    /// Human readable form, e.g. `12-03-2024 10:15:00`
    pub fn describe(self) -> String {
        match self.to_datetime() {
            Some(at) => at.format("%d-%m-%Y %H:%M:%S").to_string(),
            None if self.is_set() => self.0.to_string(),
            None => "never".to_string(),
        }
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "unset")
        }
    }
}

/// Lifecycle of the local blocklist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Nothing has ever been installed
    NeedsInitialDownload,
    /// Installed, but freshness was never confirmed against the remote
    NeedsCheck,
    /// A newer version has been fetched than the one installed
    UpdateAvailable,
    UpToDate,
}

impl LifecycleState {
    pub fn description(&self) -> &'static str {
        match self {
            Self::NeedsInitialDownload => "No local blocklist installed",
            Self::NeedsCheck => "Local blocklist installed, never checked for updates",
            Self::UpdateAvailable => "A newer blocklist is available",
            Self::UpToDate => "Local blocklist is up to date",
        }
    }
}

/// The three version markers, always read and written together
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMarkers {
    #[serde(default)]
    pub installed: VersionStamp,
    #[serde(default)]
    pub fetched: VersionStamp,
    #[serde(default)]
    pub known_remote: VersionStamp,
}

impl VersionMarkers {
    pub const UNSET: Self = Self {
        installed: VersionStamp::UNSET,
        fetched: VersionStamp::UNSET,
        known_remote: VersionStamp::UNSET,
    };

    pub fn new(installed: u64, fetched: u64, known_remote: u64) -> Self {
        Self {
            installed: VersionStamp::from_millis(installed),
            fetched: VersionStamp::from_millis(fetched),
            known_remote: VersionStamp::from_millis(known_remote),
        }
    }

    /// Classify the markers. Pure; callers re-derive on every query.
    pub fn lifecycle(&self) -> LifecycleState {
        if !self.installed.is_set() {
            LifecycleState::NeedsInitialDownload
        } else if !self.known_remote.is_set() {
            LifecycleState::NeedsCheck
        } else if self.fetched > self.installed {
            LifecycleState::UpdateAvailable
        } else {
            LifecycleState::UpToDate
        }
    }

    /// A fetched version is never older than the installed one
    pub fn is_consistent(&self) -> bool {
        !self.fetched.is_set() || !self.installed.is_set() || self.fetched >= self.installed
    }

    fn with_install(self, version: VersionStamp) -> Self {
        Self {
            installed: version,
            fetched: self.fetched.max(version),
            ..self
        }
    }

    fn with_remote(self, version: VersionStamp) -> Self {
        Self {
            known_remote: self.known_remote.max(version),
            ..self
        }
    }
}

/// Complete record persisted to disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(flatten)]
    markers: VersionMarkers,
    /// User opted into the in-process downloader on restricted networks
    #[serde(default)]
    prefers_in_process: bool,
    /// Last successful remote check
    #[serde(default)]
    last_check: Option<DateTime<Utc>>,
}

impl PersistedState {
    fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(StoreError::Read)?;
        let mut state: Self = serde_json::from_str(&content)?;
        if !state.markers.is_consistent() {
            tracing::warn!(
                installed = %state.markers.installed,
                fetched = %state.markers.fetched,
                "fetched version older than installed, clamping"
            );
            state.markers.fetched = state.markers.installed;
        }
        Ok(state)
    }

    /// Write to a temp file first, then rename over the old one
    fn save(&self, path: &Path) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::Write)?;
        }
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content).map_err(StoreError::Write)?;
        fs::rename(&temp_path, path).map_err(StoreError::Write)?;
        Ok(())
    }
}

/// Persisted markers and downloader preference.
///
/// Reads return a whole-record snapshot and never wait on a running
/// operation. Marker writes take an [`OperationGuard`], so they can only
/// happen inside an operation's critical section.
pub struct TimestampStore {
    path: Option<PathBuf>,
    state: RwLock<PersistedState>,
    /// Orders writers; held across the file write instead of `state`
    writer: Mutex<()>,
}

impl TimestampStore {
    /// Load the store from `path`, starting empty if the file does not exist
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let state = PersistedState::load(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: RwLock::new(state),
            writer: Mutex::new(()),
        })
    }

    /// A store that is never written to disk
    pub fn in_memory(markers: VersionMarkers) -> Self {
        Self {
            path: None,
            state: RwLock::new(PersistedState {
                markers,
                ..PersistedState::default()
            }),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn snapshot(&self) -> PersistedState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn markers(&self) -> VersionMarkers {
        self.snapshot().markers
    }

    pub fn prefers_in_process(&self) -> bool {
        self.snapshot().prefers_in_process
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.snapshot().last_check
    }

    pub fn set_prefers_in_process(&self, enabled: bool) -> Result<(), StoreError> {
        self.update(|state| state.prefers_in_process = enabled)?;
        Ok(())
    }

    /// Record a freshly installed version
    pub fn record_install(
        &self,
        _guard: &OperationGuard,
        version: VersionStamp,
    ) -> Result<VersionMarkers, StoreError> {
        self.update(|state| state.markers = state.markers.with_install(version))
    }

    /// Record the newest version advertised by the remote
    pub fn record_remote(
        &self,
        _guard: &OperationGuard,
        version: VersionStamp,
    ) -> Result<VersionMarkers, StoreError> {
        self.update(|state| {
            state.markers = state.markers.with_remote(version);
            state.last_check = Some(Utc::now());
        })
    }

    /// Return all markers to their pristine state
    pub fn reset(&self, _guard: &OperationGuard) -> Result<VersionMarkers, StoreError> {
        self.update(|state| {
            state.markers = VersionMarkers::UNSET;
            state.last_check = None;
        })
    }

    /// Re-read the file, picking up writes made by another process.
    ///
    /// Called once an operation holds the lock shared between processes.
    pub fn refresh(&self, _guard: &OperationGuard) -> Result<VersionMarkers, StoreError> {
        let Some(path) = &self.path else {
            return Ok(self.markers());
        };
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let loaded = PersistedState::load(path)?;
        let markers = loaded.markers;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        Ok(markers)
    }

    /// Apply `change` to a copy, persist it, then publish it.
    ///
    /// Nothing becomes visible to readers unless the write succeeded, and
    /// readers are never held up by the file write.
    fn update(&self, change: impl FnOnce(&mut PersistedState)) -> Result<VersionMarkers, StoreError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.snapshot();
        change(&mut next);
        if let Some(path) = &self.path {
            next.save(path)?;
        }
        let markers = next.markers;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(markers)
    }
}

/// Timestamp store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read state: {0}")]
    Read(#[source] io::Error),
    #[error("Failed to write state: {0}")]
    Write(#[source] io::Error),
    #[error("Invalid state format: {0}")]
    Parse(#[from] serde_json::Error),
}
