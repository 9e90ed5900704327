//! Local Blocklist Update System
//!
//! Keeps one versioned blocklist artifact current on the device.
//!
//! Components:
//! - `state` - Version markers, lifecycle state and the timestamp store
//! - `artifact_store` - Filesystem layout of the downloaded blocklist
//! - `transport` - Downloader trait, network policy and transport selection
//! - `download` - In-process HTTP downloader with resume
//! - `system` - Fallback through the platform download program
//! - `coordinator` - Check/download/delete commands under one operation lock

pub mod state;
pub mod artifact_store;
pub mod transport;
pub mod download;
pub mod system;
pub mod coordinator;

pub use artifact_store::ArtifactStore;
pub use coordinator::{
    CheckOutcome, Confirmation, DownloadOutcome, DownloadReply, EventResult, RecoveryReport,
    UpdateCoordinator, UpdateError, UpdateEvent,
};
pub use state::{LifecycleState, TimestampStore, VersionMarkers, VersionStamp};
pub use transport::{NetworkPolicy, StaticPolicy, Transport, TransportKind, TransportSelector};
