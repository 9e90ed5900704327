//! Blocklist Updater - on-device update coordinator for a versioned local
//! DNS blocklist

pub mod engine;

pub use engine::config::UpdaterConfig;
pub use engine::locks::{OperationKind, OperationLock};
pub use engine::updater::{
    CheckOutcome, Confirmation, DownloadOutcome, DownloadReply, LifecycleState, UpdateCoordinator,
    UpdateError, UpdateEvent, VersionMarkers, VersionStamp,
};
