use thiserror::Error;

use crate::{ConfigError, DeviceError, ResourceError, SubmitError, SyncError};

/// Umbrella error for calls that cross component boundaries (frame distribution, context setup).
#[derive(Debug, Error)]
pub enum MultiGpuError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}
