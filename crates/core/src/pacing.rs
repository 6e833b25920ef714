use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Fixed pauses between consecutive model requests inside one stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pacing {
    pub blueprint_chunk_delay: Duration,
    pub finalize_delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            blueprint_chunk_delay: Duration::from_millis(1500),
            finalize_delay: Duration::from_millis(500),
        }
    }
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            blueprint_chunk_delay: Duration::ZERO,
            finalize_delay: Duration::ZERO,
        }
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    if cancel.is_cancelled() {
        return Err(Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
