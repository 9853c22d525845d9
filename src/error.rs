//! Error types shared by the GPU backends and the frame scheduler.

use thiserror::Error;

/// Failures while acquiring a device or building the simulation resources.
///
/// These are fatal: they surface from construction and are never retried.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no suitable GPU adapter found: {0}")]
    NoAdapter(String),
    #[error("adapter does not support {0}")]
    MissingCapability(&'static str),
    #[error("failed to request device: {0}")]
    RequestDevice(String),
    #[error("failed to create surface: {0}")]
    CreateSurface(String),
    #[error("invalid simulation config: {0}")]
    InvalidConfig(String),
    #[error("field buffer of {size} bytes exceeds the device storage binding limit of {limit} bytes")]
    GridTooLarge { size: u64, limit: u64 },
    #[error("failed to build {stage} pipeline: {message}")]
    Pipeline {
        stage: &'static str,
        message: String,
    },
}

/// A failure reported by a backend while issuing one tick.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TickError {
    /// Nothing was submitted for this tick; the next one may succeed.
    #[error("transient submission failure: {0}")]
    Transient(String),
    /// The device can no longer be used.
    #[error("device lost: {0}")]
    DeviceLost(String),
}

/// The terminal condition of a frame scheduler.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("device lost, simulation stopped: {0}")]
    DeviceLost(String),
}
