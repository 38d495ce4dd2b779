//! Error types. Accelerator failures carry the integer status codes callers check to abort a run;
//! setup problems are reported descriptively, and are never recovered mid-run.

use std::io;

use thiserror::Error;

/// Fatal accelerator conditions. None of these are retried.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum DeviceError {
    #[error("Accelerator has not been initialized")]
    NotInitialized,
    #[error("Accelerator {requested} requested, but only {available} are available")]
    DeviceOutOfRange { requested: usize, available: usize },
    #[error("Accelerator buffer allocation failed: {0}")]
    AllocationFailed(String),
    #[error("Accelerator program failed to load: {0}")]
    ProgramLoad(String),
    #[error("Accelerator program targets arch {kernel:.2}; device reports {device:.2}")]
    ArchitectureMismatch { kernel: f64, device: f64 },
    #[error("Double precision requested, but the accelerator does not support it")]
    PrecisionUnsupported,
}

impl DeviceError {
    /// The integer status callers historically checked.
    pub fn status(&self) -> i32 {
        match self {
            Self::NotInitialized => -1,
            Self::DeviceOutOfRange { .. } => -2,
            Self::AllocationFailed(_) => -3,
            Self::ProgramLoad(_) | Self::ArchitectureMismatch { .. } => -4,
            Self::PrecisionUnsupported => -5,
        }
    }
}

/// 0 on success, otherwise the negative status of the error.
pub fn status_of<T>(result: &Result<T, DeviceError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}

/// Setup-time configuration problems: illegal arguments, missing attributes, and incompatible
/// companion solvers.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),
    #[error("Incorrect args for pair coefficients")]
    IncorrectCoeffs,
    #[error("All pair coeffs are not set")]
    CoeffsNotSet,
    #[error("Pair style requires atom attribute q")]
    MissingCharge,
    #[error("Pair style is incompatible with the long-range solver (no g_ewald)")]
    IncompatibleKspace,
    #[error("Pair cutoff < Respa interior cutoff")]
    RespaCutoff,
    #[error("Invalid RESPA cutoffs: {0}")]
    RespaOrder(String),
    #[error("Lookup table: {0}")]
    Table(String),
    #[error("Thread pool: {0}")]
    ThreadPool(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
