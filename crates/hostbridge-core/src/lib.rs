//! Core orchestration for hostbridge.
//!
//! This crate ties the schema, store, fetch and runtime crates together into the
//! two central APIs: the `ProvisioningManager`, which turns manifest entries into
//! installed runtime bundles, and the `ExecutionHost`, which launches a hosted
//! runtime against an installed bundle with its bridges attached and supervises
//! it until it exits or crashes. It also provides per-identifier install locking,
//! lifecycle state validation and crash reports.

pub mod concurrency;
pub mod crash;
pub mod host;
pub mod lifecycle;
pub mod provision;
pub mod session;

pub use concurrency::{install_signal_handler, shutdown_requested, SingleFlight, StoreLock};
pub use crash::CrashReport;
pub use host::{ExecutionHost, HostConfig, LaunchRequest, RuntimeProcessHandle};
pub use lifecycle::{validate_transition, RuntimeState};
pub use provision::{
    ProgressFn, ProvisionOutcome, ProvisionPhase, ProvisioningManager, ResetReport, VerifyReport,
};
pub use session::{bridges_for_session, load_input_profile};

use hostbridge_fetch::FetchError;
use hostbridge_runtime::RuntimeError;
use hostbridge_store::StoreError;
use thiserror::Error;

/// Failures of a provisioning operation.
///
/// Every variant carries only text so a single result can be handed to all
/// callers waiting on the same in-flight provisioning.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("network error: {0}")]
    Network(String),
    #[error("checksum mismatch for {what}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        what: String,
        expected: String,
        actual: String,
    },
    #[error("disk full: {0}")]
    DiskFull(String),
    #[error("decompression failed: {0}")]
    Decompression(String),
    #[error("provisioning cancelled")]
    Cancelled,
    #[error("bundle '{bundle}' is not installed{}", at_version(.version))]
    NotInstalled {
        bundle: String,
        version: Option<String>,
    },
    #[error("{bundle}@{version} is installed from a different archive; reset the bundle first")]
    VersionConflict { bundle: String, version: String },
    #[error("no superseded version of '{0}' to roll back to")]
    NoRollbackTarget(String),
    #[error("manifest error: {0}")]
    Manifest(String),
    #[error("store error: {0}")]
    Store(String),
}

impl ProvisioningError {
    /// Whether the caller may retry the same operation and expect it to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProvisioningError::Network(_)
                | ProvisioningError::ChecksumMismatch { .. }
                | ProvisioningError::DiskFull(_)
                | ProvisioningError::Decompression(_)
                | ProvisioningError::Cancelled
        )
    }
}

fn at_version(version: &Option<String>) -> String {
    version
        .as_ref()
        .map(|v| format!(" at version {v}"))
        .unwrap_or_default()
}

fn is_disk_full(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOSPC)
}

impl From<FetchError> for ProvisioningError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Io(io) if is_disk_full(&io) => ProvisioningError::DiskFull(io.to_string()),
            FetchError::Io(io) => ProvisioningError::Store(io.to_string()),
            FetchError::Network(msg) => ProvisioningError::Network(msg),
            FetchError::NotFound(what) => ProvisioningError::Network(format!("not found: {what}")),
            FetchError::UnsupportedScheme(_) | FetchError::Config(_) => {
                ProvisioningError::Manifest(e.to_string())
            }
            FetchError::ChecksumMismatch { expected, actual } => {
                ProvisioningError::ChecksumMismatch {
                    what: "archive".to_owned(),
                    expected,
                    actual,
                }
            }
            FetchError::Cancelled => ProvisioningError::Cancelled,
        }
    }
}

impl From<StoreError> for ProvisioningError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(io) if is_disk_full(&io) => ProvisioningError::DiskFull(io.to_string()),
            StoreError::Cancelled => ProvisioningError::Cancelled,
            StoreError::IntegrityFailure {
                what,
                expected,
                actual,
            } => ProvisioningError::ChecksumMismatch {
                what,
                expected,
                actual,
            },
            e if e.is_archive_failure() => ProvisioningError::Decompression(e.to_string()),
            e => ProvisioningError::Store(e.to_string()),
        }
    }
}

impl From<hostbridge_schema::ManifestError> for ProvisioningError {
    fn from(e: hostbridge_schema::ManifestError) -> Self {
        ProvisioningError::Manifest(e.to_string())
    }
}

impl From<std::io::Error> for ProvisioningError {
    fn from(e: std::io::Error) -> Self {
        if is_disk_full(&e) {
            ProvisioningError::DiskFull(e.to_string())
        } else {
            ProvisioningError::Store(e.to_string())
        }
    }
}

/// How a failure should be presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad manifest, profile or configuration input.
    Input,
    /// Provisioning or storage failure; see `ProvisioningError::is_retryable`.
    Provisioning,
    /// The bundle cannot run on this host. Not retryable without a new bundle.
    IncompatibleRuntime,
    /// The caller broke an API precondition.
    Usage,
    Internal,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error("incompatible runtime: {0}")]
    Incompatible(String),
    #[error("runtime error: {0}")]
    Runtime(RuntimeError),
    #[error("a hosted runtime for '{0}' is already running")]
    AlreadyRunning(String),
    #[error("no native surface is attached to the graphics shim")]
    NoSurface,
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("manifest error: {0}")]
    Manifest(#[from] hostbridge_schema::ManifestError),
    #[error("config error: {0}")]
    Config(#[from] hostbridge_schema::ConfigError),
    #[error("input profile error: {0}")]
    Profile(#[from] hostbridge_schema::ProfileError),
    #[error("controller config error: {0}")]
    Controller(#[from] hostbridge_schema::ControllerConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<RuntimeError> for CoreError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Incompatible(reason) => CoreError::Incompatible(reason),
            RuntimeError::Profile(p) => CoreError::Profile(p),
            other => CoreError::Runtime(other),
        }
    }
}

impl CoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::Provisioning(ProvisioningError::Manifest(_))
            | CoreError::Manifest(_)
            | CoreError::Config(_)
            | CoreError::Profile(_)
            | CoreError::Controller(_)
            | CoreError::Fetch(FetchError::Config(_) | FetchError::UnsupportedScheme(_)) => {
                ErrorClass::Input
            }
            CoreError::Provisioning(_) | CoreError::Store(_) | CoreError::Fetch(_) => {
                ErrorClass::Provisioning
            }
            CoreError::Incompatible(_) => ErrorClass::IncompatibleRuntime,
            CoreError::AlreadyRunning(_) | CoreError::NoSurface => ErrorClass::Usage,
            CoreError::Runtime(_)
            | CoreError::InvalidTransition { .. }
            | CoreError::Io(_)
            | CoreError::Serialization(_) => ErrorClass::Internal,
        }
    }
}
