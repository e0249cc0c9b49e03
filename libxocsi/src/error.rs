//! CSI error types.
//!
//! All errors surfaced to an RPC caller are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] and implements
//! [`Serialize`]/[`Deserialize`] so errors can travel across the QUIC
//! transport. Each variant maps onto a gRPC-style status [`Code`] via
//! [`CsiError::code`], which is what a container orchestrator acts on.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status codes surfaced to the caller.
///
/// The numeric values match the gRPC status code table so that a gateway can
/// translate them one to one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Code {
    /// Missing required fields or an unsupported capability.
    InvalidArgument = 3,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The RPC is outside the supported subset.
    Unimplemented = 12,
    /// Hypervisor, mount or registry failure.
    Internal = 13,
    /// Plugin misconfiguration.
    Unavailable = 14,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Code::InvalidArgument => "InvalidArgument",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
        };
        f.write_str(s)
    }
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The volume or node is not in a state that allows the operation,
    /// e.g. the volume is attached to another node.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The hypervisor management API returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// Waiting for an asynchronous hypervisor operation ran out of time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The requested RPC is not supported by this plugin.
    #[error("{0} is not implemented")]
    Unimplemented(String),

    /// The plugin is misconfigured and cannot serve the request.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Status code reported to the caller for this error.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::Unavailable(_) => Code::Unavailable,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::BackendError(_)
            | Self::Timeout(_)
            | Self::TransportError(_)
            | Self::Internal(_) => Code::Internal,
        }
    }

    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::Unimplemented`] for the named RPC.
    pub fn unimplemented(rpc: &str) -> Self {
        Self::Unimplemented(rpc.to_owned())
    }
}
