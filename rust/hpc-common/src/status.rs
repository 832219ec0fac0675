// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Scheduling status/error types.
//!
//! Every component converts its failures into a `SchedError` carrying a
//! `StatusCode`; callers decide from the code whether to retry later,
//! report the job as pending, or give up on a single job.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// No placement exists now.
    InfeasibleRequest,
    /// Contiguous allocation requested but no run is large enough.
    NoContiguousHole,
    GeometryMismatch,
    ConnectionTypeMismatch,
    /// A ledger counter would underflow or overflow.
    ConsistencyError,
    /// A job-control call failed.
    SignalFailure,
    /// Node or job not found when expected.
    LookupFailure,
    InvalidArgument,
    IOError,
    /// Saved state written by a different layout or plugin.
    VersionMismatch,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InfeasibleRequest => "InfeasibleRequest",
            Self::NoContiguousHole => "NoContiguousHole",
            Self::GeometryMismatch => "GeometryMismatch",
            Self::ConnectionTypeMismatch => "ConnectionTypeMismatch",
            Self::ConsistencyError => "ConsistencyError",
            Self::SignalFailure => "SignalFailure",
            Self::LookupFailure => "LookupFailure",
            Self::InvalidArgument => "InvalidArgument",
            Self::IOError => "IOError",
            Self::VersionMismatch => "VersionMismatch",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The primary error type for scheduling operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct SchedError {
    pub code: StatusCode,
    pub message: String,
}

impl SchedError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn infeasible(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::InfeasibleRequest, msg)
    }
    pub fn no_contiguous_hole(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NoContiguousHole, msg)
    }
    pub fn geometry_mismatch(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::GeometryMismatch, msg)
    }
    pub fn connection_type_mismatch(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::ConnectionTypeMismatch, msg)
    }
    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::ConsistencyError, msg)
    }
    pub fn signal_failure(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SignalFailure, msg)
    }
    pub fn lookup_failure(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::LookupFailure, msg)
    }
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, msg)
    }
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::IOError, msg)
    }
    pub fn version_mismatch(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::VersionMismatch, msg)
    }

    pub fn is_infeasible(&self) -> bool {
        self.code == StatusCode::InfeasibleRequest
    }
    pub fn is_no_contiguous_hole(&self) -> bool {
        self.code == StatusCode::NoContiguousHole
    }
    pub fn is_lookup_failure(&self) -> bool {
        self.code == StatusCode::LookupFailure
    }
    pub fn is_signal_failure(&self) -> bool {
        self.code == StatusCode::SignalFailure
    }

    /// Placement failures that a later scheduling pass may resolve.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            StatusCode::InfeasibleRequest
                | StatusCode::NoContiguousHole
                | StatusCode::GeometryMismatch
                | StatusCode::ConnectionTypeMismatch
        )
    }
}

impl From<std::io::Error> for SchedError {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for SchedError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_argument(format!("JSON error: {e}"))
    }
}

/// Convenience type alias: `Result<T, SchedError>`.
pub type SchedResult<T> = Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::no_contiguous_hole("need 3 nodes");
        assert_eq!(err.to_string(), "NoContiguousHole: need 3 nodes");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(SchedError::infeasible("x").is_retryable());
        assert!(SchedError::geometry_mismatch("x").is_retryable());
        assert!(!SchedError::lookup_failure("x").is_retryable());
        assert!(!SchedError::signal_failure("x").is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SchedError = io.into();
        assert_eq!(err.code, StatusCode::IOError);
    }
}
