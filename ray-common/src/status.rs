// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Status/error types.
//!
//! Failures that cross a process boundary travel as `(StatusCode, message)`.
//! Discriminants are wire values and must not be renumbered.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StatusCode {
    TypeError = 3,
    Invalid = 4,
    UnknownError = 9,
    TimedOut = 12,
    UnexpectedSystemExit = 15,
    Disconnected = 18,
    ObjectExists = 21,
    ObjectNotFound = 22,
    ObjectAlreadySealed = 23,
    ObjectStoreFull = 24,
    ObjectUnknownOwner = 29,
    OutOfResource = 31,
    InvalidArgument = 34,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TypeError => "TypeError",
            Self::Invalid => "Invalid",
            Self::UnknownError => "UnknownError",
            Self::TimedOut => "TimedOut",
            Self::UnexpectedSystemExit => "UnexpectedSystemExit",
            Self::Disconnected => "Disconnected",
            Self::ObjectExists => "ObjectExists",
            Self::ObjectNotFound => "ObjectNotFound",
            Self::ObjectAlreadySealed => "ObjectAlreadySealed",
            Self::ObjectStoreFull => "ObjectStoreFull",
            Self::ObjectUnknownOwner => "ObjectUnknownOwner",
            Self::OutOfResource => "OutOfResource",
            Self::InvalidArgument => "InvalidArgument",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The primary error type for operations in `ray-common` and the wire form
/// of every other error in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RayError {
    pub code: StatusCode,
    pub message: String,
}

impl RayError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::Invalid, msg)
    }
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, msg)
    }
}

/// Convenience type alias: `Result<T, RayError>`.
pub type RayResult<T> = Result<T, RayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_stable() {
        assert_eq!(StatusCode::TimedOut as i8, 12);
        assert_eq!(StatusCode::ObjectNotFound as i8, 22);
        assert_eq!(StatusCode::ObjectUnknownOwner as i8, 29);
        assert_eq!(StatusCode::InvalidArgument as i8, 34);
    }

    #[test]
    fn test_ray_error_display() {
        let err = RayError::invalid_argument("bad chunk size");
        assert_eq!(err.to_string(), "InvalidArgument: bad chunk size");
        assert_eq!(RayError::invalid("x").code, StatusCode::Invalid);
    }
}
