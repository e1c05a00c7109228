// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Errors returned by node-agent calls.
//!
//! The scheduler never surfaces these to callers; it only logs them and
//! treats the call as failed, so the set of codes stays small.

use std::fmt;

/// Status codes carried by a [`RayError`].
/// The discriminant values are part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StatusCode {
    IOError = 5,
    TimedOut = 12,
    Disconnected = 18,
    RpcError = 30,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IOError => "IOError",
            Self::TimedOut => "TimedOut",
            Self::Disconnected => "Disconnected",
            Self::RpcError => "RpcError",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failed node-agent call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RayError {
    pub code: StatusCode,
    pub message: String,
    /// For RpcError, the transport status code.
    pub rpc_code: Option<i32>,
}

impl RayError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            rpc_code: None,
        }
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::IOError, msg)
    }
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::Disconnected, msg)
    }
    pub fn rpc_error(msg: impl Into<String>, rpc_code: i32) -> Self {
        Self {
            code: StatusCode::RpcError,
            message: msg.into(),
            rpc_code: Some(rpc_code),
        }
    }

    /// Whether the failure came from the transport rather than the agent.
    /// Logged with every failed prepare or commit.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            StatusCode::RpcError
                | StatusCode::Disconnected
                | StatusCode::TimedOut
                | StatusCode::IOError
        )
    }
}

pub type RayResult<T> = Result<T, RayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_error_display() {
        let err = RayError::io_error("disk full");
        assert_eq!(err.to_string(), "IOError: disk full");
    }

    #[test]
    fn test_rpc_error_code() {
        // 14 = UNAVAILABLE
        let err = RayError::rpc_error("unavailable", 14);
        assert_eq!(err.code, StatusCode::RpcError);
        assert_eq!(err.rpc_code, Some(14));
        assert!(err.is_transient());
        assert_eq!(RayError::disconnected("node gone").rpc_code, None);
    }

    #[test]
    fn test_transient_classification() {
        assert!(RayError::disconnected("node gone").is_transient());
        assert!(RayError::new(StatusCode::TimedOut, "slow").is_transient());
    }
}
