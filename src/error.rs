// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Error taxonomy shared by every layer of the bridge.
//!
//! [`ErrorCategory`] is the fixed, ABI-stable set of categories a native
//! handler can report. [`XcallError`] is the Rust-side error type; every
//! variant maps onto exactly one category so that errors can cross the
//! boundary in either direction without losing their classification.

use std::fmt;

/// Fixed error categories understood on both sides of the boundary.
///
/// The discriminants are part of the native ABI and must never be reordered.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Unknown = 0,
    InvalidArgument = 1,
    OutOfRange = 2,
    NotFound = 3,
    AlreadyRegistered = 4,
    NotImplemented = 5,
    Internal = 6,
}

impl ErrorCategory {
    /// Decode a category reported by native code. Unknown values collapse to
    /// [`ErrorCategory::Unknown`] rather than failing: a handler reporting an
    /// error must never have that error swallowed.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ErrorCategory::InvalidArgument,
            2 => ErrorCategory::OutOfRange,
            3 => ErrorCategory::NotFound,
            4 => ErrorCategory::AlreadyRegistered,
            5 => ErrorCategory::NotImplemented,
            6 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::InvalidArgument => "invalid argument",
            ErrorCategory::OutOfRange => "out of range",
            ErrorCategory::NotFound => "not found",
            ErrorCategory::AlreadyRegistered => "already registered",
            ErrorCategory::NotImplemented => "not implemented",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the bridge.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum XcallError {
    /// No handler is registered for the `(target, platform)` pair.
    #[error("no handler registered for target '{target}' on platform '{platform}'")]
    NotFound { target: String, platform: String },
    /// A handler already exists for the key and replacement was not requested.
    #[error("handler for target '{target}' on platform '{platform}' is already registered")]
    AlreadyRegistered { target: String, platform: String },
    /// Attribute, shape, or type mismatch detected before invocation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An index or size outside the permitted range.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// The frame was built for a different API version than the handler.
    #[error("api version mismatch: frame uses v{frame}, handler expects v{handler}")]
    VersionMismatch { frame: u32, handler: u32 },
    /// Unknown element type or unsupported platform/feature combination.
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// Failure inside the bridge itself.
    #[error("internal error: {0}")]
    Internal(String),
    /// Structured failure reported by a handler.
    #[error("handler '{target}' failed ({category}): {message}")]
    Handler {
        target: String,
        category: ErrorCategory,
        message: String,
    },
}

impl XcallError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            XcallError::NotFound { .. } => ErrorCategory::NotFound,
            XcallError::AlreadyRegistered { .. } => ErrorCategory::AlreadyRegistered,
            XcallError::InvalidArgument(_) | XcallError::VersionMismatch { .. } => {
                ErrorCategory::InvalidArgument
            }
            XcallError::OutOfRange(_) => ErrorCategory::OutOfRange,
            XcallError::NotImplemented(_) => ErrorCategory::NotImplemented,
            XcallError::Internal(_) => ErrorCategory::Internal,
            XcallError::Handler { category, .. } => *category,
        }
    }

    /// Build an error from a category and message, as reported across the
    /// boundary by a handler that is not otherwise identified.
    pub fn from_category(category: ErrorCategory, message: impl Into<String>) -> Self {
        let message = message.into();
        match category {
            ErrorCategory::InvalidArgument => XcallError::InvalidArgument(message),
            ErrorCategory::OutOfRange => XcallError::OutOfRange(message),
            ErrorCategory::NotImplemented => XcallError::NotImplemented(message),
            ErrorCategory::Internal | ErrorCategory::Unknown => XcallError::Internal(message),
            ErrorCategory::NotFound => XcallError::NotFound {
                target: message,
                platform: String::new(),
            },
            ErrorCategory::AlreadyRegistered => XcallError::AlreadyRegistered {
                target: message,
                platform: String::new(),
            },
        }
    }

    /// Attach the target name to an error produced inside a handler.
    pub fn from_handler(target: &str, err: XcallError) -> Self {
        match err {
            XcallError::Handler { .. } => err,
            other => XcallError::Handler {
                target: target.to_string(),
                category: other.category(),
                message: handler_message(&other),
            },
        }
    }

    pub fn message(&self) -> String {
        match self {
            XcallError::Handler { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

fn handler_message(err: &XcallError) -> String {
    match err {
        XcallError::InvalidArgument(m)
        | XcallError::OutOfRange(m)
        | XcallError::NotImplemented(m)
        | XcallError::Internal(m) => m.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn invalid(msg: impl Into<String>) -> XcallError {
    XcallError::InvalidArgument(msg.into())
}

pub type Result<T> = std::result::Result<T, XcallError>;
