// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `icsia_lib` framework.
//!
//! This module provides the error hierarchy for failures across the
//! framework: configuration loading, schema parsing, payload validation,
//! transport communication, and command handler execution.

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Error in the application configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error in the transport layer.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection supervisor exhausted its reconnect attempts.
    #[error("gave up connecting after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of connect attempts made before giving up.
        attempts: u32,
    },

    /// The application is already running or has been shut down.
    #[error("application is not in a runnable state: {0}")]
    InvalidState(String),
}

/// Errors raised while loading or validating the application configuration.
///
/// These are the only irrecoverable errors in the framework: they surface
/// at startup and abort the application before any connection is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The `device_id` field is missing or empty.
    #[error("device_id must not be empty")]
    MissingDeviceId,

    /// The namespace contains characters that are not valid in a topic
    /// segment.
    #[error("invalid namespace {0:?}: must be a single non-empty topic segment")]
    InvalidNamespace(String),

    /// A topic filter is malformed (e.g. `#` not in final position).
    #[error("invalid topic filter {0:?}")]
    InvalidTopicFilter(String),

    /// A duration field is zero or negative.
    #[error("{field} must be positive, got {value}")]
    InvalidInterval {
        /// Name of the offending config field.
        field: &'static str,
        /// The rejected value in seconds.
        value: f64,
    },

    /// A schema in `command_schemas` or `status_schema` is malformed.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// `register_callback_handler` was called with a callback name that
    /// no entry in `config.subscriptions` references.
    #[error("no subscription in config references callback {0:?}")]
    UnresolvedCallback(String),
}

/// Errors raised while parsing a schema node tree from configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// A schema position holds a value that is not a scalar, mapping, or
    /// one-key default mapping.
    #[error("unsupported schema node at '{path}': {found}")]
    UnsupportedNode {
        /// Dotted path of the offending node (empty for the root).
        path: String,
        /// Short description of what was found (e.g. `array`, `null`).
        found: &'static str,
    },
}

/// Errors related to transport communication.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The MQTT client rejected an operation.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Connecting to the broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation timed out.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// An internal channel was closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// A publish or subscribe was attempted without a connection.
    #[error("not connected")]
    NotConnected,
}

/// Rejection produced by the schema validator.
///
/// The [`Display`](std::fmt::Display) rendering of these errors is what
/// ends up in the `error_msg` field of an error completion, so the
/// messages cite the dotted path of the offending field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is absent from the payload.
    #[error("Missing required field '{0}'")]
    MissingField(String),

    /// A field is present but has the wrong JSON type.
    #[error("Invalid type for field '{path}': expected {expected}, got {actual}")]
    InvalidType {
        /// Dotted path of the field.
        path: String,
        /// The JSON type the schema requires.
        expected: &'static str,
        /// The JSON type found in the payload.
        actual: &'static str,
    },

    /// A field declared as a nested object holds a non-object value.
    #[error("Field '{0}' must be an object")]
    NotAnObject(String),
}

/// An application-level error returned by a command handler.
///
/// The message is carried verbatim into the `error_msg` field of the
/// error completion. A handler may attach its own error code, which then
/// replaces the default `EXECUTION_ERROR` in the completion payload.
///
/// # Examples
///
/// ```
/// use icsia_lib::HandlerError;
///
/// let err = HandlerError::new("POSITION_OUT_OF_BOUNDS: x too large");
/// assert_eq!(err.to_string(), "POSITION_OUT_OF_BOUNDS: x too large");
///
/// let err = HandlerError::with_code("MOTOR_FAULT", "driver reported overcurrent");
/// assert_eq!(err.code(), Some("MOTOR_FAULT"));
/// ```
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    code: Option<String>,
    message: String,
}

impl HandlerError {
    /// Creates a handler error with a message only.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Creates a handler error with an application-defined error code.
    #[must_use]
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Returns the application-defined error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A convenient result type for framework operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_messages() {
        let err = ValidationError::MissingField("target_position.x".to_string());
        assert_eq!(err.to_string(), "Missing required field 'target_position.x'");

        let err = ValidationError::InvalidType {
            path: "speed".to_string(),
            expected: "number",
            actual: "string",
        };
        assert_eq!(
            err.to_string(),
            "Invalid type for field 'speed': expected number, got string"
        );
    }

    #[test]
    fn handler_error_message_verbatim() {
        let err = HandlerError::new("POSITION_OUT_OF_BOUNDS: x too large");
        assert_eq!(err.message(), "POSITION_OUT_OF_BOUNDS: x too large");
        assert!(err.code().is_none());
    }

    #[test]
    fn handler_error_from_str() {
        let err: HandlerError = "boom".into();
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::InvalidInterval {
            field: "throttle_interval",
            value: -1.0,
        };
        assert_eq!(err.to_string(), "throttle_interval must be positive, got -1");
    }

    #[test]
    fn error_from_config_error() {
        let err: Error = ConfigError::MissingDeviceId.into();
        assert!(matches!(err, Error::Config(_)));
    }
}
