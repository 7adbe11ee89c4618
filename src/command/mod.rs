// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command lifecycle types.
//!
//! Every inbound command runs the two-phase protocol: an ack publish on
//! `status/ack` before the handler runs, and exactly one completion
//! publish on `status/completion` afterwards. [`CommandResponse`] is the
//! shared payload of both phases; [`HandlerRegistry`] maps command names
//! to the async handlers device code registers at startup.

mod processor;

pub use processor::CommandProcessor;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock;
use crate::error::HandlerError;

/// Framework error codes carried in the `error_code` field of error
/// acks and completions. Handlers may substitute application-defined
/// codes via [`HandlerError::with_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Payload is not parseable as a JSON object (ack phase, terminal).
    InvalidJson,
    /// Parsed but missing the `cmd_id` field (ack + completion).
    InvalidPayload,
    /// No handler registered for the command name (completion).
    UnknownCommand,
    /// The schema validator rejected the payload (completion).
    ValidationError,
    /// The handler raised an application-level error (completion).
    ExecutionError,
    /// Unexpected framework-level error (any phase).
    InternalError,
}

impl ErrorCode {
    /// Returns the wire spelling of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidJson => "INVALID_JSON",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `status` field of an ack or completion payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// Ack of a command that passed the receive phase.
    Received,
    /// Successful completion.
    Completed,
    /// Error ack or error completion.
    Error,
}

/// Wire payload of ack and completion publishes.
///
/// `cmd_id` and `command_timestamp` are echoed from the command
/// byte-for-byte; `timestamp` is the moment this response was built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Correlation id echoed from the command.
    pub cmd_id: String,
    /// Response phase / outcome.
    pub status: ResponseStatus,
    /// When this response was produced.
    pub timestamp: String,
    /// The command's own timestamp, or time of receipt if it had none.
    pub command_timestamp: String,
    /// Error code, present on errors only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable error message, present on errors only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl CommandResponse {
    /// Builds a success ack (`status: "received"`).
    #[must_use]
    pub fn ack(cmd_id: &str, command_timestamp: &str) -> Self {
        Self::build(cmd_id, ResponseStatus::Received, command_timestamp, None, None)
    }

    /// Builds a success completion (`status: "completed"`).
    #[must_use]
    pub fn completion(cmd_id: &str, command_timestamp: &str) -> Self {
        Self::build(cmd_id, ResponseStatus::Completed, command_timestamp, None, None)
    }

    /// Builds an error ack.
    #[must_use]
    pub fn ack_error(
        cmd_id: &str,
        command_timestamp: &str,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::build(
            cmd_id,
            ResponseStatus::Error,
            command_timestamp,
            Some(code.to_string()),
            Some(message.into()),
        )
    }

    /// Builds an error completion.
    #[must_use]
    pub fn completion_error(
        cmd_id: &str,
        command_timestamp: &str,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::ack_error(cmd_id, command_timestamp, code, message)
    }

    fn build(
        cmd_id: &str,
        status: ResponseStatus,
        command_timestamp: &str,
        error_code: Option<String>,
        error_msg: Option<String>,
    ) -> Self {
        Self {
            cmd_id: cmd_id.to_string(),
            status,
            timestamp: clock::now_timestamp(),
            command_timestamp: command_timestamp.to_string(),
            error_code,
            error_msg,
        }
    }
}

/// An inbound command that passed the receive phase.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Correlation id supplied by the client.
    pub cmd_id: String,
    /// The command's `timestamp` field, or receipt time if absent.
    pub command_timestamp: String,
    /// The full parsed payload object.
    pub payload: Map<String, Value>,
}

/// Outcome of parsing a raw command payload.
#[derive(Debug)]
pub(crate) enum ParseOutcome {
    /// A well-formed command.
    Ok(CommandRequest),
    /// Not a JSON object: error ack only, no completion.
    InvalidJson,
    /// A JSON object without a string `cmd_id`: error ack and error
    /// completion.
    MissingCmdId,
}

/// Parses raw payload bytes into a command request.
pub(crate) fn parse_request(raw: &[u8]) -> ParseOutcome {
    let Ok(value) = serde_json::from_slice::<Value>(raw) else {
        return ParseOutcome::InvalidJson;
    };
    let Value::Object(payload) = value else {
        return ParseOutcome::InvalidJson;
    };
    let Some(cmd_id) = payload.get("cmd_id").and_then(Value::as_str) else {
        return ParseOutcome::MissingCmdId;
    };
    let command_timestamp = payload
        .get("timestamp")
        .and_then(Value::as_str)
        .map_or_else(clock::now_timestamp, str::to_string);
    ParseOutcome::Ok(CommandRequest {
        cmd_id: cmd_id.to_string(),
        command_timestamp,
        payload,
    })
}

/// Result type command handlers return.
pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// Boxed future produced by a command handler.
pub type BoxedCommandFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Type-erased command handler stored in the registry.
pub(crate) type CommandHandlerFn = Arc<dyn Fn(Value) -> BoxedCommandFuture + Send + Sync>;

/// Maps command names to handlers.
///
/// The registry is populated before the application runs and read-only
/// afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, CommandHandlerFn>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a command name, replacing any previous
    /// handler for that name.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: CommandHandlerFn =
            Arc::new(move |payload| Box::pin(handler(payload)) as BoxedCommandFuture);
        self.handlers.insert(name.into(), handler);
    }

    /// Returns whether a handler is registered for the command.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<CommandHandlerFn> {
        self.handlers.get(name).cloned()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("commands", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
