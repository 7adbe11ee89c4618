// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-command state machine.
//!
//! One [`process`](CommandProcessor::process) call covers the whole
//! lifecycle of an inbound command: receive-phase parsing, the ack
//! publish, handler lookup, schema validation, handler execution, and
//! the completion publish. Each command runs in its own task, so
//! commands execute concurrently; the busy/idle bookkeeping lives in the
//! status publisher's in-flight count.
//!
//! The ack is enqueued strictly before validation starts, and both
//! responses travel the supervisor's FIFO queue, so a command's
//! completion can never overtake its ack on the wire.

use std::collections::BTreeMap;
use std::sync::Arc;

use rumqttc::QoS;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::command::{
    CommandResponse, ErrorCode, HandlerRegistry, ParseOutcome, parse_request,
};
use crate::schema::{SchemaNode, validate_and_default};
use crate::status::StatusPublisher;
use crate::supervisor::PublishHandle;
use crate::topic::{self, CommandTopic};
use crate::transport::{IncomingMessage, OutboundMessage};

/// Runs the ack/completion lifecycle for inbound commands.
pub struct CommandProcessor {
    namespace: String,
    handlers: Arc<HandlerRegistry>,
    schemas: Arc<BTreeMap<String, SchemaNode>>,
    publisher: PublishHandle,
    status: Arc<StatusPublisher>,
}

impl CommandProcessor {
    /// Creates a processor over frozen registries.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        handlers: Arc<HandlerRegistry>,
        schemas: Arc<BTreeMap<String, SchemaNode>>,
        publisher: PublishHandle,
        status: Arc<StatusPublisher>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            handlers,
            schemas,
            publisher,
            status,
        }
    }

    /// Processes one inbound command message through the state machine.
    ///
    /// Cancellation aborts the handler and suppresses the completion
    /// publish; everything else produces exactly one ack and, unless the
    /// receive phase was terminal, exactly one completion.
    pub async fn process(
        &self,
        message: IncomingMessage,
        route: CommandTopic,
        cancel: CancellationToken,
    ) {
        let ack_topic = topic::status_ack(&self.namespace, &route.device_id);
        let completion_topic = topic::status_completion(&self.namespace, &route.device_id);

        let request = match parse_request(&message.payload) {
            ParseOutcome::Ok(request) => request,
            ParseOutcome::InvalidJson => {
                tracing::warn!(topic = %message.topic, "Dropping unparseable command payload");
                self.respond(
                    &ack_topic,
                    &CommandResponse::ack_error(
                        "unknown",
                        &clock::now_timestamp(),
                        ErrorCode::InvalidJson.as_str(),
                        "payload is not a valid JSON object",
                    ),
                );
                return;
            }
            ParseOutcome::MissingCmdId => {
                tracing::warn!(topic = %message.topic, "Command payload lacks cmd_id");
                let receipt = clock::now_timestamp();
                self.respond(
                    &ack_topic,
                    &CommandResponse::ack_error(
                        "unknown",
                        &receipt,
                        ErrorCode::InvalidPayload.as_str(),
                        "missing required field 'cmd_id'",
                    ),
                );
                self.respond(
                    &completion_topic,
                    &CommandResponse::completion_error(
                        "unknown",
                        &receipt,
                        ErrorCode::InvalidPayload.as_str(),
                        "missing required field 'cmd_id'",
                    ),
                );
                return;
            }
        };

        tracing::debug!(
            cmd_id = %request.cmd_id,
            command = %route.command,
            device = %route.device_id,
            "Command received"
        );
        self.respond(
            &ack_topic,
            &CommandResponse::ack(&request.cmd_id, &request.command_timestamp),
        );
        self.status.command_started(&request.command_timestamp);

        let Some(handler) = self.handlers.get(&route.command) else {
            self.respond(
                &completion_topic,
                &CommandResponse::completion_error(
                    &request.cmd_id,
                    &request.command_timestamp,
                    ErrorCode::UnknownCommand.as_str(),
                    format!("no handler registered for command '{}'", route.command),
                ),
            );
            self.status.command_finished(false);
            return;
        };

        let validated = match self.schemas.get(&route.command) {
            Some(schema) => match validate_and_default(&request.payload, schema) {
                Ok(validated) => validated,
                Err(error) => {
                    tracing::debug!(
                        cmd_id = %request.cmd_id,
                        command = %route.command,
                        error = %error,
                        "Command payload rejected"
                    );
                    self.respond(
                        &completion_topic,
                        &CommandResponse::completion_error(
                            &request.cmd_id,
                            &request.command_timestamp,
                            ErrorCode::ValidationError.as_str(),
                            error.to_string(),
                        ),
                    );
                    self.status.command_finished(false);
                    return;
                }
            },
            // Commands without a configured schema are passed through.
            None => request.payload.clone(),
        };

        // The handler runs in its own task so a panic is isolated from
        // the command task and surfaces as INTERNAL_ERROR.
        let mut execution = tokio::spawn(handler(Value::Object(validated)));
        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                execution.abort();
                tracing::debug!(cmd_id = %request.cmd_id, "Command cancelled, completion suppressed");
                self.status.command_aborted();
                return;
            }
            joined = &mut execution => joined,
        };

        match outcome {
            Ok(Ok(result)) => {
                // The handler's result object is logged, not embedded in
                // the completion payload.
                tracing::info!(
                    cmd_id = %request.cmd_id,
                    command = %route.command,
                    result = %result,
                    "Command completed"
                );
                self.respond(
                    &completion_topic,
                    &CommandResponse::completion(&request.cmd_id, &request.command_timestamp),
                );
                self.status.command_finished(true);
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    cmd_id = %request.cmd_id,
                    command = %route.command,
                    error = %error,
                    "Command failed"
                );
                let code = error
                    .code()
                    .unwrap_or(ErrorCode::ExecutionError.as_str());
                self.respond(
                    &completion_topic,
                    &CommandResponse::completion_error(
                        &request.cmd_id,
                        &request.command_timestamp,
                        code,
                        error.message(),
                    ),
                );
                self.status.command_finished(false);
            }
            Err(join_error) => {
                tracing::error!(
                    cmd_id = %request.cmd_id,
                    command = %route.command,
                    error = %join_error,
                    "Command handler did not finish"
                );
                let message = if join_error.is_panic() {
                    "command handler panicked"
                } else {
                    "command handler was aborted"
                };
                self.respond(
                    &completion_topic,
                    &CommandResponse::completion_error(
                        &request.cmd_id,
                        &request.command_timestamp,
                        ErrorCode::InternalError.as_str(),
                        message,
                    ),
                );
                self.status.command_finished(false);
            }
        }
    }

    fn respond(&self, topic: &str, response: &CommandResponse) {
        match serde_json::to_vec(response) {
            Ok(bytes) => self.publisher.publish(OutboundMessage::new(
                topic,
                bytes,
                QoS::AtLeastOnce,
                false,
            )),
            Err(e) => tracing::error!(error = %e, "Response serialization failed"),
        }
    }
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("namespace", &self.namespace)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
