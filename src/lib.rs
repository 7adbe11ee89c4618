// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `icsia_lib` - A Rust framework for MQTT device applications.
//!
//! This library turns an MQTT broker connection into a structured
//! command/response/status protocol for IoT device programs (motor
//! controllers, cameras, orchestrators). Device code supplies command
//! handlers and status updates; the framework supplies everything
//! around them:
//!
//! - **Two-phase command protocol**: every inbound command is acked on
//!   `status/ack` before its handler runs and completed on
//!   `status/completion` afterwards, with a fixed error taxonomy
//!   (`INVALID_JSON`, `INVALID_PAYLOAD`, `UNKNOWN_COMMAND`,
//!   `VALIDATION_ERROR`, `EXECUTION_ERROR`, `INTERNAL_ERROR`).
//! - **Schema validation**: command payloads are validated and
//!   defaulted against a small declarative schema dialect before the
//!   handler sees them; the same dialect seeds the status snapshot.
//! - **Status publishing**: a retained snapshot on `status/current`,
//!   published on change (and optionally on a keep-alive timer), with
//!   framework-managed `operational_status`, `timestamp` and
//!   `last_command_time` fields.
//! - **Topic callbacks**: arbitrary MQTT wildcard patterns dispatched
//!   to user callbacks, concurrently with command processing.
//! - **Connection supervision**: reconnect with configurable retry
//!   policy, subscription replay on every reconnect, and a throttled
//!   FIFO publish queue that holds messages across disconnects.
//!
//! # Topic layout
//!
//! With the default namespace `icsia` and a device id `motor1`:
//!
//! | Purpose | Topic | QoS | Retain |
//! |---------|-------|-----|--------|
//! | Command subscription | `icsia/+/cmd/#` | 1 | — |
//! | Ack | `icsia/motor1/status/ack` | 1 | no |
//! | Completion | `icsia/motor1/status/completion` | 1 | no |
//! | Status snapshot | `icsia/motor1/status/current` | 0 | yes |
//! | Log records | `icsia/motor1/logs` | 0 | no |
//!
//! # Quick start
//!
//! ```no_run
//! use icsia_lib::{AppConfig, DeviceApplication, HandlerError};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> icsia_lib::Result<()> {
//!     let config: AppConfig = serde_json::from_value(json!({
//!         "device_id": "motor1",
//!         "broker_host": "192.168.1.50",
//!         "command_schemas": {
//!             "move": {
//!                 "target_position": {"x": 0.0, "y": 0.0, "z": 0.0},
//!                 "speed": {"default": 100},
//!                 "mode": "absolute",
//!             },
//!         },
//!         "status_schema": {"position": {"x": 0.0, "y": 0.0, "z": 0.0}},
//!     }))
//!     .expect("config shape");
//!
//!     let mut app = DeviceApplication::new(config)?;
//!     let handle = app.handle();
//!
//!     app.register_command("move", move |payload| {
//!         let handle = handle.clone();
//!         async move {
//!             // `payload` is validated and defaulted: `speed` is 100
//!             // here when the caller omitted it.
//!             handle.update_status(&json!({"position": payload["target_position"]}));
//!             Ok(json!({"result": "ok"}))
//!         }
//!     });
//!
//!     app.run().await
//! }
//! ```
//!
//! # Testing device applications
//!
//! The framework talks to the broker through the [`transport::Transport`]
//! trait. [`transport::mock::MockTransport`] implements it in memory, so
//! device programs (and this crate's own tests) can exercise the full
//! command lifecycle without a broker.

pub mod application;
pub mod clock;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod schema;
pub mod status;
pub mod supervisor;
pub mod topic;
pub mod transport;

pub use application::{AppHandle, DeviceApplication};
pub use command::{
    CommandProcessor, CommandRequest, CommandResponse, ErrorCode, HandlerRegistry, HandlerResult,
    ResponseStatus,
};
pub use config::{AppConfig, SubscriptionSpec, TopicConfig};
pub use dispatch::{CallbackRegistry, DispatchRouter};
pub use error::{
    ConfigError, Error, HandlerError, Result, SchemaError, TransportError, ValidationError,
};
pub use schema::{SchemaNode, build_status_template, validate_and_default};
pub use status::{OperationalStatus, StatusPublisher};
pub use supervisor::{ConnectionSupervisor, PublishHandle, SupervisorConfig};
pub use transport::{
    IncomingMessage, MqttTransport, OutboundMessage, Transport, TransportEvent,
};
