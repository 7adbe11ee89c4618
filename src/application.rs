// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The application façade device programs build on.
//!
//! A device program constructs a [`DeviceApplication`] from an
//! [`AppConfig`], registers its command handlers and topic callbacks,
//! takes an [`AppHandle`] for use at runtime, and calls
//! [`run`](DeviceApplication::run). `run` owns the whole lifecycle:
//! it wires the subscriptions, spawns the supervisor, publish drainer,
//! router and status tasks, and performs the ordered teardown when the
//! handle requests shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::command::{CommandProcessor, HandlerRegistry, HandlerResult};
use crate::config::AppConfig;
use crate::dispatch::{Callback, CallbackRegistry, DispatchRouter};
use crate::error::{ConfigError, Error, Result};
use crate::schema::build_status_template;
use crate::status::{OperationalStatus, StatusPublisher};
use crate::supervisor::{ConnectionSupervisor, PublishHandle, SupervisorConfig};
use crate::topic;
use crate::transport::{MqttTransport, OutboundMessage, Transport};

/// Capacity of the supervisor-to-router message channel.
const INBOUND_CAPACITY: usize = 256;

/// How long cancelled command handlers get to finish before being
/// aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// An MQTT device application.
///
/// Generic over the transport so tests can run against
/// [`MockTransport`](crate::transport::mock::MockTransport); production
/// code uses [`new`](Self::new), which builds an [`MqttTransport`] from
/// the config.
///
/// # Examples
///
/// ```no_run
/// use icsia_lib::{AppConfig, DeviceApplication, HandlerError};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> icsia_lib::Result<()> {
///     let config = AppConfig::new("motor1").with_broker("192.168.1.50", 1883);
///     let mut app = DeviceApplication::new(config)?;
///
///     app.register_command("move", |payload| async move {
///         let x = payload["target_position"]["x"].as_f64().unwrap_or(0.0);
///         if x > 1000.0 {
///             return Err(HandlerError::new("POSITION_OUT_OF_BOUNDS: x too large"));
///         }
///         Ok(json!({"result": "ok"}))
///     });
///
///     let handle = app.handle();
///     handle.update_status(&json!({"position": {"x": 0.0}}));
///
///     app.run().await
/// }
/// ```
pub struct DeviceApplication<T: Transport> {
    config: Arc<AppConfig>,
    supervisor: Arc<ConnectionSupervisor<T>>,
    handlers: HandlerRegistry,
    callbacks: CallbackRegistry,
    status: Arc<StatusPublisher>,
    cancel: CancellationToken,
}

impl DeviceApplication<MqttTransport> {
    /// Creates an application over an MQTT transport built from the
    /// config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: AppConfig) -> Result<Self> {
        let transport = MqttTransport::from_config(&config);
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> DeviceApplication<T> {
    /// Creates an application over an explicit transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn with_transport(config: AppConfig, transport: T) -> Result<Self> {
        config.validate()?;

        let supervisor = Arc::new(ConnectionSupervisor::new(
            transport,
            SupervisorConfig::from_app_config(&config),
        ));
        let status = Arc::new(StatusPublisher::new(
            build_status_template(&config.status_schema),
            config.status_topic(),
            config.status_interval(),
            config.keepalive_publishing,
            supervisor.publish_handle(),
        ));

        Ok(Self {
            config: Arc::new(config),
            supervisor,
            handlers: HandlerRegistry::new(),
            callbacks: CallbackRegistry::new(),
            status,
            cancel: CancellationToken::new(),
        })
    }

    /// Returns the application configuration.
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Registers a command handler. Registration happens before
    /// [`run`](Self::run); the registry is frozen afterwards.
    pub fn register_command<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(name, handler);
    }

    /// Registers a callback for a topic pattern and schedules the
    /// pattern for subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the pattern is not a valid MQTT
    /// topic filter.
    pub fn register_callback<F>(&mut self, pattern: impl Into<String>, callback: F) -> Result<()>
    where
        F: Fn(&str, &str, Option<&Value>) + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        if !topic::is_valid_filter(&pattern) {
            return Err(ConfigError::InvalidTopicFilter(pattern).into());
        }
        self.callbacks.register(pattern, callback);
        Ok(())
    }

    /// Registers a named callback and wires it to every
    /// `config.subscriptions` entry that references it.
    ///
    /// This replaces the dynamic method lookup of configuration-driven
    /// frameworks: the config's `callback` fields select from the
    /// callables registered here, so the binding is resolved at startup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no subscription references `name` or
    /// a referenced pattern is invalid.
    pub fn register_callback_handler<F>(&mut self, name: &str, callback: F) -> Result<()>
    where
        F: Fn(&str, &str, Option<&Value>) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let mut wired = false;
        for spec in self.config.subscriptions.values() {
            if spec.callback != name {
                continue;
            }
            if !topic::is_valid_filter(&spec.topic) {
                return Err(ConfigError::InvalidTopicFilter(spec.topic.clone()).into());
            }
            self.callbacks
                .register_arc(spec.topic.clone(), Arc::clone(&callback));
            wired = true;
        }
        if wired {
            Ok(())
        } else {
            Err(ConfigError::UnresolvedCallback(name.to_string()).into())
        }
    }

    /// Deep-merges a partial object into the status snapshot. Returns
    /// whether anything changed.
    pub fn update_status(&self, partial: &Value) -> bool {
        self.status.update(partial)
    }

    /// Returns a cloneable runtime handle.
    #[must_use]
    pub fn handle(&self) -> AppHandle {
        AppHandle {
            status: Arc::clone(&self.status),
            publisher: self.supervisor.publish_handle(),
            logs_topic: self.config.logs_topic(),
            device_id: self.config.device_id.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Runs the application until shutdown is requested.
    ///
    /// Wires the command filter and every callback pattern as
    /// subscriptions, then drives four tasks: the supervisor (connect
    /// loop + receive worker), the publish drainer, the dispatch router,
    /// and the status publisher.
    ///
    /// Returning guarantees the ordered teardown has run: receive pump
    /// stopped, in-flight commands cancelled (with a grace period before
    /// aborting), status task stopped, publish queue flushed (QoS-1
    /// first), transport disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReconnectExhausted`] when the supervisor gives
    /// up on the broker.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            supervisor,
            handlers,
            callbacks,
            status,
            cancel,
        } = self;

        supervisor.add_subscription(config.command_filter(), QoS::AtLeastOnce);
        for pattern in callbacks.patterns() {
            supervisor.add_subscription(pattern, QoS::AtLeastOnce);
        }

        let processor = Arc::new(CommandProcessor::new(
            config.namespace.clone(),
            Arc::new(handlers),
            Arc::new(config.command_schemas.clone()),
            supervisor.publish_handle(),
            Arc::clone(&status),
        ));
        let router = DispatchRouter::new(
            config.command_filter(),
            config.namespace.clone(),
            Arc::new(callbacks),
            processor,
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let receive_cancel = CancellationToken::new();
        let router_cancel = CancellationToken::new();
        let command_cancel = CancellationToken::new();
        let status_cancel = CancellationToken::new();
        let drain_cancel = CancellationToken::new();

        let mut supervisor_task: JoinHandle<Result<()>> = {
            let supervisor = Arc::clone(&supervisor);
            let token = receive_cancel.clone();
            tokio::spawn(async move { supervisor.run(inbound_tx, token).await })
        };
        let drainer_task = {
            let supervisor = Arc::clone(&supervisor);
            let token = drain_cancel.clone();
            tokio::spawn(async move { supervisor.run_publisher(token).await })
        };
        let router_task = {
            let token = router_cancel.clone();
            let commands_token = command_cancel.clone();
            tokio::spawn(async move {
                router
                    .run(inbound_rx, token, commands_token, SHUTDOWN_GRACE)
                    .await;
            })
        };
        let status_task = {
            let status = Arc::clone(&status);
            let connected = supervisor.connected();
            let token = status_cancel.clone();
            tokio::spawn(async move { status.run(connected, token).await })
        };

        tracing::info!(device = %config.device_id, "Device application running");

        let supervisor_result = tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("Shutdown requested");
                receive_cancel.cancel();
                flatten_join((&mut supervisor_task).await)
            }
            joined = &mut supervisor_task => flatten_join(joined),
        };

        // Ordered teardown: commands, status, queue flush, disconnect.
        router_cancel.cancel();
        let _ = router_task.await;
        status_cancel.cancel();
        let _ = status_task.await;
        drain_cancel.cancel();
        let _ = drainer_task.await;
        supervisor.disconnect().await;

        tracing::info!(device = %config.device_id, "Device application stopped");
        supervisor_result
    }
}

impl<T: Transport> std::fmt::Debug for DeviceApplication<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceApplication")
            .field("device_id", &self.config.device_id)
            .field("commands", &self.handlers.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

fn flatten_join(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(Error::InvalidState(format!("supervisor task failed: {e}"))),
    }
}

/// Cloneable handle for interacting with a running application.
///
/// Handlers, callbacks and background tasks of the device program use
/// this to update status, publish log records, and request shutdown.
#[derive(Clone)]
pub struct AppHandle {
    status: Arc<StatusPublisher>,
    publisher: PublishHandle,
    logs_topic: String,
    device_id: String,
    cancel: CancellationToken,
}

impl AppHandle {
    /// Deep-merges a partial object into the status snapshot. Returns
    /// whether anything changed.
    pub fn update_status(&self, partial: &Value) -> bool {
        self.status.update(partial)
    }

    /// Returns the current operational status.
    #[must_use]
    pub fn operational_status(&self) -> OperationalStatus {
        self.status.operational()
    }

    /// Publishes a structured log record to the device's log topic
    /// (QoS 0, not retained).
    pub fn publish_log(&self, level: &str, message: &str) {
        let record = json!({
            "timestamp": clock::now_timestamp(),
            "level": level,
            "message": message,
            "device_id": self.device_id,
        });
        match serde_json::to_vec(&record) {
            Ok(bytes) => self.publisher.publish(OutboundMessage::new(
                self.logs_topic.clone(),
                bytes,
                QoS::AtMostOnce,
                false,
            )),
            Err(e) => tracing::error!(error = %e, "Log record serialization failed"),
        }
    }

    /// Requests an orderly shutdown of [`DeviceApplication::run`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for AppHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppHandle")
            .field("device_id", &self.device_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn mock_app() -> DeviceApplication<Arc<MockTransport>> {
        let config = AppConfig::new("m").with_subscription(
            "peer_acks",
            "icsia/+/status/ack",
            "on_ack",
        );
        DeviceApplication::with_transport(config, Arc::new(MockTransport::new())).unwrap()
    }

    #[test]
    fn invalid_config_fails_construction() {
        let result =
            DeviceApplication::with_transport(AppConfig::new(""), Arc::new(MockTransport::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn register_callback_rejects_bad_filter() {
        let mut app = mock_app();
        let result = app.register_callback("icsia/#/bad", |_, _, _| {});
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn register_callback_handler_resolves_config_names() {
        let mut app = mock_app();
        app.register_callback_handler("on_ack", |_, _, _| {}).unwrap();
        assert_eq!(app.callbacks.len(), 1);
        assert_eq!(
            app.callbacks.patterns().collect::<Vec<_>>(),
            vec!["icsia/+/status/ack"]
        );
    }

    #[test]
    fn register_callback_handler_unknown_name_errors() {
        let mut app = mock_app();
        let result = app.register_callback_handler("nonexistent", |_, _, _| {});
        assert!(matches!(result, Err(Error::Config(ConfigError::UnresolvedCallback(_)))));
    }

    #[test]
    fn update_status_before_run() {
        let app = mock_app();
        assert!(app.update_status(&json!({"boot": true})));
        assert!(!app.update_status(&json!({"boot": true})));
    }
}
