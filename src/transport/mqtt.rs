// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT transport over `rumqttc`.
//!
//! Each [`connect`](MqttTransport::connect) builds a fresh
//! `AsyncClient`/`EventLoop` pair and spawns a pump task that forwards
//! incoming packets into the transport's persistent event channel. The
//! pump is tagged with a connection generation; a pump belonging to a
//! superseded connection stops emitting, so a stale event loop can never
//! produce phantom disconnects after a reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::TransportError;
use crate::transport::{IncomingMessage, OutboundMessage, Transport, TransportEvent};

/// Capacity of the rumqttc request channel and the event channel.
const CHANNEL_CAPACITY: usize = 64;

/// Delay before the single QoS-1 publish retry.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Connection settings for [`MqttTransport`].
#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT client id. Generated from the device id when `None`.
    pub client_id: Option<String>,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Optional `(username, password)` credentials.
    pub credentials: Option<(String, String)>,
    /// How long to wait for the broker's connection acknowledgement.
    pub connection_timeout: Duration,
}

impl MqttTransportConfig {
    /// Builds transport settings from an application config.
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        Self {
            host: config.broker_host.clone(),
            port: config.broker_port,
            client_id: Some(format!(
                "{}-{}",
                config.device_id,
                Uuid::new_v4().simple()
            )),
            keep_alive: Duration::from_secs(config.keep_alive),
            credentials,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

/// MQTT transport backed by `rumqttc`.
pub struct MqttTransport {
    config: MqttTransportConfig,
    client: parking_lot::Mutex<Option<AsyncClient>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<TransportEvent>>,
    /// Current connection generation; bumped on every connect and
    /// disconnect so stale pumps stop emitting.
    generation: Arc<AtomicU64>,
}

impl MqttTransport {
    /// Creates a transport from explicit settings.
    #[must_use]
    pub fn new(config: MqttTransportConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            config,
            client: parking_lot::Mutex::new(None),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates a transport from an application config.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(MqttTransportConfig::from_app_config(config))
    }

    fn current_client(&self) -> Result<AsyncClient, TransportError> {
        self.client.lock().clone().ok_or(TransportError::NotConnected)
    }
}

impl Transport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let client_id = self.config.client_id.clone().unwrap_or_else(|| {
            format!("icsia-{}", Uuid::new_v4().simple())
        });
        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &self.config.credentials {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, CHANNEL_CAPACITY);

        let (connack_tx, connack_rx) = oneshot::channel();
        tokio::spawn(pump_events(
            event_loop,
            self.events_tx.clone(),
            generation,
            Arc::clone(&self.generation),
            connack_tx,
        ));

        match tokio::time::timeout(self.config.connection_timeout, connack_rx).await {
            Ok(Ok(())) => {
                tracing::info!(
                    host = %self.config.host,
                    port = self.config.port,
                    "Connected to MQTT broker"
                );
                *self.client.lock() = Some(client);
                Ok(())
            }
            Ok(Err(_)) => {
                // The pump terminated before ConnAck; invalidate it.
                self.generation.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::ConnectionFailed(
                    "event loop terminated before connection acknowledgement".to_string(),
                ))
            }
            Err(_) => {
                self.generation.fetch_add(1, Ordering::SeqCst);
                drop(client);
                Err(TransportError::ConnectionFailed(format!(
                    "connection timeout after {}s",
                    self.config.connection_timeout.as_secs()
                )))
            }
        }
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        let client = self.current_client()?;
        tracing::debug!(filter = %filter, ?qos, "Subscribing");
        client
            .subscribe(filter, qos)
            .await
            .map_err(TransportError::Mqtt)
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let client = self.current_client()?;
        let first = client
            .publish(
                &message.topic,
                message.qos,
                message.retain,
                message.payload.clone(),
            )
            .await;
        let Err(err) = first else {
            return Ok(());
        };

        // QoS-1 publishes get one retry before the error surfaces.
        if message.qos == QoS::AtLeastOnce {
            tracing::warn!(topic = %message.topic, error = %err, "Publish failed, retrying once");
            tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
            let client = self.current_client()?;
            client
                .publish(
                    &message.topic,
                    message.qos,
                    message.retain,
                    message.payload.clone(),
                )
                .await
                .map_err(TransportError::Mqtt)
        } else {
            Err(TransportError::Mqtt(err))
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        // Invalidate the pump first so the deliberate disconnect is not
        // reported as a connection loss.
        self.generation.fetch_add(1, Ordering::SeqCst);
        let client = self.client.lock().take();
        if let Some(client) = client {
            client.disconnect().await.map_err(TransportError::Mqtt)?;
        }
        Ok(())
    }
}

/// Forwards rumqttc events into the transport's event channel.
async fn pump_events(
    mut event_loop: EventLoop,
    events_tx: mpsc::Sender<TransportEvent>,
    generation: u64,
    current_generation: Arc<AtomicU64>,
    connack_tx: oneshot::Sender<()>,
) {
    let mut connack_tx = Some(connack_tx);

    loop {
        if current_generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "Event pump superseded, stopping");
            return;
        }
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "Connection acknowledged");
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(());
                }
                let _ = events_tx.send(TransportEvent::Connected).await;
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::debug!(?suback, "Subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = IncomingMessage::new(publish.topic.clone(), publish.payload.to_vec());
                if current_generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if events_tx
                    .send(TransportEvent::Message(message))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                if current_generation.load(Ordering::SeqCst) == generation {
                    tracing::warn!(error = %e, "MQTT event loop error");
                    let _ = events_tx.send(TransportEvent::Disconnected).await;
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_app_config() {
        let app = AppConfig::new("motor1").with_broker("broker.local", 8883);
        let config = MqttTransportConfig::from_app_config(&app);
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 8883);
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert!(config.client_id.unwrap().starts_with("motor1-"));
        assert!(config.credentials.is_none());
    }

    #[test]
    fn credentials_require_both_fields() {
        let mut app = AppConfig::new("m");
        app.username = Some("user".to_string());
        let config = MqttTransportConfig::from_app_config(&app);
        assert!(config.credentials.is_none());

        app.password = Some("pass".to_string());
        let config = MqttTransportConfig::from_app_config(&app);
        assert_eq!(
            config.credentials,
            Some(("user".to_string(), "pass".to_string()))
        );
    }

    #[tokio::test]
    async fn publish_without_connection_fails() {
        let transport = MqttTransport::from_config(&AppConfig::new("m"));
        let msg = OutboundMessage::new("t", b"x".to_vec(), QoS::AtMostOnce, false);
        assert!(matches!(
            transport.publish(&msg).await,
            Err(TransportError::NotConnected)
        ));
    }
}
