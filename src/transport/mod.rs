// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transport seam between the framework and an MQTT client.
//!
//! [`Transport`] is the minimal capability set the framework depends on:
//! connect, subscribe, publish, an event stream, disconnect. The
//! production implementation is [`MqttTransport`] over `rumqttc`;
//! [`mock::MockTransport`] provides an in-memory stand-in for tests.

pub mod mock;
mod mqtt;

pub use mqtt::{MqttTransport, MqttTransportConfig};

use rumqttc::QoS;

use crate::error::TransportError;

/// A message received from the broker.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Full topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Optional MQTT 5 message properties, passed through untouched.
    /// `None` on MQTT 3.1.1 connections.
    pub properties: Option<serde_json::Value>,
}

impl IncomingMessage {
    /// Creates a message without properties.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            properties: None,
        }
    }
}

/// A message queued for publishing.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Destination topic.
    pub topic: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Quality of service.
    pub qos: QoS,
    /// Whether the broker should retain the message.
    pub retain: bool,
}

impl OutboundMessage {
    /// Creates an outbound message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    /// Returns the payload interpreted as UTF-8, lossily.
    #[must_use]
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Connection-state changes and messages surfaced by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The broker acknowledged the connection.
    Connected,
    /// The connection was lost. The supervisor reacts by reconnecting.
    Disconnected,
    /// A message arrived on a subscribed topic.
    Message(IncomingMessage),
}

/// Minimal contract over an MQTT client.
///
/// All methods take `&self`; implementations carry their own interior
/// state. The event stream is single-consumer: the connection
/// supervisor's receive worker is the only caller of
/// [`next_event`](Transport::next_event).
#[allow(async_fn_in_trait)]
pub trait Transport: Send + Sync + 'static {
    /// Establishes the connection, returning once the broker has
    /// acknowledged it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the connection cannot be
    /// established.
    fn connect(&self) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Subscribes to a topic filter. Idempotent: re-subscribing to an
    /// already-subscribed filter is a no-op at the broker.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the subscription cannot be sent.
    fn subscribe(&self, filter: &str, qos: QoS) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Publishes a message, returning once it has been accepted for
    /// delivery.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the message is not accepted.
    fn publish(&self, message: &OutboundMessage) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Waits for the next transport event. Returns `None` once the
    /// transport is permanently closed.
    fn next_event(&self) -> impl std::future::Future<Output = Option<TransportEvent>> + Send;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the disconnect cannot be sent.
    fn disconnect(&self) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
}

impl<T: Transport> Transport for std::sync::Arc<T> {
    async fn connect(&self) -> Result<(), TransportError> {
        (**self).connect().await
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        (**self).subscribe(filter, qos).await
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        (**self).publish(message).await
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        (**self).next_event().await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        (**self).disconnect().await
    }
}
