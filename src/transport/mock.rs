// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory transport for testing without a broker.
//!
//! Records publishes and subscriptions for assertions, and lets tests
//! inject inbound messages and connection losses. Wrap it in an [`Arc`]
//! to keep a handle for driving the test while the application owns the
//! transport:
//!
//! ```no_run
//! use std::sync::Arc;
//! use icsia_lib::transport::mock::MockTransport;
//!
//! let transport = Arc::new(MockTransport::new());
//! let handle = Arc::clone(&transport);
//! // pass `transport` to the application, drive the test via `handle`
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use rumqttc::QoS;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{IncomingMessage, OutboundMessage, Transport, TransportEvent};

/// Mock implementation of the [`Transport`] trait.
pub struct MockTransport {
    published: parking_lot::Mutex<Vec<OutboundMessage>>,
    subscriptions: parking_lot::Mutex<Vec<(String, QoS)>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    connected: AtomicBool,
    connect_attempts: AtomicU32,
    failures_remaining: AtomicU32,
}

impl MockTransport {
    /// Creates a mock transport.
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            published: parking_lot::Mutex::new(Vec::new()),
            subscriptions: parking_lot::Mutex::new(Vec::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            connected: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
            failures_remaining: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Returns how many connect attempts were made.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Returns whether the transport believes it is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Delivers an inbound message to the application.
    pub fn inject_message(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        let message = IncomingMessage::new(topic, payload);
        let _ = self.events_tx.send(TransportEvent::Message(message));
    }

    /// Simulates a connection loss.
    pub fn inject_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Disconnected);
    }

    /// Returns all recorded publishes in order.
    #[must_use]
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().clone()
    }

    /// Returns all publishes to the given topic, in order.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<OutboundMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Returns every recorded `subscribe` call (replays included).
    #[must_use]
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().clone()
    }

    /// Returns whether the given filter has been subscribed at least
    /// once.
    #[must_use]
    pub fn is_subscribed_to(&self, filter: &str) -> bool {
        self.subscriptions.lock().iter().any(|(f, _)| f == filter)
    }

    /// Clears recorded publishes and subscriptions.
    pub fn reset(&self) {
        self.published.lock().clear();
        self.subscriptions.lock().clear();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("connected", &self.is_connected())
            .field("published", &self.published.lock().len())
            .finish()
    }
}

impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let failures = self.failures_remaining.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures_remaining.store(failures - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectionFailed(
                "simulated connect failure".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.subscriptions.lock().push((filter.to_string(), qos));
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.published.lock().push(message.clone());
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_records_messages() {
        let mock = MockTransport::new();
        let msg = OutboundMessage::new("test/topic", b"hello".to_vec(), QoS::AtLeastOnce, false);
        mock.publish(&msg).await.unwrap();

        let published = mock.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "test/topic");
        assert_eq!(published[0].payload, b"hello");
    }

    #[tokio::test]
    async fn subscribe_records_every_call() {
        let mock = MockTransport::new();
        mock.subscribe("icsia/+/cmd/#", QoS::AtLeastOnce).await.unwrap();
        mock.subscribe("icsia/+/cmd/#", QoS::AtLeastOnce).await.unwrap();

        assert!(mock.is_subscribed_to("icsia/+/cmd/#"));
        assert_eq!(mock.subscriptions().len(), 2);
    }

    #[tokio::test]
    async fn failed_connects_count_down() {
        let mock = MockTransport::new();
        mock.fail_next_connects(2);

        assert!(mock.connect().await.is_err());
        assert!(mock.connect().await.is_err());
        assert!(mock.connect().await.is_ok());
        assert_eq!(mock.connect_attempts(), 3);
        assert!(mock.is_connected());
    }

    #[tokio::test]
    async fn injected_messages_surface_as_events() {
        let mock = MockTransport::new();
        mock.inject_message("icsia/m/cmd/move", b"{}".to_vec());

        let event = mock.next_event().await.unwrap();
        let TransportEvent::Message(msg) = event else {
            panic!("expected a message event");
        };
        assert_eq!(msg.topic, "icsia/m/cmd/move");
    }

    #[tokio::test]
    async fn injected_disconnect_flips_state() {
        let mock = MockTransport::new();
        mock.connect().await.unwrap();
        mock.inject_disconnect();

        assert!(!mock.is_connected());
        assert!(matches!(
            mock.next_event().await,
            Some(TransportEvent::Disconnected)
        ));
    }
}
