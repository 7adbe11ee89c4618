// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection supervision.
//!
//! The [`ConnectionSupervisor`] owns the transport for the life of the
//! process. It retries the initial connect and every reconnect with a
//! configurable interval, replays all registered subscriptions before the
//! receive worker resumes, and funnels every outbound publish through a
//! single FIFO queue whose drainer enforces the publish throttle.
//!
//! # Queue discipline
//!
//! The queue is unbounded and strictly FIFO. Messages enqueued while
//! disconnected are held and drained in order after reconnection. The
//! retained status snapshot uses [`PublishHandle::publish_replacing`],
//! which drops a previously queued message for the same topic, so a long
//! disconnect coalesces stale snapshots instead of accumulating them;
//! command responses are never dropped. On shutdown the drainer flushes
//! what remains best-effort, QoS-1 messages first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{Error, TransportError};
use crate::transport::{IncomingMessage, OutboundMessage, Transport, TransportEvent};

/// Timing and retry settings for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Maximum failed connect attempts before giving up; negative means
    /// retry forever.
    pub max_reconnect_attempts: i32,
    /// Minimum gap between two adjacent publishes.
    pub throttle_interval: Duration,
}

impl SupervisorConfig {
    /// Extracts supervisor settings from an application config.
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            reconnect_interval: config.reconnect_delay(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            throttle_interval: config.throttle(),
        }
    }
}

/// The FIFO publish queue shared by handle and drainer.
struct PublishQueue {
    items: parking_lot::Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
}

impl PublishQueue {
    fn new() -> Self {
        Self {
            items: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, message: OutboundMessage) {
        self.items.lock().push_back(message);
        self.notify.notify_one();
    }

    fn push_replacing(&self, message: OutboundMessage) {
        let mut items = self.items.lock();
        items.retain(|m| m.topic != message.topic);
        items.push_back(message);
        drop(items);
        self.notify.notify_one();
    }

    fn push_front(&self, message: OutboundMessage) {
        self.items.lock().push_front(message);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<OutboundMessage> {
        self.items.lock().pop_front()
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }

    fn drain(&self) -> Vec<OutboundMessage> {
        self.items.lock().drain(..).collect()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

/// Cheaply cloneable handle for enqueuing publishes.
///
/// Enqueuing never blocks and never fails; delivery is the drainer's
/// concern.
#[derive(Clone)]
pub struct PublishHandle {
    queue: Arc<PublishQueue>,
}

impl PublishHandle {
    /// Appends a message to the publish queue.
    pub fn publish(&self, message: OutboundMessage) {
        self.queue.push(message);
    }

    /// Appends a message, dropping any queued message for the same
    /// topic. Used for retained snapshots where only the latest value
    /// matters.
    pub fn publish_replacing(&self, message: OutboundMessage) {
        self.queue.push_replacing(message);
    }

    /// Returns the number of queued messages.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl std::fmt::Debug for PublishHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishHandle")
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Owns the transport lifecycle: connect retries, subscription replay,
/// the receive worker, and the throttled publish drainer.
pub struct ConnectionSupervisor<T: Transport> {
    transport: T,
    config: SupervisorConfig,
    queue: Arc<PublishQueue>,
    subscriptions: parking_lot::Mutex<Vec<(String, QoS)>>,
    connected_tx: watch::Sender<bool>,
}

impl<T: Transport> ConnectionSupervisor<T> {
    /// Creates a supervisor over the given transport.
    #[must_use]
    pub fn new(transport: T, config: SupervisorConfig) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            transport,
            config,
            queue: Arc::new(PublishQueue::new()),
            subscriptions: parking_lot::Mutex::new(Vec::new()),
            connected_tx,
        }
    }

    /// Returns a handle for enqueuing publishes.
    #[must_use]
    pub fn publish_handle(&self) -> PublishHandle {
        PublishHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Returns a watch receiver tracking the connection state.
    #[must_use]
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Registers a topic filter for subscription. The filter is applied
    /// on connect and re-applied on every reconnect. Registration
    /// happens before [`run`](Self::run) starts.
    pub fn add_subscription(&self, filter: impl Into<String>, qos: QoS) {
        let filter = filter.into();
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.iter().any(|(f, _)| *f == filter) {
            subscriptions.push((filter, qos));
        }
    }

    /// Runs the connect loop and receive worker until cancelled.
    ///
    /// Incoming messages are forwarded to `inbound_tx` in transport
    /// receive order. On connection loss the worker stops, the connect
    /// loop resumes, and subscriptions are replayed before messages flow
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReconnectExhausted`] when the configured attempt
    /// budget is spent.
    pub async fn run(
        &self,
        inbound_tx: mpsc::Sender<IncomingMessage>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                result = self.connect_with_retry() => result?,
            }

            if let Err(e) = self.replay_subscriptions().await {
                tracing::warn!(error = %e, "Subscription replay failed, reconnecting");
                tokio::time::sleep(self.config.reconnect_interval).await;
                continue;
            }
            self.connected_tx.send_replace(true);
            tracing::info!("Receive worker running");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        // Keep the connection up: the drainer still needs
                        // it for the final flush.
                        return Ok(());
                    }
                    event = self.transport.next_event() => match event {
                        None => {
                            self.connected_tx.send_replace(false);
                            tracing::info!("Transport closed, supervisor stopping");
                            return Ok(());
                        }
                        Some(TransportEvent::Connected) => {
                            tracing::debug!("Transport reports connected");
                        }
                        Some(TransportEvent::Disconnected) => {
                            self.connected_tx.send_replace(false);
                            tracing::warn!("Connection lost, reconnecting");
                            break;
                        }
                        Some(TransportEvent::Message(message)) => {
                            if inbound_tx.send(message).await.is_err() {
                                tracing::debug!("Router gone, supervisor stopping");
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Runs the publish drainer until cancelled, then flushes the queue
    /// best-effort (QoS-1 before QoS-0).
    pub async fn run_publisher(&self, cancel: CancellationToken) {
        let mut connected_rx = self.connected_tx.subscribe();
        let mut last_publish: Option<Instant> = None;

        'running: loop {
            // Hold off while disconnected. Messages stay in the queue
            // during the outage so retained snapshots can still
            // coalesce.
            while !*connected_rx.borrow_and_update() {
                tokio::select! {
                    () = cancel.cancelled() => break 'running,
                    changed = connected_rx.changed() => {
                        if changed.is_err() {
                            break 'running;
                        }
                    }
                }
            }

            let message = loop {
                if let Some(message) = self.queue.try_pop() {
                    break message;
                }
                tokio::select! {
                    () = cancel.cancelled() => break 'running,
                    () = self.queue.wait() => {}
                }
            };

            // The connection may have dropped while waiting for work.
            if !*connected_rx.borrow_and_update() {
                self.queue.push_front(message);
                continue 'running;
            }

            if let Some(last) = last_publish {
                let elapsed = last.elapsed();
                if elapsed < self.config.throttle_interval {
                    tokio::time::sleep(self.config.throttle_interval - elapsed).await;
                }
            }

            if let Err(e) = self.transport.publish(&message).await {
                tracing::warn!(topic = %message.topic, error = %e, "Publish failed");
            }
            last_publish = Some(Instant::now());
        }

        self.flush_remaining().await;
    }

    /// Disconnects the transport.
    pub async fn disconnect(&self) {
        self.connected_tx.send_replace(false);
        if let Err(e) = self.transport.disconnect().await {
            tracing::debug!(error = %e, "Disconnect failed");
        }
    }

    async fn connect_with_retry(&self) -> Result<(), Error> {
        let mut attempts: u32 = 0;
        loop {
            match self.transport.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        error = %e,
                        attempt = attempts,
                        "Connect failed"
                    );
                    #[allow(clippy::cast_sign_loss)]
                    if self.config.max_reconnect_attempts >= 0
                        && attempts >= self.config.max_reconnect_attempts as u32
                    {
                        return Err(Error::ReconnectExhausted { attempts });
                    }
                    tokio::time::sleep(self.config.reconnect_interval).await;
                }
            }
        }
    }

    async fn replay_subscriptions(&self) -> Result<(), TransportError> {
        let subscriptions = self.subscriptions.lock().clone();
        for (filter, qos) in subscriptions {
            self.transport.subscribe(&filter, qos).await?;
            tracing::debug!(filter = %filter, "Subscription applied");
        }
        Ok(())
    }

    async fn flush_remaining(&self) {
        let remaining = self.queue.drain();
        if remaining.is_empty() {
            return;
        }
        tracing::debug!(count = remaining.len(), "Flushing publish queue");
        let (urgent, rest): (Vec<_>, Vec<_>) = remaining
            .into_iter()
            .partition(|m| m.qos != QoS::AtMostOnce);
        for message in urgent.into_iter().chain(rest) {
            if let Err(e) = self.transport.publish(&message).await {
                tracing::warn!(topic = %message.topic, error = %e, "Flush publish failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            reconnect_interval: Duration::from_millis(10),
            max_reconnect_attempts: -1,
            throttle_interval: Duration::from_millis(0),
        }
    }

    fn qos0(topic: &str, payload: &str) -> OutboundMessage {
        OutboundMessage::new(topic, payload.as_bytes().to_vec(), QoS::AtMostOnce, false)
    }

    #[test]
    fn queue_is_fifo() {
        let queue = PublishQueue::new();
        queue.push(qos0("a", "1"));
        queue.push(qos0("b", "2"));

        assert_eq!(queue.try_pop().unwrap().topic, "a");
        assert_eq!(queue.try_pop().unwrap().topic, "b");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn push_replacing_drops_same_topic() {
        let queue = PublishQueue::new();
        queue.push(qos0("status", "old"));
        queue.push(qos0("other", "x"));
        queue.push_replacing(qos0("status", "new"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().topic, "other");
        let last = queue.try_pop().unwrap();
        assert_eq!(last.topic, "status");
        assert_eq!(last.payload_str(), "new");
    }

    #[tokio::test]
    async fn connect_retries_until_success() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_connects(2);
        let supervisor =
            ConnectionSupervisor::new(Arc::clone(&transport), test_config());

        supervisor.connect_with_retry().await.unwrap();
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn connect_gives_up_after_max_attempts() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_connects(10);
        let mut config = test_config();
        config.max_reconnect_attempts = 3;
        let supervisor = ConnectionSupervisor::new(Arc::clone(&transport), config);

        let err = supervisor.connect_with_retry().await.unwrap_err();
        assert!(matches!(err, Error::ReconnectExhausted { attempts: 3 }));
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn messages_flow_to_inbound_channel() {
        let transport = Arc::new(MockTransport::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&transport),
            test_config(),
        ));
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let sup = Arc::clone(&supervisor);
        let token = cancel.clone();
        let worker = tokio::spawn(async move { sup.run(inbound_tx, token).await });

        transport.inject_message("icsia/m/cmd/move", b"{}".to_vec());
        let message = inbound_rx.recv().await.unwrap();
        assert_eq!(message.topic, "icsia/m/cmd/move");

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn subscriptions_replay_after_reconnect() {
        let transport = Arc::new(MockTransport::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&transport),
            test_config(),
        ));
        supervisor.add_subscription("icsia/+/cmd/#", QoS::AtLeastOnce);
        supervisor.add_subscription("icsia/+/status/ack", QoS::AtLeastOnce);

        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let sup = Arc::clone(&supervisor);
        let token = cancel.clone();
        let worker = tokio::spawn(async move { sup.run(inbound_tx, token).await });

        let mut connected = supervisor.connected();
        connected.wait_for(|c| *c).await.unwrap();
        assert_eq!(transport.subscriptions().len(), 2);

        transport.inject_disconnect();
        // Both filters applied again once the reconnect completes.
        tokio::time::timeout(Duration::from_secs(1), async {
            while transport.subscriptions().len() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn publisher_holds_messages_until_connected() {
        let transport = Arc::new(MockTransport::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&transport),
            test_config(),
        ));
        let handle = supervisor.publish_handle();
        let cancel = CancellationToken::new();

        let sup = Arc::clone(&supervisor);
        let token = cancel.clone();
        let drainer = tokio::spawn(async move { sup.run_publisher(token).await });

        handle.publish(qos0("t/1", "a"));
        handle.publish(qos0("t/2", "b"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.published().is_empty());

        supervisor.connected_tx.send_replace(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let published = transport.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].topic, "t/1");
        assert_eq!(published[1].topic, "t/2");

        cancel.cancel();
        drainer.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flush_prioritizes_qos1() {
        let transport = Arc::new(MockTransport::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&transport),
            test_config(),
        ));
        let handle = supervisor.publish_handle();

        handle.publish(qos0("status", "snapshot"));
        handle.publish(OutboundMessage::new(
            "ack",
            b"{}".to_vec(),
            QoS::AtLeastOnce,
            false,
        ));

        let cancel = CancellationToken::new();
        cancel.cancel();
        supervisor.run_publisher(cancel).await;

        let published = transport.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].topic, "ack");
        assert_eq!(published[1].topic, "status");
    }
}
