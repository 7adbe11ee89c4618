// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status snapshot maintenance and publishing.
//!
//! The [`StatusPublisher`] owns the device's status snapshot: a JSON
//! object seeded from the status schema and kept current by user updates
//! and the command state machine. Publishing is change-driven by
//! default — the snapshot goes out when something actually changed — with
//! an optional keep-alive mode that also publishes on every timer wake.
//!
//! The snapshot mutex is held only across merge and equality checks,
//! never across I/O; publishing hands the serialized payload to the
//! supervisor's queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use serde_json::{Map, Value};
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::supervisor::PublishHandle;
use crate::transport::OutboundMessage;

/// Snapshot field maintained by the framework: overall device state.
pub const OPERATIONAL_STATUS: &str = "operational_status";
/// Snapshot field maintained by the framework: time of publish.
pub const TIMESTAMP: &str = "timestamp";
/// Snapshot field maintained by the framework: `command_timestamp` of
/// the most recently acked command.
pub const LAST_COMMAND_TIME: &str = "last_command_time";

/// Framework-managed device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationalStatus {
    /// No command in flight.
    Idle,
    /// At least one command is executing.
    Busy,
    /// The most recent command failed and nothing is in flight.
    Error,
}

impl OperationalStatus {
    /// Returns the wire spelling of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct StatusInner {
    snapshot: Map<String, Value>,
    dirty: bool,
    in_flight: usize,
    last_published: Option<DateTime<Utc>>,
}

/// Maintains the status snapshot and publishes it on change and/or on a
/// timer.
pub struct StatusPublisher {
    topic: String,
    interval: Duration,
    keepalive: bool,
    publisher: PublishHandle,
    inner: parking_lot::Mutex<StatusInner>,
    changed: Notify,
}

impl StatusPublisher {
    /// Creates a publisher over a template produced by
    /// [`build_status_template`](crate::schema::build_status_template).
    ///
    /// The framework-managed fields are added on top of the template;
    /// `operational_status` starts as `idle`.
    #[must_use]
    pub fn new(
        template: Map<String, Value>,
        topic: impl Into<String>,
        interval: Duration,
        keepalive: bool,
        publisher: PublishHandle,
    ) -> Self {
        let mut snapshot = template;
        let startup = clock::now_timestamp();
        snapshot.insert(
            OPERATIONAL_STATUS.to_string(),
            Value::String(OperationalStatus::Idle.as_str().to_string()),
        );
        snapshot.insert(TIMESTAMP.to_string(), Value::String(startup.clone()));
        snapshot.insert(LAST_COMMAND_TIME.to_string(), Value::String(startup));

        Self {
            topic: topic.into(),
            interval,
            keepalive,
            publisher,
            inner: parking_lot::Mutex::new(StatusInner {
                snapshot,
                dirty: false,
                in_flight: 0,
                last_published: None,
            }),
            changed: Notify::new(),
        }
    }

    /// Deep-merges a partial object into the snapshot.
    ///
    /// Object values merge recursively; scalars and arrays replace.
    /// Returns `true` if anything actually changed (structural
    /// equality); only then is a publish triggered. Non-object partials
    /// are ignored.
    pub fn update(&self, partial: &Value) -> bool {
        let Some(partial) = partial.as_object() else {
            tracing::warn!("Ignoring non-object status update");
            return false;
        };

        let changed = {
            let mut inner = self.inner.lock();
            let before = inner.snapshot.clone();
            deep_merge(&mut inner.snapshot, partial);
            let changed = inner.snapshot != before;
            if changed {
                inner.dirty = true;
            }
            changed
        };
        if changed {
            self.changed.notify_one();
        }
        changed
    }

    /// Sets the operational status, triggering a publish if it changed.
    pub fn set_operational(&self, status: OperationalStatus) {
        let changed = {
            let mut inner = self.inner.lock();
            set_field(
                &mut inner,
                OPERATIONAL_STATUS,
                Value::String(status.as_str().to_string()),
            )
        };
        if changed {
            self.changed.notify_one();
        }
    }

    /// Returns the current operational status.
    #[must_use]
    pub fn operational(&self) -> OperationalStatus {
        let inner = self.inner.lock();
        match inner.snapshot.get(OPERATIONAL_STATUS).and_then(Value::as_str) {
            Some("busy") => OperationalStatus::Busy,
            Some("error") => OperationalStatus::Error,
            _ => OperationalStatus::Idle,
        }
    }

    /// Returns a copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner.lock().snapshot.clone()
    }

    /// Marks a command as in flight: status goes busy and
    /// `last_command_time` records the command's timestamp.
    pub(crate) fn command_started(&self, command_timestamp: &str) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.in_flight += 1;
            let a = set_field(
                &mut inner,
                OPERATIONAL_STATUS,
                Value::String(OperationalStatus::Busy.as_str().to_string()),
            );
            let b = set_field(
                &mut inner,
                LAST_COMMAND_TIME,
                Value::String(command_timestamp.to_string()),
            );
            a || b
        };
        if changed {
            self.changed.notify_one();
        }
    }

    /// Marks a command as finished. When the in-flight set empties, the
    /// operational status settles to `idle` (success) or `error`
    /// (failure) and a change-check fires.
    pub(crate) fn command_finished(&self, success: bool) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
            if inner.in_flight == 0 {
                let settled = if success {
                    OperationalStatus::Idle
                } else {
                    OperationalStatus::Error
                };
                set_field(
                    &mut inner,
                    OPERATIONAL_STATUS,
                    Value::String(settled.as_str().to_string()),
                )
            } else {
                false
            }
        };
        if changed {
            self.changed.notify_one();
        }
    }

    /// Drops a cancelled command from the in-flight count without
    /// publishing anything.
    pub(crate) fn command_aborted(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// Returns whether the snapshot changed since the last publish.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Serializes the snapshot and enqueues it on the status topic
    /// (QoS 0, retained). The publish `timestamp` is refreshed and
    /// clamped so consecutive publishes never go backwards.
    pub fn publish_now(&self) {
        let payload = {
            let mut inner = self.inner.lock();
            let now = clock::now();
            let stamped = inner.last_published.map_or(now, |last| now.max(last));
            inner.last_published = Some(stamped);
            inner.snapshot.insert(
                TIMESTAMP.to_string(),
                Value::String(clock::format_timestamp(stamped)),
            );
            inner.dirty = false;
            serde_json::to_vec(&Value::Object(inner.snapshot.clone()))
        };
        match payload {
            Ok(bytes) => {
                tracing::debug!(topic = %self.topic, "Publishing status snapshot");
                self.publisher.publish_replacing(OutboundMessage::new(
                    self.topic.clone(),
                    bytes,
                    QoS::AtMostOnce,
                    true,
                ));
            }
            Err(e) => tracing::error!(error = %e, "Status snapshot serialization failed"),
        }
    }

    /// Runs the publishing schedule until cancelled.
    ///
    /// An initial snapshot goes out once after the first successful
    /// connect. After that, the task wakes every interval (publishing
    /// when dirty, or always in keep-alive mode) and additionally
    /// publishes immediately whenever the snapshot becomes dirty.
    pub async fn run(&self, mut connected: watch::Receiver<bool>, cancel: CancellationToken) {
        tokio::select! {
            () = cancel.cancelled() => return,
            result = connected.wait_for(|c| *c) => {
                if result.is_err() {
                    return;
                }
            }
        }
        self.publish_now();

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.keepalive || self.is_dirty() {
                        self.publish_now();
                    }
                }
                () = self.changed.notified() => {
                    if self.is_dirty() {
                        self.publish_now();
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StatusPublisher")
            .field("topic", &self.topic)
            .field("dirty", &inner.dirty)
            .field("in_flight", &inner.in_flight)
            .finish()
    }
}

fn set_field(inner: &mut StatusInner, key: &str, value: Value) -> bool {
    if inner.snapshot.get(key) == Some(&value) {
        return false;
    }
    inner.snapshot.insert(key.to_string(), value);
    inner.dirty = true;
    true
}

/// Deep-merges `partial` into `target`: object values merge recursively,
/// everything else replaces.
fn deep_merge(target: &mut Map<String, Value>, partial: &Map<String, Value>) {
    for (key, value) in partial {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{ConnectionSupervisor, SupervisorConfig};
    use crate::transport::mock::MockTransport;
    use serde_json::json;
    use std::sync::Arc;

    fn publisher_with_queue() -> (StatusPublisher, Arc<MockTransport>, PublishHandle) {
        let transport = Arc::new(MockTransport::new());
        let supervisor = ConnectionSupervisor::new(
            Arc::clone(&transport),
            SupervisorConfig {
                reconnect_interval: Duration::from_millis(10),
                max_reconnect_attempts: -1,
                throttle_interval: Duration::ZERO,
            },
        );
        let handle = supervisor.publish_handle();
        let status = StatusPublisher::new(
            Map::new(),
            "icsia/m/status/current",
            Duration::from_secs(30),
            false,
            handle.clone(),
        );
        (status, transport, handle)
    }

    #[test]
    fn new_snapshot_has_framework_fields() {
        let (status, _, _) = publisher_with_queue();
        let snapshot = status.snapshot();
        assert_eq!(snapshot[OPERATIONAL_STATUS], json!("idle"));
        assert!(snapshot.contains_key(TIMESTAMP));
        assert!(snapshot.contains_key(LAST_COMMAND_TIME));
    }

    #[test]
    fn update_merges_and_marks_dirty() {
        let (status, _, _) = publisher_with_queue();
        assert!(status.update(&json!({"position": {"x": 1}})));
        assert!(status.is_dirty());
        assert_eq!(status.snapshot()["position"], json!({"x": 1}));

        // Objects merge, scalars replace.
        assert!(status.update(&json!({"position": {"y": 2}})));
        assert_eq!(status.snapshot()["position"], json!({"x": 1, "y": 2}));
        assert!(status.update(&json!({"position": {"x": 9}})));
        assert_eq!(status.snapshot()["position"], json!({"x": 9, "y": 2}));
    }

    #[test]
    fn update_with_equal_value_is_not_a_change() {
        let (status, _, _) = publisher_with_queue();
        assert!(status.update(&json!({"foo": 1})));
        status.publish_now();
        assert!(!status.is_dirty());

        assert!(!status.update(&json!({"foo": 1})));
        assert!(!status.is_dirty());
    }

    #[test]
    fn arrays_replace_wholesale() {
        let (status, _, _) = publisher_with_queue();
        status.update(&json!({"waypoints": [1, 2, 3]}));
        status.update(&json!({"waypoints": [4]}));
        assert_eq!(status.snapshot()["waypoints"], json!([4]));
    }

    #[test]
    fn command_lifecycle_drives_operational_status() {
        let (status, _, _) = publisher_with_queue();
        assert_eq!(status.operational(), OperationalStatus::Idle);

        status.command_started("2025-08-10T14:30:15.123Z");
        assert_eq!(status.operational(), OperationalStatus::Busy);
        assert_eq!(
            status.snapshot()[LAST_COMMAND_TIME],
            json!("2025-08-10T14:30:15.123Z")
        );

        status.command_finished(true);
        assert_eq!(status.operational(), OperationalStatus::Idle);

        status.command_started("2025-08-10T14:30:16.000Z");
        status.command_finished(false);
        assert_eq!(status.operational(), OperationalStatus::Error);
    }

    #[test]
    fn overlapping_commands_stay_busy_until_all_finish() {
        let (status, _, _) = publisher_with_queue();
        status.command_started("t1");
        status.command_started("t2");
        status.command_finished(true);
        assert_eq!(status.operational(), OperationalStatus::Busy);
        status.command_finished(true);
        assert_eq!(status.operational(), OperationalStatus::Idle);
    }

    #[test]
    fn publish_now_enqueues_retained_qos0() {
        let (status, _, handle) = publisher_with_queue();
        status.update(&json!({"foo": 1}));
        status.publish_now();

        assert_eq!(handle.queued(), 1);
        assert!(!status.is_dirty());
    }

    #[test]
    fn publish_timestamps_never_decrease() {
        let (status, _, _) = publisher_with_queue();
        status.publish_now();
        let first = status.snapshot()[TIMESTAMP].as_str().unwrap().to_string();
        status.publish_now();
        let second = status.snapshot()[TIMESTAMP].as_str().unwrap().to_string();
        assert!(second >= first);
    }

    #[test]
    fn operational_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&OperationalStatus::Busy).unwrap(),
            "\"busy\""
        );
        assert_eq!(OperationalStatus::Error.to_string(), "error");
    }
}
