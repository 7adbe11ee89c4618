// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inbound message dispatch.
//!
//! The [`DispatchRouter`] consumes the supervisor's inbound stream and
//! does two things with every message: it fans the raw message out to
//! every user callback whose topic pattern matches, and it detects
//! command topics and spawns a command task for each.
//!
//! Callbacks registered under the same pattern run in registration
//! order within one task; distinct patterns run concurrently with each
//! other and with command processing. Both kinds of task are tracked by
//! the router: a panicking callback or command handler is logged and
//! never takes down the router itself.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::command::CommandProcessor;
use crate::topic::{self, CommandTopic};
use crate::transport::IncomingMessage;

/// A user callback: `(topic, payload, properties)`.
pub type Callback = Arc<dyn Fn(&str, &str, Option<&Value>) + Send + Sync>;

/// Ordered registry of topic-pattern callbacks.
///
/// Populated before the application runs and read-only afterwards.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Vec<(String, Vec<Callback>)>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for a topic pattern. Callbacks on the same
    /// pattern are invoked in registration order.
    pub fn register<F>(&mut self, pattern: impl Into<String>, callback: F)
    where
        F: Fn(&str, &str, Option<&Value>) + Send + Sync + 'static,
    {
        self.register_arc(pattern, Arc::new(callback));
    }

    /// Registers an already type-erased callback.
    pub fn register_arc(&mut self, pattern: impl Into<String>, callback: Callback) {
        let pattern = pattern.into();
        if let Some((_, callbacks)) = self.entries.iter_mut().find(|(p, _)| *p == pattern) {
            callbacks.push(callback);
        } else {
            self.entries.push((pattern, vec![callback]));
        }
    }

    /// Iterates the registered patterns in registration order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(pattern, _)| pattern.as_str())
    }

    /// Returns the callback lists of every pattern matching `topic`.
    #[must_use]
    pub fn matching(&self, topic: &str) -> Vec<(String, Vec<Callback>)> {
        self.entries
            .iter()
            .filter(|(pattern, _)| topic::matches(pattern, topic))
            .cloned()
            .collect()
    }

    /// Returns the total number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, callbacks)| callbacks.len()).sum()
    }

    /// Returns `true` if no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("patterns", &self.patterns().collect::<Vec<_>>())
            .field("callbacks", &self.len())
            .finish()
    }
}

/// Routes inbound messages to callbacks and command tasks.
pub struct DispatchRouter {
    command_filter: String,
    namespace: String,
    callbacks: Arc<CallbackRegistry>,
    processor: Arc<CommandProcessor>,
}

impl DispatchRouter {
    /// Creates a router.
    #[must_use]
    pub fn new(
        command_filter: impl Into<String>,
        namespace: impl Into<String>,
        callbacks: Arc<CallbackRegistry>,
        processor: Arc<CommandProcessor>,
    ) -> Self {
        Self {
            command_filter: command_filter.into(),
            namespace: namespace.into(),
            callbacks,
            processor,
        }
    }

    /// Consumes the inbound stream until cancelled or the stream ends,
    /// then winds down in-flight tasks: cancel commands cooperatively,
    /// wait out the grace period, abort stragglers.
    pub async fn run(
        &self,
        mut inbound_rx: mpsc::Receiver<IncomingMessage>,
        cancel: CancellationToken,
        command_cancel: CancellationToken,
        grace: Duration,
    ) {
        let mut commands: JoinSet<()> = JoinSet::new();
        let mut callbacks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = inbound_rx.recv() => match message {
                    None => break,
                    Some(message) => {
                        self.dispatch(message, &mut commands, &mut callbacks, &command_cancel);
                    }
                },
                Some(joined) = commands.join_next(), if !commands.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Command task panicked");
                        }
                    }
                }
                Some(joined) = callbacks.join_next(), if !callbacks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Callback panicked");
                        }
                    }
                }
            }
        }

        self.wind_down(commands, callbacks, &command_cancel, grace).await;
    }

    fn dispatch(
        &self,
        message: IncomingMessage,
        commands: &mut JoinSet<()>,
        callback_tasks: &mut JoinSet<()>,
        command_cancel: &CancellationToken,
    ) {
        // User callbacks: one task per matching pattern.
        for (pattern, callbacks) in self.callbacks.matching(&message.topic) {
            let topic = message.topic.clone();
            let payload = message.payload.clone();
            let properties = message.properties.clone();
            callback_tasks.spawn(async move {
                let payload = String::from_utf8_lossy(&payload);
                tracing::trace!(pattern = %pattern, topic = %topic, "Dispatching callbacks");
                for callback in callbacks {
                    callback(&topic, &payload, properties.as_ref());
                }
            });
        }

        // Command detection.
        if !topic::matches(&self.command_filter, &message.topic) {
            return;
        }
        let Some(route) = CommandTopic::parse(&message.topic, &self.namespace) else {
            tracing::debug!(topic = %message.topic, "Command filter matched a non-command topic");
            return;
        };
        let processor = Arc::clone(&self.processor);
        let token = command_cancel.clone();
        commands.spawn(async move {
            processor.process(message, route, token).await;
        });
    }

    async fn wind_down(
        &self,
        mut commands: JoinSet<()>,
        mut callbacks: JoinSet<()>,
        command_cancel: &CancellationToken,
        grace: Duration,
    ) {
        command_cancel.cancel();

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            if commands.is_empty() && callbacks.is_empty() {
                break;
            }
            tokio::select! {
                () = &mut deadline => {
                    let remaining = commands.len() + callbacks.len();
                    tracing::warn!(count = remaining, "Aborting tasks after grace period");
                    commands.abort_all();
                    callbacks.abort_all();
                    while commands.join_next().await.is_some() {}
                    while callbacks.join_next().await.is_some() {}
                    break;
                }
                Some(joined) = commands.join_next(), if !commands.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Command task panicked");
                        }
                    }
                }
                Some(joined) = callbacks.join_next(), if !callbacks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Callback panicked");
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for DispatchRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRouter")
            .field("command_filter", &self.command_filter)
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn registry_preserves_registration_order_per_pattern() {
        let mut registry = CallbackRegistry::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.register("icsia/+/status/ack", move |_, _, _| {
                order.lock().push(tag);
            });
        }

        let matching = registry.matching("icsia/m/status/ack");
        assert_eq!(matching.len(), 1);
        for callback in &matching[0].1 {
            callback("icsia/m/status/ack", "{}", None);
        }
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn matching_respects_wildcards() {
        let mut registry = CallbackRegistry::new();
        registry.register("icsia/+/status/ack", |_, _, _| {});
        registry.register("icsia/m/#", |_, _, _| {});
        registry.register("other/topic", |_, _, _| {});

        let matching = registry.matching("icsia/m/status/ack");
        let patterns: Vec<_> = matching.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(patterns, vec!["icsia/+/status/ack", "icsia/m/#"]);
    }

    #[test]
    fn distinct_patterns_have_distinct_entries() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut registry = CallbackRegistry::new();
        for pattern in ["a/#", "a/b"] {
            let counter = Arc::clone(&counter);
            registry.register(pattern, move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(registry.len(), 2);

        for (_, callbacks) in registry.matching("a/b") {
            for callback in callbacks {
                callback("a/b", "", None);
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
