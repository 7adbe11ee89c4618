// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT topic-filter matching and command-topic parsing.
//!
//! Filters follow MQTT 3.1.1 semantics: `+` matches exactly one non-empty
//! segment, `#` matches zero or more trailing segments and is only legal
//! as the final segment. Matching is case-sensitive and `/`-delimited.

/// Returns `true` if `topic` matches the MQTT topic filter `filter`.
///
/// # Examples
///
/// ```
/// use icsia_lib::topic::matches;
///
/// assert!(matches("icsia/+/cmd/#", "icsia/motor1/cmd/move"));
/// assert!(matches("icsia/+/cmd/#", "icsia/motor1/cmd/routine/start"));
/// assert!(!matches("icsia/+/cmd/#", "icsia/motor1/status/ack"));
/// ```
#[must_use]
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    for (i, part) in filter_parts.iter().enumerate() {
        if *part == "#" {
            // Legal only as the final segment; matches zero or more
            // trailing topic segments.
            return i == filter_parts.len() - 1;
        }
        match topic_parts.get(i) {
            None => return false,
            Some(segment) if *part == "+" => {
                if segment.is_empty() {
                    return false;
                }
            }
            Some(segment) => {
                if part != segment {
                    return false;
                }
            }
        }
    }
    filter_parts.len() == topic_parts.len()
}

/// Returns `true` if `filter` is a well-formed MQTT topic filter.
///
/// Rejects empty filters and any `#` that is not the final segment.
#[must_use]
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let parts: Vec<&str> = filter.split('/').collect();
    parts
        .iter()
        .enumerate()
        .all(|(i, part)| *part != "#" || i == parts.len() - 1)
}

/// A command topic parsed into its addressing components.
///
/// Command topics have the shape `{namespace}/{device_id}/cmd/{command}`;
/// the command name is the final topic segment, so routed commands like
/// `icsia/motor1/cmd/routine/start` yield the command `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    /// The device the command addresses (topic segment 1).
    pub device_id: String,
    /// The command name (final topic segment).
    pub command: String,
}

impl CommandTopic {
    /// Parses a topic as a command topic under the given namespace.
    ///
    /// Returns `None` for topics that are not of the form
    /// `{namespace}/{device_id}/cmd/{command...}`.
    #[must_use]
    pub fn parse(topic: &str, namespace: &str) -> Option<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 4 || parts[0] != namespace || parts[2] != "cmd" {
            return None;
        }
        let device_id = parts[1];
        let command = parts[parts.len() - 1];
        if device_id.is_empty() || command.is_empty() {
            return None;
        }
        Some(Self {
            device_id: device_id.to_string(),
            command: command.to_string(),
        })
    }
}

/// Extracts the device id from a command topic.
///
/// Returns `None` for anything that does not parse as
/// `{namespace}/{device_id}/cmd/...`.
#[must_use]
pub fn extract_device_id<'a>(topic: &'a str, namespace: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < 4 || parts[0] != namespace || parts[2] != "cmd" || parts[1].is_empty() {
        return None;
    }
    Some(parts[1])
}

/// Builds the ack topic for a device: `{namespace}/{device_id}/status/ack`.
#[must_use]
pub fn status_ack(namespace: &str, device_id: &str) -> String {
    format!("{namespace}/{device_id}/status/ack")
}

/// Builds the completion topic for a device:
/// `{namespace}/{device_id}/status/completion`.
#[must_use]
pub fn status_completion(namespace: &str, device_id: &str) -> String {
    format!("{namespace}/{device_id}/status/completion")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b/d"));
    }

    #[test]
    fn match_is_case_sensitive() {
        assert!(!matches("a/B", "a/b"));
    }

    #[test]
    fn plus_matches_one_segment() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(matches("+/b/c", "a/b/c"));
        assert!(!matches("a/+", "a/b/c"));
        assert!(!matches("a/+/c", "a/c"));
    }

    #[test]
    fn plus_rejects_empty_segment() {
        assert!(!matches("a/+/c", "a//c"));
    }

    #[test]
    fn hash_matches_trailing_segments() {
        assert!(matches("a/#", "a/b"));
        assert!(matches("a/#", "a/b/c/d"));
        assert!(matches("a/#", "a"));
        assert!(matches("#", "a/b/c"));
        assert!(!matches("a/#", "b/c"));
    }

    #[test]
    fn hash_not_final_never_matches() {
        assert!(!matches("a/#/c", "a/b/c"));
    }

    #[test]
    fn filter_validity() {
        assert!(is_valid_filter("icsia/+/cmd/#"));
        assert!(is_valid_filter("#"));
        assert!(is_valid_filter("a/+/b"));
        assert!(!is_valid_filter("a/#/b"));
        assert!(!is_valid_filter(""));
    }

    #[test]
    fn parse_command_topic() {
        let parsed = CommandTopic::parse("icsia/motor1/cmd/move", "icsia").unwrap();
        assert_eq!(parsed.device_id, "motor1");
        assert_eq!(parsed.command, "move");
    }

    #[test]
    fn parse_nested_command_uses_last_segment() {
        let parsed = CommandTopic::parse("icsia/cam/cmd/capture/start", "icsia").unwrap();
        assert_eq!(parsed.device_id, "cam");
        assert_eq!(parsed.command, "start");
    }

    #[test]
    fn parse_rejects_foreign_topics() {
        assert!(CommandTopic::parse("icsia/motor1/status/ack", "icsia").is_none());
        assert!(CommandTopic::parse("other/motor1/cmd/move", "icsia").is_none());
        assert!(CommandTopic::parse("icsia/motor1/cmd", "icsia").is_none());
        assert!(CommandTopic::parse("icsia//cmd/move", "icsia").is_none());
    }

    #[test]
    fn extract_device_id_from_command_topic() {
        assert_eq!(extract_device_id("icsia/m/cmd/move", "icsia"), Some("m"));
        assert_eq!(extract_device_id("icsia/m/status/ack", "icsia"), None);
        assert_eq!(extract_device_id("icsia/m", "icsia"), None);
    }

    #[test]
    fn response_topic_builders() {
        assert_eq!(status_ack("icsia", "m"), "icsia/m/status/ack");
        assert_eq!(status_completion("icsia", "m"), "icsia/m/status/completion");
    }
}
