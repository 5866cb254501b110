// GCPS
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Transport layer to talk to Google Cloud Pub/Sub.
//!
//! The broker only needs a handful of Pub/Sub primitives: creating topics and pull
//! subscriptions, publishing to a topic, pulling from a subscription and settling pulled messages
//! by either acknowledging them or by modifying their ack deadline.  These are captured by the
//! `PubSubClient` trait so that the broker can run against the real service (or the official
//! emulator) via `RestPubSubClient` and against an in-process fake in tests.

use crate::model::QueueName;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

mod rest;
pub use rest::{PubSubOptions, RestPubSubClient};
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

/// Default prefix for the topic and subscription identifiers created by the broker.
///
/// This matches the naming used by the Dramatiq Pub/Sub broker so that both can share queues.
pub const DEFAULT_TOPIC_PREFIX: &str = "dramatiq";

/// Ack deadlines, in seconds, accepted by Pub/Sub subscriptions.
const ACK_DEADLINE_RANGE: RangeInclusive<u64> = 10..=600;

/// Converts `ack_deadline` to the number of seconds that Pub/Sub expects.
///
/// Fails with `InvalidInput` if the deadline has a fractional part or is outside of the range
/// accepted by the service.
pub fn ack_deadline_seconds(ack_deadline: Duration) -> PubSubResult<u32> {
    let seconds = ack_deadline.as_secs();
    if ack_deadline.subsec_nanos() != 0 || !ACK_DEADLINE_RANGE.contains(&seconds) {
        return Err(PubSubError::InvalidInput(format!(
            "Ack deadline must be a whole number of seconds between {} and {}; got {:?}",
            ACK_DEADLINE_RANGE.start(),
            ACK_DEADLINE_RANGE.end(),
            ack_deadline
        )));
    }
    u32::try_from(seconds).map_err(|e| PubSubError::InvalidInput(e.to_string()))
}

/// Errors returned by the Pub/Sub service.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum PubSubError {
    /// The resource being created already exists.
    #[error("{0}")]
    AlreadyExists(String),

    /// Catch-all for unexpected service or network errors.
    #[error("{0}")]
    BackendError(String),

    /// The request was rejected as invalid.
    #[error("{0}")]
    InvalidInput(String),

    /// The resource being accessed does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The caller is not allowed to perform the operation.
    #[error("{0}")]
    PermissionDenied(String),
}

/// Result type for this module.
pub type PubSubResult<T> = Result<T, PubSubError>;

/// Fully-qualified name of a topic, of the form `projects/{project}/topics/{topic}`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TopicPath(String);

impl TopicPath {
    /// Creates the path of topic `topic` in `project`.
    pub fn new(project: &str, topic: &str) -> Self {
        Self(format!("projects/{}/topics/{}", project, topic))
    }

    /// Returns the path as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully-qualified name of a subscription, of the form
/// `projects/{project}/subscriptions/{subscription}`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionPath(String);

impl SubscriptionPath {
    /// Creates the path of subscription `subscription` in `project`.
    pub fn new(project: &str, subscription: &str) -> Self {
        Self(format!("projects/{}/subscriptions/{}", project, subscription))
    }

    /// Returns the path as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the identifier of the topic backing `queue`.
///
/// Underscores are replaced by dashes to keep identifiers in the style of other Pub/Sub
/// resources.  Note that this means that `a_b` and `a-b` share a topic.
pub fn topic_id(prefix: &str, queue: &QueueName) -> String {
    format!("{}-{}", prefix, queue.as_str().replace('_', "-"))
}

/// Computes the identifier of the pull subscription backing `queue`.
pub fn subscription_id(prefix: &str, queue: &QueueName) -> String {
    format!("{}-sub", topic_id(prefix, queue))
}

/// A message pulled from a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedMessage {
    /// Token to acknowledge or nack this delivery.
    pub ack_id: String,

    /// Message payload.
    pub data: Vec<u8>,

    /// Identifier assigned by the service at publish time.
    pub message_id: String,

    /// Attributes attached at publish time.
    pub attributes: HashMap<String, String>,

    /// Delivery attempt counter, only reported by subscriptions with a dead-letter policy.
    pub delivery_attempt: Option<u32>,
}

/// Interface to the Pub/Sub primitives used by the broker.
#[async_trait]
pub trait PubSubClient {
    /// Creates `topic`.  Fails with `AlreadyExists` if it exists.
    async fn create_topic(&self, topic: &TopicPath) -> PubSubResult<()>;

    /// Deletes `topic`.
    async fn delete_topic(&self, topic: &TopicPath) -> PubSubResult<()>;

    /// Creates the pull `subscription` attached to `topic`.  Fails with `AlreadyExists` if it
    /// exists.
    ///
    /// `ack_deadline` is the time the service waits for an acknowledgement before redelivering a
    /// pulled message.  `None` uses the service default.
    async fn create_subscription(
        &self,
        subscription: &SubscriptionPath,
        topic: &TopicPath,
        ack_deadline: Option<Duration>,
    ) -> PubSubResult<()>;

    /// Deletes `subscription`.
    async fn delete_subscription(&self, subscription: &SubscriptionPath) -> PubSubResult<()>;

    /// Publishes `data` with `attributes` to `topic` and returns the service-assigned id.
    async fn publish(
        &self,
        topic: &TopicPath,
        data: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> PubSubResult<String>;

    /// Pulls up to `max_messages` from `subscription`, waiting at most `timeout`.
    ///
    /// Returns an empty list if no messages become available in time.
    async fn pull(
        &self,
        subscription: &SubscriptionPath,
        max_messages: u16,
        timeout: Duration,
    ) -> PubSubResult<Vec<ReceivedMessage>>;

    /// Acknowledges the deliveries identified by `ack_ids`.
    async fn acknowledge(
        &self,
        subscription: &SubscriptionPath,
        ack_ids: &[String],
    ) -> PubSubResult<()>;

    /// Changes the ack deadline of `ack_ids` to `seconds` from now.  A deadline of zero makes
    /// the messages available for redelivery immediately.
    async fn modify_ack_deadline(
        &self,
        subscription: &SubscriptionPath,
        ack_ids: &[String],
        seconds: u32,
    ) -> PubSubResult<()>;

    /// Releases any resources held by the client.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(
            "projects/test-project/topics/dramatiq-default",
            TopicPath::new("test-project", "dramatiq-default").as_str()
        );
        assert_eq!(
            "projects/test-project/subscriptions/dramatiq-default-sub",
            SubscriptionPath::new("test-project", "dramatiq-default-sub").to_string()
        );
    }

    #[test]
    fn test_ack_deadline_seconds() {
        assert_eq!(10, ack_deadline_seconds(Duration::from_secs(10)).unwrap());
        assert_eq!(600, ack_deadline_seconds(Duration::from_secs(600)).unwrap());

        for invalid in [
            Duration::ZERO,
            Duration::from_millis(500),
            Duration::from_secs(9),
            Duration::from_millis(10_500),
            Duration::from_secs(601),
        ] {
            match ack_deadline_seconds(invalid) {
                Err(PubSubError::InvalidInput(msg)) => {
                    assert!(msg.contains("between 10 and 600"), "{}", msg)
                }
                e => panic!("Unexpected result {:?} for {:?}", e, invalid),
            }
        }
    }

    #[test]
    fn test_resource_ids() {
        let queue = QueueName::from("default");
        assert_eq!("dramatiq-default", topic_id(DEFAULT_TOPIC_PREFIX, &queue));
        assert_eq!("dramatiq-default-sub", subscription_id(DEFAULT_TOPIC_PREFIX, &queue));
    }

    #[test]
    fn test_resource_ids_replace_underscores() {
        let queue = QueueName::from("queue_1a2b_x");
        assert_eq!("tasks-queue-1a2b-x", topic_id("tasks", &queue));
        assert_eq!("tasks-queue-1a2b-x-sub", subscription_id("tasks", &queue));
    }
}
