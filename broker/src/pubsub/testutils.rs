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

//! Test utilities for the Pub/Sub transport.

use crate::pubsub::{
    ack_deadline_seconds, PubSubClient, PubSubError, PubSubResult, ReceivedMessage,
    SubscriptionPath, TopicPath,
};
use async_trait::async_trait;
use futures::lock::Mutex;
use gcps_core::clocks::Clock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Ack deadline used by subscriptions created without an explicit one, as in the real service.
const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Maximum real time to wait when a pull finds no messages.  Keeps consumer loops from spinning
/// without making tests slow.
const EMPTY_PULL_DELAY: Duration = Duration::from_millis(10);

/// A message stored in a subscription.
#[derive(Clone)]
struct StoredMessage {
    /// Identifier assigned at publish time.
    message_id: String,

    /// Payload.
    data: Vec<u8>,

    /// Attributes attached at publish time.
    attributes: HashMap<String, String>,

    /// Number of times the message has been handed out, reported as its delivery attempt.
    deliveries: u32,
}

/// A message that has been pulled but not yet settled.
struct Outstanding {
    /// Token handed out with the delivery.
    ack_id: String,

    /// Time after which the message becomes available for redelivery.
    deadline: OffsetDateTime,

    /// The delivered message.
    message: StoredMessage,
}

/// State of a single subscription.
struct SubscriptionState {
    /// Path of the topic the subscription is attached to, or `None` if the topic was deleted.
    topic: Option<String>,

    /// Time to wait for an acknowledgement before redelivering.
    ack_deadline: Duration,

    /// Messages ready for delivery, in delivery order.
    pending: VecDeque<StoredMessage>,

    /// Messages pulled but not yet settled, in delivery order.
    outstanding: Vec<Outstanding>,
}

impl SubscriptionState {
    /// Makes messages whose deadline expired at or before `now` available again.
    fn expire(&mut self, now: OffsetDateTime) {
        let mut expired = vec![];
        self.outstanding.retain(|o| {
            if o.deadline <= now {
                expired.push(o.message.clone());
                false
            } else {
                true
            }
        });
        for message in expired.into_iter().rev() {
            self.pending.push_front(message);
        }
    }
}

/// Mutable state of the fake service.
#[derive(Default)]
struct ServiceState {
    /// Existing topics and the paths of the subscriptions attached to them.
    topics: HashMap<String, Vec<String>>,

    /// Existing subscriptions keyed by path.
    subscriptions: HashMap<String, SubscriptionState>,

    /// Payloads published to each topic, in publish order.
    published: HashMap<String, Vec<Vec<u8>>>,

    /// Log of the calls received by the service.
    calls: Vec<String>,

    /// Whether all calls should fail as if the service was down.
    unavailable: bool,

    /// Counter to generate message identifiers.
    last_message_id: u64,

    /// Counter to generate ack identifiers.
    last_ack_id: u64,
}

impl ServiceState {
    /// Records `call` in the log and fails if the service is marked as unavailable.
    fn record(&mut self, call: String) -> PubSubResult<()> {
        self.calls.push(call);
        if self.unavailable {
            return Err(PubSubError::BackendError("Service unavailable".to_owned()));
        }
        Ok(())
    }

    /// Gets the state of `subscription`, failing if it does not exist.
    fn subscription(
        &mut self,
        subscription: &SubscriptionPath,
    ) -> PubSubResult<&mut SubscriptionState> {
        self.subscriptions.get_mut(subscription.as_str()).ok_or_else(|| {
            PubSubError::NotFound(format!("Subscription {} not found", subscription))
        })
    }
}

/// In-process fake of the Pub/Sub service.
///
/// Topics fan out published messages to all of their subscriptions.  Pulled messages stay
/// outstanding until they are acknowledged or until their ack deadline expires, which is
/// measured with the injected clock.  Deadline modifications to zero make messages available
/// for redelivery right away.
#[derive(Clone)]
pub struct InMemoryPubSub {
    /// Clock used to compute ack deadlines.
    clock: Arc<dyn Clock + Send + Sync>,

    /// State shared across clones.
    state: Arc<Mutex<ServiceState>>,
}

impl InMemoryPubSub {
    /// Creates an empty service that uses `clock` to track ack deadlines.
    pub fn new(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self { clock, state: Arc::from(Mutex::from(ServiceState::default())) }
    }

    /// Makes all subsequent calls fail (or succeed again) as if the service was down.
    pub async fn set_unavailable(&self, unavailable: bool) {
        let mut state = self.state.lock().await;
        state.unavailable = unavailable;
    }

    /// Returns the log of calls received so far.
    pub async fn calls(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.calls.clone()
    }

    /// Returns the number of calls received so far whose log entry starts with `prefix`.
    pub async fn count_calls(&self, prefix: &str) -> usize {
        let state = self.state.lock().await;
        state.calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Returns whether `topic` exists.
    pub async fn has_topic(&self, topic: &TopicPath) -> bool {
        let state = self.state.lock().await;
        state.topics.contains_key(topic.as_str())
    }

    /// Returns whether `subscription` exists.
    pub async fn has_subscription(&self, subscription: &SubscriptionPath) -> bool {
        let state = self.state.lock().await;
        state.subscriptions.contains_key(subscription.as_str())
    }

    /// Returns the payloads published to `topic` so far.
    pub async fn published(&self, topic: &TopicPath) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        state.published.get(topic.as_str()).cloned().unwrap_or_default()
    }

    /// Returns the number of messages ready for delivery in `subscription`.
    pub async fn pending_count(&self, subscription: &SubscriptionPath) -> usize {
        let state = self.state.lock().await;
        state.subscriptions.get(subscription.as_str()).map(|s| s.pending.len()).unwrap_or(0)
    }

    /// Returns the number of pulled but unsettled messages in `subscription`.
    pub async fn outstanding_count(&self, subscription: &SubscriptionPath) -> usize {
        let state = self.state.lock().await;
        state.subscriptions.get(subscription.as_str()).map(|s| s.outstanding.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PubSubClient for InMemoryPubSub {
    async fn create_topic(&self, topic: &TopicPath) -> PubSubResult<()> {
        let mut state = self.state.lock().await;
        state.record(format!("create_topic {}", topic))?;
        if state.topics.contains_key(topic.as_str()) {
            return Err(PubSubError::AlreadyExists(format!("Topic {} already exists", topic)));
        }
        state.topics.insert(topic.as_str().to_owned(), vec![]);
        Ok(())
    }

    async fn delete_topic(&self, topic: &TopicPath) -> PubSubResult<()> {
        let mut state = self.state.lock().await;
        state.record(format!("delete_topic {}", topic))?;
        let Some(subscriptions) = state.topics.remove(topic.as_str()) else {
            return Err(PubSubError::NotFound(format!("Topic {} not found", topic)));
        };
        for subscription in subscriptions {
            if let Some(subscription) = state.subscriptions.get_mut(&subscription) {
                subscription.topic = None;
            }
        }
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &SubscriptionPath,
        topic: &TopicPath,
        ack_deadline: Option<Duration>,
    ) -> PubSubResult<()> {
        let mut state = self.state.lock().await;
        state.record(format!("create_subscription {} {}", subscription, topic))?;
        if let Some(ack_deadline) = ack_deadline {
            ack_deadline_seconds(ack_deadline)?;
        }
        if state.subscriptions.contains_key(subscription.as_str()) {
            return Err(PubSubError::AlreadyExists(format!(
                "Subscription {} already exists",
                subscription
            )));
        }
        let Some(subscriptions) = state.topics.get_mut(topic.as_str()) else {
            return Err(PubSubError::NotFound(format!("Topic {} not found", topic)));
        };
        subscriptions.push(subscription.as_str().to_owned());
        state.subscriptions.insert(
            subscription.as_str().to_owned(),
            SubscriptionState {
                topic: Some(topic.as_str().to_owned()),
                ack_deadline: ack_deadline.unwrap_or(DEFAULT_ACK_DEADLINE),
                pending: VecDeque::default(),
                outstanding: vec![],
            },
        );
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &SubscriptionPath) -> PubSubResult<()> {
        let mut state = self.state.lock().await;
        state.record(format!("delete_subscription {}", subscription))?;
        let Some(removed) = state.subscriptions.remove(subscription.as_str()) else {
            return Err(PubSubError::NotFound(format!("Subscription {} not found", subscription)));
        };
        if let Some(topic) = removed.topic {
            if let Some(subscriptions) = state.topics.get_mut(&topic) {
                subscriptions.retain(|s| s != subscription.as_str());
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &TopicPath,
        data: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> PubSubResult<String> {
        let mut state = self.state.lock().await;
        state.record(format!("publish {}", topic))?;
        let Some(subscriptions) = state.topics.get(topic.as_str()).cloned() else {
            return Err(PubSubError::NotFound(format!("Topic {} not found", topic)));
        };

        state.last_message_id += 1;
        let message = StoredMessage {
            message_id: state.last_message_id.to_string(),
            data,
            attributes,
            deliveries: 0,
        };
        for subscription in subscriptions {
            if let Some(subscription) = state.subscriptions.get_mut(&subscription) {
                subscription.pending.push_back(message.clone());
            }
        }
        state.published.entry(topic.as_str().to_owned()).or_default().push(message.data);
        Ok(message.message_id)
    }

    async fn pull(
        &self,
        subscription: &SubscriptionPath,
        max_messages: u16,
        timeout: Duration,
    ) -> PubSubResult<Vec<ReceivedMessage>> {
        let received = {
            let now = self.clock.now_utc();
            let mut state = self.state.lock().await;
            state.record(format!("pull {}", subscription))?;
            let mut last_ack_id = state.last_ack_id;

            let sub = state.subscription(subscription)?;
            sub.expire(now);

            let mut received = vec![];
            while received.len() < usize::from(max_messages) {
                let Some(mut message) = sub.pending.pop_front() else {
                    break;
                };
                message.deliveries += 1;
                last_ack_id += 1;
                let ack_id = format!("ack-{}", last_ack_id);
                received.push(ReceivedMessage {
                    ack_id: ack_id.clone(),
                    data: message.data.clone(),
                    message_id: message.message_id.clone(),
                    attributes: message.attributes.clone(),
                    delivery_attempt: Some(message.deliveries),
                });
                let deadline = now + sub.ack_deadline;
                sub.outstanding.push(Outstanding { ack_id, deadline, message });
            }

            state.last_ack_id = last_ack_id;
            received
        };

        if received.is_empty() {
            tokio::time::sleep(timeout.min(EMPTY_PULL_DELAY)).await;
        }
        Ok(received)
    }

    async fn acknowledge(
        &self,
        subscription: &SubscriptionPath,
        ack_ids: &[String],
    ) -> PubSubResult<()> {
        let mut state = self.state.lock().await;
        state.record(format!("acknowledge {} {}", subscription, ack_ids.join(",")))?;
        let sub = state.subscription(subscription)?;
        sub.outstanding.retain(|o| !ack_ids.contains(&o.ack_id));
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &SubscriptionPath,
        ack_ids: &[String],
        seconds: u32,
    ) -> PubSubResult<()> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;
        state.record(format!(
            "modify_ack_deadline {} {} {}",
            subscription,
            ack_ids.join(","),
            seconds
        ))?;
        let sub = state.subscription(subscription)?;
        for outstanding in sub.outstanding.iter_mut() {
            if ack_ids.contains(&outstanding.ack_id) {
                outstanding.deadline = now + Duration::from_secs(u64::from(seconds));
            }
        }
        if seconds == 0 {
            sub.expire(now);
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.calls.push("close".to_owned());
    }
}
