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

//! Consumer implementation on top of Pub/Sub pull subscriptions.

use crate::driver::{BrokerResult, Consumer};
use crate::model::{Message, MessageProxy};
use crate::pubsub::{PubSubClient, SubscriptionPath};
use async_trait::async_trait;
use log::{debug, error, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Maximum number of messages to fetch in a single pull.
const MAX_PREFETCH: u16 = 100;

/// Pull timeout to use when the caller does not specify one.
const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(30);

/// Computes the pull timeout for a consumer created with `timeout`.
///
/// Pub/Sub pulls have second granularity, so the timeout is truncated to whole seconds with a
/// minimum of one second.  A zero timeout means "use the default".
fn pull_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_PULL_TIMEOUT
    } else {
        Duration::from_secs(std::cmp::max(1, timeout.as_secs()))
    }
}

/// Consumer that pulls messages from the subscription backing a queue.
///
/// Messages are pulled in batches of up to `prefetch` and buffered locally until they are handed
/// out by `next`.  Buffered messages count against their ack deadline, so `close` hands them
/// back to the service for other consumers to pick up.
pub struct PubSubConsumer<C>
where
    C: PubSubClient + Send + Sync + 'static,
{
    /// Client to talk to the Pub/Sub service.
    client: Arc<C>,

    /// Subscription to pull from.
    subscription: SubscriptionPath,

    /// Maximum number of messages to fetch in a single pull.
    prefetch: u16,

    /// Maximum time to wait for messages in a single pull.
    pull_timeout: Duration,

    /// Messages pulled but not yet handed out by `next`.
    buffer: VecDeque<MessageProxy>,
}

impl<C> PubSubConsumer<C>
where
    C: PubSubClient + Send + Sync + 'static,
{
    /// Creates a new consumer that pulls from `subscription` via `client`.
    ///
    /// `prefetch` is clamped to the range supported by the broker.
    pub(crate) fn new(
        client: Arc<C>,
        subscription: SubscriptionPath,
        prefetch: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            subscription,
            prefetch: prefetch.clamp(1, MAX_PREFETCH),
            pull_timeout: pull_timeout(timeout),
            buffer: VecDeque::default(),
        }
    }

    /// Changes the ack deadline of `ack_ids` to zero so that the service redelivers them.
    async fn release(&self, ack_ids: &[String]) -> BrokerResult<()> {
        self.client.modify_ack_deadline(&self.subscription, ack_ids, 0).await?;
        Ok(())
    }
}

#[async_trait]
impl<C> Consumer for PubSubConsumer<C>
where
    C: PubSubClient + Send + Sync + 'static,
{
    async fn next(&mut self) -> Option<MessageProxy> {
        if let Some(message) = self.buffer.pop_front() {
            return Some(message);
        }

        let received = match self
            .client
            .pull(&self.subscription, self.prefetch, self.pull_timeout)
            .await
        {
            Ok(received) => received,
            Err(e) => {
                error!("Pull from {} failed: {}", self.subscription, e);
                return None;
            }
        };

        for delivery in received {
            match Message::decode(&delivery.data) {
                Ok(message) => self.buffer.push_back(MessageProxy::new(
                    message,
                    delivery.ack_id,
                    delivery.delivery_attempt,
                )),
                Err(e) => {
                    // Leave the message unacknowledged: it will be redelivered once its ack
                    // deadline expires, which gives a chance to consumers that understand it.
                    warn!(
                        "Skipping message {} from {}: {}",
                        delivery.message_id, self.subscription, e
                    );
                }
            }
        }

        self.buffer.pop_front()
    }

    async fn ack(&mut self, message: &MessageProxy) -> BrokerResult<()> {
        self.client.acknowledge(&self.subscription, &[message.receipt().to_owned()]).await?;
        Ok(())
    }

    async fn nack(&mut self, message: &MessageProxy) -> BrokerResult<()> {
        self.release(&[message.receipt().to_owned()]).await
    }

    async fn requeue(&mut self, messages: &[MessageProxy]) -> BrokerResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let ack_ids = messages.iter().map(|m| m.receipt().to_owned()).collect::<Vec<String>>();
        self.release(&ack_ids).await
    }

    async fn close(&mut self) {
        let pending = self.buffer.drain(..).collect::<Vec<MessageProxy>>();
        if pending.is_empty() {
            return;
        }

        debug!("Requeueing {} buffered messages from {}", pending.len(), self.subscription);
        if let Err(e) = self.requeue(&pending).await {
            // The messages will be redelivered anyway once their ack deadline expires.
            warn!("Failed to requeue buffered messages from {}: {}", self.subscription, e);
        }
    }
}
