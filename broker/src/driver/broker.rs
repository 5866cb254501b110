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

//! Broker implementation on top of Pub/Sub.

use crate::driver::{Actor, Broker, BrokerError, BrokerResult, Consumer, PubSubConsumer};
use crate::middleware::Middlewares;
use crate::model::{ActorName, Message, QueueName};
use crate::pubsub::{
    PubSubClient, PubSubError, PubSubOptions, RestPubSubClient, SubscriptionPath, TopicPath,
    subscription_id, topic_id,
};
use async_trait::async_trait;
use futures::lock::Mutex;
use gcps_core::clocks::Clock;
use log::{debug, info};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Broker that maps every queue to a Pub/Sub topic with one pull subscription.
///
/// Queues must be declared before messages can be enqueued to or consumed from them.  Declaring
/// a queue creates its topic and subscription if they do not exist yet, so multiple processes
/// can declare the same queues concurrently.
pub struct PubSubBroker<C>
where
    C: PubSubClient + Send + Sync + 'static,
{
    /// Client to talk to the Pub/Sub service.
    client: Arc<C>,

    /// Project that owns all topics and subscriptions.
    project_id: String,

    /// Prefix for the topic and subscription identifiers.
    topic_prefix: String,

    /// Ack deadline for newly-created subscriptions, or `None` for the service default.
    ack_deadline: Option<Duration>,

    /// Clock used to stamp messages.
    clock: Arc<dyn Clock + Send + Sync>,

    /// Middleware notified of broker events.
    middleware: Middlewares,

    /// Declared queues and the subscription backing each of them.
    queues: Mutex<HashMap<QueueName, SubscriptionPath>>,

    /// Declared actors.
    actors: Mutex<HashMap<ActorName, Actor>>,
}

impl PubSubBroker<RestPubSubClient> {
    /// Creates a broker that talks to the service configured in `opts`.
    pub fn connect(
        opts: &PubSubOptions,
        clock: Arc<dyn Clock + Send + Sync>,
        middleware: Middlewares,
    ) -> BrokerResult<Self> {
        let client = RestPubSubClient::new(opts).map_err(BrokerError::InvalidInput)?;
        info!("Using Pub/Sub at {} for project {}", client.base_url(), opts.project_id);
        Ok(Self::new(client, opts, clock, middleware))
    }
}

impl<C> PubSubBroker<C>
where
    C: PubSubClient + Send + Sync + 'static,
{
    /// Creates a broker backed by `client` and configured by `opts`.
    pub fn new(
        client: C,
        opts: &PubSubOptions,
        clock: Arc<dyn Clock + Send + Sync>,
        middleware: Middlewares,
    ) -> Self {
        Self {
            client: Arc::from(client),
            project_id: opts.project_id.clone(),
            topic_prefix: opts.topic_prefix.clone(),
            ack_deadline: opts.ack_deadline,
            clock,
            middleware,
            queues: Mutex::default(),
            actors: Mutex::default(),
        }
    }

    /// Returns the path of the topic backing `queue`.
    pub fn topic_path(&self, queue: &QueueName) -> TopicPath {
        TopicPath::new(&self.project_id, &topic_id(&self.topic_prefix, queue))
    }

    /// Returns the path of the subscription backing `queue`.
    pub fn subscription_path(&self, queue: &QueueName) -> SubscriptionPath {
        SubscriptionPath::new(&self.project_id, &subscription_id(&self.topic_prefix, queue))
    }

    /// Returns the subscription backing `queue`, failing if the queue has not been declared.
    async fn require_queue(&self, queue: &QueueName) -> BrokerResult<SubscriptionPath> {
        let queues = self.queues.lock().await;
        match queues.get(queue) {
            Some(subscription) => Ok(subscription.clone()),
            None => Err(BrokerError::QueueNotFound(queue.clone())),
        }
    }

    /// Creates the topic and subscription for `queue`, tolerating their prior existence.
    async fn create_queue_resources(
        &self,
        topic: &TopicPath,
        subscription: &SubscriptionPath,
    ) -> BrokerResult<()> {
        match self.client.create_topic(topic).await {
            Ok(()) => debug!("Created topic {}", topic),
            Err(PubSubError::AlreadyExists(_)) => debug!("Topic {} already exists", topic),
            Err(e) => return Err(e.into()),
        }

        match self.client.create_subscription(subscription, topic, self.ack_deadline).await {
            Ok(()) => debug!("Created subscription {}", subscription),
            Err(PubSubError::AlreadyExists(_)) => {
                debug!("Subscription {} already exists", subscription)
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }
}

#[async_trait]
impl<C> Broker for PubSubBroker<C>
where
    C: PubSubClient + Send + Sync + 'static,
{
    fn clock(&self) -> Arc<dyn Clock + Send + Sync> {
        self.clock.clone()
    }

    fn middleware(&self) -> &Middlewares {
        &self.middleware
    }

    async fn declare_queue(&self, queue: &QueueName) -> BrokerResult<()> {
        // Hold the lock while creating the resources so that concurrent declarations of the
        // same queue only talk to the service once.
        let mut queues = self.queues.lock().await;
        if queues.contains_key(queue) {
            return Ok(());
        }

        self.middleware.each(|m| m.before_declare_queue(queue));
        let topic = self.topic_path(queue);
        let subscription = self.subscription_path(queue);
        self.create_queue_resources(&topic, &subscription).await?;
        queues.insert(queue.clone(), subscription);
        drop(queues);
        self.middleware.each(|m| m.after_declare_queue(queue));

        Ok(())
    }

    async fn declare_actor(&self, actor: Actor) -> BrokerResult<()> {
        let name = actor.name().clone();
        self.middleware.each(|m| m.before_declare_actor(&name));
        self.declare_queue(actor.queue()).await?;
        {
            let mut actors = self.actors.lock().await;
            actors.insert(name.clone(), actor);
        }
        self.middleware.each(|m| m.after_declare_actor(&name));
        Ok(())
    }

    async fn get_actor(&self, name: &ActorName) -> BrokerResult<Actor> {
        let actors = self.actors.lock().await;
        actors.get(name).cloned().ok_or_else(|| BrokerError::ActorNotFound(name.clone()))
    }

    async fn enqueue(&self, message: Message, delay: Option<Duration>) -> BrokerResult<Message> {
        if delay.is_some_and(|d| !d.is_zero()) {
            return Err(BrokerError::NotImplemented(
                "Delayed messages (eta) are not yet supported".to_owned(),
            ));
        }

        let queue = message.queue_name();
        self.require_queue(queue).await?;

        let topic = self.topic_path(queue);
        self.middleware.each(|m| m.before_enqueue(&message, delay));
        let id = self.client.publish(&topic, message.encode(), HashMap::default()).await?;
        debug!("Enqueued message {} to {} as {}", message.message_id(), queue, id);
        self.middleware.each(|m| m.after_enqueue(&message, delay));

        Ok(message)
    }

    async fn consume(
        &self,
        queue: &QueueName,
        prefetch: u16,
        timeout: Duration,
    ) -> BrokerResult<Box<dyn Consumer>> {
        let subscription = self.require_queue(queue).await?;
        Ok(Box::new(PubSubConsumer::new(self.client.clone(), subscription, prefetch, timeout)))
    }

    async fn enqueue_batch(&self, messages: Vec<Message>) -> BrokerResult<Vec<Message>> {
        for message in &messages {
            self.require_queue(message.queue_name()).await?;
        }
        Err(BrokerError::NotImplemented("Batch publishing is not yet supported".to_owned()))
    }

    async fn dead_letters(&self, queue: &QueueName) -> BrokerResult<Vec<Message>> {
        self.require_queue(queue).await?;
        Err(BrokerError::NotImplemented("Dead-letter topics are not yet supported".to_owned()))
    }

    async fn flush(&self, queue: &QueueName) -> BrokerResult<()> {
        Err(BrokerError::NotImplemented(format!("Cannot flush queue {}", queue)))
    }

    async fn join(&self, queue: &QueueName, _timeout: Duration) -> BrokerResult<()> {
        Err(BrokerError::NotImplemented(format!("Cannot join queue {}", queue)))
    }

    async fn get_declared_queues(&self) -> BTreeSet<QueueName> {
        let queues = self.queues.lock().await;
        queues.keys().cloned().collect()
    }

    async fn get_declared_actors(&self) -> BTreeSet<ActorName> {
        let actors = self.actors.lock().await;
        actors.keys().cloned().collect()
    }

    async fn close(&self) {
        self.client.close().await;
    }
}
