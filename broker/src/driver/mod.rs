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

//! The broker contract and its Pub/Sub implementation.
//!
//! A `Broker` owns the set of declared queues and actors and moves messages between producers and
//! workers.  Producers call `enqueue` (usually via `Actor::send`) and workers obtain a `Consumer`
//! per queue with `consume`, which hands out messages that must later be settled with `ack`,
//! `nack` or `requeue`.
//!
//! `PubSubBroker` maps every queue to a Pub/Sub topic with a single pull subscription and relies
//! on ack deadlines to provide at-least-once delivery: a message that is not acknowledged in time
//! is redelivered by the service.

use crate::middleware::Middlewares;
use crate::model::{ActorName, ExecResult, Message, MessageProxy, QueueName};
use crate::pubsub::PubSubError;
use async_trait::async_trait;
use derivative::Derivative;
use futures::Future;
use futures::future::{BoxFuture, FutureExt};
use gcps_core::clocks::Clock;
use gcps_core::model::ModelError;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

mod broker;
pub use broker::PubSubBroker;

mod consumer;
pub use consumer::PubSubConsumer;

mod worker;
pub use worker::{Worker, WorkerOptions};

/// Broker errors.  These errors encompass backend and logical errors.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum BrokerError {
    /// Indicates that a message refers to an actor that has not been declared.
    #[error("Actor {0} not found")]
    ActorNotFound(ActorName),

    /// Catch-all error type for unexpected transport errors.
    #[error("{0}")]
    BackendError(String),

    /// Indicates an error in the input data.
    #[error("{0}")]
    InvalidInput(String),

    /// Indicates that the requested feature is not supported by this broker.
    #[error("{0}")]
    NotImplemented(String),

    /// Indicates that an operation refers to a queue that has not been declared.
    #[error("Queue {0} not found")]
    QueueNotFound(QueueName),
}

impl From<PubSubError> for BrokerError {
    fn from(e: PubSubError) -> Self {
        match e {
            PubSubError::InvalidInput(_) => BrokerError::InvalidInput(e.to_string()),
            PubSubError::AlreadyExists(_)
            | PubSubError::BackendError(_)
            | PubSubError::NotFound(_)
            | PubSubError::PermissionDenied(_) => BrokerError::BackendError(e.to_string()),
        }
    }
}

impl From<ModelError> for BrokerError {
    fn from(e: ModelError) -> Self {
        BrokerError::InvalidInput(e.to_string())
    }
}

/// Result type for this module.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Type-erased function that runs an actor on a message.
type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, ExecResult> + Send + Sync>;

/// A unit of deferred work: a named handler bound to a queue.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Actor {
    /// Name of the actor, which messages use to refer to it.
    name: ActorName,

    /// Queue where messages for this actor are sent.
    queue: QueueName,

    /// Function that processes messages for this actor.
    #[derivative(Debug = "ignore")]
    handler: Handler,

    /// Maximum number of retries for this actor, overriding the worker's default.
    max_retries: Option<u32>,
}

impl Actor {
    /// Creates a new actor `name` that receives messages from `queue` and runs them via
    /// `handler`.
    pub fn new<F, Fut>(name: ActorName, queue: QueueName, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |message| handler(message).boxed());
        Self { name, queue, handler, max_retries: None }
    }

    /// Overrides the maximum number of retries for messages of this actor.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Returns the name of the actor.
    pub fn name(&self) -> &ActorName {
        &self.name
    }

    /// Returns the queue of the actor.
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Returns the per-actor retries limit, if any.
    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Builds a message for this actor with the given arguments, stamped at `now`.
    pub fn message(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        now: OffsetDateTime,
    ) -> Message {
        Message::new(self.queue.clone(), self.name.clone(), args, kwargs, Map::default(), now)
    }

    /// Builds a message for this actor with positional `args` and enqueues it via `broker`.
    pub async fn send<B: Broker + ?Sized>(
        &self,
        broker: &B,
        args: Vec<Value>,
    ) -> BrokerResult<Message> {
        let message = self.message(args, Map::default(), broker.clock().now_utc());
        broker.enqueue(message, None).await
    }

    /// Runs the actor's handler on `message`.
    pub(crate) fn run(&self, message: Message) -> BoxFuture<'static, ExecResult> {
        (self.handler)(message)
    }
}

/// Source of messages for a single queue.
///
/// Messages returned by `next` must be settled with exactly one of `ack`, `nack` or `requeue`.
/// Unsettled messages are eventually redelivered by the transport.
#[async_trait]
pub trait Consumer: Send {
    /// Returns the next message, or `None` if none became available within the consumer's
    /// timeout or if the transport failed.
    async fn next(&mut self) -> Option<MessageProxy>;

    /// Marks `message` as processed so that it is never delivered again.
    async fn ack(&mut self, message: &MessageProxy) -> BrokerResult<()>;

    /// Hands `message` back to the transport for immediate redelivery.
    async fn nack(&mut self, message: &MessageProxy) -> BrokerResult<()>;

    /// Hands all `messages` back to the transport for immediate redelivery.
    async fn requeue(&mut self, messages: &[MessageProxy]) -> BrokerResult<()>;

    /// Stops consuming, handing back any messages that were fetched but not yet returned.
    async fn close(&mut self);
}

/// Transport for messages between producers and workers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Returns the clock used to stamp messages.
    fn clock(&self) -> Arc<dyn Clock + Send + Sync>;

    /// Returns the middleware stack notified of broker events.
    fn middleware(&self) -> &Middlewares;

    /// Ensures `queue` exists in the transport.  Declaring an existing queue does nothing.
    async fn declare_queue(&self, queue: &QueueName) -> BrokerResult<()>;

    /// Registers `actor`, declaring its queue if necessary.
    async fn declare_actor(&self, actor: Actor) -> BrokerResult<()>;

    /// Looks up a previously-declared actor.
    async fn get_actor(&self, name: &ActorName) -> BrokerResult<Actor>;

    /// Sends `message` to its queue and returns it.  `delay` asks for delivery to be postponed.
    async fn enqueue(&self, message: Message, delay: Option<Duration>) -> BrokerResult<Message>;

    /// Sends all `messages` in a single request and returns them.
    async fn enqueue_batch(&self, messages: Vec<Message>) -> BrokerResult<Vec<Message>>;

    /// Obtains a consumer for `queue` that fetches up to `prefetch` messages at once and waits
    /// up to `timeout` for new messages.
    async fn consume(
        &self,
        queue: &QueueName,
        prefetch: u16,
        timeout: Duration,
    ) -> BrokerResult<Box<dyn Consumer>>;

    /// Returns the messages of `queue` that could not be delivered.
    async fn dead_letters(&self, queue: &QueueName) -> BrokerResult<Vec<Message>>;

    /// Drops all messages pending in `queue`.
    async fn flush(&self, queue: &QueueName) -> BrokerResult<()>;

    /// Waits until `queue` has no pending messages or until `timeout` expires.
    async fn join(&self, queue: &QueueName, timeout: Duration) -> BrokerResult<()>;

    /// Returns the names of all declared queues.
    async fn get_declared_queues(&self) -> BTreeSet<QueueName>;

    /// Returns the names of all declared actors.
    async fn get_declared_actors(&self) -> BTreeSet<ActorName>;

    /// Releases the transport.
    async fn close(&self);
}
