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

//! Hooks to observe the lifecycle of queues, actors and messages.

use crate::model::{ActorName, Message, MessageProxy, Outcome, QueueName};
use std::sync::Arc;
use std::time::Duration;

/// Observer of broker and worker events.
///
/// All hooks default to doing nothing so that implementations only need to override the ones
/// they care about.  Hooks cannot fail: any problems must be handled within the hook itself.
pub trait Middleware: Send + Sync {
    /// Called before `queue` is declared for the first time.
    fn before_declare_queue(&self, _queue: &QueueName) {}

    /// Called after `queue` has been declared for the first time.
    fn after_declare_queue(&self, _queue: &QueueName) {}

    /// Called before `actor` is registered.
    fn before_declare_actor(&self, _actor: &ActorName) {}

    /// Called after `actor` has been registered.
    fn after_declare_actor(&self, _actor: &ActorName) {}

    /// Called before `message` is published with an optional `delay`.
    fn before_enqueue(&self, _message: &Message, _delay: Option<Duration>) {}

    /// Called after `message` has been published with an optional `delay`.
    fn after_enqueue(&self, _message: &Message, _delay: Option<Duration>) {}

    /// Called right before a worker runs the actor for `message`.
    fn before_process_message(&self, _message: &MessageProxy) {}

    /// Called after a worker has decided the `outcome` of `message`.
    fn after_process_message(&self, _message: &MessageProxy, _outcome: &Outcome) {}

    /// Called before acknowledging `message`.
    fn before_ack(&self, _message: &MessageProxy) {}

    /// Called after `message` has been acknowledged.
    fn after_ack(&self, _message: &MessageProxy) {}

    /// Called before handing `message` back to the transport for redelivery.
    fn before_nack(&self, _message: &MessageProxy) {}

    /// Called after `message` has been handed back to the transport.
    fn after_nack(&self, _message: &MessageProxy) {}
}

/// Ordered collection of middleware.
#[derive(Clone, Default)]
pub struct Middlewares(Vec<Arc<dyn Middleware>>);

impl Middlewares {
    /// Appends `middleware` to the end of the stack.
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.0.push(middleware);
        self
    }

    /// Returns the number of middleware in the stack.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Invokes `f` on every middleware, in the order in which they were added.
    pub fn each<F: Fn(&dyn Middleware)>(&self, f: F) {
        for middleware in &self.0 {
            f(middleware.as_ref());
        }
    }
}

/// Test utilities.
#[cfg(any(test, feature = "testutils"))]
pub mod testutils {
    use super::*;
    use std::sync::Mutex;

    /// Middleware that records every hook invocation as a human-readable string.
    #[derive(Clone, Default)]
    pub struct RecorderMiddleware {
        /// Recorded events, in invocation order.
        events: Arc<Mutex<Vec<String>>>,
    }

    impl RecorderMiddleware {
        /// Records `event`.
        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        /// Returns a copy of the events recorded so far.
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        /// Returns the recorded events that start with `prefix`.
        pub fn events_with_prefix(&self, prefix: &str) -> Vec<String> {
            self.events().into_iter().filter(|e| e.starts_with(prefix)).collect()
        }
    }

    impl Middleware for RecorderMiddleware {
        fn before_declare_queue(&self, queue: &QueueName) {
            self.record(format!("before_declare_queue {}", queue));
        }

        fn after_declare_queue(&self, queue: &QueueName) {
            self.record(format!("after_declare_queue {}", queue));
        }

        fn before_declare_actor(&self, actor: &ActorName) {
            self.record(format!("before_declare_actor {}", actor));
        }

        fn after_declare_actor(&self, actor: &ActorName) {
            self.record(format!("after_declare_actor {}", actor));
        }

        fn before_enqueue(&self, message: &Message, delay: Option<Duration>) {
            self.record(format!("before_enqueue {} {:?}", message.actor_name(), delay));
        }

        fn after_enqueue(&self, message: &Message, delay: Option<Duration>) {
            self.record(format!("after_enqueue {} {:?}", message.actor_name(), delay));
        }

        fn before_process_message(&self, message: &MessageProxy) {
            self.record(format!("before_process_message {}", message.actor_name()));
        }

        fn after_process_message(&self, message: &MessageProxy, outcome: &Outcome) {
            self.record(format!("after_process_message {} {:?}", message.actor_name(), outcome));
        }

        fn before_ack(&self, message: &MessageProxy) {
            self.record(format!("before_ack {}", message.actor_name()));
        }

        fn after_ack(&self, message: &MessageProxy) {
            self.record(format!("after_ack {}", message.actor_name()));
        }

        fn before_nack(&self, message: &MessageProxy) {
            self.record(format!("before_nack {}", message.actor_name()));
        }

        fn after_nack(&self, message: &MessageProxy) {
            self.record(format!("after_nack {}", message.actor_name()));
        }
    }
}
