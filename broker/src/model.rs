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

//! Generic data types for the broker.
//!
//! Messages are the unit of transport.  Their JSON encoding follows the Dramatiq envelope so that
//! producers and workers written against Dramatiq can share the same Pub/Sub topics with this
//! crate: a message carries the queue and actor it is destined to, positional and keyword
//! arguments, free-form options, a unique identifier and the creation timestamp.
//!
//! Message execution is decoupled from message representation.  The broker only cares about the
//! ability to serialize and deserialize messages, and it must be possible for producers to
//! enqueue messages without knowing how to execute them.

use gcps_core::clocks::unix_millis;
use gcps_core::model::{ModelError, ModelResult};
use serde::de::Visitor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::ops::Deref;
use time::OffsetDateTime;
use uuid::Uuid;

/// Maximum length of queue and actor names.
///
/// Queue names end up embedded in Pub/Sub topic and subscription identifiers, which are limited
/// to 255 characters, and we need room for the topic prefix and the subscription suffix.
pub(crate) const MAX_NAME_LENGTH: usize = 200;

/// Name of the message option that counts how many times a message has been retried.
const RETRIES_OPTION: &str = "retries";

/// Validates that `s` is a valid queue or actor name, using `what` to describe the entity in
/// error messages.
fn validate_name(what: &str, s: &str) -> ModelResult<()> {
    if s.is_empty() {
        return Err(ModelError(format!("{} cannot be empty", what)));
    }
    if s.len() > MAX_NAME_LENGTH {
        return Err(ModelError(format!("{} '{}' is too long", what, s)));
    }

    let mut chars = s.chars();
    if let Some(first) = chars.next() {
        if !(first.is_ascii_alphabetic() || first == '_') {
            return Err(ModelError(format!(
                "{} '{}' must start with a letter or an underscore",
                what, s
            )));
        }
    }
    for ch in chars {
        if !(ch.is_ascii_alphanumeric() || "._-".contains(ch)) {
            return Err(ModelError(format!("Unsupported character '{}' in {} '{}'", ch, what, s)));
        }
    }

    Ok(())
}

/// Generates a validated string newtype along with its `serde` glue.
macro_rules! validated_name [
    ( $name:ident, $visitor:ident, $what:literal ) => {
        #[doc = concat!("Represents a correctly-formatted ", $what, ".")]
        #[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Creates a new ", $what, " from an untrusted string `s`.")]
            pub fn new<S: Into<String>>(s: S) -> ModelResult<Self> {
                let s = s.into();
                validate_name($what, &s)?;
                Ok(Self(s))
            }

            #[doc = concat!("Returns a string view of the ", $what, ".")]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        #[cfg(any(test, feature = "testutils"))]
        impl From<&'static str> for $name {
            /// Creates a new name from a hardcoded string, which must be valid.
            fn from(name: &'static str) -> Self {
                $name::new(name).expect("Hardcoded names must be valid")
            }
        }

        #[doc = concat!("A deserialization visitor for a `", stringify!($name), "`.")]
        struct $visitor;

        impl Visitor<'_> for $visitor {
            type Value = $name;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(concat!("a ", $what))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                $name::new(v).map_err(|e| E::custom(e.to_string()))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                $name::new(v).map_err(|e| E::custom(e.to_string()))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                deserializer.deserialize_string($visitor)
            }
        }
    }
];

validated_name!(QueueName, QueueNameVisitor, "queue name");
validated_name!(ActorName, ActorNameVisitor, "actor name");

/// Error returned when a payload cannot be decoded into a `Message`.
#[derive(Debug, thiserror::Error)]
#[error("Cannot decode message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// A task message as it travels through the broker.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Message {
    /// Queue the message is routed to.
    queue_name: QueueName,

    /// Actor that knows how to process the message.
    actor_name: ActorName,

    /// Positional arguments for the actor.
    args: Vec<Value>,

    /// Keyword arguments for the actor.
    kwargs: Map<String, Value>,

    /// Free-form options attached by producers and middleware.
    options: Map<String, Value>,

    /// Unique identifier of the message.  Retries of a message keep the same identifier.
    message_id: Uuid,

    /// Creation time of the message in milliseconds since the Unix epoch.
    message_timestamp: i64,
}

impl Message {
    /// Creates a new message with a fresh identifier stamped at `now`.
    pub fn new(
        queue_name: QueueName,
        actor_name: ActorName,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: Map<String, Value>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            queue_name,
            actor_name,
            args,
            kwargs,
            options,
            message_id: Uuid::new_v4(),
            message_timestamp: unix_millis(now),
        }
    }

    /// Decodes a message from its wire representation.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Encodes the message into its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        match serde_json::to_vec(self) {
            Ok(data) => data,
            // All fields are strings, numbers or JSON values with string keys.
            Err(e) => unreachable!("Message serialization cannot fail: {}", e),
        }
    }

    /// Returns the queue this message is routed to.
    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    /// Returns the actor that processes this message.
    pub fn actor_name(&self) -> &ActorName {
        &self.actor_name
    }

    /// Returns the positional arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Returns the keyword arguments.
    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    /// Returns the message options.
    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    /// Returns the unique identifier of the message.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Returns the creation timestamp in milliseconds since the Unix epoch.
    pub fn message_timestamp(&self) -> i64 {
        self.message_timestamp
    }

    /// Returns how many times this message has been retried so far.
    pub fn retries(&self) -> u32 {
        self.options
            .get(RETRIES_OPTION)
            .and_then(Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    /// Returns a copy of this message to be enqueued again as a retry.
    ///
    /// The copy keeps the identifier and payload and has its retries counter incremented.
    pub fn for_retry(&self) -> Self {
        let mut copy = self.clone();
        let retries = Value::from(self.retries().saturating_add(1));
        copy.options.insert(RETRIES_OPTION.to_owned(), retries);
        copy
    }
}

/// A message obtained from a consumer, along with the details needed to settle it.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageProxy {
    /// The decoded message.
    message: Message,

    /// Opaque token handed out by the transport to acknowledge this delivery.
    receipt: String,

    /// Number of times the transport has attempted to deliver this message, if known.
    delivery_attempt: Option<u32>,
}

impl MessageProxy {
    /// Wraps a delivered `message` identified by `receipt`.
    pub(crate) fn new(message: Message, receipt: String, delivery_attempt: Option<u32>) -> Self {
        Self { message, receipt, delivery_attempt }
    }

    /// Returns the transport receipt for this delivery.
    pub fn receipt(&self) -> &str {
        &self.receipt
    }

    /// Returns the delivery attempt reported by the transport, if any.
    pub fn delivery_attempt(&self) -> Option<u32> {
        self.delivery_attempt
    }

    /// Returns the wrapped message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Consumes the proxy and returns the wrapped message.
    pub fn into_message(self) -> Message {
        self.message
    }
}

impl Deref for MessageProxy {
    type Target = Message;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

/// Error type returned by actor handlers.
#[derive(Debug)]
pub enum ExecError {
    /// Indicates that the message failed in a controlled manner and must not be retried.
    Failed(String),

    /// Indicates that the message failed and wants to be retried.
    Retry(String),
}

/// Result type returned by actor handlers.  The optional string summarizes the result for logs.
pub type ExecResult = Result<Option<String>, ExecError>;

/// Describes what happened to a message after a worker processed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The actor completed successfully.
    Done(Option<String>),

    /// The actor failed with the given reason and the message was dropped.
    Failed(String),

    /// The actor asked to be retried and a retry was enqueued.
    Retried(String),

    /// The actor asked to be retried but had exhausted its retries.
    Abandoned(String),

    /// The message was not processed and was handed back to the transport.
    Skipped(String),
}
