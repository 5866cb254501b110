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

//! Sample actors to exercise the Pub/Sub broker end to end.
//!
//! The `gcps-example` binary uses these to either run a worker or send messages.  Point it at the
//! Pub/Sub emulator with `PUBSUB_EMULATOR_HOST` and `PUBSUB_PROJECT_ID`.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use gcps_broker::driver::{Actor, Broker, BrokerResult};
use gcps_broker::model::{ActorName, ExecError, ExecResult, Message, QueueName};
use log::info;

/// Name of the queue where the sample actors live.
pub const QUEUE: &str = "default";

/// Name of the actor that adds two numbers.
pub const ADD: &str = "add";

/// Adds the two integer arguments of `message`.
pub async fn add(message: Message) -> ExecResult {
    let (x, y) = match message.args() {
        [x, y] => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(ExecError::Failed(format!("Non-integer arguments {} and {}", x, y))),
        },
        args => {
            return Err(ExecError::Failed(format!(
                "add takes 2 arguments but {} were given",
                args.len()
            )));
        }
    };

    let result = x.checked_add(y).ok_or_else(|| {
        ExecError::Failed(format!("add({}, {}) overflows", x, y))
    })?;
    info!("add({}, {}) = {}", x, y, result);
    Ok(Some(result.to_string()))
}

/// Declares the sample actors in `broker` and returns the `add` actor.
pub async fn declare_actors(broker: &dyn Broker) -> BrokerResult<Actor> {
    let queue = QueueName::new(QUEUE)?;
    let actor = Actor::new(ActorName::new(ADD)?, queue, add);
    broker.declare_actor(actor.clone()).await?;
    Ok(actor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcps_broker::driver::{PubSubBroker, Worker, WorkerOptions};
    use gcps_broker::middleware::Middlewares;
    use gcps_broker::middleware::testutils::RecorderMiddleware;
    use gcps_broker::pubsub::PubSubOptions;
    use gcps_broker::pubsub::testutils::InMemoryPubSub;
    use gcps_core::clocks::testutils::SettableClock;
    use serde_json::{json, Map};
    use std::sync::Arc;
    use std::time::Duration;
    use time::macros::datetime;

    /// Builds a message for `add` with `args`.
    fn add_message(args: Vec<serde_json::Value>) -> Message {
        Message::new(
            QueueName::from(QUEUE),
            ActorName::from(ADD),
            args,
            Map::default(),
            Map::default(),
            datetime!(2024-03-01 08:00:00 UTC),
        )
    }

    #[tokio::test]
    async fn test_add_ok() {
        let result = add(add_message(vec![json!(3), json!(7)])).await.unwrap();
        assert_eq!(Some("10".to_owned()), result);

        let result = add(add_message(vec![json!(-5), json!(1)])).await.unwrap();
        assert_eq!(Some("-4".to_owned()), result);
    }

    #[tokio::test]
    async fn test_add_errors() {
        for (args, expected) in [
            (vec![json!(1)], "add takes 2 arguments but 1 were given"),
            (vec![json!(1), json!("two")], "Non-integer arguments 1 and \"two\""),
            (vec![json!(i64::MAX), json!(1)], "add(9223372036854775807, 1) overflows"),
        ] {
            match add(add_message(args)).await {
                Err(ExecError::Failed(msg)) => assert_eq!(expected, msg),
                e => panic!("Unexpected result {:?}", e),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_and_process() {
        let clock = Arc::new(SettableClock::new(datetime!(2024-03-01 08:00:00 UTC)));
        let recorder = RecorderMiddleware::default();
        let broker = Arc::new(PubSubBroker::new(
            InMemoryPubSub::new(clock.clone()),
            &PubSubOptions::new("test-project"),
            clock,
            Middlewares::default().with(Arc::new(recorder.clone())),
        ));

        let actor = declare_actors(broker.as_ref()).await.unwrap();
        actor.send(broker.as_ref(), vec![json!(3), json!(7)]).await.unwrap();

        let worker = Worker::start(broker.clone(), WorkerOptions::default()).await.unwrap();
        for _ in 0..500 {
            if !recorder.events_with_prefix("after_ack").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.stop().await;

        assert_eq!(
            vec!["after_process_message add Done(Some(\"10\"))".to_owned()],
            recorder.events_with_prefix("after_process_message")
        );
    }
}
