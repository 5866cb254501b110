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

//! Background tasks to consume messages from queues and run their actors.

use crate::driver::{Broker, BrokerError, BrokerResult, Consumer};
use crate::model::{ExecError, MessageProxy, Outcome, QueueName};
use futures::channel::oneshot;
use futures::future::{self, join_all, Either, FutureExt, Shared};
use gcps_core::env::get_optional_var;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default number of consumer loops per queue.
const DEFAULT_THREADS: usize = 1;

/// Default number of messages to fetch at once.
const DEFAULT_PREFETCH: u16 = 1;

/// Default maximum time to wait for messages in a single fetch.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum number of retries for a message whose actor asks to be retried.
const DEFAULT_MAX_RETRIES: u32 = 20;

/// Time to pause a consumer loop after a fetch that returned nothing or after a message that had
/// to be handed back, so that transport failures and unknown actors do not turn into busy loops.
const IDLE_DELAY: Duration = Duration::from_millis(100);

/// Configuration options for the worker.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerOptions {
    /// Queues to consume from.  If empty, consumes from all queues declared in the broker at the
    /// time the worker starts.
    pub queues: Vec<QueueName>,

    /// Number of concurrent consumer loops per queue.
    pub threads: usize,

    /// Number of messages each consumer fetches at once.
    pub prefetch: u16,

    /// Maximum time each consumer waits for messages in a single fetch.
    pub timeout: Duration,

    /// Maximum number of retries for messages whose actor does not specify its own limit.
    pub max_retries: u32,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            queues: vec![],
            threads: DEFAULT_THREADS,
            prefetch: DEFAULT_PREFETCH,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl WorkerOptions {
    /// Creates a new set of options from environment variables.
    pub fn from_env(prefix: &str) -> Result<Self, String> {
        let queues = match get_optional_var::<String>(prefix, "QUEUES")? {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    QueueName::new(s)
                        .map_err(|e| format!("Invalid queue in {}_QUEUES: {}", prefix, e))
                })
                .collect::<Result<Vec<QueueName>, String>>()?,
            None => vec![],
        };

        Ok(Self {
            queues,
            threads: get_optional_var::<usize>(prefix, "THREADS")?.unwrap_or(DEFAULT_THREADS),
            prefetch: get_optional_var::<u16>(prefix, "PREFETCH")?.unwrap_or(DEFAULT_PREFETCH),
            timeout: get_optional_var::<Duration>(prefix, "TIMEOUT")?.unwrap_or(DEFAULT_TIMEOUT),
            max_retries: get_optional_var::<u32>(prefix, "MAX_RETRIES")?
                .unwrap_or(DEFAULT_MAX_RETRIES),
        })
    }
}

/// Acknowledges `message` via `consumer`, notifying the broker's middleware.
async fn ack(broker: &dyn Broker, consumer: &mut dyn Consumer, message: &MessageProxy) {
    broker.middleware().each(|m| m.before_ack(message));
    match consumer.ack(message).await {
        Ok(()) => broker.middleware().each(|m| m.after_ack(message)),
        Err(e) => warn!("Message {}: failed to ack: {}", message.message_id(), e),
    }
}

/// Hands `message` back to the transport via `consumer`, notifying the broker's middleware.
async fn nack(broker: &dyn Broker, consumer: &mut dyn Consumer, message: &MessageProxy) {
    broker.middleware().each(|m| m.before_nack(message));
    match consumer.nack(message).await {
        Ok(()) => broker.middleware().each(|m| m.after_nack(message)),
        Err(e) => warn!("Message {}: failed to nack: {}", message.message_id(), e),
    }
}

/// Runs the actor for `message` and settles the message according to the result.
///
/// Messages that ask to be retried are enqueued again as new messages with an increased retries
/// counter, up to `default_max_retries` or the actor's own limit.  Messages that cannot be
/// processed here (because their actor is unknown or because their retry could not be enqueued)
/// are handed back to the transport so that they are redelivered.
///
/// This never fails: problems settling the message are logged and the transport will redeliver
/// the message once its ack deadline expires.
pub(super) async fn process_message(
    broker: &dyn Broker,
    consumer: &mut dyn Consumer,
    message: MessageProxy,
    default_max_retries: u32,
) -> Outcome {
    let id = message.message_id();

    let actor = match broker.get_actor(message.actor_name()).await {
        Ok(actor) => actor,
        Err(e) => {
            warn!("Message {}: {}; handing it back", id, e);
            let outcome = Outcome::Skipped(e.to_string());
            broker.middleware().each(|m| m.after_process_message(&message, &outcome));
            nack(broker, consumer, &message).await;
            return outcome;
        }
    };

    broker.middleware().each(|m| m.before_process_message(&message));
    info!("Message {}: running {}", id, actor.name());
    let result = match tokio::spawn(actor.run(message.message().clone())).await {
        Ok(result) => result,
        Err(e) => Err(ExecError::Failed(format!("Actor crashed: {}", e))),
    };

    let outcome = match result {
        Ok(summary) => Outcome::Done(summary),

        Err(ExecError::Failed(reason)) => Outcome::Failed(reason),

        Err(ExecError::Retry(reason)) => {
            let max_retries = actor.max_retries().unwrap_or(default_max_retries);
            if message.retries() < max_retries {
                match broker.enqueue(message.for_retry(), None).await {
                    Ok(_) => Outcome::Retried(reason),
                    Err(e) => Outcome::Skipped(format!("Cannot enqueue retry: {}", e)),
                }
            } else {
                Outcome::Abandoned(format!(
                    "{} (retried {} times, max_retries is {})",
                    reason,
                    message.retries(),
                    max_retries
                ))
            }
        }
    };
    info!("Message {}: finished with {:?}", id, outcome);
    broker.middleware().each(|m| m.after_process_message(&message, &outcome));

    match outcome {
        Outcome::Skipped(_) => nack(broker, consumer, &message).await,
        _ => ack(broker, consumer, &message).await,
    }

    outcome
}

/// Future that completes when the worker is asked to stop.
type StopSignal = Shared<oneshot::Receiver<()>>;

/// Returns true if `stop` has fired.  A dropped sender counts as a stop request.
fn is_stopped(stop: &StopSignal) -> bool {
    stop.clone().now_or_never().is_some()
}

/// Pauses for `IDLE_DELAY` unless `stop` fires first.  Returns true if the loop must stop.
async fn idle(stop: &StopSignal) -> bool {
    match future::select(stop.clone(), tokio::time::sleep(IDLE_DELAY).boxed()).await {
        Either::Left(_) => true,
        Either::Right(_) => false,
    }
}

/// Fetches messages from `consumer` and processes them until `stop` fires.
///
/// Fetches are never interrupted: a fetch in flight when `stop` fires completes, bounded by the
/// consumer's timeout, so that the messages it leased can be handed back.
async fn consume_loop(
    broker: Arc<dyn Broker>,
    mut consumer: Box<dyn Consumer>,
    queue: QueueName,
    max_retries: u32,
    stop: StopSignal,
) {
    debug!("Consumer for {} starting", queue);
    while !is_stopped(&stop) {
        let message = match consumer.next().await {
            Some(message) => message,
            None => {
                if idle(&stop).await {
                    break;
                }
                continue;
            }
        };

        if is_stopped(&stop) {
            if let Err(e) = consumer.requeue(std::slice::from_ref(&message)).await {
                warn!("Message {}: failed to requeue on stop: {}", message.message_id(), e);
            }
            break;
        }

        let outcome =
            process_message(broker.as_ref(), consumer.as_mut(), message, max_retries).await;
        // Skipped messages go straight back to the subscription and would be fetched again
        // right away.
        if matches!(outcome, Outcome::Skipped(_)) && idle(&stop).await {
            break;
        }
    }
    consumer.close().await;
    debug!("Consumer for {} stopped", queue);
}

/// A running worker.
///
/// The worker runs a set of consumer loops in the background, each of which fetches messages from
/// one queue and runs them through their actors.  Dropping the worker without calling `stop`
/// also stops the loops, but does not wait for them to finish.
pub struct Worker {
    /// Sender to signal the consumer loops to stop.
    stop_tx: oneshot::Sender<()>,

    /// Handles of the background consumer loops.
    loops: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Starts a worker that consumes from `broker` according to `opts`.
    ///
    /// All queues must already be declared in `broker`.
    pub async fn start(broker: Arc<dyn Broker>, opts: WorkerOptions) -> BrokerResult<Self> {
        let queues = if opts.queues.is_empty() {
            broker.get_declared_queues().await.into_iter().collect::<Vec<QueueName>>()
        } else {
            opts.queues.clone()
        };
        if queues.is_empty() {
            return Err(BrokerError::InvalidInput("No queues to consume from".to_owned()));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let stop_rx = stop_rx.shared();
        let threads = std::cmp::max(1, opts.threads);
        let mut loops = Vec::with_capacity(queues.len() * threads);
        for queue in &queues {
            for _ in 0..threads {
                // If this fails, returning drops `stop_tx`, which also stops any loops we have
                // already spawned.
                let consumer = broker.consume(queue, opts.prefetch, opts.timeout).await?;
                loops.push(tokio::spawn(consume_loop(
                    broker.clone(),
                    consumer,
                    queue.clone(),
                    opts.max_retries,
                    stop_rx.clone(),
                )));
            }
        }

        info!(
            "Worker started with {} consumers on queues {}",
            loops.len(),
            queues.iter().map(QueueName::as_str).collect::<Vec<&str>>().join(", ")
        );
        Ok(Self { stop_tx, loops })
    }

    /// Stops all consumer loops and waits for them to finish.
    ///
    /// Messages that were being processed finish processing, and fetches in flight complete.
    /// Messages that were fetched but not yet processed are handed back to the transport.
    pub async fn stop(self) {
        if self.stop_tx.send(()).is_err() {
            debug!("All consumer loops were already gone");
        }
        for result in join_all(self.loops).await {
            if let Err(e) = result {
                warn!("Consumer loop terminated abnormally: {}", e);
            }
        }
        info!("Worker stopped");
    }
}
