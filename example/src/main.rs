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

//! Entry point to the sample worker and producer.
//!
//! Run `gcps-example --help` for usage details.
//!
//! The broker is configured via `PUBSUB_*` environment variables (see `PubSubOptions`) and the
//! worker via `WORKER_*` variables (see `WorkerOptions`).

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use clap::{Parser, Subcommand};
use gcps_broker::driver::{Broker, PubSubBroker, Worker, WorkerOptions};
use gcps_broker::middleware::Middlewares;
use gcps_broker::pubsub::PubSubOptions;
use gcps_core::clocks::SystemClock;
use gcps_example::declare_actors;
use log::info;
use serde_json::json;
use std::process;
use std::sync::Arc;

/// Command-line interface of the sample.
#[derive(Debug, Parser)]
#[command(name = "gcps-example", about = "Sample worker and producer for GCPS", long_about = None)]
struct Cli {
    /// The command to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Debug, PartialEq, Subcommand)]
enum Command {
    /// Runs a worker until interrupted with Ctrl-C.
    Worker,

    /// Sends a message to add X and Y.
    #[command(allow_negative_numbers = true)]
    Send {
        /// First operand.
        x: i64,

        /// Second operand.
        y: i64,
    },
}

/// Runs a worker for the sample actors until Ctrl-C is received.
async fn run_worker(broker: Arc<dyn Broker>) -> Result<(), String> {
    let opts = WorkerOptions::from_env("WORKER")?;
    let worker = Worker::start(broker, opts).await.map_err(|e| e.to_string())?;

    tokio::signal::ctrl_c().await.map_err(|e| format!("Cannot wait for Ctrl-C: {}", e))?;
    info!("Interrupted; stopping worker");
    worker.stop().await;
    Ok(())
}

/// Executes `command` and returns an error message on failure.
async fn run(command: Command) -> Result<(), String> {
    let opts = PubSubOptions::from_env("PUBSUB")?;
    let broker = Arc::new(
        PubSubBroker::connect(&opts, Arc::new(SystemClock::default()), Middlewares::default())
            .map_err(|e| e.to_string())?,
    );
    let actor = declare_actors(broker.as_ref()).await.map_err(|e| e.to_string())?;

    let result = match command {
        Command::Worker => run_worker(broker.clone()).await,
        Command::Send { x, y } => {
            let args = vec![json!(x), json!(y)];
            match actor.send(broker.as_ref(), args).await {
                Ok(message) => {
                    println!("Sent message {}", message.message_id());
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            }
        }
    };

    broker.close().await;
    result
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        eprintln!("gcps-example: {}", e);
        process::exit(1);
    }
}
