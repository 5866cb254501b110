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

//! Task queue broker backed by Google Cloud Pub/Sub.
//!
//! This crate lets a Dramatiq-style task framework use Pub/Sub as its message transport.  Every
//! queue maps to a Pub/Sub topic with a single pull subscription, messages are JSON envelopes
//! compatible with Dramatiq's encoding, and delivery guarantees come from Pub/Sub's ack
//! deadlines: a message that is not acknowledged in time is delivered again.
//!
//! The entry point is `driver::PubSubBroker`, which implements the `driver::Broker` contract on
//! top of any `pubsub::PubSubClient`.  `pubsub::RestPubSubClient` talks to the real service or to
//! the Pub/Sub emulator.  `driver::Worker` runs actors for the messages consumed from a broker.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

pub mod driver;
pub mod middleware;
pub mod model;
pub mod pubsub;
