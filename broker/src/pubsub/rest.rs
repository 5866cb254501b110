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

//! Pub/Sub client backed by the v1 REST API.

use crate::pubsub::{
    ack_deadline_seconds, DEFAULT_TOPIC_PREFIX, PubSubClient, PubSubError, PubSubResult,
    ReceivedMessage, SubscriptionPath, TopicPath,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, Bytes};
use derivative::Derivative;
use gcps_core::env::{get_optional_var, get_required_var};
use log::debug;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Endpoint of the production Pub/Sub service.
const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Converts a `reqwest::Error` to a `PubSubError`.
fn reqwest_error_to_pubsub_error(e: reqwest::Error) -> PubSubError {
    PubSubError::BackendError(format!("HTTP request failed: {}", e))
}

/// Converts a `reqwest::Response` to a `PubSubError`.  The response should have a non-OK status.
async fn http_response_to_pubsub_error(response: Response) -> PubSubError {
    let status = response.status();

    let message = match response.text().await {
        Ok(text) => format!("HTTP request returned status {} with text '{}'", status, text),
        Err(e) => {
            format!("HTTP request returned status {} and failed to get text due to {}", status, e)
        }
    };

    match status {
        StatusCode::BAD_REQUEST => PubSubError::InvalidInput(message),
        StatusCode::UNAUTHORIZED => PubSubError::PermissionDenied(message),
        StatusCode::FORBIDDEN => PubSubError::PermissionDenied(message),
        StatusCode::NOT_FOUND => PubSubError::NotFound(message),
        StatusCode::CONFLICT => PubSubError::AlreadyExists(message),
        _ => PubSubError::BackendError(message),
    }
}

/// Parses a JSON response body.
fn parse_json<T: DeserializeOwned>(bytes: Bytes) -> PubSubResult<T> {
    serde_json::from_reader(bytes.reader())
        .map_err(|e| PubSubError::BackendError(format!("Invalid response from Pub/Sub: {}", e)))
}

/// Deserializes a base64-encoded string into raw bytes.
fn deserialize_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    BASE64.decode(s).map_err(serde::de::Error::custom)
}

/// Request to create a topic.
#[derive(Serialize)]
struct CreateTopicRequest {}

/// Request to create a pull subscription.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriptionRequest<'a> {
    /// Path of the topic to attach the subscription to.
    topic: &'a str,

    /// Deadline to acknowledge pulled messages before they are redelivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    ack_deadline_seconds: Option<u32>,
}

/// A message to publish.
#[derive(Serialize)]
struct OutgoingMessage<'a> {
    /// Base64-encoded payload.
    data: String,

    /// Message attributes.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    attributes: &'a HashMap<String, String>,
}

/// Request to publish messages to a topic.
#[derive(Serialize)]
struct PublishRequest<'a> {
    /// Messages to publish.
    messages: Vec<OutgoingMessage<'a>>,
}

/// Response to a `PublishRequest`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    /// Identifiers of the published messages, in request order.
    message_ids: Vec<String>,
}

/// Request to pull messages from a subscription.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    /// Maximum number of messages to return.
    max_messages: u16,
}

/// A message as returned within a `PullResponse`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingMessage {
    /// Payload.  Absent if the message was published with attributes only.
    #[serde(default, deserialize_with = "deserialize_base64")]
    data: Vec<u8>,

    /// Identifier assigned at publish time.
    #[serde(default)]
    message_id: String,

    /// Message attributes.
    #[serde(default)]
    attributes: HashMap<String, String>,
}

/// A delivery as returned within a `PullResponse`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingDelivery {
    /// Token to settle this delivery.
    ack_id: String,

    /// The delivered message.
    message: IncomingMessage,

    /// Delivery attempt counter, if the subscription tracks it.
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

/// Response to a `PullRequest`.  The service omits the list when there are no messages.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    /// Pulled deliveries.
    #[serde(default)]
    received_messages: Vec<IncomingDelivery>,
}

/// Request to acknowledge deliveries.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    /// Tokens of the deliveries to acknowledge.
    ack_ids: &'a [String],
}

/// Request to modify the ack deadline of deliveries.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    /// Tokens of the deliveries to modify.
    ack_ids: &'a [String],

    /// New deadline, counted from now.
    ack_deadline_seconds: u32,
}

/// Options to configure access to Pub/Sub.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
#[cfg_attr(test, derivative(PartialEq))]
pub struct PubSubOptions {
    /// Project that holds the topics and subscriptions.
    pub project_id: String,

    /// Address (`host:port`) of a Pub/Sub emulator.  When set, requests go to the emulator over
    /// plain HTTP and without credentials.
    pub emulator_host: Option<String>,

    /// Base URL of the Pub/Sub API, for when talking to something other than the production
    /// service.  Ignored if `emulator_host` is set.
    pub endpoint: Option<String>,

    /// OAuth 2.0 access token to authenticate requests with.
    #[derivative(Debug = "ignore")]
    pub access_token: Option<String>,

    /// Prefix for the identifiers of the topics and subscriptions backing queues.
    pub topic_prefix: String,

    /// Ack deadline for newly-created subscriptions.  `None` uses the service default.
    pub ack_deadline: Option<Duration>,
}

impl PubSubOptions {
    /// Creates a set of options for `project_id` with defaults for everything else.
    pub fn new<S: Into<String>>(project_id: S) -> Self {
        Self {
            project_id: project_id.into(),
            emulator_host: None,
            endpoint: None,
            access_token: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_owned(),
            ack_deadline: None,
        }
    }

    /// Creates a set of options from environment variables whose name is prefixed with the given
    /// `prefix`.
    ///
    /// This will use variables such as `<prefix>_PROJECT_ID`, `<prefix>_EMULATOR_HOST`,
    /// `<prefix>_ENDPOINT`, `<prefix>_ACCESS_TOKEN`, `<prefix>_TOPIC_PREFIX` and
    /// `<prefix>_ACK_DEADLINE`.
    pub fn from_env(prefix: &str) -> Result<Self, String> {
        Ok(Self {
            project_id: get_required_var::<String>(prefix, "PROJECT_ID")?,
            emulator_host: get_optional_var::<String>(prefix, "EMULATOR_HOST")?,
            endpoint: get_optional_var::<String>(prefix, "ENDPOINT")?,
            access_token: get_optional_var::<String>(prefix, "ACCESS_TOKEN")?,
            topic_prefix: get_optional_var::<String>(prefix, "TOPIC_PREFIX")?
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_owned()),
            ack_deadline: match get_optional_var::<Duration>(prefix, "ACK_DEADLINE")? {
                Some(ack_deadline) => {
                    ack_deadline_seconds(ack_deadline)
                        .map_err(|e| format!("Invalid {}_ACK_DEADLINE: {}", prefix, e))?;
                    Some(ack_deadline)
                }
                None => None,
            },
        })
    }
}

/// Pub/Sub client that talks to the service's REST API.
#[derive(Clone)]
pub struct RestPubSubClient {
    /// Asynchronous HTTP client with which to issue the service requests.
    client: Client,

    /// Base URL of the API, always ending in a slash.
    base_url: Url,

    /// Token to authenticate requests with, if any.
    access_token: Option<String>,
}

impl RestPubSubClient {
    /// Creates a new client configured by `opts`.
    pub fn new(opts: &PubSubOptions) -> Result<Self, String> {
        let (base_url, access_token) = match opts.emulator_host.as_ref() {
            Some(host) if host.starts_with("http://") || host.starts_with("https://") => {
                (host.clone(), None)
            }
            Some(host) => (format!("http://{}", host), None),
            None => (
                opts.endpoint.clone().unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned()),
                opts.access_token.clone(),
            ),
        };

        let mut base_url = Url::parse(&base_url)
            .map_err(|e| format!("Invalid Pub/Sub endpoint {}: {}", base_url, e))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self { client: Client::default(), base_url, access_token })
    }

    /// Returns the base URL requests are sent to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Issues a `method` request against `resource`, optionally invoking a custom `verb` on it,
    /// and returns the raw response body.
    ///
    /// `timeout` overrides the client's default request timeout.
    async fn call<B: Serialize>(
        &self,
        method: Method,
        resource: &str,
        verb: Option<&str>,
        body: Option<&B>,
        timeout: Option<Duration>,
    ) -> Result<Bytes, CallError> {
        let url = match verb {
            Some(verb) => format!("{}v1/{}:{}", self.base_url, resource, verb),
            None => format!("{}v1/{}", self.base_url, resource),
        };
        debug!("Pub/Sub request: {} {}", method, url);

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            let body = serde_json::to_vec(body).map_err(|e| {
                CallError::Service(PubSubError::InvalidInput(format!(
                    "Cannot serialize request: {}",
                    e
                )))
            })?;
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }
        if let Some(token) = self.access_token.as_ref() {
            request = request.bearer_auth(token);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(CallError::Http)?;
        if response.status().is_success() {
            response.bytes().await.map_err(CallError::Http)
        } else {
            Err(CallError::Service(http_response_to_pubsub_error(response).await))
        }
    }
}

/// Errors returned by `RestPubSubClient::call`.
///
/// Transport errors are kept separate from service errors so that callers can tell timeouts
/// apart.
enum CallError {
    /// The HTTP request could not be completed.
    Http(reqwest::Error),

    /// The service answered with an error status.
    Service(PubSubError),
}

impl From<CallError> for PubSubError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Http(e) => reqwest_error_to_pubsub_error(e),
            CallError::Service(e) => e,
        }
    }
}

/// Placeholder body type for requests that carry no body.
type NoBody = CreateTopicRequest;

#[async_trait]
impl PubSubClient for RestPubSubClient {
    async fn create_topic(&self, topic: &TopicPath) -> PubSubResult<()> {
        self.call(Method::PUT, topic.as_str(), None, Some(&CreateTopicRequest {}), None).await?;
        Ok(())
    }

    async fn delete_topic(&self, topic: &TopicPath) -> PubSubResult<()> {
        self.call::<NoBody>(Method::DELETE, topic.as_str(), None, None, None).await?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &SubscriptionPath,
        topic: &TopicPath,
        ack_deadline: Option<Duration>,
    ) -> PubSubResult<()> {
        let request = CreateSubscriptionRequest {
            topic: topic.as_str(),
            ack_deadline_seconds: ack_deadline.map(ack_deadline_seconds).transpose()?,
        };
        self.call(Method::PUT, subscription.as_str(), None, Some(&request), None).await?;
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &SubscriptionPath) -> PubSubResult<()> {
        self.call::<NoBody>(Method::DELETE, subscription.as_str(), None, None, None).await?;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &TopicPath,
        data: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> PubSubResult<String> {
        let request = PublishRequest {
            messages: vec![OutgoingMessage { data: BASE64.encode(data), attributes: &attributes }],
        };
        let bytes =
            self.call(Method::POST, topic.as_str(), Some("publish"), Some(&request), None).await?;
        let response: PublishResponse = parse_json(bytes)?;
        match response.message_ids.into_iter().next() {
            Some(id) => Ok(id),
            None => Err(PubSubError::BackendError(format!(
                "Publishing to {} returned no message identifiers",
                topic
            ))),
        }
    }

    async fn pull(
        &self,
        subscription: &SubscriptionPath,
        max_messages: u16,
        timeout: Duration,
    ) -> PubSubResult<Vec<ReceivedMessage>> {
        let request = PullRequest { max_messages };
        let bytes = match self
            .call(Method::POST, subscription.as_str(), Some("pull"), Some(&request), Some(timeout))
            .await
        {
            Ok(bytes) => bytes,
            Err(CallError::Http(e)) if e.is_timeout() => {
                debug!("Pull from {} timed out after {:?}", subscription, timeout);
                return Ok(vec![]);
            }
            Err(e) => return Err(e.into()),
        };

        let response: PullResponse = parse_json(bytes)?;
        Ok(response
            .received_messages
            .into_iter()
            .map(|delivery| ReceivedMessage {
                ack_id: delivery.ack_id,
                data: delivery.message.data,
                message_id: delivery.message.message_id,
                attributes: delivery.message.attributes,
                delivery_attempt: delivery.delivery_attempt,
            })
            .collect())
    }

    async fn acknowledge(
        &self,
        subscription: &SubscriptionPath,
        ack_ids: &[String],
    ) -> PubSubResult<()> {
        let request = AcknowledgeRequest { ack_ids };
        self.call(Method::POST, subscription.as_str(), Some("acknowledge"), Some(&request), None)
            .await?;
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &SubscriptionPath,
        ack_ids: &[String],
        seconds: u32,
    ) -> PubSubResult<()> {
        let request = ModifyAckDeadlineRequest { ack_ids, ack_deadline_seconds: seconds };
        self.call(
            Method::POST,
            subscription.as_str(),
            Some("modifyAckDeadline"),
            Some(&request),
            None,
        )
        .await?;
        Ok(())
    }

    async fn close(&self) {
        // reqwest tears down pooled connections when the last clone of the client is dropped.
        debug!("Closing Pub/Sub client for {}", self.base_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, Method as HttpMethod, StatusCode as HttpStatusCode, Uri};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    /// A request captured by the fake server.
    #[derive(Debug)]
    struct CapturedRequest {
        /// HTTP method of the request.
        method: String,

        /// Path of the request, including any custom verb.
        path: String,

        /// Value of the `Authorization` header, if any.
        authorization: Option<String>,

        /// Body of the request.
        body: String,
    }

    /// Shared state of the fake server.
    #[derive(Clone, Default)]
    struct FakeState {
        /// Requests received so far.
        requests: Arc<Mutex<Vec<CapturedRequest>>>,

        /// Canned responses to return, in order.  Defaults to `200 {}` when empty.
        responses: Arc<Mutex<VecDeque<(u16, String)>>>,

        /// Delay to apply before answering pull requests.
        pull_delay: Arc<Mutex<Option<Duration>>>,
    }

    /// Handles any request by recording it and returning the next canned response.
    async fn handle(
        State(state): State<FakeState>,
        method: HttpMethod,
        uri: Uri,
        headers: HeaderMap,
        body: String,
    ) -> (HttpStatusCode, String) {
        let path = uri.path().to_owned();
        let authorization =
            headers.get("authorization").map(|v| v.to_str().unwrap().to_owned());
        state.requests.lock().unwrap().push(CapturedRequest {
            method: method.to_string(),
            path: path.clone(),
            authorization,
            body,
        });

        if path.ends_with(":pull") {
            let delay = *state.pull_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        let (status, body) =
            state.responses.lock().unwrap().pop_front().unwrap_or((200, "{}".to_owned()));
        (HttpStatusCode::from_u16(status).unwrap(), body)
    }

    /// An in-process HTTP server that mimics the Pub/Sub REST API.
    struct FakeServer {
        /// Address the server listens on.
        addr: SocketAddr,

        /// State shared with the request handler.
        state: FakeState,
    }

    impl FakeServer {
        /// Starts a new server on a random local port.
        async fn start() -> Self {
            let state = FakeState::default();
            let app = Router::new().fallback(handle).with_state(state.clone());
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
            Self { addr, state }
        }

        /// Queues a response for the next request.
        fn respond(&self, status: u16, body: &str) {
            self.state.responses.lock().unwrap().push_back((status, body.to_owned()));
        }

        /// Returns and clears the captured requests.
        fn take_requests(&self) -> Vec<CapturedRequest> {
            std::mem::take(&mut *self.state.requests.lock().unwrap())
        }

        /// Creates a client that talks to this server as if it was the emulator.
        fn emulator_client(&self) -> RestPubSubClient {
            let mut opts = PubSubOptions::new("test-project");
            opts.emulator_host = Some(self.addr.to_string());
            opts.access_token = Some("ignored".to_owned());
            RestPubSubClient::new(&opts).unwrap()
        }
    }

    /// Parses a captured body as JSON.
    fn body_json(request: &CapturedRequest) -> Value {
        serde_json::from_str(&request.body).unwrap()
    }

    /// Returns the topic used by the tests.
    fn topic() -> TopicPath {
        TopicPath::new("test-project", "dramatiq-default")
    }

    /// Returns the subscription used by the tests.
    fn subscription() -> SubscriptionPath {
        SubscriptionPath::new("test-project", "dramatiq-default-sub")
    }

    #[test]
    fn test_base_url_emulator() {
        let mut opts = PubSubOptions::new("p");
        opts.emulator_host = Some("localhost:8085".to_owned());
        let client = RestPubSubClient::new(&opts).unwrap();
        assert_eq!("http://localhost:8085/", client.base_url().as_str());
        assert!(client.access_token.is_none());
    }

    #[test]
    fn test_base_url_default_and_endpoint() {
        let client = RestPubSubClient::new(&PubSubOptions::new("p")).unwrap();
        assert_eq!("https://pubsub.googleapis.com/", client.base_url().as_str());

        let mut opts = PubSubOptions::new("p");
        opts.endpoint = Some("https://pubsub.example.com/api".to_owned());
        opts.access_token = Some("token".to_owned());
        let client = RestPubSubClient::new(&opts).unwrap();
        assert_eq!("https://pubsub.example.com/api/", client.base_url().as_str());
        assert_eq!(Some("token"), client.access_token.as_deref());
    }

    #[test]
    fn test_base_url_invalid() {
        let mut opts = PubSubOptions::new("p");
        opts.endpoint = Some("not a url".to_owned());
        let err = RestPubSubClient::new(&opts).err().unwrap();
        assert!(err.starts_with("Invalid Pub/Sub endpoint not a url"));
    }

    #[test]
    fn test_options_from_env_all_present() {
        let overrides = [
            ("PUBSUB_PROJECT_ID", Some("the-project")),
            ("PUBSUB_EMULATOR_HOST", Some("localhost:8085")),
            ("PUBSUB_ENDPOINT", Some("https://example.com")),
            ("PUBSUB_ACCESS_TOKEN", Some("secret")),
            ("PUBSUB_TOPIC_PREFIX", Some("tasks")),
            ("PUBSUB_ACK_DEADLINE", Some("60")),
        ];
        temp_env::with_vars(overrides, || {
            let opts = PubSubOptions::from_env("PUBSUB").unwrap();
            assert_eq!(
                PubSubOptions {
                    project_id: "the-project".to_owned(),
                    emulator_host: Some("localhost:8085".to_owned()),
                    endpoint: Some("https://example.com".to_owned()),
                    access_token: Some("secret".to_owned()),
                    topic_prefix: "tasks".to_owned(),
                    ack_deadline: Some(Duration::from_secs(60)),
                },
                opts
            );
            assert!(!format!("{:?}", opts).contains("secret"));
        });
    }

    #[test]
    fn test_options_from_env_defaults() {
        let overrides = [
            ("PUBSUB_PROJECT_ID", Some("the-project")),
            ("PUBSUB_EMULATOR_HOST", None),
            ("PUBSUB_ENDPOINT", None),
            ("PUBSUB_ACCESS_TOKEN", None),
            ("PUBSUB_TOPIC_PREFIX", None),
            ("PUBSUB_ACK_DEADLINE", None),
        ];
        temp_env::with_vars(overrides, || {
            assert_eq!(
                PubSubOptions::new("the-project"),
                PubSubOptions::from_env("PUBSUB").unwrap()
            );
        });
    }

    #[test]
    fn test_options_from_env_bad_ack_deadline() {
        let overrides =
            [("PUBSUB_PROJECT_ID", Some("the-project")), ("PUBSUB_ACK_DEADLINE", Some("5"))];
        temp_env::with_vars(overrides, || {
            let err = PubSubOptions::from_env("PUBSUB").unwrap_err();
            assert!(err.starts_with("Invalid PUBSUB_ACK_DEADLINE: "), "{}", err);
        });
    }

    #[test]
    fn test_options_from_env_missing_project() {
        temp_env::with_var_unset("MISSING_PROJECT_ID", || {
            let err = PubSubOptions::from_env("MISSING").unwrap_err();
            assert!(err.contains("MISSING_PROJECT_ID"));
        });
    }

    #[tokio::test]
    async fn test_create_topic_and_subscription() {
        let server = FakeServer::start().await;
        let client = server.emulator_client();

        client.create_topic(&topic()).await.unwrap();
        client
            .create_subscription(&subscription(), &topic(), Some(Duration::from_secs(45)))
            .await
            .unwrap();
        client.create_subscription(&subscription(), &topic(), None).await.unwrap();
        match client
            .create_subscription(&subscription(), &topic(), Some(Duration::from_millis(1500)))
            .await
        {
            Err(PubSubError::InvalidInput(msg)) => assert!(msg.starts_with("Ack deadline")),
            e => panic!("Unexpected result {:?}", e),
        }

        // The invalid deadline is rejected before reaching the service.
        let requests = server.take_requests();
        assert_eq!(3, requests.len());

        assert_eq!("PUT", requests[0].method);
        assert_eq!("/v1/projects/test-project/topics/dramatiq-default", requests[0].path);
        assert_eq!(json!({}), body_json(&requests[0]));
        assert_eq!(None, requests[0].authorization);

        assert_eq!("PUT", requests[1].method);
        assert_eq!(
            "/v1/projects/test-project/subscriptions/dramatiq-default-sub",
            requests[1].path
        );
        assert_eq!(
            json!({
                "topic": "projects/test-project/topics/dramatiq-default",
                "ackDeadlineSeconds": 45,
            }),
            body_json(&requests[1])
        );

        assert_eq!(
            json!({"topic": "projects/test-project/topics/dramatiq-default"}),
            body_json(&requests[2])
        );
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let server = FakeServer::start().await;
        let client = server.emulator_client();

        server.respond(409, r#"{"error":{"code":409,"status":"ALREADY_EXISTS"}}"#);
        match client.create_topic(&topic()).await {
            Err(PubSubError::AlreadyExists(msg)) => assert!(msg.contains("ALREADY_EXISTS")),
            e => panic!("Unexpected result {:?}", e),
        }

        server.respond(404, "");
        match client.delete_subscription(&subscription()).await {
            Err(PubSubError::NotFound(msg)) => assert!(msg.contains("404")),
            e => panic!("Unexpected result {:?}", e),
        }

        server.respond(400, "bad");
        assert!(matches!(
            client.acknowledge(&subscription(), &["a".to_owned()]).await,
            Err(PubSubError::InvalidInput(_))
        ));

        server.respond(401, "");
        assert!(matches!(
            client.create_topic(&topic()).await,
            Err(PubSubError::PermissionDenied(_))
        ));

        server.respond(403, "");
        assert!(matches!(
            client.delete_topic(&topic()).await,
            Err(PubSubError::PermissionDenied(_))
        ));

        server.respond(503, "");
        assert!(matches!(
            client.publish(&topic(), b"x".to_vec(), HashMap::default()).await,
            Err(PubSubError::BackendError(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_requests() {
        let server = FakeServer::start().await;
        let client = server.emulator_client();

        client.delete_subscription(&subscription()).await.unwrap();
        client.delete_topic(&topic()).await.unwrap();

        let requests = server.take_requests();
        assert_eq!("DELETE", requests[0].method);
        assert_eq!(
            "/v1/projects/test-project/subscriptions/dramatiq-default-sub",
            requests[0].path
        );
        assert_eq!("", requests[0].body);
        assert_eq!("DELETE", requests[1].method);
        assert_eq!("/v1/projects/test-project/topics/dramatiq-default", requests[1].path);
    }

    #[tokio::test]
    async fn test_publish() {
        let server = FakeServer::start().await;
        let client = server.emulator_client();

        server.respond(200, r#"{"messageIds":["1234"]}"#);
        let mut attributes = HashMap::default();
        attributes.insert("origin".to_owned(), "test".to_owned());
        let id = client.publish(&topic(), b"hello".to_vec(), attributes).await.unwrap();
        assert_eq!("1234", id);

        server.respond(200, r#"{"messageIds":["5678"]}"#);
        client.publish(&topic(), b"bye".to_vec(), HashMap::default()).await.unwrap();

        let requests = server.take_requests();
        assert_eq!("POST", requests[0].method);
        assert_eq!("/v1/projects/test-project/topics/dramatiq-default:publish", requests[0].path);
        assert_eq!(
            json!({"messages": [{"data": "aGVsbG8=", "attributes": {"origin": "test"}}]}),
            body_json(&requests[0])
        );
        assert_eq!(json!({"messages": [{"data": "Ynll"}]}), body_json(&requests[1]));
    }

    #[tokio::test]
    async fn test_publish_without_ids_is_an_error() {
        let server = FakeServer::start().await;
        let client = server.emulator_client();

        server.respond(200, r#"{"messageIds":[]}"#);
        match client.publish(&topic(), b"x".to_vec(), HashMap::default()).await {
            Err(PubSubError::BackendError(msg)) => assert!(msg.contains("no message identifiers")),
            e => panic!("Unexpected result {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_pull_some() {
        let server = FakeServer::start().await;
        let client = server.emulator_client();

        server.respond(
            200,
            r#"{"receivedMessages":[
                {"ackId":"ack-1","message":{"data":"Zmlyc3Q=","messageId":"1","publishTime":"2024-03-01T10:00:00Z"}},
                {"ackId":"ack-2","message":{"data":"c2Vjb25k","messageId":"2","attributes":{"k":"v"}},"deliveryAttempt":3}
            ]}"#,
        );
        let messages = client.pull(&subscription(), 10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            vec![
                ReceivedMessage {
                    ack_id: "ack-1".to_owned(),
                    data: b"first".to_vec(),
                    message_id: "1".to_owned(),
                    attributes: HashMap::default(),
                    delivery_attempt: None,
                },
                ReceivedMessage {
                    ack_id: "ack-2".to_owned(),
                    data: b"second".to_vec(),
                    message_id: "2".to_owned(),
                    attributes: HashMap::from([("k".to_owned(), "v".to_owned())]),
                    delivery_attempt: Some(3),
                },
            ],
            messages
        );

        let requests = server.take_requests();
        assert_eq!(
            "/v1/projects/test-project/subscriptions/dramatiq-default-sub:pull",
            requests[0].path
        );
        assert_eq!(json!({"maxMessages": 10}), body_json(&requests[0]));
    }

    #[tokio::test]
    async fn test_pull_none() {
        let server = FakeServer::start().await;
        let client = server.emulator_client();

        server.respond(200, "{}");
        assert!(client.pull(&subscription(), 1, Duration::from_secs(5)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_timeout_returns_nothing() {
        let server = FakeServer::start().await;
        let client = server.emulator_client();

        *server.state.pull_delay.lock().unwrap() = Some(Duration::from_secs(10));
        let messages = client.pull(&subscription(), 1, Duration::from_millis(100)).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_pull_invalid_response() {
        let server = FakeServer::start().await;
        let client = server.emulator_client();

        server.respond(200, r#"{"receivedMessages":[{"ackId":"a","message":{"data":"!!"}}]}"#);
        match client.pull(&subscription(), 1, Duration::from_secs(5)).await {
            Err(PubSubError::BackendError(msg)) => assert!(msg.contains("Invalid response")),
            e => panic!("Unexpected result {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_acknowledge_and_modify_ack_deadline() {
        let server = FakeServer::start().await;
        let client = server.emulator_client();

        let ack_ids = vec!["ack-1".to_owned(), "ack-2".to_owned()];
        client.acknowledge(&subscription(), &ack_ids).await.unwrap();
        client.modify_ack_deadline(&subscription(), &ack_ids[1..], 0).await.unwrap();

        let requests = server.take_requests();
        assert_eq!(
            "/v1/projects/test-project/subscriptions/dramatiq-default-sub:acknowledge",
            requests[0].path
        );
        assert_eq!(json!({"ackIds": ["ack-1", "ack-2"]}), body_json(&requests[0]));
        assert_eq!(
            "/v1/projects/test-project/subscriptions/dramatiq-default-sub:modifyAckDeadline",
            requests[1].path
        );
        assert_eq!(json!({"ackIds": ["ack-2"], "ackDeadlineSeconds": 0}), body_json(&requests[1]));
    }

    #[tokio::test]
    async fn test_access_token_sent_outside_emulator() {
        let server = FakeServer::start().await;
        let mut opts = PubSubOptions::new("test-project");
        opts.endpoint = Some(format!("http://{}", server.addr));
        opts.access_token = Some("the-token".to_owned());
        let client = RestPubSubClient::new(&opts).unwrap();

        client.create_topic(&topic()).await.unwrap();

        let requests = server.take_requests();
        assert_eq!(Some("Bearer the-token"), requests[0].authorization.as_deref());
    }
}
