//! Request/response over pub/sub
//!
//! Each call gets a fresh correlation id and a private response topic
//! (`{request_topic}:response:{id}`). The response subscription is confirmed
//! before the request is published, so a fast responder cannot beat it, and
//! it is released on every exit path: reply, timeout, or error.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{response_topic, BrokerError, MessageBroker, Subscription};

/// Field carrying the correlation id in requests and responses
const CORRELATION_FIELD: &str = "requestId";

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("No response within {}ms", .0.as_millis())]
    TimedOut(Duration),

    /// The responder answered with an error
    #[error("Responder error: {0}")]
    Application(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

#[derive(Clone)]
pub struct CorrelationChannel {
    broker: Arc<dyn MessageBroker>,
    request_topic: String,
}

impl CorrelationChannel {
    pub fn new(broker: Arc<dyn MessageBroker>, request_topic: impl Into<String>) -> Self {
        Self {
            broker,
            request_topic: request_topic.into(),
        }
    }

    pub fn request_topic(&self) -> &str {
        &self.request_topic
    }

    /// Send `request` and wait up to `timeout` for the matching response
    ///
    /// `request` must serialize to a JSON object; the correlation id is added
    /// to it. A response with a non-null `error` or `"success": false` is an
    /// `Application` error.
    pub async fn call<Req, Resp>(&self, request: &Req, timeout: Duration) -> Result<Resp, CorrelationError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let correlation_id = Uuid::new_v4().to_string();
        let payload = encode_request(request, &correlation_id)?;
        let reply_topic = response_topic(&self.request_topic, &correlation_id);

        let mut subscription = self.broker.subscribe(&reply_topic).await?;
        let outcome = self
            .exchange(subscription.as_mut(), &payload, timeout)
            .await;

        if let Err(e) = subscription.close().await {
            warn!(topic = %reply_topic, "Failed to release response subscription: {}", e);
        }

        let response = outcome?;
        decode_response(&response)
    }

    async fn exchange(
        &self,
        subscription: &mut dyn Subscription,
        payload: &str,
        timeout: Duration,
    ) -> Result<String, CorrelationError> {
        match tokio::time::timeout(timeout, self.round_trip(subscription, payload)).await {
            Ok(result) => result,
            Err(_) => Err(CorrelationError::TimedOut(timeout)),
        }
    }

    async fn round_trip(
        &self,
        subscription: &mut dyn Subscription,
        payload: &str,
    ) -> Result<String, CorrelationError> {
        let receivers = self.broker.publish(&self.request_topic, payload).await?;
        if receivers == 0 {
            debug!(topic = %self.request_topic, "Request published with no listeners");
        }

        subscription
            .next_message()
            .await
            .ok_or(CorrelationError::Broker(BrokerError::Closed))
    }
}

fn encode_request<Req: Serialize>(request: &Req, correlation_id: &str) -> Result<String, CorrelationError> {
    let mut value = serde_json::to_value(request)
        .map_err(|e| CorrelationError::Malformed(e.to_string()))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| CorrelationError::Malformed("request must be a JSON object".into()))?;
    object.insert(CORRELATION_FIELD.to_string(), Value::String(correlation_id.to_string()));

    serde_json::to_string(&value).map_err(|e| CorrelationError::Malformed(e.to_string()))
}

fn decode_response<Resp: DeserializeOwned>(raw: &str) -> Result<Resp, CorrelationError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| CorrelationError::Malformed(e.to_string()))?;

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(CorrelationError::Application(message));
    }
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(CorrelationError::Application("responder reported failure".into()));
    }

    serde_json::from_value(value).map_err(|e| CorrelationError::Malformed(e.to_string()))
}
