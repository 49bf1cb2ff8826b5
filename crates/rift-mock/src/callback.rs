//! Fire-and-forget outbound callbacks.

use crate::error::CallbackError;
use crate::observe::Observer;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A rendered callback, ready to send.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    /// Rule that scheduled the callback
    pub rule: String,
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Wait before sending
    pub delay: Duration,
}

#[derive(Clone)]
pub struct CallbackDispatcher {
    client: reqwest::Client,
    observer: Arc<dyn Observer>,
}

impl CallbackDispatcher {
    pub fn new(timeout: Duration, observer: Arc<dyn Observer>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, observer })
    }

    /// Send on a background task. Failures are logged and reported to the
    /// observer; nothing is retried.
    pub fn dispatch(&self, request: CallbackRequest) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if !request.delay.is_zero() {
                tokio::time::sleep(request.delay).await;
            }
            match dispatcher.deliver(&request).await {
                Ok(status) => debug!(
                    "Callback for rule '{}' to {} returned {}",
                    request.rule, request.url, status
                ),
                Err(e) => {
                    warn!(
                        "Callback for rule '{}' to {} failed: {}",
                        request.rule, request.url, e
                    );
                    dispatcher
                        .observer
                        .on_callback_failure(&request.rule, &e.to_string());
                }
            }
        })
    }

    pub async fn deliver(&self, request: &CallbackRequest) -> Result<u16, CallbackError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| CallbackError::InvalidMethod(request.method.clone()))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(CallbackError::Status(status.as_u16()))
        }
    }
}
