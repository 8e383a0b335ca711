//! HTTP webhook notification channel.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use autoprice_storage::{NotificationChannel, ServiceError};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info_span, warn, Instrument};

/// Delays between delivery attempts: `base_delay` doubled per retry, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_before(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug)]
enum Attempt {
    Delivered,
    Retry(String),
    Failed(ServiceError),
}

/// Throttling and server errors are retried; any other non-success status is final.
fn classify_status(status: StatusCode, url: &str) -> Attempt {
    if status.is_success() {
        Attempt::Delivered
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Attempt::Retry(format!("HTTP {}", status.as_u16()))
    } else {
        Attempt::Failed(ServiceError::rejected(
            format!("HTTP {}", status.as_u16()),
            format!("webhook {url} refused the alert"),
        ))
    }
}

fn classify_transport(err: reqwest::Error) -> Attempt {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Attempt::Retry(err.to_string())
    } else {
        Attempt::Failed(ServiceError::Unavailable(err.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    body: &'a str,
}

/// Posts `{subject, body}` JSON to a fixed URL.
#[derive(Debug)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration, backoff: BackoffPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("autoprice/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
            backoff,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn publish(&self, subject: &str, body: &str) -> Result<(), ServiceError> {
        let payload = WebhookPayload { subject, body };
        let span = info_span!("webhook_publish", url = %self.url);

        async {
            let attempts = self.backoff.max_retries + 1;
            let mut last_reason = String::new();
            for attempt in 1..=attempts {
                if attempt > 1 {
                    tokio::time::sleep(self.backoff.delay_before(attempt - 1)).await;
                }
                let outcome = match self.client.post(&self.url).json(&payload).send().await {
                    Ok(resp) => classify_status(resp.status(), &self.url),
                    Err(err) => classify_transport(err),
                };
                match outcome {
                    Attempt::Delivered => {
                        debug!(attempt, "webhook accepted alert");
                        return Ok(());
                    }
                    Attempt::Failed(err) => return Err(err),
                    Attempt::Retry(reason) => {
                        warn!(attempt, attempts, %reason, "webhook delivery failed");
                        last_reason = reason;
                    }
                }
            }
            Err(ServiceError::Unavailable(format!(
                "webhook {} gave up after {attempts} attempts: {last_reason}",
                self.url
            )))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::Value;
    use tokio::net::TcpListener;

    use super::*;

    /// Answers `failure` for the first `failures` posts, then 200.
    struct Endpoint {
        failures: AtomicUsize,
        failure: axum::http::StatusCode,
        received: Mutex<Vec<Value>>,
    }

    async fn receive(State(endpoint): State<Arc<Endpoint>>, Json(payload): Json<Value>) -> axum::http::StatusCode {
        endpoint.received.lock().unwrap().push(payload);
        let remaining = endpoint.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            endpoint.failures.store(remaining - 1, Ordering::SeqCst);
            endpoint.failure
        } else {
            axum::http::StatusCode::OK
        }
    }

    async fn spawn_endpoint(failures: usize, failure: axum::http::StatusCode) -> (String, Arc<Endpoint>) {
        let endpoint = Arc::new(Endpoint {
            failures: AtomicUsize::new(failures),
            failure,
            received: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/alerts", post(receive))
            .with_state(endpoint.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (format!("http://{addr}/alerts"), endpoint)
    }

    fn channel(url: &str, max_retries: u32) -> WebhookChannel {
        WebhookChannel::new(
            url,
            Duration::from_secs(2),
            BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_the_alert_lands() {
        let (url, endpoint) = spawn_endpoint(2, axum::http::StatusCode::SERVICE_UNAVAILABLE).await;

        channel(&url, 3).publish("[AutoPrice] Glue Error", "crawler failed").await.unwrap();

        let received = endpoint.received.lock().unwrap().clone();
        assert_eq!(received.len(), 3);
        assert_eq!(received[2]["subject"], "[AutoPrice] Glue Error");
        assert_eq!(received[2]["body"], "crawler failed");
    }

    #[tokio::test]
    async fn refused_alert_is_not_retried() {
        let (url, endpoint) = spawn_endpoint(5, axum::http::StatusCode::FORBIDDEN).await;

        let err = channel(&url, 3).publish("subject", "body").await.unwrap_err();

        assert!(matches!(err, ServiceError::Rejected { ref code, .. } if code == "HTTP 403"));
        assert_eq!(endpoint.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn throttled_endpoint_exhausts_the_retry_budget() {
        let (url, endpoint) = spawn_endpoint(10, axum::http::StatusCode::TOO_MANY_REQUESTS).await;

        let err = channel(&url, 2).publish("subject", "body").await.unwrap_err();

        assert!(matches!(err, ServiceError::Unavailable(ref reason) if reason.contains("HTTP 429")));
        assert_eq!(endpoint.received.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_an_error() {
        let err = channel("http://127.0.0.1:9/alerts", 1)
            .publish("subject", "body")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
    }

    #[test]
    fn retry_delays_double_from_the_base_and_stop_at_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(25),
        };
        let delays: Vec<_> = (1..=4).map(|retry| policy.delay_before(retry)).collect();
        assert_eq!(
            delays,
            [10, 20, 25, 25].map(Duration::from_millis).to_vec()
        );
    }
}
