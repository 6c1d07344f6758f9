//! Retry wrapper for model clients

use super::{DeltaFn, ModelClient, ModelRequest, ModelResponse};
use crate::error::ClientError;
use crate::BackoffConfig;
use async_trait::async_trait;
use tracing::warn;

/// Retries transient failures of the inner client with exponential backoff
///
/// Fatal errors are returned immediately. Streaming calls are retried only
/// when no delta has been delivered yet; otherwise the caller would see the
/// same text twice.
pub struct RetryingClient<C> {
    inner: C,
    backoff: BackoffConfig,
}

impl<C: ModelClient> RetryingClient<C> {
    pub fn new(inner: C, backoff: BackoffConfig) -> Self {
        Self { inner, backoff }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: ModelClient> ModelClient for RetryingClient<C> {
    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ClientError> {
        let mut attempt = 0;
        loop {
            match self.inner.send(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.backoff.max_retries => {
                    attempt += 1;
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        "Transient model error (retry {}/{} in {:?}): {}",
                        attempt, self.backoff.max_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_streaming(
        &self,
        request: &ModelRequest,
        on_delta: &DeltaFn<'_>,
    ) -> Result<ModelResponse, ClientError> {
        let mut attempt = 0;
        loop {
            let delivered = std::sync::atomic::AtomicBool::new(false);
            let tracking = |delta: &str| {
                delivered.store(true, std::sync::atomic::Ordering::SeqCst);
                on_delta(delta);
            };

            match self.inner.send_streaming(request, &tracking).await {
                Ok(response) => return Ok(response),
                Err(e)
                    if e.is_transient()
                        && attempt < self.backoff.max_retries
                        && !delivered.load(std::sync::atomic::Ordering::SeqCst) =>
                {
                    attempt += 1;
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        "Transient streaming error (retry {}/{} in {:?}): {}",
                        attempt, self.backoff.max_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Message, RequestOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails with `error` for the first `failures` calls
    struct Flaky {
        failures: usize,
        error: ClientError,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelClient for Flaky {
        async fn send(&self, _request: &ModelRequest) -> Result<ModelResponse, ClientError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(ModelResponse::new("ok"))
            }
        }
    }

    fn no_delay(max_retries: u32) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            max_retries,
            jitter: false,
        }
    }

    fn request() -> ModelRequest {
        ModelRequest {
            system: Arc::from(""),
            cache_boundary: None,
            messages: vec![Message::user("hi")],
            options: RequestOptions {
                model: "m".to_string(),
                max_output: 1,
                temperature: 0.0,
                stream: false,
            },
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let client = RetryingClient::new(
            Flaky {
                failures: 2,
                error: ClientError::Transient("429".into()),
                calls: AtomicUsize::new(0),
            },
            no_delay(3),
        );
        let response = client.send(&request()).await.unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let client = RetryingClient::new(
            Flaky {
                failures: 10,
                error: ClientError::Transient("503".into()),
                calls: AtomicUsize::new(0),
            },
            no_delay(2),
        );
        assert!(client.send(&request()).await.is_err());
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let client = RetryingClient::new(
            Flaky {
                failures: 1,
                error: ClientError::Fatal("401".into()),
                calls: AtomicUsize::new(0),
            },
            no_delay(5),
        );
        let err = client.send(&request()).await.unwrap_err();
        assert_eq!(err, ClientError::Fatal("401".into()));
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_streaming_retries_before_first_delta() {
        let client = RetryingClient::new(
            Flaky {
                failures: 1,
                error: ClientError::Transient("reset".into()),
                calls: AtomicUsize::new(0),
            },
            no_delay(2),
        );
        let response = client.send_streaming(&request(), &|_| {}).await.unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_streaming_forwards_deltas_through_wrapper() {
        let client = RetryingClient::new(
            Flaky {
                failures: 0,
                error: ClientError::Transient("unused".into()),
                calls: AtomicUsize::new(0),
            },
            no_delay(0),
        );
        let seen = std::sync::Mutex::new(String::new());
        let sink = |delta: &str| seen.lock().unwrap().push_str(delta);

        let response = client.send_streaming(&request(), &sink).await.unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(*seen.lock().unwrap(), "ok");
    }
}
