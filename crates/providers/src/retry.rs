//! Rate-limit retries.
//!
//! Wraps a provider and retries calls that fail with
//! [`ProviderError::RateLimited`], sleeping for the advertised
//! `retry_after_secs` (capped) between attempts. Every other error is
//! returned immediately.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use threadline_core::error::ProviderError;
use threadline_core::provider::{Provider, ProviderRequest, ProviderResponse};
use tracing::{info, warn};

/// Longest single wait between attempts.
pub const MAX_RETRY_WAIT: Duration = Duration::from_secs(30);

pub struct RetryingProvider {
    inner: Arc<dyn Provider>,
    max_retries: u32,
    max_wait: Duration,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn Provider>, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            max_wait: MAX_RETRY_WAIT,
        }
    }

    /// Cap each wait at `max_wait`.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

#[async_trait]
impl Provider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(request.clone()).await {
                Err(ProviderError::RateLimited { retry_after_secs }) if attempt < self.max_retries => {
                    attempt += 1;
                    let wait = Duration::from_secs(retry_after_secs).min(self.max_wait);
                    info!(
                        provider = %self.inner.name(),
                        attempt,
                        max_retries = self.max_retries,
                        wait_secs = wait.as_secs(),
                        "Rate limited; retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    if e.is_rate_limited() {
                        warn!(provider = %self.inner.name(), attempts = attempt + 1, "Rate limit retries exhausted");
                    }
                    return Err(e);
                }
                Ok(response) => return Ok(response),
            }
        }
    }

    async fn list_models(&self) -> std::result::Result<Vec<String>, ProviderError> {
        self.inner.list_models().await
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        self.inner.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use threadline_core::message::ContextMessage;
    use threadline_core::provider::Usage;

    /// Plays back a fixed sequence of outcomes.
    struct SequenceProvider {
        outcomes: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
        call_count: Mutex<usize>,
    }

    impl SequenceProvider {
        fn new(outcomes: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                call_count: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.call_count.lock().unwrap()
        }
    }

    #[async_trait]
    impl Provider for SequenceProvider {
        fn name(&self) -> &str {
            "sequence"
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            *self.call_count.lock().unwrap() += 1;
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .expect("sequence exhausted")
        }
    }

    fn ok() -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            content: "success".into(),
            usage: Usage::default(),
            model: "test-model".into(),
        })
    }

    fn limited(secs: u64) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::RateLimited {
            retry_after_secs: secs,
        })
    }

    fn test_request() -> ProviderRequest {
        ProviderRequest::new("test", vec![ContextMessage::user("hello")])
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_then_succeeds() {
        let inner = Arc::new(SequenceProvider::new(vec![limited(5), limited(5), ok()]));
        let provider = RetryingProvider::new(inner.clone(), 2);

        let started = tokio::time::Instant::now();
        let response = provider.complete(test_request()).await.unwrap();
        assert_eq!(response.content, "success");
        assert_eq!(inner.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let inner = Arc::new(SequenceProvider::new(vec![limited(1), limited(1), limited(1)]));
        let provider = RetryingProvider::new(inner.clone(), 2);

        let err = provider.complete(test_request()).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_are_capped() {
        let inner = Arc::new(SequenceProvider::new(vec![limited(3600), ok()]));
        let provider =
            RetryingProvider::new(inner, 1).with_max_wait(Duration::from_secs(2));

        let started = tokio::time::Instant::now();
        provider.complete(test_request()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let inner = Arc::new(SequenceProvider::new(vec![
            Err(ProviderError::ServiceUnavailable("down".into())),
            ok(),
        ]));
        let provider = RetryingProvider::new(inner.clone(), 3);

        let err = provider.complete(test_request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::ServiceUnavailable(_)));
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn zero_retries_passes_through() {
        let inner = Arc::new(SequenceProvider::new(vec![limited(1)]));
        let provider = RetryingProvider::new(inner.clone(), 0);
        assert!(provider.complete(test_request()).await.is_err());
        assert_eq!(inner.calls(), 1);
    }
}
