//! Embedding gateway: the single entry point for turning text into vectors.
//!
//! Wraps an [`EmbeddingBackend`] with the shared [`RetryPolicy`] (per-attempt
//! timeout, bounded retries with backoff) and an [`EmbeddingCache`]. A
//! terminal failure is always `EmbeddingError::Unavailable`; a zero vector is
//! never returned.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{cache_key, EmbeddingCache};
use crate::config::EmbeddingConfig;
use crate::embeddings::{is_zero_vector, EmbeddingBackend, EmbeddingError};
use crate::retry::{AttemptError, RetryPolicy};

pub struct EmbeddingGateway {
    backend: Arc<dyn EmbeddingBackend>,
    policy: RetryPolicy,
    cache: EmbeddingCache,
}

impl EmbeddingGateway {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, config: &EmbeddingConfig) -> Self {
        let policy = RetryPolicy::new(
            config.max_retries,
            Duration::from_millis(config.retry_delay_ms),
            Duration::from_millis(config.max_retry_delay_ms),
            config.timeout(),
        );
        Self::with_policy(
            backend,
            policy,
            EmbeddingCache::new(config.cache_ttl(), config.cache_capacity),
        )
    }

    pub fn with_policy(backend: Arc<dyn EmbeddingBackend>, policy: RetryPolicy, cache: EmbeddingCache) -> Self {
        Self {
            backend,
            policy,
            cache,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.backend.dimensions()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Embed a query, serving repeats of the same normalized text from cache.
    pub async fn embed(&self, text: &str) -> Result<Arc<Vec<f32>>, EmbeddingError> {
        let key = cache_key(text);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(key = %&key[..12], "Embedding cache hit");
            return Ok(hit);
        }

        let vector = Arc::new(self.embed_uncached(text).await?);
        self.cache.insert(key, vector.clone());
        Ok(vector)
    }

    /// Embed without consulting or filling the cache (ingestion path).
    pub async fn embed_uncached(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let backend = &self.backend;
        let result = self
            .policy
            .run(
                || async move {
                    let v = backend.embed(text).await?;
                    if is_zero_vector(&v) {
                        return Err(EmbeddingError::ZeroVector);
                    }
                    Ok(v)
                },
                |e: &EmbeddingError| {
                    let retry = e.is_retryable();
                    if retry {
                        tracing::warn!(error = %e, backend = backend.name(), "Embedding attempt failed, retrying");
                    }
                    retry
                },
            )
            .await;

        result.map_err(|e| {
            let reason = match &e {
                AttemptError::TimedOut(d) => EmbeddingError::Timeout(d.as_millis() as u64).to_string(),
                AttemptError::Failed(inner) => inner.to_string(),
            };
            tracing::error!(
                backend = self.backend.name(),
                attempts = self.policy.max_attempts(),
                reason = %reason,
                "Embedding unavailable"
            );
            EmbeddingError::Unavailable {
                attempts: self.policy.max_attempts(),
                reason,
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::embeddings::{OpenAiEmbeddingClient, OpenAiEmbeddingConfig};

    /// Deterministic backend counting its calls.
    pub(crate) struct CountingBackend {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    #[async_trait]
    impl EmbeddingBackend for CountingBackend {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EmbeddingError::Api {
                    code: 503,
                    message: "unavailable".to_string(),
                });
            }
            let len = text.len() as f32;
            Ok(vec![1.0, len, 0.5])
        }

        fn dimensions(&self) -> usize {
            3
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(
            2,
            Duration::from_millis(1),
            Duration::from_millis(2),
            Duration::from_millis(500),
        )
    }

    fn gateway(backend: Arc<dyn EmbeddingBackend>) -> EmbeddingGateway {
        EmbeddingGateway::with_policy(backend, fast_policy(), EmbeddingCache::new(Duration::from_secs(60), 16))
    }

    #[tokio::test]
    async fn cache_hit_returns_identical_vector_without_second_call() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let gw = gateway(backend.clone());

        let first = gw.embed("Me dejó mi pareja").await.unwrap();
        let second = gw.embed("  me dejó   MI pareja ").await.unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        let a: Vec<u32> = first.iter().map(|f| f.to_bits()).collect();
        let b: Vec<u32> = second.iter().map(|f| f.to_bits()).collect();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_unavailable() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let gw = gateway(backend.clone());

        match gw.embed("hola").await {
            Err(EmbeddingError::Unavailable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Unavailable, got {:?}", other),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(gw.cache_len(), 0);
    }

    struct ZeroBackend;

    #[async_trait]
    impl EmbeddingBackend for ZeroBackend {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![0.0; 3])
        }

        fn dimensions(&self) -> usize {
            3
        }

        fn name(&self) -> &str {
            "zero"
        }
    }

    #[tokio::test]
    async fn zero_vector_is_never_returned() {
        let gw = gateway(Arc::new(ZeroBackend));
        assert!(matches!(
            gw.embed("hola").await,
            Err(EmbeddingError::Unavailable { .. })
        ));
    }

    /// Answers only after the gateway's attempt timeout has passed.
    struct SlowBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingBackend for SlowBackend {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(vec![1.0, 0.0, 0.0])
        }

        fn dimensions(&self) -> usize {
            3
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn attempt_timeouts_surface_unavailable() {
        let backend = Arc::new(SlowBackend {
            calls: AtomicUsize::new(0),
        });
        let gw = EmbeddingGateway::with_policy(
            backend.clone(),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(2), Duration::from_millis(20)),
            EmbeddingCache::new(Duration::from_secs(60), 16),
        );

        let started = std::time::Instant::now();
        match gw.embed("hola").await {
            Err(EmbeddingError::Unavailable { attempts, reason }) => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("20"), "{}", reason);
            }
            other => panic!("expected Unavailable, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(gw.cache_len(), 0);
    }

    fn openai_config(base_url: &str) -> OpenAiEmbeddingConfig {
        OpenAiEmbeddingConfig {
            api_key: "test-key".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 4,
            base_url: base_url.to_string(),
        }
    }

    #[tokio::test]
    async fn rate_limit_then_success_is_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": { "message": "Rate limit reached" }
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "embedding": [0.1, 0.2, 0.3, 0.4] }]
            })))
            .mount(&server)
            .await;

        let client = OpenAiEmbeddingClient::new(openai_config(&server.uri())).unwrap();
        let gw = gateway(Arc::new(client));
        let v = gw.embed("hola").await.unwrap();
        assert_eq!(v.as_slice(), &[0.1, 0.2, 0.3, 0.4]);
    }

    #[tokio::test]
    async fn server_errors_exhaust_into_unavailable() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let client = OpenAiEmbeddingClient::new(openai_config(&server.uri())).unwrap();
        let gw = gateway(Arc::new(client));
        assert!(matches!(
            gw.embed("hola").await,
            Err(EmbeddingError::Unavailable { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "message": "bad input" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiEmbeddingClient::new(openai_config(&server.uri())).unwrap();
        let gw = gateway(Arc::new(client));
        match gw.embed("hola").await {
            Err(EmbeddingError::Unavailable { reason, .. }) => assert!(reason.contains("bad input")),
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }
}
