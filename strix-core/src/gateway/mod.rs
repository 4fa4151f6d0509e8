//! LLM gateway: bounded-concurrency, rate-limited, retrying request queue
//!
//! All model traffic for a scan flows through one gateway. The semaphore
//! bounds in-flight requests, acquisition order gives FIFO fairness across
//! callers, and a configurable gap is inserted between submissions. Transient
//! provider failures are retried with exponential backoff while the permit is
//! held; cancellation aborts queued and in-flight requests alike.

mod parse;
mod provider;
mod quirks;
mod retry;
mod rig;
mod stats;

pub use parse::{parse_tool_invocations, truncate_after_last_function};
pub use provider::{
    CompletionRequest, CompletionResponse, LlmProvider, TokenUsage, WireMessage, WireRole,
};
pub use quirks::IMAGE_REMOVED_PLACEHOLDER;
pub use retry::{build_backoff, RetryConfig};
pub use rig::{create_provider, AnthropicProvider, OpenAiCompatProvider};
pub use stats::{RequestStats, UsageCounters, UsageSnapshot};

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LlmSettings;
use crate::pricing::PricingConfig;
use crate::tools::ToolInvocation;
use crate::{Error, Result};

const SUMMARIZATION_PROMPT: &str = "You compress security-testing agent \
conversations. Summarise the following messages into a dense factual digest: \
targets touched, tools run, findings, and open leads. Keep identifiers and \
URLs exact. Respond with the summary only.";

/// Parsed result of one gateway round trip
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub content: String,
    pub tool_invocations: Vec<ToolInvocation>,
    pub stats: RequestStats,
}

/// Process-wide request queue in front of the model endpoint
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    model: String,
    semaphore: Arc<Semaphore>,
    submit_gap: Duration,
    last_submit: Mutex<Option<Instant>>,
    request_timeout: Duration,
    retry: RetryConfig,
    counters: UsageCounters,
    cancel: CancellationToken,
}

impl LlmGateway {
    pub fn new(
        settings: &LlmSettings,
        provider: Arc<dyn LlmProvider>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            model: settings.model.clone(),
            semaphore: Arc::new(Semaphore::new(settings.rate_limit_concurrent.max(1))),
            submit_gap: settings.rate_limit_delay,
            last_submit: Mutex::new(None),
            request_timeout: settings.timeout,
            retry: RetryConfig::default(),
            counters: UsageCounters::new(),
            cancel,
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn counters(&self) -> &UsageCounters {
        &self.counters
    }

    /// Request the next assistant message for a conversation.
    ///
    /// Shapes the request for the configured model, waits for a queue slot,
    /// retries transient failures, and parses tool invocations out of the
    /// returned content.
    pub async fn generate(
        &self,
        system: Option<String>,
        mut messages: Vec<WireMessage>,
    ) -> Result<GatewayResponse> {
        if !quirks::supports_vision(&self.model) {
            quirks::strip_images(&mut messages);
        }
        quirks::mark_cache_breakpoints(&self.model, &mut messages);

        let mut request = CompletionRequest::new(messages);
        request.system = system;
        if quirks::supports_stop_words(&self.model) {
            request.stop = vec!["</function>".to_string()];
        }
        request.reasoning_effort = quirks::reasoning_effort(&self.model);

        let response = self.submit(request).await?;

        let cost = PricingConfig::load().calculate_cost(
            &self.model,
            response.usage.input_tokens,
            response.usage.cache_read_tokens,
            response.usage.output_tokens,
        );
        self.counters.record(&response.usage, cost);
        let stats = RequestStats::from_usage(&response.usage, cost);

        let content = truncate_after_last_function(&response.content).to_string();
        let tool_invocations = parse_tool_invocations(&content);

        Ok(GatewayResponse {
            content,
            tool_invocations,
            stats,
        })
    }

    /// Summarise a block of conversation text for the memory compressor.
    pub async fn summarize(&self, text: &str) -> Result<String> {
        let request = CompletionRequest::new(vec![WireMessage::user(text)])
            .with_system(SUMMARIZATION_PROMPT);
        let response = self.submit(request).await?;

        let cost = PricingConfig::load().calculate_cost(
            &self.model,
            response.usage.input_tokens,
            response.usage.cache_read_tokens,
            response.usage.output_tokens,
        );
        self.counters.record(&response.usage, cost);

        Ok(response.content.trim().to_string())
    }

    /// Queue one request: FIFO permit, submission gap, per-request timeout,
    /// retries with backoff. The permit is held across retries so bounded
    /// concurrency holds at every instant.
    async fn submit(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.semaphore.acquire() => {
                permit.map_err(|_| Error::Cancelled)?
            }
        };

        if !self.submit_gap.is_zero() {
            let mut last = self.last_submit.lock().await;
            if let Some(previous) = *last {
                let elapsed = previous.elapsed();
                if elapsed < self.submit_gap {
                    tokio::time::sleep(self.submit_gap - elapsed).await;
                }
            }
            *last = Some(Instant::now());
        }

        use backon::BackoffBuilder;
        let mut delays = retry::build_backoff(&self.retry).build();

        loop {
            let attempt = self.provider.complete(request.clone());
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                result = tokio::time::timeout(self.request_timeout, attempt) => result,
            };

            let message = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(error)) => error.to_string(),
                Err(_) => format!(
                    "request timed out after {} seconds",
                    self.request_timeout.as_secs()
                ),
            };

            self.counters.record_failure();

            if !retry::is_retriable_error(&message) {
                return Err(Error::LlmFatal(message));
            }

            let typed = if retry::is_rate_limit_error(&message) {
                Error::LlmRateLimited(message.clone())
            } else {
                Error::LlmFatal(message.clone())
            };

            match delays.next() {
                Some(delay) => {
                    warn!(error = %typed, ?delay, "Retrying LLM request");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    debug!("LLM retry budget exhausted");
                    return Err(Error::LlmFatal(message));
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn test_settings(concurrent: usize) -> LlmSettings {
        LlmSettings {
            model: "anthropic/claude-4-sonnet".to_string(),
            api_key: "test".to_string(),
            api_base: None,
            timeout: Duration::from_secs(5),
            rate_limit_delay: Duration::ZERO,
            rate_limit_concurrent: concurrent,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: false,
        }
    }

    /// Provider that records overlap and start order
    struct ObservingProvider {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        start_order: StdMutex<Vec<String>>,
        hold: Duration,
    }

    impl ObservingProvider {
        fn new(hold: Duration) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                start_order: StdMutex::new(Vec::new()),
                hold,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ObservingProvider {
        fn name(&self) -> &str {
            "observing"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            self.start_order
                .lock()
                .unwrap()
                .push(request.messages[0].text.clone());

            tokio::time::sleep(self.hold).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(CompletionResponse {
                content: format!("reply to {}", request.messages[0].text),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
            })
        }
    }

    /// Provider that fails a configurable number of times before succeeding
    struct FlakyProvider {
        failures_left: AtomicUsize,
        error_message: String,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::LlmFatal(self.error_message.clone()));
            }
            Ok(CompletionResponse {
                content: "ok".to_string(),
                usage: TokenUsage::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_bounded_concurrency_and_fifo() {
        let provider = Arc::new(ObservingProvider::new(Duration::from_millis(30)));
        let gateway = Arc::new(LlmGateway::new(
            &test_settings(2),
            provider.clone(),
            CancellationToken::new(),
        ));

        let mut handles = Vec::new();
        for i in 0..5 {
            let gateway = Arc::clone(&gateway);
            handles.push(tokio::spawn(async move {
                gateway
                    .generate(None, vec![WireMessage::user(format!("req-{i}"))])
                    .await
            }));
            // Stagger spawns so queue order is deterministic
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);

        let order = provider.start_order.lock().unwrap().clone();
        let expected: Vec<String> = (0..5).map(|i| format!("req-{i}")).collect();
        assert_eq!(order, expected, "FIFO order preserved");
    }

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let provider = Arc::new(FlakyProvider {
            failures_left: AtomicUsize::new(2),
            error_message: "503 service unavailable".to_string(),
            attempts: AtomicUsize::new(0),
        });
        let gateway = LlmGateway::new(
            &test_settings(1),
            provider.clone(),
            CancellationToken::new(),
        )
        .with_retry_config(fast_retry());

        let response = gateway
            .generate(None, vec![WireMessage::user("hello")])
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(gateway.counters().snapshot().failed_requests, 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let provider = Arc::new(FlakyProvider {
            failures_left: AtomicUsize::new(usize::MAX),
            error_message: "401 Unauthorized".to_string(),
            attempts: AtomicUsize::new(0),
        });
        let gateway = LlmGateway::new(
            &test_settings(1),
            provider.clone(),
            CancellationToken::new(),
        )
        .with_retry_config(fast_retry());

        let error = gateway
            .generate(None, vec![WireMessage::user("hello")])
            .await
            .unwrap_err();
        assert!(matches!(error, Error::LlmFatal(_)));
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_is_fatal() {
        let provider = Arc::new(FlakyProvider {
            failures_left: AtomicUsize::new(usize::MAX),
            error_message: "429 rate limit".to_string(),
            attempts: AtomicUsize::new(0),
        });
        let gateway = LlmGateway::new(
            &test_settings(1),
            provider.clone(),
            CancellationToken::new(),
        )
        .with_retry_config(fast_retry());

        let error = gateway
            .generate(None, vec![WireMessage::user("hello")])
            .await
            .unwrap_err();
        assert!(matches!(error, Error::LlmFatal(_)));
        // initial attempt + 3 retries
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_queued_requests() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let provider = Arc::new(ObservingProvider::new(Duration::from_millis(10)));
        let gateway = LlmGateway::new(&test_settings(1), provider, cancel);

        let error = gateway
            .generate(None, vec![WireMessage::user("hello")])
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Cancelled));
    }

    struct ToolCallingProvider;

    #[async_trait]
    impl LlmProvider for ToolCallingProvider {
        fn name(&self) -> &str {
            "tool-calling"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse {
                content: "Checking.\n<function=terminal_execute>\n\
                          <parameter=command>id</parameter>\n</function>\nstray text"
                    .to_string(),
                usage: TokenUsage::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_generate_parses_and_truncates() {
        let gateway = LlmGateway::new(
            &test_settings(1),
            Arc::new(ToolCallingProvider),
            CancellationToken::new(),
        );

        let response = gateway
            .generate(None, vec![WireMessage::user("go")])
            .await
            .unwrap();
        assert_eq!(response.tool_invocations.len(), 1);
        assert_eq!(response.tool_invocations[0].name, "terminal_execute");
        assert!(response.content.ends_with("</function>"));
    }

    #[tokio::test]
    async fn test_usage_accounting() {
        let provider = Arc::new(ObservingProvider::new(Duration::from_millis(1)));
        let gateway = LlmGateway::new(&test_settings(1), provider, CancellationToken::new());

        let response = gateway
            .generate(None, vec![WireMessage::user("count me")])
            .await
            .unwrap();
        assert_eq!(response.stats.input_tokens, 10);
        assert_eq!(response.stats.output_tokens, 5);
        assert_eq!(response.stats.requests, 1);

        let snapshot = gateway.counters().snapshot();
        assert_eq!(snapshot.input_tokens, 10);
        assert!(snapshot.cost > 0.0);
    }
}
