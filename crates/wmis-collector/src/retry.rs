//! Bounded retry around capability calls. The collection engine and the
//! pipeline never retry on their own; wrap an adapter here instead.

use std::thread;
use std::time::Duration;
use tracing::warn;
use wmis_core::{
    ExtractionError, MessagePage, MessageSource, RawMessage, SourceError, StructuredExtractor,
    TradeCandidate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    pub fn none() -> Self {
        Self::new(0, 0)
    }

    fn run<T, E, F, R>(&self, operation: &str, mut call: F, retryable: R) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Result<T, E>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && retryable(&err) => {
                    attempt += 1;
                    warn!(
                        event = "capability_retry",
                        operation = operation,
                        attempt = attempt,
                        max_retries = self.max_retries,
                        error = %err
                    );
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

pub struct RetryingSource<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingSource<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: MessageSource> MessageSource for RetryingSource<S> {
    fn exists(&self) -> bool {
        self.inner.exists()
    }

    // A conversation that is not there will not appear on retry.
    fn fetch_next_page(
        &mut self,
        conversation_id: &str,
        page_index: u32,
    ) -> Result<MessagePage, SourceError> {
        let inner = &mut self.inner;
        self.policy.run(
            "fetch_next_page",
            || inner.fetch_next_page(conversation_id, page_index),
            |err| !matches!(err, SourceError::ConversationNotFound(_)),
        )
    }
}

pub struct RetryingExtractor<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E> RetryingExtractor<E> {
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<E: StructuredExtractor> StructuredExtractor for RetryingExtractor<E> {
    fn extract(&self, batch: &[RawMessage]) -> Result<Vec<TradeCandidate>, ExtractionError> {
        self.policy
            .run("extract", || self.inner.extract(batch), |_| true)
    }
}
