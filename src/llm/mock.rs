//! Mock provider for tests and offline development.
//!
//! Returns canned envelope replies keyed on input patterns, and can
//! simulate transient failures and provider rejections for router tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{AskError, Result};
use crate::llm::{Completion, Message, ProviderClient, Role};

/// Mock LLM provider.
#[derive(Debug, Default)]
pub struct MockProvider {
    /// Custom response mappings (pattern -> response).
    custom_responses: Vec<(String, String)>,
    /// Fail this many calls with *ModelUnavailable* before succeeding.
    fail_first: AtomicU32,
    /// Always fail with *ModelRejected*.
    always_reject: bool,
}

impl MockProvider {
    /// Creates a mock with the default canned responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a custom response returned when the input contains `pattern`.
    pub fn with_response(mut self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.custom_responses.push((pattern.into(), response.into()));
        self
    }

    /// Makes the first `n` calls fail as transient.
    pub fn failing_first(self, n: u32) -> Self {
        self.fail_first.store(n, Ordering::Relaxed);
        self
    }

    /// Makes every call fail as a provider rejection.
    pub fn rejecting(mut self) -> Self {
        self.always_reject = true;
        self
    }

    fn mock_response(&self, input: &str) -> String {
        let input_lower = input.to_lowercase();

        for (pattern, response) in &self.custom_responses {
            if input_lower.contains(&pattern.to_lowercase()) {
                return response.clone();
            }
        }

        if input_lower.contains("region") || input.contains("地区") {
            return envelope(
                "SELECT region, SUM(amount) AS total_amount FROM orders \
                 GROUP BY region ORDER BY total_amount DESC LIMIT 5",
                "Top regions by total amount",
                "bar",
            );
        }

        if input_lower.contains("count") || input.contains("数") {
            return envelope("SELECT COUNT(*) AS cnt FROM orders", "Order count", "table");
        }

        if input_lower.contains("trend") || input.contains("趋势") {
            return envelope(
                "SELECT order_date, SUM(amount) AS total_amount FROM orders \
                 GROUP BY order_date ORDER BY order_date",
                "Daily amount trend",
                "line",
            );
        }

        "I don't understand that question. Could you please rephrase it?".to_string()
    }

    fn extract_user_input(messages: &[Message]) -> String {
        messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

/// Builds the fenced JSON envelope the composer's output contract asks for.
fn envelope(sql: &str, explanation: &str, chart_kind: &str) -> String {
    let body = serde_json::json!({
        "sql": sql,
        "explanation": explanation,
        "chartKind": chart_kind,
    });
    format!("```json\n{body}\n```")
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn complete(&self, messages: &[Message]) -> Result<Completion> {
        if self.always_reject {
            return Err(AskError::ModelRejected("mock rejection".to_string()));
        }

        let remaining = self.fail_first.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::Relaxed);
            return Err(AskError::ModelUnavailable(
                "mock transient failure".to_string(),
            ));
        }

        let input = Self::extract_user_input(messages);
        Ok(Completion {
            text: self.mock_response(&input),
            tokens_used: Some(42),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_region_question_returns_envelope() {
        let provider = MockProvider::new();
        let completion = provider
            .complete(&[Message::user("本月各地区销售额前五")])
            .await
            .unwrap();
        assert!(completion.text.contains("```json"));
        assert!(completion.text.contains("GROUP BY region"));
        assert_eq!(completion.tokens_used, Some(42));
    }

    #[tokio::test]
    async fn test_custom_response_wins() {
        let provider = MockProvider::new()
            .with_response("special", "```json\n{\"sql\": \"SELECT 9\"}\n```");
        let completion = provider
            .complete(&[Message::user("run the special one")])
            .await
            .unwrap();
        assert!(completion.text.contains("SELECT 9"));
    }

    #[tokio::test]
    async fn test_failing_first_then_succeeds() {
        let provider = MockProvider::new().failing_first(2);

        for _ in 0..2 {
            let err = provider.complete(&[Message::user("count")]).await.unwrap_err();
            assert!(matches!(err, AskError::ModelUnavailable(_)));
        }
        assert!(provider.complete(&[Message::user("count")]).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejecting_always_fails() {
        let provider = MockProvider::new().rejecting();
        let err = provider.complete(&[Message::user("count")]).await.unwrap_err();
        assert!(matches!(err, AskError::ModelRejected(_)));
    }

    #[tokio::test]
    async fn test_unknown_question_is_prose() {
        let provider = MockProvider::new();
        let completion = provider
            .complete(&[Message::user("what is the meaning of life?")])
            .await
            .unwrap();
        assert!(!completion.text.contains("```"));
    }
}
