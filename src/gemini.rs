//! Completion service and its Gemini-backed implementation
//!
//! The response stage hands the query, the candidate products and any
//! recent conversation history to a [`CompletionService`]. Uses a
//! long-lived reqwest::Client for connection pooling.

use crate::error::PipelineError;
use crate::models::{ConversationTurn, FinancialProduct, MessageRole};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub query: String,
    pub products: Vec<FinancialProduct>,
    pub history: Option<Vec<ConversationTurn>>,
}

/// Text completion collaborator
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".to_string(),
        })
    }

    /// Generate a recommendation answer from Gemini
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(PipelineError::LlmError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.base_url, self.api_key);

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.7,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 1024,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: SYSTEM_PROMPT.to_string(),
                }],
            },
        };

        info!("Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                PipelineError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(PipelineError::LlmError(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            PipelineError::LlmError(format!("Gemini parse error: {}", e))
        })?;

        let answer = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.trim().to_string())
            .unwrap_or_default();

        if answer.is_empty() {
            return Err(PipelineError::LlmError(
                "Empty response from Gemini".to_string(),
            ));
        }

        info!(chars = answer.len(), "Gemini response received");
        Ok(answer)
    }
}

#[async_trait]
impl CompletionService for GeminiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let prompt = build_prompt(request);
        self.generate(&prompt).await
    }
}

const SYSTEM_PROMPT: &str = r#"You are a professional financial product advisor.

Guidelines:
- Recommend only from the candidate products you are given
- Explain risk and expected return for each recommendation
- Be structured and concise
- Never promise returns; emphasize risk awareness

Format: A short, friendly recommendation suitable for a chat reply."#;

/// Build the user prompt from query, candidates and history
pub fn build_prompt(request: &CompletionRequest) -> String {
    let mut prompt = String::new();

    if let Some(history) = request.history.as_ref().filter(|h| !h.is_empty()) {
        prompt.push_str("Recent conversation:\n");
        for turn in history {
            let role = match turn.role {
                MessageRole::User => "User",
                MessageRole::Assistant => "Advisor",
            };
            prompt.push_str(&format!("{}: {}\n", role, turn.content));
        }
        prompt.push('\n');
    }

    prompt.push_str("Candidate products:\n");
    for product in &request.products {
        prompt.push_str(&format!(
            "- {} ({}, {} risk, expected return {}): {}\n",
            product.name,
            product.product_type,
            product.risk_level,
            product.expected_return,
            product.description
        ));
    }

    prompt.push_str(&format!("\nUser query: {}", request.query));
    prompt
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::catalog;

    #[test]
    fn test_prompt_includes_history_candidates_and_query() {
        let request = CompletionRequest {
            query: "I want growth".to_string(),
            products: vec![catalog::growth_fund()],
            history: Some(vec![
                ConversationTurn::new(MessageRole::User, "hello"),
                ConversationTurn::new(MessageRole::Assistant, "hi there"),
            ]),
        };

        let prompt = build_prompt(&request);
        assert!(prompt.starts_with("Recent conversation:\nUser: hello\nAdvisor: hi there\n"));
        assert!(prompt.contains("Yuanta Growth Fund (mutual_fund, high risk, expected return 12-18%)"));
        assert!(prompt.ends_with("User query: I want growth"));
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_fast() {
        let client = GeminiClient::new(String::new()).unwrap();
        let request = CompletionRequest {
            query: "anything".to_string(),
            products: vec![],
            history: None,
        };
        let err = client.complete(&request).await.unwrap_err();
        assert!(matches!(err, PipelineError::LlmError(_)));
    }

    #[test]
    fn test_response_parsing_tolerates_missing_candidates() {
        let parsed: GeminiResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.candidates.is_empty());
    }
}
