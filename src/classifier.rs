//! Intent Classifier
//!
//! Maps a free-text financial query onto one of a fixed set of intents:
//! - Growth: high-risk / aggressive / return-seeking queries
//! - Preservation: low-risk / conservative queries
//! - Diversification: ETF / index queries
//! - Listing: "show me everything" queries
//! - General advice: everything else

use crate::models::{IntentLabel, IntentResult, RiskLevel};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Map};

/// Intent classification collaborator
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<IntentResult>;
}

/// Static keyword lists, checked in priority order
const GROWTH_KEYWORDS: &[&str] = &["high risk", "high-risk", "aggressive", "growth", "high return"];

const PRESERVATION_KEYWORDS: &[&str] = &["low risk", "low-risk", "conservative", "stable", "safe"];

const DIVERSIFICATION_KEYWORDS: &[&str] = &["etf", "index", "diversified"];

const LISTING_KEYWORDS: &[&str] = &["list", "all", "every", "show"];

const KEYWORD_CONFIDENCE: f32 = 0.8;

/// Deterministic keyword classifier.
///
/// Used by default; LLM classifiers tend to read "high risk" as a
/// risk-management question rather than a growth request.
pub struct KeywordIntentClassifier;

impl KeywordIntentClassifier {
    pub fn classify_text(text: &str) -> IntentResult {
        let query = text.to_lowercase();
        let matches = |keywords: &[&str]| keywords.iter().any(|kw| query.contains(kw));

        let (label, reasoning) = if matches(GROWTH_KEYWORDS) {
            (
                IntentLabel::GrowthInvestment,
                "Query contains high-risk or growth keywords",
            )
        } else if matches(PRESERVATION_KEYWORDS) {
            (
                IntentLabel::CapitalPreservation,
                "Query contains low-risk or conservative keywords",
            )
        } else if matches(DIVERSIFICATION_KEYWORDS) {
            (
                IntentLabel::Diversification,
                "Query contains ETF or diversification keywords",
            )
        } else if matches(LISTING_KEYWORDS) {
            (IntentLabel::ProductListing, "Query requests product listing")
        } else {
            (IntentLabel::GeneralAdvice, "General investment advice query")
        };

        IntentResult {
            label,
            confidence: KEYWORD_CONFIDENCE,
            entities: entities_for(label),
            reasoning: reasoning.to_string(),
        }
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(&self, text: &str) -> Result<IntentResult> {
        Ok(Self::classify_text(text))
    }
}

/// Risk level implied by an intent
pub fn risk_level_for(label: IntentLabel) -> RiskLevel {
    match label {
        IntentLabel::GrowthInvestment => RiskLevel::High,
        IntentLabel::CapitalPreservation => RiskLevel::Low,
        _ => RiskLevel::Medium,
    }
}

pub fn entities_for(label: IntentLabel) -> Map<String, serde_json::Value> {
    let mut entities = Map::new();
    entities.insert("risk_level".into(), json!(risk_level_for(label).to_string()));
    entities.insert("investment_type".into(), json!("general"));
    entities
}

/// Intent used when the classifier collaborator is unavailable
pub fn fallback_intent(reason: &str) -> IntentResult {
    IntentResult {
        label: IntentLabel::GeneralAdvice,
        confidence: 0.5,
        entities: entities_for(IntentLabel::GeneralAdvice),
        reasoning: format!("Classifier unavailable: {}", reason),
    }
}
