//! Response synthesis
//!
//! Picks candidate products from the query, asks the completion service for
//! an answer and falls back to a fixed template when that call fails.
//! Synthesis never fails and never returns an empty answer.

pub mod catalog;

pub use catalog::ProductBucket;

use crate::gemini::{CompletionRequest, CompletionService};
use crate::models::{ConversationTurn, FinancialProduct, Recommendation, ToolResult};
use std::sync::Arc;
use tracing::{info, warn};

/// Confidence attached to catalog recommendations
pub const RECOMMENDATION_CONFIDENCE: f32 = 0.88;

const DEFAULT_QUERY: &str = "Please provide investment advice";

#[derive(Debug, Clone)]
pub struct Synthesis {
    pub text: String,
    pub bucket: ProductBucket,
    pub products: Vec<FinancialProduct>,
    pub used_fallback: bool,
}

pub struct ResponseSynthesizer {
    completion: Arc<dyn CompletionService>,
}

impl ResponseSynthesizer {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self { completion }
    }

    pub async fn synthesize(&self, query: &str, history: Option<Vec<ConversationTurn>>) -> Synthesis {
        let bucket = ProductBucket::from_query(query);
        let products = bucket.candidates();

        info!(
            ?bucket,
            candidates = ?products.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            "Selected candidate products"
        );

        let request = CompletionRequest {
            query: if query.trim().is_empty() {
                DEFAULT_QUERY.to_string()
            } else {
                query.to_string()
            },
            products: products.clone(),
            history,
        };

        match self.completion.complete(&request).await {
            Ok(text) if !text.trim().is_empty() => Synthesis {
                text,
                bucket,
                products,
                used_fallback: false,
            },
            Ok(_) => {
                warn!("Completion service returned an empty answer, using template");
                fallback(bucket, products)
            }
            Err(e) => {
                warn!(error = %e, "Completion service failed, using template");
                fallback(bucket, products)
            }
        }
    }
}

fn fallback(bucket: ProductBucket, products: Vec<FinancialProduct>) -> Synthesis {
    Synthesis {
        text: bucket.fallback_response(&products),
        bucket,
        products,
        used_fallback: true,
    }
}

pub fn recommendations_from_products(products: &[FinancialProduct]) -> Vec<Recommendation> {
    products
        .iter()
        .map(|p| Recommendation {
            product_id: p.product_id.clone(),
            name: p.name.clone(),
            risk_level: p.risk_level.to_string(),
            expected_return: p.expected_return.clone(),
            confidence: RECOMMENDATION_CONFIDENCE,
        })
        .collect()
}

/// Recommendations taken straight from retrieval output, used when there is
/// no query text to bucket. Falls back to the balanced fund.
pub fn recommendations_from_results(results: &[ToolResult]) -> Vec<Recommendation> {
    let recommendations: Vec<Recommendation> = results
        .iter()
        .flat_map(|r| r.results.iter())
        .map(|record| Recommendation {
            product_id: record.product_id.clone(),
            name: record.name.clone(),
            risk_level: record.risk_level.clone(),
            expected_return: record.expected_return.clone(),
            confidence: if record.confidence > 0.0 {
                record.confidence
            } else {
                RECOMMENDATION_CONFIDENCE
            },
        })
        .collect();

    if recommendations.is_empty() {
        recommendations_from_products(&[catalog::balanced_fund()])
    } else {
        recommendations
    }
}
