//! Product catalog and keyword buckets
//!
//! Candidate products are picked from the raw query text alone, never from
//! what the retrieval tools returned.

use crate::models::{FinancialProduct, RiskLevel};
use serde::Serialize;

const LISTING_KEYWORDS: &[&str] = &[
    "list every",
    "list all",
    "every",
    "all products",
    "show all",
    "all yuanta",
];

const GROWTH_KEYWORDS: &[&str] = &[
    "high risk",
    "high-risk",
    "aggressive",
    "growth",
    "high return",
    "high yield",
];

const PRESERVATION_KEYWORDS: &[&str] = &["low risk", "low-risk", "conservative", "stable", "safe"];

const DIVERSIFIED_KEYWORDS: &[&str] = &["etf", "index", "diversified"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductBucket {
    Listing,
    Growth,
    Preservation,
    Diversified,
    Balanced,
}

impl ProductBucket {
    /// First matching bucket wins; listing requests are checked before anything else
    pub fn from_query(query: &str) -> Self {
        let query = query.to_lowercase();
        let matches = |keywords: &[&str]| keywords.iter().any(|kw| query.contains(kw));

        if matches(LISTING_KEYWORDS) {
            ProductBucket::Listing
        } else if matches(GROWTH_KEYWORDS) {
            ProductBucket::Growth
        } else if matches(PRESERVATION_KEYWORDS) {
            ProductBucket::Preservation
        } else if matches(DIVERSIFIED_KEYWORDS) {
            ProductBucket::Diversified
        } else {
            ProductBucket::Balanced
        }
    }

    pub fn candidates(&self) -> Vec<FinancialProduct> {
        match self {
            ProductBucket::Listing => all_products(),
            ProductBucket::Growth => vec![growth_fund()],
            ProductBucket::Preservation => vec![conservative_fund()],
            ProductBucket::Diversified => vec![etf_index_fund()],
            ProductBucket::Balanced => vec![balanced_fund()],
        }
    }

    /// Templated answer used when the completion service is unavailable
    pub fn fallback_response(&self, products: &[FinancialProduct]) -> String {
        let Some(first) = products.first() else {
            return "I apologize, but I don't have any suitable products to recommend at this time."
                .to_string();
        };

        match self {
            ProductBucket::Growth => format!(
                "For growth-oriented investors, I recommend the {}. This fund targets {} returns but comes with higher volatility, suitable for investors with a longer time horizon.",
                first.name, first.expected_return
            ),
            ProductBucket::Preservation => format!(
                "Based on your query, I recommend the {}. This fund offers stable returns of {} with minimal volatility, making it ideal for conservative investors seeking steady growth.",
                first.name, first.expected_return
            ),
            ProductBucket::Diversified => format!(
                "For ETF investments, I recommend the {}. This diversified ETF tracks major market indices and offers {} returns with moderate risk.",
                first.name, first.expected_return
            ),
            ProductBucket::Balanced => format!(
                "I recommend the {} for a well-diversified portfolio. This fund offers {} returns with moderate risk, suitable for most investors.",
                first.name, first.expected_return
            ),
            ProductBucket::Listing => {
                let lines: Vec<String> = products
                    .iter()
                    .map(|p| format!("{} ({} risk, {} expected return)", p.name, p.risk_level, p.expected_return))
                    .collect();
                format!("Here are all of our available products: {}.", lines.join("; "))
            }
        }
    }
}

const ISSUER: &str = "Yuanta Securities";

pub fn conservative_fund() -> FinancialProduct {
    FinancialProduct {
        product_id: "PROD_001".to_string(),
        name: "Yuanta Conservative Fund".to_string(),
        product_type: "mutual_fund".to_string(),
        risk_level: RiskLevel::Low,
        description: "Conservative fund with stable returns and low volatility".to_string(),
        issuer: ISSUER.to_string(),
        expected_return: "4-6%".to_string(),
        volatility: 0.03,
        sharpe_ratio: 0.9,
        minimum_investment: 1000.0,
        expense_ratio: 0.008,
        tags: tags(&["conservative", "stable", "low-risk"]),
    }
}

pub fn growth_fund() -> FinancialProduct {
    FinancialProduct {
        product_id: "PROD_002".to_string(),
        name: "Yuanta Growth Fund".to_string(),
        product_type: "mutual_fund".to_string(),
        risk_level: RiskLevel::High,
        description: "High-growth fund with potential for significant returns".to_string(),
        issuer: ISSUER.to_string(),
        expected_return: "12-18%".to_string(),
        volatility: 0.15,
        sharpe_ratio: 1.2,
        minimum_investment: 5000.0,
        expense_ratio: 0.015,
        tags: tags(&["growth", "high-risk", "equity"]),
    }
}

pub fn etf_index_fund() -> FinancialProduct {
    FinancialProduct {
        product_id: "PROD_003".to_string(),
        name: "Yuanta ETF Index Fund".to_string(),
        product_type: "etf".to_string(),
        risk_level: RiskLevel::Medium,
        description: "Diversified ETF tracking major market indices".to_string(),
        issuer: ISSUER.to_string(),
        expected_return: "8-12%".to_string(),
        volatility: 0.08,
        sharpe_ratio: 1.0,
        minimum_investment: 500.0,
        expense_ratio: 0.005,
        tags: tags(&["etf", "diversified", "index"]),
    }
}

pub fn balanced_fund() -> FinancialProduct {
    FinancialProduct {
        product_id: "PROD_004".to_string(),
        name: "Yuanta Balanced Fund".to_string(),
        product_type: "mutual_fund".to_string(),
        risk_level: RiskLevel::Medium,
        description: "Balanced fund with moderate risk and steady returns".to_string(),
        issuer: ISSUER.to_string(),
        expected_return: "8-12%".to_string(),
        volatility: 0.06,
        sharpe_ratio: 1.1,
        minimum_investment: 2000.0,
        expense_ratio: 0.012,
        tags: tags(&["balanced", "moderate", "diversified"]),
    }
}

pub fn all_products() -> Vec<FinancialProduct> {
    vec![
        conservative_fund(),
        growth_fund(),
        etf_index_fund(),
        balanced_fund(),
    ]
}

fn tags(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_priority() {
        let cases = vec![
            ("I want a high-risk growth investment", ProductBucket::Growth),
            ("something safe and stable", ProductBucket::Preservation),
            ("an ETF please", ProductBucket::Diversified),
            ("what should I do with my bonus?", ProductBucket::Balanced),
            ("list all growth funds", ProductBucket::Listing),
            ("high yield but conservative", ProductBucket::Growth),
            ("", ProductBucket::Balanced),
        ];

        for (query, expected) in cases {
            assert_eq!(ProductBucket::from_query(query), expected, "{}", query);
        }
    }

    #[test]
    fn test_candidates() {
        assert_eq!(ProductBucket::Listing.candidates().len(), 4);
        assert_eq!(ProductBucket::Growth.candidates()[0].product_id, "PROD_002");
        assert_eq!(ProductBucket::Preservation.candidates()[0].risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_fallback_never_empty() {
        for bucket in [
            ProductBucket::Listing,
            ProductBucket::Growth,
            ProductBucket::Preservation,
            ProductBucket::Diversified,
            ProductBucket::Balanced,
        ] {
            assert!(!bucket.fallback_response(&bucket.candidates()).is_empty());
            assert!(!bucket.fallback_response(&[]).is_empty());
        }
    }

    #[test]
    fn test_listing_fallback_names_every_product() {
        let text = ProductBucket::Listing.fallback_response(&all_products());
        for product in all_products() {
            assert!(text.contains(&product.name));
        }
    }
}
