//! Retrieval tool trait and registry
//!
//! Each tool answers one retrieval request with a [`ToolResult`].
//! Catalog-backed tools are used by default; HTTP-backed tools call a
//! retrieval service when `RETRIEVAL_API_BASE_URL` is configured.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{ProductRecord, SelectedTool, ToolResult};
use crate::Result;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub const STRUCTURED_DB_SEARCH: &str = "structured_db_search";
pub const VECTOR_SEARCH: &str = "vector_search";
pub const GRAPHRAG_SEARCH: &str = "graphrag_search";

/// Trait for a single retrieval tool
#[async_trait::async_trait]
pub trait RetrievalTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &'static str;
    async fn retrieve(&self, parameters: &Value) -> Result<ToolResult>;
}

/// Tool registry for looking up retrieval tools by name
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn RetrievalTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn RetrievalTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RetrievalTool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed scatter policy: structured lookup, similarity search, relationship search
pub fn select_tools(risk_level: &str, query: &str) -> Vec<SelectedTool> {
    vec![
        SelectedTool {
            name: STRUCTURED_DB_SEARCH.to_string(),
            priority: 1,
            parameters: json!({
                "risk_level": risk_level,
                "product_category": "investment",
            }),
        },
        SelectedTool {
            name: VECTOR_SEARCH.to_string(),
            priority: 2,
            parameters: json!({
                "query": query,
                "limit": 10,
            }),
        },
        SelectedTool {
            name: GRAPHRAG_SEARCH.to_string(),
            priority: 3,
            parameters: json!({
                "query": query,
                "depth": 2,
            }),
        },
    ]
}

/// Degraded result used when a tool call fails or times out
pub fn degraded_result(tool_name: &str, error: &str, elapsed: Duration) -> ToolResult {
    let mut metadata = Map::new();
    metadata.insert("error".into(), json!(error));
    metadata.insert("result_count".into(), json!(0));

    ToolResult {
        source: tool_name.to_string(),
        results: vec![],
        metadata,
        confidence: 0.0,
        processing_time: elapsed.as_secs_f64(),
    }
}

//
// ================= Catalog-backed tools =================
//

/// Serves a single fixed catalog record, standing in for a real data source
pub struct CatalogTool {
    tool_name: &'static str,
    tool_description: &'static str,
    record: ProductRecord,
    query_time: f64,
}

impl CatalogTool {
    pub fn structured_lookup() -> Self {
        Self {
            tool_name: STRUCTURED_DB_SEARCH,
            tool_description: "Structured product lookup by risk level and category",
            record: ProductRecord {
                product_id: "PROD_001".to_string(),
                name: "Yuanta Conservative Fund".to_string(),
                risk_level: "low".to_string(),
                expected_return: "4-6%".to_string(),
                description: "Conservative fund with stable returns".to_string(),
                confidence: 0.92,
            },
            query_time: 0.15,
        }
    }

    pub fn vector_search() -> Self {
        Self {
            tool_name: VECTOR_SEARCH,
            tool_description: "Semantic similarity search over product descriptions",
            record: ProductRecord {
                product_id: "PROD_002".to_string(),
                name: "Yuanta Growth Fund".to_string(),
                risk_level: "high".to_string(),
                expected_return: "12-18%".to_string(),
                description: "High-growth fund with potential for significant returns"
                    .to_string(),
                confidence: 0.88,
            },
            query_time: 0.25,
        }
    }

    pub fn graph_search() -> Self {
        Self {
            tool_name: GRAPHRAG_SEARCH,
            tool_description: "Relationship search across the product graph",
            record: ProductRecord {
                product_id: "PROD_003".to_string(),
                name: "Yuanta ETF Index Fund".to_string(),
                risk_level: "medium".to_string(),
                expected_return: "8-12%".to_string(),
                description: "Diversified ETF tracking major market indices".to_string(),
                confidence: 0.85,
            },
            query_time: 0.35,
        }
    }
}

#[async_trait::async_trait]
impl RetrievalTool for CatalogTool {
    fn name(&self) -> &str {
        self.tool_name
    }

    fn description(&self) -> &'static str {
        self.tool_description
    }

    async fn retrieve(&self, parameters: &Value) -> Result<ToolResult> {
        if !parameters.is_object() && !parameters.is_null() {
            return Err(PipelineError::RetrievalError(
                "tool parameters must be a JSON object".to_string(),
            ));
        }

        debug!(tool = self.tool_name, ?parameters, "Catalog retrieval");

        let mut metadata = Map::new();
        metadata.insert("query_time".into(), json!(self.query_time));
        metadata.insert("result_count".into(), json!(1));

        Ok(ToolResult {
            source: self.tool_name.to_string(),
            results: vec![self.record.clone()],
            metadata,
            confidence: self.record.confidence,
            processing_time: self.query_time,
        })
    }
}

//
// ================= HTTP-backed tools =================
//

#[derive(Clone)]
struct RetrievalApiClient {
    client: Client,
    base_url: String,
}

impl RetrievalApiClient {
    fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                PipelineError::RetrievalError(format!(
                    "Retrieval API request failed for {}: {}",
                    path, e
                ))
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| PipelineError::RetrievalError(format!("Invalid JSON response: {}", e)))?;

        if !status.is_success() {
            return Err(PipelineError::RetrievalError(format!(
                "Retrieval API returned {} for {}: {}",
                status, path, body
            )));
        }

        Ok(body)
    }
}

/// Retrieval tool backed by `POST {base}/api/v1/retrieval/{tool}`
pub struct HttpRetrievalTool {
    tool_name: &'static str,
    api: RetrievalApiClient,
}

#[async_trait::async_trait]
impl RetrievalTool for HttpRetrievalTool {
    fn name(&self) -> &str {
        self.tool_name
    }

    fn description(&self) -> &'static str {
        "Remote retrieval service"
    }

    async fn retrieve(&self, parameters: &Value) -> Result<ToolResult> {
        let start = Instant::now();
        let path = format!("/api/v1/retrieval/{}", self.tool_name);
        let body = self.api.post_json(&path, parameters).await?;

        let mut result: ToolResult = serde_json::from_value(body)?;
        if result.source.is_empty() {
            result.source = self.tool_name.to_string();
        }
        if result.processing_time <= 0.0 {
            result.processing_time = start.elapsed().as_secs_f64();
        }
        Ok(result)
    }
}

/// Create the default registry: HTTP-backed when a retrieval service is
/// configured, catalog-backed otherwise.
pub fn create_default_registry(config: &PipelineConfig) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    match config.retrieval_api_base_url.as_deref() {
        Some(base_url) => {
            let api = RetrievalApiClient::new(base_url, config.tool_timeout)?;
            for tool_name in [STRUCTURED_DB_SEARCH, VECTOR_SEARCH, GRAPHRAG_SEARCH] {
                registry.register(Arc::new(HttpRetrievalTool {
                    tool_name,
                    api: api.clone(),
                }));
            }
        }
        None => {
            registry.register(Arc::new(CatalogTool::structured_lookup()));
            registry.register(Arc::new(CatalogTool::vector_search()));
            registry.register(Arc::new(CatalogTool::graph_search()));
        }
    }

    Ok(registry)
}
