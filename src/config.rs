//! Runtime configuration loaded from the environment

use crate::error::PipelineError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum queued events before `publish` starts rejecting
    pub queue_capacity: usize,
    /// How long the dispatch loop waits on an empty queue before re-checking for shutdown
    pub poll_interval: Duration,
    /// REST waiter timeout for a correlated response
    pub response_timeout: Duration,
    /// Upper bound for a single retrieval call
    pub tool_timeout: Duration,
    /// Force-emit a degraded response when a gather has not completed in time.
    /// `None` keeps stalled aggregations forever.
    pub aggregation_deadline: Option<Duration>,
    pub session_timeout: Duration,
    pub session_cleanup_interval: Duration,
    pub conversation_history_limit: usize,
    pub api_port: u16,
    pub gemini_api_key: String,
    pub retrieval_api_base_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            poll_interval: Duration::from_millis(1000),
            response_timeout: Duration::from_secs(30),
            tool_timeout: Duration::from_secs(10),
            aggregation_deadline: None,
            session_timeout: Duration::from_secs(24 * 3600),
            session_cleanup_interval: Duration::from_secs(3600),
            conversation_history_limit: 3,
            api_port: 8080,
            gemini_api_key: String::new(),
            retrieval_api_base_url: None,
        }
    }
}

impl PipelineConfig {
    /// Build from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let queue_capacity = parse_var("EVENT_QUEUE_CAPACITY")?.unwrap_or(defaults.queue_capacity);
        if queue_capacity == 0 {
            return Err(PipelineError::ConfigError(
                "EVENT_QUEUE_CAPACITY must be greater than zero".to_string(),
            ));
        }

        let api_port = match parse_var::<u16>("PORT")? {
            Some(port) => port,
            None => parse_var("API_PORT")?.unwrap_or(defaults.api_port),
        };

        let session_timeout = match parse_var::<u64>("SESSION_TIMEOUT_HOURS")? {
            Some(hours) => hours_to_duration(hours)?,
            None => defaults.session_timeout,
        };

        let config = Self {
            queue_capacity,
            poll_interval: parse_var("EVENT_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            response_timeout: parse_var("RESPONSE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.response_timeout),
            tool_timeout: parse_var("TOOL_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.tool_timeout),
            aggregation_deadline: parse_var("AGGREGATION_DEADLINE_SECS")?.map(Duration::from_secs),
            session_timeout,
            session_cleanup_interval: parse_var("SESSION_CLEANUP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_cleanup_interval),
            conversation_history_limit: parse_var("CONVERSATION_HISTORY_LIMIT")?
                .unwrap_or(defaults.conversation_history_limit),
            api_port,
            gemini_api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
            retrieval_api_base_url: env::var("RETRIEVAL_API_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject intervals and timeouts the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("EVENT_POLL_INTERVAL_MS", self.poll_interval),
            ("RESPONSE_TIMEOUT_SECS", self.response_timeout),
            ("TOOL_TIMEOUT_SECS", self.tool_timeout),
            ("SESSION_TIMEOUT_HOURS", self.session_timeout),
            ("SESSION_CLEANUP_INTERVAL_SECS", self.session_cleanup_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(PipelineError::ConfigError(format!(
                "{} must be greater than zero",
                name
            )));
        }
        if self.aggregation_deadline.is_some_and(|d| d.is_zero()) {
            return Err(PipelineError::ConfigError(
                "AGGREGATION_DEADLINE_SECS must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn hours_to_duration(hours: u64) -> Result<Duration> {
    hours
        .checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or_else(|| {
            PipelineError::ConfigError(format!("SESSION_TIMEOUT_HOURS is too large: {}", hours))
        })
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| PipelineError::ConfigError(format!("{} has invalid value '{}'", name, raw))),
        _ => Ok(None),
    }
}
