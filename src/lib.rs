//! Financial Event Pipeline
//!
//! Answers free-text financial queries by routing each message through a
//! fixed chain of stages on an in-process event bus:
//! - Intake stamps the original query and receive time
//! - Intent analysis classifies the query
//! - Tool selection scatters parallel retrieval requests and gathers them
//! - Response generation synthesizes exactly one reply per message
//!
//! PIPELINE:
//! MESSAGE → INTENT → SELECT → RETRIEVE ×N → GATHER → RESPOND

pub mod adapters;
pub mod api;
pub mod bus;
pub mod classifier;
pub mod config;
pub mod error;
pub mod gemini;
pub mod models;
pub mod pipeline;
pub mod state;
pub mod synthesis;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use error::Result;

// Re-export common types
pub use bus::{EventBus, EventHandler, Publisher};
pub use config::PipelineConfig;
pub use models::*;
