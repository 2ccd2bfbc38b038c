//! LLM provider implementations.

mod openai;

pub use openai::OpenAiDriver;

use std::sync::Arc;

use crate::llm::{LlmDriver, LlmSettings};

/// Create a driver for the configured provider.
///
/// The service speaks the OpenAI-compatible protocol, which also covers
/// self-hosted gateways and most hosted providers.
pub fn create_driver(settings: LlmSettings) -> Arc<dyn LlmDriver> {
    Arc::new(OpenAiDriver::new(settings))
}
