//! LLM 层：后端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）+ 带重试与用量统计的 ModelClient

use std::sync::Arc;

pub mod client;
pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

pub use client::{GeneratedText, ModelClient, RetryPolicy};
pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{CallOptions, Completion, LlmClient, LlmError, Message, MessageRole};

use crate::config::AppConfig;

/// 按配置与可用的 API Key 选择后端；都不可用时退回 Mock
pub fn create_backend(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    // 有 DeepSeek Key，或配置为 deepseek 且仅有 OpenAI Key 时也走 DeepSeek 兼容端点
    let use_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok()
        || (provider == "deepseek" && std::env::var("OPENAI_API_KEY").is_ok());
    let use_openai = std::env::var("OPENAI_API_KEY").is_ok() && provider != "deepseek";

    if use_deepseek {
        tracing::info!("Using DeepSeek backend ({})", cfg.llm.model);
        Arc::new(create_deepseek_client(Some(&cfg.llm.model)))
    } else if use_openai {
        let base = cfg.llm.base_url.as_deref();
        tracing::info!("Using OpenAI-compatible backend ({})", cfg.llm.model);
        Arc::new(OpenAiClient::new(
            base,
            &cfg.llm.model,
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock backend");
        Arc::new(MockLlmClient::new())
    }
}
