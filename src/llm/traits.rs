//! LLM 后端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：complete 接收消息列表与采样参数，
//! 返回文本与后端报告的 token 用量。错误分为瞬时（可重试）与永久（立即上抛）两类。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// 采样参数；字段封闭，不接受未知项
#[derive(Clone, Debug)]
pub struct CallOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4000,
            stop: Vec::new(),
        }
    }
}

impl CallOptions {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
            stop: Vec::new(),
        }
    }

    /// 参数校验：temperature 限 [0, 1]，max_tokens 限 [1, 8192]
    pub fn validate(&self) -> Result<(), LlmError> {
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(LlmError::InvalidRequest(format!(
                "temperature must be within [0, 1], got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 || self.max_tokens > 8192 {
            return Err(LlmError::InvalidRequest(format!(
                "max_tokens must be within [1, 8192], got {}",
                self.max_tokens
            )));
        }
        Ok(())
    }
}

/// 一次补全的结果：文本与后端报告的 token 用量
#[derive(Clone, Debug, Default)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Completion {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// 后端错误：is_transient 决定是否进入重试
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("rate limited by backend")]
    RateLimited,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// 后端服务端错误（5xx / 过载）
    #[error("backend unavailable ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("empty response from backend")]
    EmptyResponse,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("content rejected by backend policy: {0}")]
    ContentFiltered(String),

    /// 重试耗尽，携带最后一次底层错误
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<LlmError>,
    },
}

impl LlmError {
    /// 瞬时错误（限流 / 超时 / 服务端错误 / 空应答）可重试；其余立即上抛
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited
            | LlmError::Timeout(_)
            | LlmError::Network(_)
            | LlmError::EmptyResponse => true,
            LlmError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// LLM 客户端 trait：一次非流式补全
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> Result<Completion, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_validate_ranges() {
        assert!(CallOptions::default().validate().is_ok());
        assert!(CallOptions::new(1.5, 100).validate().is_err());
        assert!(CallOptions::new(-0.1, 100).validate().is_err());
        assert!(CallOptions::new(0.7, 0).validate().is_err());
        assert!(CallOptions::new(0.7, 9000).validate().is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::RateLimited.is_transient());
        assert!(LlmError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(LlmError::EmptyResponse.is_transient());
        assert!(LlmError::Upstream {
            status: 503,
            message: "overloaded".into()
        }
        .is_transient());

        assert!(!LlmError::Auth("bad key".into()).is_transient());
        assert!(!LlmError::InvalidRequest("empty prompt".into()).is_transient());
        assert!(!LlmError::ContentFiltered("policy".into()).is_transient());
        assert!(!LlmError::Upstream {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!LlmError::RetryExhausted {
            attempts: 3,
            source: Box::new(LlmError::RateLimited),
        }
        .is_transient());
    }
}
