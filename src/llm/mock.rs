//! Mock 后端（用于测试与离线运行，无需 API）
//!
//! 支持两种用法：空脚本时回显最后一条 User 消息；脚本模式下按序弹出预设的应答或错误，
//! 并记录每次收到的消息列表，便于测试断言提示词内容与调用次数。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{CallOptions, Completion, LlmClient, LlmError, Message, MessageRole};

/// 粗略估算 token 数：约 4 字符 1 token
fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 / 4).max(1)
}

/// Mock 后端：脚本驱动，记录所有请求
#[derive(Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按序弹出预设步骤的脚本模式
    pub fn scripted(steps: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 追加一个脚本步骤
    pub fn push(&self, step: Result<String, LlmError>) {
        self.script.lock().unwrap().push_back(step);
    }

    /// 至今收到的全部请求（每次调用的消息列表）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    /// 调用次数
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _options: &CallOptions,
    ) -> Result<Completion, LlmError> {
        self.requests.lock().unwrap().push(messages.to_vec());

        let step = self.script.lock().unwrap().pop_front();
        let text = match step {
            Some(Ok(text)) => text,
            Some(Err(err)) => return Err(err),
            // 无脚本：回显最后一条 User 消息
            None => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                format!("Echo from Mock: {}", last_user)
            }
        };

        let prompt_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
        Ok(Completion {
            prompt_tokens: (prompt_chars as u64 / 4).max(1),
            completion_tokens: estimate_tokens(&text),
            text,
        })
    }
}
