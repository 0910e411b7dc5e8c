//! ModelClient：对单次模型调用的韧性封装
//!
//! 在后端之上提供：参数校验、单次调用超时、瞬时失败的指数退避重试（带抖动）、
//! 逐次尝试写入用量账本。永久错误不重试，重试耗尽以 RetryExhausted 上抛并携带最后一次底层错误。

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::AppConfig;
use crate::llm::{CallOptions, LlmClient, LlmError, Message};
use crate::usage::{CallRecord, RoleId, UsageLedger};

/// 一次成功调用的结果
#[derive(Clone, Debug)]
pub struct GeneratedText {
    pub text: String,
    /// 后端报告的本次调用 token 总数
    pub token_count: u64,
}

/// 重试策略：指数退避 + 随机抖动，封顶尝试次数
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的退避时长（attempt 从 1 起）
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.base_delay.mul_f64(exp);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// 模型客户端：后端 + 重试策略 + 单次调用超时
pub struct ModelClient {
    backend: Arc<dyn LlmClient>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl ModelClient {
    pub fn new(backend: Arc<dyn LlmClient>) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(backend: Arc<dyn LlmClient>, cfg: &AppConfig) -> Self {
        Self {
            backend,
            retry: RetryPolicy {
                max_attempts: cfg.retry.max_attempts.max(1),
                base_delay: Duration::from_millis(cfg.retry.base_delay_ms),
                multiplier: cfg.retry.multiplier,
                max_jitter: Duration::from_millis(cfg.retry.max_jitter_ms),
            },
            request_timeout: Duration::from_secs(cfg.llm.timeouts.request.max(1)),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// 发起一次生成调用
    ///
    /// 每次尝试（成功或失败）各向账本写一条记录；瞬时失败退避后重试，
    /// 永久失败立即返回，重试耗尽返回 RetryExhausted。
    pub async fn invoke(
        &self,
        role: RoleId,
        messages: &[Message],
        options: &CallOptions,
        ledger: &mut UsageLedger,
    ) -> Result<GeneratedText, LlmError> {
        if messages.is_empty() || messages.iter().any(|m| m.content.trim().is_empty()) {
            return Err(LlmError::InvalidRequest(
                "rendered prompt must not be empty".to_string(),
            ));
        }
        options.validate()?;

        let mut last_err: Option<LlmError> = None;

        for attempt in 1..=self.retry.max_attempts {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                self.request_timeout,
                self.backend.complete(messages, options),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(self.request_timeout)),
            };
            let latency = started.elapsed();

            match outcome {
                Ok(completion) => {
                    let token_count = completion.total_tokens();
                    ledger.record(CallRecord {
                        role,
                        attempt,
                        tokens: token_count,
                        latency,
                        ok: true,
                    });
                    return Ok(GeneratedText {
                        text: completion.text,
                        token_count,
                    });
                }
                Err(err) => {
                    ledger.record(CallRecord {
                        role,
                        attempt,
                        tokens: 0,
                        latency,
                        ok: false,
                    });
                    if !err.is_transient() {
                        tracing::warn!(role = %role, %err, "model call failed permanently");
                        return Err(err);
                    }
                    tracing::warn!(
                        role = %role,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        %err,
                        "model call failed transiently"
                    );
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(LlmError::RetryExhausted {
            attempts: self.retry.max_attempts,
            source: Box::new(last_err.unwrap_or(LlmError::EmptyResponse)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_jitter: Duration::ZERO,
        }
    }

    fn user(text: &str) -> Vec<Message> {
        vec![Message::user(text)]
    }

    #[tokio::test]
    async fn test_transient_failures_then_success_records_three_attempts() {
        let backend = Arc::new(MockLlmClient::scripted(vec![
            Err(LlmError::RateLimited),
            Err(LlmError::Upstream {
                status: 503,
                message: "overloaded".into(),
            }),
            Ok("第三次成功".to_string()),
        ]));
        let client = ModelClient::new(backend).with_retry_policy(fast_policy());
        let mut ledger = UsageLedger::new();

        let out = client
            .invoke(RoleId::Writer, &user("写一段"), &CallOptions::default(), &mut ledger)
            .await
            .unwrap();

        assert_eq!(out.text, "第三次成功");
        assert!(out.token_count > 0);
        let records = ledger.per_call();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.role == RoleId::Writer));
        assert_eq!(records[0].attempt, 1);
        assert_eq!(records[2].attempt, 3);
        assert!(!records[0].ok && !records[1].ok && records[2].ok);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let backend = Arc::new(MockLlmClient::scripted(vec![
            Err(LlmError::Auth("bad key".into())),
            Ok("不应被调用".to_string()),
        ]));
        let client = ModelClient::new(backend.clone()).with_retry_policy(fast_policy());
        let mut ledger = UsageLedger::new();

        let err = client
            .invoke(RoleId::Planner, &user("规划"), &CallOptions::default(), &mut ledger)
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::Auth(_)));
        assert_eq!(ledger.total_requests(), 1);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_carries_last_error() {
        let backend = Arc::new(MockLlmClient::scripted(vec![
            Err(LlmError::RateLimited),
            Err(LlmError::RateLimited),
            Err(LlmError::EmptyResponse),
        ]));
        let client = ModelClient::new(backend).with_retry_policy(fast_policy());
        let mut ledger = UsageLedger::new();

        let err = client
            .invoke(RoleId::Critic, &user("评估"), &CallOptions::default(), &mut ledger)
            .await
            .unwrap_err();

        match err {
            LlmError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, LlmError::EmptyResponse));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(ledger.total_requests(), 3);
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected_without_attempt() {
        let backend = Arc::new(MockLlmClient::new());
        let client = ModelClient::new(backend.clone());
        let mut ledger = UsageLedger::new();

        let err = client
            .invoke(RoleId::Writer, &user("   "), &CallOptions::default(), &mut ledger)
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::InvalidRequest(_)));
        assert_eq!(ledger.total_requests(), 0);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let backend = Arc::new(MockLlmClient::new());
        let client = ModelClient::new(backend);
        let mut ledger = UsageLedger::new();

        let err = client
            .invoke(
                RoleId::Writer,
                &user("写一段"),
                &CallOptions::new(2.0, 100),
                &mut ledger,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::InvalidRequest(_)));
        assert_eq!(ledger.total_requests(), 0);
    }
}
