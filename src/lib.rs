//! fabula - 多角色协作的故事生成引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **error**: 生成流程错误（按状态打标）
//! - **llm**: 后端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）+ 带重试与用量统计的 ModelClient
//! - **observability**: tracing 初始化
//! - **story**: 记忆、Planner / Writer / Critic 角色、生成主循环与过程事件
//! - **usage**: 逐次调用的用量账本与按角色汇总

pub mod config;
pub mod error;
pub mod llm;
pub mod observability;
pub mod story;
pub mod usage;

pub use config::{load_config, AppConfig};
pub use error::GenerationError;
pub use llm::{
    create_backend, CallOptions, GeneratedText, LlmClient, LlmError, Message, MockLlmClient,
    ModelClient, RetryPolicy,
};
pub use story::{
    Chapter, ChapterPlan, Critique, FeedbackRequest, FeedbackResponse, GenerationSession,
    GenerationSettings, RoleAgent, RunStatus, StoryEvent, StoryGenerator, StoryMemory, StoryResult,
};
pub use usage::{RoleId, UsageLedger};
