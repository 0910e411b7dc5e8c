//! 生成流程错误：按发生的状态打标，涉及章节时携带章节号
//!
//! 所有角色/模型失败都冒泡到生成主循环；主循环总是携带已建成的部分故事与用量账本收尾，
//! 不会丢弃任何已完成章节。

use thiserror::Error;

use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum GenerationError {
    /// 规划失败：大纲为空 / 缺少概要，或模型调用失败
    #[error("planning failed: {reason}")]
    PlanningFailed {
        reason: String,
        #[source]
        source: Option<LlmError>,
    },

    #[error("writing chapter {chapter} failed: {source}")]
    WritingFailed {
        chapter: u32,
        #[source]
        source: LlmError,
    },

    #[error("critiquing chapter {chapter} failed: {source}")]
    CritiquingFailed {
        chapter: u32,
        #[source]
        source: LlmError,
    },

    /// 调用方取消；不是故障，而是一种终态
    #[error("generation cancelled")]
    Cancelled,
}

impl GenerationError {
    pub(crate) fn planning_model(source: LlmError) -> Self {
        GenerationError::PlanningFailed {
            reason: "model call failed".to_string(),
            source: Some(source),
        }
    }

    pub(crate) fn planning_invalid(reason: impl Into<String>) -> Self {
        GenerationError::PlanningFailed {
            reason: reason.into(),
            source: None,
        }
    }
}
