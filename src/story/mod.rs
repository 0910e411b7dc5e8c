//! 故事生成域：记忆、三个角色（Planner / Writer / Critic）、主循环与过程事件

use async_trait::async_trait;

use crate::llm::LlmError;
use crate::usage::{RoleId, UsageLedger};

pub mod critic;
pub mod events;
pub mod loop_;
pub mod memory;
pub mod planner;
pub mod writer;

pub use critic::{parse_critique, Critic, Critique};
pub use events::{GenerationPhase, StoryEvent};
pub use loop_::{
    FeedbackHandler, FeedbackRequest, FeedbackResponse, GenerationSession, GenerationSettings,
    RunStatus, StoryGenerator, StoryResult,
};
pub use memory::{Chapter, ChapterPlan, CharacterState, FeedbackEntry, StoryMemory};
pub use planner::{parse_outline, PlannedStory, Planner};
pub use writer::Writer;

/// 角色能力：基于只读记忆快照产出文本
///
/// 角色拿到的是共享借用，无法改写记忆；所有状态变更由生成主循环折叠。
/// directive 为本次调用注入的指令（修订建议或读者反馈）。
#[async_trait]
pub trait RoleAgent: Send + Sync {
    fn role(&self) -> RoleId;

    async fn produce(
        &self,
        memory: &StoryMemory,
        directive: Option<&str>,
        ledger: &mut UsageLedger,
    ) -> Result<String, LlmError>;
}
