//! 生成过程事件：状态迁移与用量快照，供外部观测接收端（日志、SSE、前端）消费
//!
//! 核心只产出数据；格式化与落地由外部决定。发送为尽力而为，接收端关闭不影响生成。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// 生成阶段（状态机的可序列化投影）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    Init,
    Planning,
    Writing,
    Critiquing,
    Revising,
    FeedbackWait,
    Advancing,
    Done,
    Failed,
}

/// 过程事件（可序列化为 JSON 供外部展示）
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoryEvent {
    /// 状态迁移；chapter 为当前章节号，规划阶段为 0
    PhaseChange { phase: GenerationPhase, chapter: u32 },
    /// 大纲就绪
    OutlineReady { title: String, chapters: usize },
    /// 章节初稿完成
    ChapterDrafted { index: u32, chars: usize },
    /// 评语就绪
    CritiqueReady { index: u32, rating: u8, issues: usize },
    /// 修订稿已覆盖原文
    RevisionApplied { index: u32 },
    /// 收到读者反馈
    FeedbackReceived {
        index: u32,
        continue_run: bool,
        has_directive: bool,
        replan: bool,
    },
    /// 用量快照（累计）
    TokenUsage { requests: u64, tokens: u64 },
    /// 运行结束
    RunFinished { status: String },
}

/// 尽力而为地发送事件；未配置接收端或接收端已关闭时静默丢弃
pub(crate) fn send_event(tx: &Option<UnboundedSender<StoryEvent>>, ev: StoryEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
