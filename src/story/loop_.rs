//! 生成主循环
//!
//! Planning -> 逐章 Writing -> Critiquing -> （至多一次）Revising -> FeedbackWait -> Advancing。
//! 取消只在状态迁移间生效；任何角色的不可重试失败都会带着已建成的部分故事与完整账本收尾，
//! 绝不丢弃已完成章节。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::GenerationError;
use crate::llm::{CallOptions, ModelClient};
use crate::story::critic::Critic;
use crate::story::events::{send_event, GenerationPhase, StoryEvent};
use crate::story::memory::{Chapter, StoryMemory};
use crate::story::planner::Planner;
use crate::story::writer::Writer;
use crate::story::RoleAgent;
use crate::usage::UsageLedger;

/// 运行终态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    PartialStop,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::PartialStop => "partial_stop",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// 一次生成的最终产物；无论成败都携带已建成的章节与用量账本
#[derive(Debug)]
pub struct StoryResult {
    pub status: RunStatus,
    pub title: String,
    pub content: String,
    pub chapters: Vec<Chapter>,
    pub usage: UsageLedger,
    pub error: Option<GenerationError>,
}

/// 发给反馈回调的章节快照
#[derive(Clone, Debug)]
pub struct FeedbackRequest {
    pub current_chapter: u32,
    pub chapter_text: String,
    /// 剩余章节数
    pub remaining: u32,
}

/// 反馈回调的应答；replan 为扩展字段，缺省 false 即最小契约
#[derive(Clone, Debug)]
pub struct FeedbackResponse {
    pub continue_run: bool,
    pub directive: Option<String>,
    pub replan: bool,
}

impl Default for FeedbackResponse {
    fn default() -> Self {
        Self {
            continue_run: true,
            directive: None,
            replan: false,
        }
    }
}

impl FeedbackResponse {
    /// 提前收束
    pub fn stop() -> Self {
        Self {
            continue_run: false,
            directive: None,
            replan: false,
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }

    pub fn with_replan(mut self) -> Self {
        self.replan = true;
        self
    }
}

/// 反馈回调：调用方提供的异步函数
pub type FeedbackHandler = Box<
    dyn Fn(FeedbackRequest) -> Pin<Box<dyn Future<Output = FeedbackResponse> + Send>>
        + Send
        + Sync,
>;

/// 一次生成会话的输入与可选协作方
pub struct GenerationSession {
    prompt: String,
    max_chapters: u32,
    feedback: Option<FeedbackHandler>,
    cancel: CancellationToken,
    event_tx: Option<UnboundedSender<StoryEvent>>,
}

impl GenerationSession {
    pub fn new(prompt: impl Into<String>, max_chapters: u32) -> Self {
        Self {
            prompt: prompt.into(),
            max_chapters: max_chapters.max(1),
            feedback: None,
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_feedback(mut self, handler: FeedbackHandler) -> Self {
        self.feedback = Some(handler);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<StoryEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

/// 主循环参数（与角色采样参数分离）
#[derive(Clone, Debug)]
pub struct GenerationSettings {
    /// 反馈回调等待上限，超时视为「继续、无指令」
    pub feedback_timeout: Duration,
    /// 评分低于该值时记录警告
    pub low_rating_warn: u8,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            feedback_timeout: Duration::from_secs(120),
            low_rating_warn: 7,
        }
    }
}

/// 故事生成器：三个角色共享同一个 ModelClient
pub struct StoryGenerator {
    planner: Planner,
    writer: Writer,
    critic: Critic,
    settings: GenerationSettings,
}

impl StoryGenerator {
    pub fn new(client: Arc<ModelClient>) -> Self {
        Self {
            planner: Planner::new(client.clone()),
            writer: Writer::new(client.clone()),
            critic: Critic::new(client),
            settings: GenerationSettings::default(),
        }
    }

    /// 按配置构建：角色采样参数、结尾窗口与反馈超时均取自配置
    pub fn from_config(client: Arc<ModelClient>, cfg: &AppConfig) -> Self {
        Self {
            planner: Planner::new(client.clone()).with_options(CallOptions::new(
                cfg.roles.planner.temperature,
                cfg.roles.planner.max_tokens,
            )),
            writer: Writer::new(client.clone())
                .with_options(CallOptions::new(
                    cfg.roles.writer.temperature,
                    cfg.roles.writer.max_tokens,
                ))
                .with_closing_window(cfg.generation.closing_context_chars),
            critic: Critic::new(client).with_options(CallOptions::new(
                cfg.roles.critic.temperature,
                cfg.roles.critic.max_tokens,
            )),
            settings: GenerationSettings {
                feedback_timeout: cfg.generation.feedback_timeout(),
                low_rating_warn: cfg.generation.low_rating_warn,
            },
        }
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 生成一部故事；本函数从不 Err，失败/取消也以 StoryResult 携带部分成果返回
    pub async fn generate(&self, session: GenerationSession) -> StoryResult {
        let run_id = Uuid::new_v4();
        let tx = session.event_tx.clone();
        let mut memory = StoryMemory::new(session.prompt.clone(), session.max_chapters);
        let mut ledger = UsageLedger::new();

        tracing::info!(run = %run_id, max_chapters = session.max_chapters, "generation started");
        send_event(&tx, StoryEvent::PhaseChange { phase: GenerationPhase::Init, chapter: 0 });

        if session.cancel.is_cancelled() {
            return finalize(RunStatus::Cancelled, memory, ledger, Some(GenerationError::Cancelled), &tx, run_id);
        }

        // Planning：一次性产出标题与全书大纲
        send_event(&tx, StoryEvent::PhaseChange { phase: GenerationPhase::Planning, chapter: 0 });
        match self.planner.plan(&memory, None, &mut ledger).await {
            Ok(planned) => {
                memory.set_title(planned.title);
                memory.seed_characters(planned.characters);
                send_event(
                    &tx,
                    StoryEvent::OutlineReady {
                        title: memory.title().unwrap_or_default().to_string(),
                        chapters: planned.plans.len(),
                    },
                );
                memory.set_outline(planned.plans);
            }
            Err(err) => {
                tracing::error!(run = %run_id, %err, "planning failed");
                return finalize(RunStatus::Failed, memory, ledger, Some(err), &tx, run_id);
            }
        }

        let mut chapter = 1u32;
        loop {
            if session.cancel.is_cancelled() {
                return finalize(RunStatus::Cancelled, memory, ledger, Some(GenerationError::Cancelled), &tx, run_id);
            }

            // WritingChapter(i)：初稿入库后才进入评估
            send_event(&tx, StoryEvent::PhaseChange { phase: GenerationPhase::Writing, chapter });
            tracing::info!(run = %run_id, chapter, "writing chapter");
            let title = memory
                .plan_for(chapter)
                .map(|p| p.title.clone())
                .unwrap_or_else(|| format!("第{}章", chapter));
            match self.writer.produce(&memory, None, &mut ledger).await {
                Ok(text) => {
                    send_event(&tx, StoryEvent::ChapterDrafted { index: chapter, chars: text.chars().count() });
                    memory.push_chapter(title, text);
                }
                Err(source) => {
                    let err = GenerationError::WritingFailed { chapter, source };
                    tracing::error!(run = %run_id, %err, "writing failed");
                    return finalize(RunStatus::Failed, memory, ledger, Some(err), &tx, run_id);
                }
            }

            // Critiquing(i) ->（至多一次）Revising(i) -> Critiquing(i)
            loop {
                send_event(&tx, StoryEvent::PhaseChange { phase: GenerationPhase::Critiquing, chapter });
                let critique = match self.critic.review(&memory, &mut ledger).await {
                    Ok(c) => c,
                    Err(source) => {
                        let err = GenerationError::CritiquingFailed { chapter, source };
                        tracing::error!(run = %run_id, %err, "critiquing failed");
                        return finalize(RunStatus::Failed, memory, ledger, Some(err), &tx, run_id);
                    }
                };
                send_event(
                    &tx,
                    StoryEvent::CritiqueReady {
                        index: chapter,
                        rating: critique.overall_rating,
                        issues: critique.consistency_issues.len(),
                    },
                );
                if critique.overall_rating < self.settings.low_rating_warn {
                    tracing::warn!(run = %run_id, chapter, rating = critique.overall_rating, "chapter rated low");
                }

                memory.apply_character_updates(&critique.character_updates);
                let directive = critique
                    .suggested_revision
                    .clone()
                    .unwrap_or_else(|| critique.consistency_issues.join("；"));
                memory.set_critique(chapter, critique);

                // 一致性问题触发重写，每章至多一次
                if memory.revision_target().is_none() {
                    break;
                }
                if session.cancel.is_cancelled() {
                    return finalize(RunStatus::Cancelled, memory, ledger, Some(GenerationError::Cancelled), &tx, run_id);
                }
                send_event(&tx, StoryEvent::PhaseChange { phase: GenerationPhase::Revising, chapter });
                tracing::info!(run = %run_id, chapter, "revising chapter");
                match self.writer.produce(&memory, Some(&directive), &mut ledger).await {
                    Ok(text) => {
                        memory.apply_revision(chapter, text);
                        send_event(&tx, StoryEvent::RevisionApplied { index: chapter });
                        // 修订稿再评一次；revised 标记已消耗，不会再次触发重写
                    }
                    Err(source) => {
                        let err = GenerationError::WritingFailed { chapter, source };
                        tracing::error!(run = %run_id, %err, "revision failed");
                        return finalize(RunStatus::Failed, memory, ledger, Some(err), &tx, run_id);
                    }
                }
            }

            // FeedbackWait(i)：未配置回调则直接穿过
            send_event(&tx, StoryEvent::PhaseChange { phase: GenerationPhase::FeedbackWait, chapter });
            if let Some(handler) = &session.feedback {
                let request = FeedbackRequest {
                    current_chapter: chapter,
                    chapter_text: memory
                        .chapter(chapter)
                        .map(|c| c.text.clone())
                        .unwrap_or_default(),
                    remaining: session.max_chapters - chapter,
                };
                let response =
                    match tokio::time::timeout(self.settings.feedback_timeout, handler(request)).await {
                        Ok(response) => response,
                        Err(_) => {
                            tracing::warn!(run = %run_id, chapter, "feedback callback timed out, continuing");
                            FeedbackResponse::default()
                        }
                    };
                send_event(
                    &tx,
                    StoryEvent::FeedbackReceived {
                        index: chapter,
                        continue_run: response.continue_run,
                        has_directive: response.directive.is_some(),
                        replan: response.replan,
                    },
                );

                let directive = response.directive.clone();
                if let Some(ref d) = directive {
                    memory.add_feedback(chapter, d.clone());
                }
                if !response.continue_run {
                    tracing::info!(run = %run_id, chapter, "feedback requested early stop");
                    return finalize(RunStatus::PartialStop, memory, ledger, None, &tx, run_id);
                }
                if response.replan && chapter < session.max_chapters {
                    tracing::info!(run = %run_id, chapter, "feedback requested replanning");
                    match self
                        .planner
                        .replan_remaining(&memory, directive.as_deref(), &mut ledger)
                        .await
                    {
                        Ok(plans) => memory.replace_outline_from(chapter + 1, plans),
                        Err(err) => {
                            tracing::error!(run = %run_id, %err, "replanning failed");
                            return finalize(RunStatus::Failed, memory, ledger, Some(err), &tx, run_id);
                        }
                    }
                }
            }

            // Advancing
            send_event(&tx, StoryEvent::PhaseChange { phase: GenerationPhase::Advancing, chapter });
            if chapter == session.max_chapters {
                break;
            }
            chapter += 1;
        }

        finalize(RunStatus::Completed, memory, ledger, None, &tx, run_id)
    }
}

/// 统一收尾：拼装正文、发送用量快照与终态事件；部分成果永不丢弃
fn finalize(
    status: RunStatus,
    memory: StoryMemory,
    ledger: UsageLedger,
    error: Option<GenerationError>,
    tx: &Option<UnboundedSender<StoryEvent>>,
    run_id: Uuid,
) -> StoryResult {
    let phase = match status {
        RunStatus::Failed => GenerationPhase::Failed,
        _ => GenerationPhase::Done,
    };
    send_event(tx, StoryEvent::PhaseChange { phase, chapter: memory.chapters().len() as u32 });
    send_event(
        tx,
        StoryEvent::TokenUsage {
            requests: ledger.total_requests(),
            tokens: ledger.total_tokens(),
        },
    );
    send_event(tx, StoryEvent::RunFinished { status: status.as_str().to_string() });

    tracing::info!(
        run = %run_id,
        status = status.as_str(),
        chapters = memory.chapters().len(),
        requests = ledger.total_requests(),
        tokens = ledger.total_tokens(),
        "generation finished"
    );

    let title = memory.title().unwrap_or("未命名故事").to_string();
    let chapters = memory.into_chapters();
    let content = chapters
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    StoryResult {
        status,
        title,
        content,
        chapters,
        usage: ledger,
        error,
    }
}
