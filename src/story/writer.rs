//! Writer：章节正文创作
//!
//! 初稿依据当前章的大纲条目、上一章结尾窗口、人物现状与读者反馈展开；
//! 当记忆中存在待修订章节且带有修订指令时，转为重写该章。输出为纯正文，不是 JSON。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{CallOptions, LlmError, Message, ModelClient};
use crate::story::memory::StoryMemory;
use crate::story::RoleAgent;
use crate::usage::{RoleId, UsageLedger};

const WRITER_SYSTEM: &str =
    "你是专业的故事创作专家，文笔流畅，擅长在既定大纲内推进情节并保持人物与设定一致。\
     你直接输出章节正文，不输出任何解释或标注。";

const DRAFT_TEMPLATE: &str = "\
请创作第{index}章《{title}》的正文。

本章概要：{summary}
关键情节点：{beats}

{characters}{previous}{feedback}要求：承接前文自然衔接，只输出正文。";

const REVISE_TEMPLATE: &str = "\
请重写第{index}章《{title}》的正文。

原稿：
{original}

修改意见：{directive}

{characters}{feedback}要求：保留原有情节骨架，修复上述问题，只输出修改后的正文。";

/// Writer：持有 ModelClient、采样参数与结尾窗口大小
pub struct Writer {
    client: Arc<ModelClient>,
    options: CallOptions,
    closing_window: usize,
}

impl Writer {
    pub fn new(client: Arc<ModelClient>) -> Self {
        Self {
            client,
            options: CallOptions::new(0.9, 4000),
            closing_window: 600,
        }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_closing_window(mut self, chars: usize) -> Self {
        self.closing_window = chars;
        self
    }

    fn render_draft(&self, memory: &StoryMemory) -> String {
        let index = memory.next_chapter_index();
        let (title, summary, beats) = match memory.plan_for(index) {
            Some(plan) => (
                plan.title.clone(),
                plan.summary.clone(),
                if plan.beats.is_empty() {
                    "无".to_string()
                } else {
                    plan.beats.join("；")
                },
            ),
            None => (format!("第{}章", index), String::from("继续推进主线"), "无".to_string()),
        };

        let previous = match memory.closing_context(self.closing_window) {
            Some(tail) => format!("## 上一章结尾\n…{}\n\n", tail),
            None => String::new(),
        };

        DRAFT_TEMPLATE
            .replace("{index}", &index.to_string())
            .replace("{title}", &title)
            .replace("{summary}", &summary)
            .replace("{beats}", &beats)
            .replace("{characters}", &memory.characters_section())
            .replace("{previous}", &previous)
            .replace("{feedback}", &memory.feedback_section())
    }

    fn render_revision(&self, memory: &StoryMemory, directive: &str) -> Option<String> {
        let target = memory.revision_target()?;
        Some(
            REVISE_TEMPLATE
                .replace("{index}", &target.index.to_string())
                .replace("{title}", &target.title)
                .replace("{original}", &target.text)
                .replace("{directive}", directive)
                .replace("{characters}", &memory.characters_section())
                .replace("{feedback}", &memory.feedback_section()),
        )
    }
}

#[async_trait]
impl RoleAgent for Writer {
    fn role(&self) -> RoleId {
        RoleId::Writer
    }

    async fn produce(
        &self,
        memory: &StoryMemory,
        directive: Option<&str>,
        ledger: &mut UsageLedger,
    ) -> Result<String, LlmError> {
        let prompt = match directive.and_then(|d| self.render_revision(memory, d)) {
            Some(revision) => revision,
            None => self.render_draft(memory),
        };

        let messages = vec![Message::system(WRITER_SYSTEM), Message::user(prompt)];
        let generated = self
            .client
            .invoke(self.role(), &messages, &self.options, ledger)
            .await?;
        Ok(generated.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ModelClient};
    use crate::story::critic::Critique;
    use crate::story::memory::ChapterPlan;

    fn memory_with_plan() -> StoryMemory {
        let mut memory = StoryMemory::new("一个关于友情的故事", 2);
        memory.set_outline(vec![
            ChapterPlan {
                index: 1,
                title: "初遇".into(),
                summary: "两人在山村相识".into(),
                beats: vec!["相遇".into()],
            },
            ChapterPlan {
                index: 2,
                title: "风雪".into(),
                summary: "风雪中互相扶持".into(),
                beats: vec![],
            },
        ]);
        memory
    }

    #[tokio::test]
    async fn test_draft_prompt_carries_plan_and_context() {
        let backend = Arc::new(MockLlmClient::scripted(vec![Ok("第二章正文".into())]));
        let writer = Writer::new(Arc::new(ModelClient::new(backend.clone())));

        let mut memory = memory_with_plan();
        memory.push_chapter("初遇", "……黄昏时分，两人在村口分别。");
        memory.add_feedback(1, "多写一些环境描写");

        let mut ledger = UsageLedger::new();
        let text = writer.produce(&memory, None, &mut ledger).await.unwrap();
        assert_eq!(text, "第二章正文");

        let prompt = &backend.requests()[0][1].content;
        assert!(prompt.contains("第2章"));
        assert!(prompt.contains("风雪中互相扶持"));
        assert!(prompt.contains("村口分别"));
        assert!(prompt.contains("环境描写"));
    }

    #[tokio::test]
    async fn test_revision_prompt_rewrites_target_chapter() {
        let backend = Arc::new(MockLlmClient::scripted(vec![Ok("修订后的正文".into())]));
        let writer = Writer::new(Arc::new(ModelClient::new(backend.clone())));

        let mut memory = memory_with_plan();
        memory.push_chapter("初遇", "初稿正文");
        memory.set_critique(
            1,
            Critique {
                consistency_issues: vec!["时间线矛盾".into()],
                ..Critique::default()
            },
        );

        let mut ledger = UsageLedger::new();
        let text = writer
            .produce(&memory, Some("修正时间线"), &mut ledger)
            .await
            .unwrap();
        assert_eq!(text, "修订后的正文");

        let prompt = &backend.requests()[0][1].content;
        assert!(prompt.contains("重写第1章"));
        assert!(prompt.contains("初稿正文"));
        assert!(prompt.contains("修正时间线"));
    }
}
