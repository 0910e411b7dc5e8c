//! Planner：故事标题与全书章节大纲
//!
//! 调用 LLM 产出 JSON 大纲；parse_outline 先剥离代码块围栏再解析，
//! 解析失败时退回逐行文本解析（「第N章 / Chapter N / 1.」开头识别章节）。
//! 大纲统一规范化为恰好 max_chapters 项：超出截断，不足以续写条目补齐。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::GenerationError;
use crate::llm::{CallOptions, LlmError, Message, ModelClient};
use crate::story::memory::{ChapterPlan, StoryMemory};
use crate::story::RoleAgent;
use crate::usage::{RoleId, UsageLedger};

const PLANNER_SYSTEM: &str =
    "你是资深的故事大纲设计专家，擅长设计结构完整、节奏合理的多章节故事框架。\
     你只输出被要求的 JSON，不输出其它解释文字。";

const PLAN_TEMPLATE: &str = "\
为以下创作需求设计一部恰好 {count} 章的故事。

创作需求：{requirements}

{feedback}请只输出一个 JSON 对象，格式为：
{\"title\": \"故事标题\", \"characters\": [{\"name\": \"人物名\", \"traits\": [\"特质\"]}], \
\"chapters\": [{\"title\": \"章节标题\", \"summary\": \"本章概要\", \"beats\": [\"关键情节点\"]}]}
chapters 必须恰好 {count} 项。";

const REPLAN_TEMPLATE: &str = "\
一部名为《{title}》的故事已完成前 {done} 章，现需要重新设计余下 {count} 章的大纲。

创作需求：{requirements}

已完成章节概览：
{digest}
{feedback}调整要求：{directive}

请只输出一个 JSON 对象，格式为：
{\"chapters\": [{\"title\": \"章节标题\", \"summary\": \"本章概要\", \"beats\": [\"关键情节点\"]}]}
chapters 必须恰好 {count} 项，对应第 {start} 章到第 {end} 章。";

/// Planner 产出的故事框架
#[derive(Clone, Debug)]
pub struct PlannedStory {
    pub title: String,
    pub plans: Vec<ChapterPlan>,
    /// 人物名 -> 初始特质，用于播种人物状态
    pub characters: BTreeMap<String, Vec<String>>,
}

/// 大纲解析的中间形态（序号在规范化时统一重排）
#[derive(Clone, Debug, Default, Deserialize)]
pub struct OutlineDraft {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub characters: Vec<CharacterDraft>,
    #[serde(default)]
    pub chapters: Vec<ChapterDraft>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CharacterDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChapterDraft {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub beats: Vec<String>,
}

/// 剥离应答首尾的 markdown 代码块围栏（```json ... ```）
pub(crate) fn strip_code_fences(raw: &str) -> String {
    static OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^```[a-zA-Z]*\s*\n?").unwrap());
    static CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n?\s*```\s*$").unwrap());
    let trimmed = raw.trim();
    let without_open = OPEN.replace(trimmed, "");
    CLOSE.replace(without_open.trim(), "").trim().to_string()
}

/// 从文本中取出最外层的 JSON 对象片段
pub(crate) fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// 解析大纲应答：JSON 优先，失败退回逐行文本解析
pub fn parse_outline(raw: &str) -> OutlineDraft {
    let cleaned = strip_code_fences(raw);
    if let Ok(draft) = serde_json::from_str::<OutlineDraft>(&cleaned) {
        return draft;
    }
    if let Some(block) = extract_json_block(&cleaned) {
        if let Ok(draft) = serde_json::from_str::<OutlineDraft>(block) {
            return draft;
        }
    }
    tracing::warn!("outline is not valid JSON, falling back to line parsing");
    fallback_outline(&cleaned)
}

/// 逐行文本解析：识别「第N章 / Chapter N / 1.」起始的章节行，其后各行并入概要，
/// 以 - 开头的行作为情节点
fn fallback_outline(text: &str) -> OutlineDraft {
    static CHAPTER_HEAD: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^\s*(?:第[一二三四五六七八九十百零0-9]+章|Chapter\s*\d+|\d+[\.、．:：])\s*(.*)$")
            .unwrap()
    });

    let mut draft = OutlineDraft::default();
    let mut current: Option<ChapterDraft> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = CHAPTER_HEAD.captures(line) {
            if let Some(done) = current.take() {
                draft.chapters.push(done);
            }
            let rest = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            current = Some(ChapterDraft {
                title: if rest.is_empty() { line.to_string() } else { rest.to_string() },
                summary: String::new(),
                beats: Vec::new(),
            });
        } else if let Some(ref mut chapter) = current {
            if let Some(beat) = line.strip_prefix('-').or_else(|| line.strip_prefix('•')) {
                chapter.beats.push(beat.trim().to_string());
            } else {
                if !chapter.summary.is_empty() {
                    chapter.summary.push(' ');
                }
                chapter.summary.push_str(line);
            }
        } else if draft.title.is_empty() {
            // 第一章出现前的首行当作标题
            draft.title = line.trim_matches(['《', '》']).to_string();
        }
    }
    if let Some(done) = current.take() {
        draft.chapters.push(done);
    }
    draft
}

/// 规范化为从 start 起连续编号的恰好 count 项：超出截断，不足以续写条目补齐
fn normalize_plans(drafts: Vec<ChapterDraft>, start: u32, count: usize) -> Vec<ChapterPlan> {
    let mut plans: Vec<ChapterPlan> = drafts
        .into_iter()
        .take(count)
        .enumerate()
        .map(|(offset, d)| {
            let index = start + offset as u32;
            ChapterPlan {
                index,
                title: if d.title.trim().is_empty() {
                    format!("第{}章", index)
                } else {
                    d.title.trim().to_string()
                },
                summary: d.summary.trim().to_string(),
                beats: d.beats,
            }
        })
        .collect();

    while plans.len() < count {
        let index = start + plans.len() as u32;
        plans.push(ChapterPlan {
            index,
            title: format!("第{}章", index),
            summary: "承接前文继续推进主线，收束尚未完成的伏笔。".to_string(),
            beats: Vec::new(),
        });
    }
    plans
}

/// Planner：持有 ModelClient 与采样参数
pub struct Planner {
    client: Arc<ModelClient>,
    options: CallOptions,
}

impl Planner {
    pub fn new(client: Arc<ModelClient>) -> Self {
        Self {
            client,
            options: CallOptions::new(0.7, 2000),
        }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    fn render_prompt(&self, memory: &StoryMemory, directive: Option<&str>) -> String {
        if memory.outline().is_empty() {
            let mut prompt = PLAN_TEMPLATE
                .replace("{count}", &memory.max_chapters().to_string())
                .replace("{requirements}", memory.requirements())
                .replace("{feedback}", &memory.feedback_section());
            if let Some(d) = directive {
                prompt.push_str(&format!("\n补充要求：{}", d));
            }
            prompt
        } else {
            let start = memory.next_chapter_index();
            let count = memory.max_chapters().saturating_sub(memory.chapters().len() as u32);
            REPLAN_TEMPLATE
                .replace("{title}", memory.title().unwrap_or("未命名故事"))
                .replace("{done}", &memory.chapters().len().to_string())
                .replace("{count}", &count.to_string())
                .replace("{requirements}", memory.requirements())
                .replace("{digest}", &memory.chapters_digest())
                .replace("{feedback}", &memory.feedback_section())
                .replace("{directive}", directive.unwrap_or("按读者反馈调整后续走向"))
                .replace("{start}", &start.to_string())
                .replace("{end}", &memory.max_chapters().to_string())
        }
    }

    /// 初次规划：产出标题与覆盖全书的大纲
    pub async fn plan(
        &self,
        memory: &StoryMemory,
        directive: Option<&str>,
        ledger: &mut UsageLedger,
    ) -> Result<PlannedStory, GenerationError> {
        let raw = self
            .produce(memory, directive, ledger)
            .await
            .map_err(GenerationError::planning_model)?;

        let draft = parse_outline(&raw);
        let usable: Vec<ChapterDraft> = draft
            .chapters
            .into_iter()
            .filter(|c| !c.summary.trim().is_empty() || !c.title.trim().is_empty())
            .collect();
        if usable.is_empty() {
            return Err(GenerationError::planning_invalid(
                "outline contains no chapters",
            ));
        }
        if usable.iter().all(|c| c.summary.trim().is_empty()) {
            return Err(GenerationError::planning_invalid(
                "outline chapters have no summary text",
            ));
        }

        let characters: BTreeMap<String, Vec<String>> = draft
            .characters
            .into_iter()
            .filter(|c| !c.name.trim().is_empty())
            .map(|c| {
                let traits = if c.traits.is_empty() && !c.description.trim().is_empty() {
                    vec![c.description.trim().to_string()]
                } else {
                    c.traits
                };
                (c.name.trim().to_string(), traits)
            })
            .collect();

        let plans = normalize_plans(usable, 1, memory.max_chapters() as usize);
        tracing::info!(chapters = plans.len(), title = %draft.title, "outline ready");
        Ok(PlannedStory {
            title: draft.title.trim().to_string(),
            plans,
            characters,
        })
    }

    /// 依反馈重新规划余下章节
    pub async fn replan_remaining(
        &self,
        memory: &StoryMemory,
        directive: Option<&str>,
        ledger: &mut UsageLedger,
    ) -> Result<Vec<ChapterPlan>, GenerationError> {
        let start = memory.next_chapter_index();
        let count = memory
            .max_chapters()
            .saturating_sub(memory.chapters().len() as u32) as usize;

        let raw = self
            .produce(memory, directive, ledger)
            .await
            .map_err(GenerationError::planning_model)?;

        let draft = parse_outline(&raw);
        let usable: Vec<ChapterDraft> = draft
            .chapters
            .into_iter()
            .filter(|c| !c.summary.trim().is_empty() || !c.title.trim().is_empty())
            .collect();
        if usable.is_empty() {
            return Err(GenerationError::planning_invalid(
                "replanned outline contains no chapters",
            ));
        }

        Ok(normalize_plans(usable, start, count))
    }
}

#[async_trait]
impl RoleAgent for Planner {
    fn role(&self) -> RoleId {
        RoleId::Planner
    }

    async fn produce(
        &self,
        memory: &StoryMemory,
        directive: Option<&str>,
        ledger: &mut UsageLedger,
    ) -> Result<String, LlmError> {
        let messages = vec![
            Message::system(PLANNER_SYSTEM),
            Message::user(self.render_prompt(memory, directive)),
        ];
        let generated = self
            .client
            .invoke(self.role(), &messages, &self.options, ledger)
            .await?;
        Ok(generated.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        let fenced = "```json\n{\"title\": \"x\"}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"title\": \"x\"}");
        assert_eq!(strip_code_fences("plain"), "plain");
    }

    #[test]
    fn test_parse_outline_json() {
        let raw = r#"```json
{"title": "远山", "characters": [{"name": "林远", "traits": ["坚韧", "内向"]}],
 "chapters": [
  {"title": "初遇", "summary": "两人在山村相识", "beats": ["相遇", "误会"]},
  {"title": "风雪", "summary": "困于风雪中互相扶持", "beats": []}
]}
```"#;
        let draft = parse_outline(raw);
        assert_eq!(draft.title, "远山");
        assert_eq!(draft.chapters.len(), 2);
        assert_eq!(draft.chapters[0].beats.len(), 2);
        assert_eq!(draft.characters[0].name, "林远");
    }

    #[tokio::test]
    async fn test_plan_collects_characters() {
        use crate::llm::{MockLlmClient, ModelClient};

        let backend = Arc::new(MockLlmClient::scripted(vec![Ok(
            r#"{"title": "远山",
                "characters": [{"name": "林远", "traits": ["坚韧"]},
                               {"name": "阿秋", "description": "乐观的采药人"}],
                "chapters": [{"title": "初遇", "summary": "两人在山村相识"}]}"#
                .to_string(),
        )]));
        let planner = Planner::new(Arc::new(ModelClient::new(backend)));
        let memory = StoryMemory::new("一个故事", 1);
        let mut ledger = UsageLedger::new();

        let planned = planner.plan(&memory, None, &mut ledger).await.unwrap();
        assert_eq!(planned.characters["林远"], vec!["坚韧".to_string()]);
        // 只有 description 时并入特质
        assert_eq!(planned.characters["阿秋"], vec!["乐观的采药人".to_string()]);
    }

    #[test]
    fn test_parse_outline_fallback_lines() {
        let raw = "《远山》\n第一章 初遇\n两人在山村相识。\n- 相遇\n第二章 风雪\n困于风雪中互相扶持。";
        let draft = parse_outline(raw);
        assert_eq!(draft.title, "远山");
        assert_eq!(draft.chapters.len(), 2);
        assert_eq!(draft.chapters[0].title, "初遇");
        assert!(draft.chapters[0].summary.contains("相识"));
        assert_eq!(draft.chapters[0].beats, vec!["相遇".to_string()]);
    }

    #[test]
    fn test_normalize_truncates_and_pads() {
        let drafts = vec![
            ChapterDraft { title: "一".into(), summary: "A".into(), beats: vec![] },
            ChapterDraft { title: "二".into(), summary: "B".into(), beats: vec![] },
            ChapterDraft { title: "三".into(), summary: "C".into(), beats: vec![] },
        ];
        let truncated = normalize_plans(drafts.clone(), 1, 2);
        assert_eq!(truncated.len(), 2);
        assert_eq!(truncated[1].index, 2);

        let padded = normalize_plans(drafts, 1, 5);
        assert_eq!(padded.len(), 5);
        assert_eq!(padded[4].index, 5);
        assert!(!padded[4].summary.is_empty());
    }

    #[tokio::test]
    async fn test_plan_rejects_empty_outline() {
        use crate::llm::{MockLlmClient, ModelClient};

        let backend = Arc::new(MockLlmClient::scripted(vec![Ok(
            r#"{"title": "空", "chapters": []}"#.to_string(),
        )]));
        let planner = Planner::new(Arc::new(ModelClient::new(backend)));
        let memory = StoryMemory::new("一个故事", 3);
        let mut ledger = UsageLedger::new();

        let err = planner.plan(&memory, None, &mut ledger).await.unwrap_err();
        assert!(matches!(err, GenerationError::PlanningFailed { .. }));
        // 模型调用本身成功，账本应有记录
        assert_eq!(ledger.total_requests(), 1);
    }
}
