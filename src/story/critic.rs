//! Critic：章节一致性评估
//!
//! 对照大纲条目检查新成章节，产出结构化评语：评分、一致性问题、修订建议与人物变化。
//! 评语只建议不改写；是否触发重写由生成主循环决定。JSON 解析失败时退回正则抽取，
//! 再失败则使用无问题的缺省评语。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::llm::{CallOptions, LlmError, Message, ModelClient};
use crate::story::memory::StoryMemory;
use crate::story::planner::{extract_json_block, strip_code_fences};
use crate::story::RoleAgent;
use crate::usage::{RoleId, UsageLedger};

/// 评分范围与缺省值
const MIN_RATING: u8 = 1;
const MAX_RATING: u8 = 10;
const DEFAULT_RATING: u8 = 5;

const CRITIC_SYSTEM: &str =
    "你是严谨的故事评论专家，负责检查章节与大纲、前文设定之间的一致性。\
     你只给出评估与建议，不改写正文，并且只输出被要求的 JSON。";

const REVIEW_TEMPLATE: &str = "\
请评估以下章节是否达成其大纲目标，并检查与前文设定的一致性。

大纲目标：第{index}章《{title}》——{summary}
关键情节点：{beats}

章节正文：
{content}

请只输出一个 JSON 对象，格式为：
{\"overall_rating\": 1到10的整数, \"consistency_issues\": [\"发现的一致性问题\"], \
\"suggested_revision\": \"修改建议或 null\", \"character_updates\": {\"人物名\": \"本章中的状态变化\"}}
没有问题时 consistency_issues 为空数组。";

/// 结构化评语
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Critique {
    pub overall_rating: u8,
    pub consistency_issues: Vec<String>,
    pub suggested_revision: Option<String>,
    pub character_updates: BTreeMap<String, String>,
}

impl Default for Critique {
    fn default() -> Self {
        Self {
            overall_rating: DEFAULT_RATING,
            consistency_issues: Vec::new(),
            suggested_revision: None,
            character_updates: BTreeMap::new(),
        }
    }
}

/// 评语解析的中间形态（评分容忍浮点与缺失）
#[derive(Debug, Default, Deserialize)]
struct CritiqueDraft {
    #[serde(default)]
    overall_rating: Option<f64>,
    #[serde(default)]
    consistency_issues: Vec<String>,
    #[serde(default)]
    suggested_revision: Option<String>,
    #[serde(default)]
    character_updates: BTreeMap<String, String>,
}

fn clamp_rating(raw: Option<f64>) -> u8 {
    match raw {
        Some(v) if v.is_finite() => (v.round() as i64).clamp(MIN_RATING as i64, MAX_RATING as i64) as u8,
        _ => DEFAULT_RATING,
    }
}

/// 解析评语应答：JSON 优先，失败退回正则抽取，再失败给出无问题缺省评语
pub fn parse_critique(raw: &str) -> Critique {
    let cleaned = strip_code_fences(raw);
    let parsed = serde_json::from_str::<CritiqueDraft>(&cleaned).ok().or_else(|| {
        extract_json_block(&cleaned).and_then(|block| serde_json::from_str::<CritiqueDraft>(block).ok())
    });

    if let Some(draft) = parsed {
        let suggested = draft
            .suggested_revision
            .filter(|s| !s.trim().is_empty() && s.trim().to_lowercase() != "null");
        return Critique {
            overall_rating: clamp_rating(draft.overall_rating),
            consistency_issues: draft
                .consistency_issues
                .into_iter()
                .filter(|s| !s.trim().is_empty())
                .collect(),
            suggested_revision: suggested,
            character_updates: draft.character_updates,
        };
    }

    tracing::warn!("critique is not valid JSON, falling back to regex extraction");
    fallback_critique(&cleaned)
}

/// 正则兜底：抽取评分与「问题」段落下的条目
fn fallback_critique(text: &str) -> Critique {
    static RATING: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?:评分|rating)[\s\x22]*[:：]\s*(\d+)").unwrap());
    static ISSUES: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?s)问题[：:](.*?)(?:\n\n|$)").unwrap());

    let rating = RATING
        .captures(&text.to_lowercase())
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());

    let issues = ISSUES
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| {
            m.as_str()
                .split(['\n', '。', '；'])
                .map(|s| s.trim().trim_start_matches(['-', '•', ' ']).to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Critique {
        overall_rating: clamp_rating(rating),
        consistency_issues: issues,
        suggested_revision: None,
        character_updates: BTreeMap::new(),
    }
}

/// Critic：持有 ModelClient 与采样参数
pub struct Critic {
    client: Arc<ModelClient>,
    options: CallOptions,
}

impl Critic {
    pub fn new(client: Arc<ModelClient>) -> Self {
        Self {
            client,
            options: CallOptions::new(0.3, 1500),
        }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// 评估最新章节，返回结构化评语
    pub async fn review(
        &self,
        memory: &StoryMemory,
        ledger: &mut UsageLedger,
    ) -> Result<Critique, LlmError> {
        let raw = self.produce(memory, None, ledger).await?;
        Ok(parse_critique(&raw))
    }
}

#[async_trait]
impl RoleAgent for Critic {
    fn role(&self) -> RoleId {
        RoleId::Critic
    }

    async fn produce(
        &self,
        memory: &StoryMemory,
        _directive: Option<&str>,
        ledger: &mut UsageLedger,
    ) -> Result<String, LlmError> {
        let chapter = memory
            .chapters()
            .last()
            .ok_or_else(|| LlmError::InvalidRequest("no chapter to review".to_string()))?;
        let (summary, beats) = match memory.plan_for(chapter.index) {
            Some(plan) => (
                plan.summary.clone(),
                if plan.beats.is_empty() {
                    "无".to_string()
                } else {
                    plan.beats.join("；")
                },
            ),
            None => (String::from("（无大纲条目）"), "无".to_string()),
        };

        let prompt = REVIEW_TEMPLATE
            .replace("{index}", &chapter.index.to_string())
            .replace("{title}", &chapter.title)
            .replace("{summary}", &summary)
            .replace("{beats}", &beats)
            .replace("{content}", &chapter.text);

        let messages = vec![Message::system(CRITIC_SYSTEM), Message::user(prompt)];
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
    fn test_parse_critique_json_with_fences() {
        let raw = r#"```json
{"overall_rating": 8, "consistency_issues": ["主角名字前后不一"],
 "suggested_revision": "统一主角名字", "character_updates": {"林远": "情绪转向坚定"}}
```"#;
        let critique = parse_critique(raw);
        assert_eq!(critique.overall_rating, 8);
        assert_eq!(critique.consistency_issues.len(), 1);
        assert_eq!(critique.suggested_revision.as_deref(), Some("统一主角名字"));
        assert_eq!(critique.character_updates["林远"], "情绪转向坚定");
    }

    #[test]
    fn test_rating_clamped_and_defaulted() {
        let high = parse_critique(r#"{"overall_rating": 99, "consistency_issues": []}"#);
        assert_eq!(high.overall_rating, 10);

        let low = parse_critique(r#"{"overall_rating": -3, "consistency_issues": []}"#);
        assert_eq!(low.overall_rating, 1);

        let missing = parse_critique(r#"{"consistency_issues": []}"#);
        assert_eq!(missing.overall_rating, 5);
    }

    #[test]
    fn test_null_suggested_revision_dropped() {
        let critique =
            parse_critique(r#"{"overall_rating": 7, "suggested_revision": null}"#);
        assert!(critique.suggested_revision.is_none());
    }

    #[test]
    fn test_fallback_extracts_rating_and_issues() {
        let raw = "总体评价不错。\n评分：6\n问题：节奏偏慢；配角动机不明\n\n其余从略。";
        let critique = parse_critique(raw);
        assert_eq!(critique.overall_rating, 6);
        assert_eq!(critique.consistency_issues.len(), 2);
    }

    #[test]
    fn test_garbage_yields_default_critique() {
        let critique = parse_critique("这章写得还行吧");
        assert_eq!(critique.overall_rating, 5);
        assert!(critique.consistency_issues.is_empty());
        assert!(critique.suggested_revision.is_none());
    }
}
