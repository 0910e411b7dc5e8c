//! 故事记忆：一次生成运行内的共享上下文
//!
//! 大纲、已成章节、人物状态与读者反馈统一由 StoryMemory 持有；唯一写入者是生成主循环，
//! 角色只拿到只读借用。章节号从 1 起连续递增，评语只能落在已有正文的章节上。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::story::critic::Critique;

/// 单章规划：序号、标题、概要与关键情节点
#[derive(Clone, Debug, Serialize)]
pub struct ChapterPlan {
    pub index: u32,
    pub title: String,
    pub summary: String,
    pub beats: Vec<String>,
}

/// 已成章节；revised 标记本章是否已消耗过一次修订机会
#[derive(Clone, Debug, Serialize)]
pub struct Chapter {
    pub index: u32,
    pub title: String,
    pub text: String,
    pub critique: Option<Critique>,
    pub revised: bool,
}

/// 人物状态：特质与弧线笔记，由评语的 character_updates 折叠而来
#[derive(Clone, Debug, Default, Serialize)]
pub struct CharacterState {
    pub traits: Vec<String>,
    pub arc_notes: Vec<String>,
}

/// 一条读者反馈指令
#[derive(Clone, Debug, Serialize)]
pub struct FeedbackEntry {
    pub chapter_index: u32,
    pub directive: String,
}

/// 故事记忆：生成运行的全部可变上下文
#[derive(Debug, Serialize)]
pub struct StoryMemory {
    requirements: String,
    max_chapters: u32,
    title: Option<String>,
    outline: Vec<ChapterPlan>,
    chapters: Vec<Chapter>,
    characters: BTreeMap<String, CharacterState>,
    feedback_log: Vec<FeedbackEntry>,
}

impl StoryMemory {
    pub fn new(requirements: impl Into<String>, max_chapters: u32) -> Self {
        Self {
            requirements: requirements.into(),
            max_chapters: max_chapters.max(1),
            title: None,
            outline: Vec::new(),
            chapters: Vec::new(),
            characters: BTreeMap::new(),
            feedback_log: Vec::new(),
        }
    }

    pub fn requirements(&self) -> &str {
        &self.requirements
    }

    pub fn max_chapters(&self) -> u32 {
        self.max_chapters
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        let title = title.into();
        if !title.trim().is_empty() {
            self.title = Some(title);
        }
    }

    pub fn outline(&self) -> &[ChapterPlan] {
        &self.outline
    }

    pub fn set_outline(&mut self, plans: Vec<ChapterPlan>) {
        self.outline = plans;
    }

    /// 用新规划替换从 start_index（含）起的大纲尾部；已成章节对应的条目不受影响
    pub fn replace_outline_from(&mut self, start_index: u32, plans: Vec<ChapterPlan>) {
        self.outline.retain(|p| p.index < start_index);
        self.outline.extend(plans);
    }

    pub fn plan_for(&self, index: u32) -> Option<&ChapterPlan> {
        self.outline.iter().find(|p| p.index == index)
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn chapter(&self, index: u32) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.index == index)
    }

    /// 下一个待写章节号（= 已成章节数 + 1）
    pub fn next_chapter_index(&self) -> u32 {
        self.chapters.len() as u32 + 1
    }

    /// 追加新章节，序号由既有章节数派生，保证从 1 起连续
    pub fn push_chapter(&mut self, title: impl Into<String>, text: impl Into<String>) -> u32 {
        let index = self.next_chapter_index();
        self.chapters.push(Chapter {
            index,
            title: title.into(),
            text: text.into(),
            critique: None,
            revised: false,
        });
        index
    }

    /// 评语只能落在已有正文的章节上；章节不存在则丢弃并返回 false
    pub fn set_critique(&mut self, index: u32, critique: Critique) -> bool {
        match self.chapters.iter_mut().find(|c| c.index == index) {
            Some(chapter) => {
                chapter.critique = Some(critique);
                true
            }
            None => false,
        }
    }

    /// 用修订稿覆盖章节正文并标记修订已消耗
    pub fn apply_revision(&mut self, index: u32, text: impl Into<String>) -> bool {
        match self.chapters.iter_mut().find(|c| c.index == index) {
            Some(chapter) => {
                chapter.text = text.into();
                chapter.revised = true;
                true
            }
            None => false,
        }
    }

    /// 待修订章节：最后一章评语带一致性问题且尚未修订过
    pub fn revision_target(&self) -> Option<&Chapter> {
        let last = self.chapters.last()?;
        let has_issues = last
            .critique
            .as_ref()
            .map(|c| !c.consistency_issues.is_empty())
            .unwrap_or(false);
        if has_issues && !last.revised {
            Some(last)
        } else {
            None
        }
    }

    pub fn characters(&self) -> &BTreeMap<String, CharacterState> {
        &self.characters
    }

    /// 用规划阶段的人物表播种初始特质
    pub fn seed_characters(&mut self, seeds: BTreeMap<String, Vec<String>>) {
        for (name, traits) in seeds {
            if name.trim().is_empty() {
                continue;
            }
            let state = self.characters.entry(name).or_default();
            state.traits = traits;
        }
    }

    /// 折叠评语给出的人物变化：新增人物或向既有人物追加弧线笔记
    pub fn apply_character_updates(&mut self, updates: &BTreeMap<String, String>) {
        for (name, note) in updates {
            if name.trim().is_empty() || note.trim().is_empty() {
                continue;
            }
            let state = self.characters.entry(name.clone()).or_default();
            state.arc_notes.push(note.clone());
        }
    }

    pub fn feedback_log(&self) -> &[FeedbackEntry] {
        &self.feedback_log
    }

    pub fn add_feedback(&mut self, chapter_index: u32, directive: impl Into<String>) {
        self.feedback_log.push(FeedbackEntry {
            chapter_index,
            directive: directive.into(),
        });
    }

    /// 上一章结尾窗口（按字符截取，供写作衔接）
    pub fn closing_context(&self, max_chars: usize) -> Option<String> {
        let last = self.chapters.last()?;
        let chars: Vec<char> = last.text.chars().collect();
        let start = chars.len().saturating_sub(max_chars);
        Some(chars[start..].iter().collect())
    }

    /// 人物现状段落（注入角色提示词；无人物时为空）
    pub fn characters_section(&self) -> String {
        if self.characters.is_empty() {
            return String::new();
        }
        let mut out = String::from("## 人物现状\n");
        for (name, state) in &self.characters {
            let mut parts: Vec<String> = Vec::new();
            if !state.traits.is_empty() {
                parts.push(state.traits.join("、"));
            }
            if !state.arc_notes.is_empty() {
                parts.push(state.arc_notes.join("；"));
            }
            out.push_str(&format!("- {}：{}\n", name, parts.join("；")));
        }
        out.push('\n');
        out
    }

    /// 读者反馈段落（注入角色提示词；无反馈时为空）
    pub fn feedback_section(&self) -> String {
        if self.feedback_log.is_empty() {
            return String::new();
        }
        let mut out = String::from("## 读者反馈（后续创作需遵循）\n");
        for entry in &self.feedback_log {
            out.push_str(&format!("- 第{}章后：{}\n", entry.chapter_index, entry.directive));
        }
        out.push('\n');
        out
    }

    /// 已成章节概览（供重新规划时参考）
    pub fn chapters_digest(&self) -> String {
        let mut out = String::new();
        for chapter in &self.chapters {
            let preview: String = chapter.text.chars().take(120).collect();
            out.push_str(&format!("第{}章《{}》：{}…\n", chapter.index, chapter.title, preview));
        }
        out
    }

    /// 收尾时移出全部章节
    pub fn into_chapters(self) -> Vec<Chapter> {
        self.chapters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn critique_with_issues(issues: Vec<&str>) -> Critique {
        Critique {
            consistency_issues: issues.into_iter().map(String::from).collect(),
            ..Critique::default()
        }
    }

    #[test]
    fn test_chapter_indices_contiguous_from_one() {
        let mut memory = StoryMemory::new("一个故事", 3);
        assert_eq!(memory.next_chapter_index(), 1);
        assert_eq!(memory.push_chapter("开端", "第一章正文"), 1);
        assert_eq!(memory.push_chapter("发展", "第二章正文"), 2);

        let indices: Vec<u32> = memory.chapters().iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn test_critique_requires_existing_chapter() {
        let mut memory = StoryMemory::new("一个故事", 3);
        assert!(!memory.set_critique(1, Critique::default()));

        memory.push_chapter("开端", "正文");
        assert!(memory.set_critique(1, Critique::default()));
        assert!(memory.chapter(1).unwrap().critique.is_some());
    }

    #[test]
    fn test_revision_target_and_marker() {
        let mut memory = StoryMemory::new("一个故事", 3);
        memory.push_chapter("开端", "初稿");
        assert!(memory.revision_target().is_none());

        memory.set_critique(1, critique_with_issues(vec!["时间线矛盾"]));
        assert_eq!(memory.revision_target().unwrap().index, 1);

        memory.apply_revision(1, "修订稿");
        assert_eq!(memory.chapter(1).unwrap().text, "修订稿");
        assert!(memory.chapter(1).unwrap().revised);

        // 再次出现问题也不再给出修订目标
        memory.set_critique(1, critique_with_issues(vec!["仍有矛盾"]));
        assert!(memory.revision_target().is_none());
    }

    #[test]
    fn test_closing_context_respects_char_boundary() {
        let mut memory = StoryMemory::new("一个故事", 3);
        memory.push_chapter("开端", "春眠不觉晓，处处闻啼鸟。");
        let tail = memory.closing_context(5).unwrap();
        assert_eq!(tail, "处闻啼鸟。");
        assert!(memory.closing_context(1000).unwrap().chars().count() == 12);
    }

    #[test]
    fn test_character_updates_fold_into_state() {
        let mut memory = StoryMemory::new("一个故事", 3);
        let mut updates = BTreeMap::new();
        updates.insert("林远".to_string(), "开始怀疑自己的选择".to_string());
        updates.insert("".to_string(), "应被忽略".to_string());
        memory.apply_character_updates(&updates);

        let mut second = BTreeMap::new();
        second.insert("林远".to_string(), "与旧友和解".to_string());
        memory.apply_character_updates(&second);

        assert_eq!(memory.characters().len(), 1);
        assert_eq!(memory.characters()["林远"].arc_notes.len(), 2);
        assert!(memory.characters_section().contains("林远"));
    }

    #[test]
    fn test_feedback_section_renders_entries() {
        let mut memory = StoryMemory::new("一个故事", 5);
        assert!(memory.feedback_section().is_empty());
        memory.add_feedback(2, "多写一些环境描写");
        let section = memory.feedback_section();
        assert!(section.contains("第2章后"));
        assert!(section.contains("环境描写"));
    }

    #[test]
    fn test_replace_outline_tail() {
        let mut memory = StoryMemory::new("一个故事", 3);
        memory.set_outline(vec![
            ChapterPlan { index: 1, title: "一".into(), summary: "A".into(), beats: vec![] },
            ChapterPlan { index: 2, title: "二".into(), summary: "B".into(), beats: vec![] },
            ChapterPlan { index: 3, title: "三".into(), summary: "C".into(), beats: vec![] },
        ]);
        memory.replace_outline_from(
            2,
            vec![
                ChapterPlan { index: 2, title: "新二".into(), summary: "B2".into(), beats: vec![] },
                ChapterPlan { index: 3, title: "新三".into(), summary: "C2".into(), beats: vec![] },
            ],
        );
        assert_eq!(memory.plan_for(1).unwrap().summary, "A");
        assert_eq!(memory.plan_for(2).unwrap().title, "新二");
        assert_eq!(memory.outline().len(), 3);
    }
}
