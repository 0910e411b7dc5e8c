//! fabula demo 入口
//!
//! 用法：`fabula [创作需求...]`；按配置与可用的 API Key 选择后端（无 Key 时退回 Mock），
//! 生成后打印标题、各章正文与按角色汇总的用量。

use std::sync::Arc;

use anyhow::Context;
use fabula::{
    create_backend, load_config, AppConfig, GenerationSession, ModelClient, RunStatus,
    StoryGenerator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fabula::observability::init();

    let cfg = load_config(None).unwrap_or_else(|err| {
        tracing::warn!(%err, "config load failed, using defaults");
        AppConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let prompt = if args.is_empty() {
        "一个关于友情的故事".to_string()
    } else {
        args.join(" ")
    };

    let backend = create_backend(&cfg);
    let client = Arc::new(ModelClient::from_config(backend, &cfg));
    let generator = StoryGenerator::from_config(client, &cfg);

    let session = GenerationSession::new(prompt, cfg.generation.max_chapters);
    let result = generator.generate(session).await;

    println!("《{}》\n", result.title);
    for chapter in &result.chapters {
        println!("—— 第{}章 {} ——\n", chapter.index, chapter.title);
        println!("{}\n", chapter.text);
    }

    let summary =
        serde_json::to_string_pretty(&result.usage.role_summary()).context("serialize usage")?;
    println!(
        "状态: {} | 请求数: {} | token 数: {}\n{}",
        result.status.as_str(),
        result.usage.total_requests(),
        result.usage.total_tokens(),
        summary
    );

    if result.status == RunStatus::Failed {
        if let Some(err) = result.error {
            return Err(anyhow::Error::new(err).context("generation failed"));
        }
    }
    Ok(())
}
