//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FABULA__*` 覆盖（双下划线表示嵌套，如 `FABULA__LLM__MODEL=deepseek-chat`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub retry: RetrySection,
    pub generation: GenerationSection,
    pub roles: RolesSection,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai；优先级由 API Key 与 provider 共同决定
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次模型调用超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [retry] 段：瞬时失败的指数退避重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    /// 每次退避附加的随机抖动上限（毫秒）
    pub max_jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_jitter_ms: 250,
        }
    }
}

/// [generation] 段：生成主循环参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub max_chapters: u32,
    /// 反馈回调等待上限（秒），超时视为「继续、无指令」
    pub feedback_timeout_secs: u64,
    /// 写作时携带的上一章结尾窗口（字符数）
    pub closing_context_chars: usize,
    /// 评分低于该值时记录警告
    pub low_rating_warn: u8,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            max_chapters: 5,
            feedback_timeout_secs: 120,
            closing_context_chars: 600,
            low_rating_warn: 7,
        }
    }
}

impl GenerationSection {
    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_secs(self.feedback_timeout_secs)
    }
}

/// [roles] 段：各角色的采样参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RolesSection {
    pub planner: RoleSection,
    pub writer: RoleSection,
    pub critic: RoleSection,
}

impl Default for RolesSection {
    fn default() -> Self {
        Self {
            planner: RoleSection {
                temperature: 0.7,
                max_tokens: 2000,
            },
            writer: RoleSection {
                temperature: 0.9,
                max_tokens: 4000,
            },
            critic: RoleSection {
                temperature: 0.3,
                max_tokens: 1500,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleSection {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// 从 config 目录加载配置，环境变量 FABULA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FABULA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FABULA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.generation.max_chapters, 5);
        assert_eq!(cfg.llm.provider, "deepseek");
        assert!(cfg.roles.writer.temperature > cfg.roles.critic.temperature);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabula.toml");
        std::fs::write(
            &path,
            "[llm]\nmodel = \"gpt-4o-mini\"\n\n[generation]\nmax_chapters = 3\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
        assert_eq!(cfg.generation.max_chapters, 3);
        // 未覆盖的键保持默认
        assert_eq!(cfg.retry.max_attempts, 3);
    }
}
