use serde::{Deserialize, Serialize};

/// 后端角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendRole {
    /// 被测后端（生成答案）
    Subject,
    /// 评审团成员（投票）
    Judge,
}

/// 单个后端的配置（来自 backends.toml）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// 后端名称，在结果树中作为唯一键
    pub name: String,
    /// 提供方，决定默认限流预算和接口地址
    pub provider: String,
    /// 模型名称
    pub model: String,
    #[serde(default)]
    pub api_base: Option<String>,
    /// 最大输入 token 数
    #[serde(default = "default_max_input")]
    pub max_input: usize,
    #[serde(default)]
    pub requests_per_minute: Option<usize>,
    /// 为 true 时每分钟额度摊到每秒发放
    #[serde(default)]
    pub spread: bool,
    /// 同一限流组的后端共享一个票据代理
    #[serde(default)]
    pub rate_group: Option<String>,
    #[serde(default = "default_roles")]
    pub roles: Vec<BackendRole>,
}

fn default_max_input() -> usize {
    128_000
}

fn default_roles() -> Vec<BackendRole> {
    vec![BackendRole::Subject]
}

impl BackendSpec {
    pub fn is_subject(&self) -> bool {
        self.roles.contains(&BackendRole::Subject)
    }

    pub fn is_judge(&self) -> bool {
        self.roles.contains(&BackendRole::Judge)
    }

    /// 票据代理的分组键（未指定限流组时按后端名独占）
    pub fn rate_group_key(&self) -> &str {
        self.rate_group.as_deref().unwrap_or(&self.name)
    }
}

/// backends.toml 文件结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendFile {
    #[serde(default)]
    pub backends: Vec<BackendSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_spec_defaults() {
        let file: BackendFile = toml::from_str(
            r#"
            [[backends]]
            name = "gpt-4o"
            provider = "openai"
            model = "gpt-4o"

            [[backends]]
            name = "judge-a"
            provider = "deepseek"
            model = "deepseek-chat"
            roles = ["judge"]
            rate_group = "deepseek"
            "#,
        )
        .unwrap();

        let subject = &file.backends[0];
        assert!(subject.is_subject());
        assert!(!subject.is_judge());
        assert_eq!(subject.max_input, 128_000);
        assert_eq!(subject.rate_group_key(), "gpt-4o");

        let judge = &file.backends[1];
        assert!(judge.is_judge());
        assert_eq!(judge.rate_group_key(), "deepseek");
    }
}
