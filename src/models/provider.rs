//! 后端提供方的默认参数
//!
//! 配置文件没有给出限流预算或 API 地址时使用这里的值。

use phf::phf_map;

/// 提供方默认参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderDefaults {
    /// 每分钟请求数
    pub requests_per_minute: usize,
    /// OpenAI 兼容接口地址（Ollama 为原生接口地址）
    pub api_base: &'static str,
    /// API 密钥所在的环境变量，`None` 表示不需要密钥
    pub api_key_var: Option<&'static str>,
    /// 使用的客户端协议
    pub protocol: Protocol,
}

/// 客户端协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// OpenAI Chat Completions 兼容接口
    OpenAiCompatible,
    /// Ollama `/api/generate`
    Ollama,
}

pub static PROVIDER_DEFAULTS: phf::Map<&'static str, ProviderDefaults> = phf_map! {
    "openai" => ProviderDefaults {
        requests_per_minute: 5000,
        api_base: "https://api.openai.com/v1",
        api_key_var: Some("OPENAI_API_KEY"),
        protocol: Protocol::OpenAiCompatible,
    },
    "deepseek" => ProviderDefaults {
        requests_per_minute: 600,
        api_base: "https://api.deepseek.com",
        api_key_var: Some("DEEPSEEK_API_KEY"),
        protocol: Protocol::OpenAiCompatible,
    },
    "mistral" => ProviderDefaults {
        requests_per_minute: 300,
        api_base: "https://api.mistral.ai/v1",
        api_key_var: Some("MISTRAL_API_KEY"),
        protocol: Protocol::OpenAiCompatible,
    },
    "fireworks" => ProviderDefaults {
        requests_per_minute: 480,
        api_base: "https://api.fireworks.ai/inference/v1",
        api_key_var: Some("FIREWORKS_API_KEY"),
        protocol: Protocol::OpenAiCompatible,
    },
    "gemini" => ProviderDefaults {
        requests_per_minute: 1200,
        api_base: "https://generativelanguage.googleapis.com/v1beta/openai",
        api_key_var: Some("GEMINI_API_KEY"),
        protocol: Protocol::OpenAiCompatible,
    },
    "anthropic" => ProviderDefaults {
        requests_per_minute: 480,
        api_base: "https://api.anthropic.com/v1",
        api_key_var: Some("ANTHROPIC_API_KEY"),
        protocol: Protocol::OpenAiCompatible,
    },
    "ai21" => ProviderDefaults {
        requests_per_minute: 60,
        api_base: "https://api.ai21.com/studio/v1",
        api_key_var: Some("AI21_API_KEY"),
        protocol: Protocol::OpenAiCompatible,
    },
    "ollama" => ProviderDefaults {
        requests_per_minute: 60,
        api_base: "http://localhost:11434",
        api_key_var: None,
        protocol: Protocol::Ollama,
    },
};

/// 按名称查找提供方默认参数（忽略大小写）
pub fn provider_defaults(provider: &str) -> Option<&'static ProviderDefaults> {
    PROVIDER_DEFAULTS.get(provider.to_ascii_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_lookup_is_case_insensitive() {
        let defaults = provider_defaults("Mistral").unwrap();
        assert_eq!(defaults.requests_per_minute, 300);
        assert_eq!(defaults.protocol, Protocol::OpenAiCompatible);
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let defaults = provider_defaults("ollama").unwrap();
        assert!(defaults.api_key_var.is_none());
        assert_eq!(defaults.protocol, Protocol::Ollama);
        assert!(provider_defaults("unknown").is_none());
    }
}
