//! OpenAI 兼容接口客户端
//!
//! 使用 `async-openai` 调用 Chat Completions，
//! 兼容 OpenAI、DeepSeek、Mistral、Fireworks 等提供 OpenAI 兼容端点的服务。

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clients::backend::{Backend, BackendError};

/// 单次回复的最大 token 数
const MAX_COMPLETION_TOKENS: u32 = 1024;

pub struct OpenAiCompatibleClient {
    id: String,
    model_name: String,
    max_input: usize,
    client: Client<OpenAIConfig>,
}

impl OpenAiCompatibleClient {
    /// 创建新的客户端
    ///
    /// # 参数
    /// - `id`: 后端名称
    /// - `model_name`: 请求中使用的模型名
    /// - `api_base`: 接口地址
    /// - `api_key`: API 密钥
    /// - `max_input`: 最大输入 token 数
    pub fn new(
        id: impl Into<String>,
        model_name: impl Into<String>,
        api_base: &str,
        api_key: &str,
        max_input: usize,
    ) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base);

        Self {
            id: id.into(),
            model_name: model_name.into(),
            max_input,
            client: Client::with_config(openai_config),
        }
    }

    fn build_request_error(&self, err: impl std::fmt::Display) -> BackendError {
        BackendError::Fatal {
            backend: self.id.clone(),
            message: format!("构建请求失败: {}", err),
        }
    }
}

#[async_trait]
impl Backend for OpenAiCompatibleClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn max_input(&self) -> usize {
        self.max_input
    }

    async fn invoke(&self, prompt: &str, system: Option<&str>) -> Result<String, BackendError> {
        debug!(
            "[{}] 调用模型 {}，提示词长度: {} 字符",
            self.id,
            self.model_name,
            prompt.len()
        );

        let mut messages = Vec::new();

        if let Some(sys_msg) = system {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_msg)
                .build()
                .map_err(|e| self.build_request_error(e))?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(|e| self.build_request_error(e))?;
        messages.push(ChatCompletionRequestMessage::User(user_msg));

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.0)
            .max_tokens(MAX_COMPLETION_TOKENS)
            .build()
            .map_err(|e| self.build_request_error(e))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("[{}] API 调用失败: {}", self.id, e);
            BackendError::classify(&self.id, None, e.to_string())
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| BackendError::EmptyResponse {
                backend: self.id.clone(),
            })?;

        Ok(content.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_reports_identity() {
        let client = OpenAiCompatibleClient::new(
            "gpt-4o",
            "gpt-4o-2024-08-06",
            "https://api.openai.com/v1",
            "sk-test",
            128_000,
        );
        assert_eq!(client.id(), "gpt-4o");
        assert_eq!(client.max_input(), 128_000);
    }

    #[tokio::test]
    #[ignore] // 需要真实的 API 密钥
    async fn test_invoke_real_endpoint() {
        let key = crate::config::api_key("OPENAI_API_KEY").unwrap();
        let client = OpenAiCompatibleClient::new(
            "gpt-4o-mini",
            "gpt-4o-mini",
            "https://api.openai.com/v1",
            &key,
            128_000,
        );
        let reply = client.invoke("Reply with the word ok.", None).await.unwrap();
        assert!(!reply.is_empty());
    }
}
