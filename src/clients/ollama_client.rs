//! Ollama 本地模型客户端
//!
//! 直接调用 `POST {base}/api/generate`，关闭流式输出。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clients::backend::{Backend, BackendError};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_ctx: usize,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

pub struct OllamaClient {
    id: String,
    model_name: String,
    api_base: String,
    max_input: usize,
    http: reqwest::Client,
}

impl OllamaClient {
    /// 创建新的 Ollama 客户端
    pub fn new(
        id: impl Into<String>,
        model_name: impl Into<String>,
        api_base: impl Into<String>,
        max_input: usize,
    ) -> Self {
        Self {
            id: id.into(),
            model_name: model_name.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            max_input,
            http: reqwest::Client::new(),
        }
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.api_base)
    }
}

#[async_trait]
impl Backend for OllamaClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn max_input(&self) -> usize {
        self.max_input
    }

    async fn invoke(&self, prompt: &str, system: Option<&str>) -> Result<String, BackendError> {
        debug!("[{}] 调用 Ollama 模型 {}", self.id, self.model_name);

        let body = GenerateRequest {
            model: &self.model_name,
            prompt,
            system,
            stream: false,
            options: GenerateOptions {
                temperature: 0.0,
                num_ctx: self.max_input,
            },
        };

        let response = self
            .http
            .post(self.generate_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("[{}] 请求发送失败: {}", self.id, e);
                BackendError::Transient {
                    backend: self.id.clone(),
                    message: e.to_string(),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("[{}] 请求失败，状态码: {}", self.id, status);
            return Err(BackendError::classify(&self.id, Some(status.as_u16()), text));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| BackendError::Transient {
            backend: self.id.clone(),
            message: format!("解析响应失败: {}", e),
        })?;

        Ok(parsed.response.trim().to_string())
    }
}
