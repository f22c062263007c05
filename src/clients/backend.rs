//! 后端能力抽象
//!
//! 被测后端和评审后端都只是"给一段提示词，返回一段文本"的能力。
//! 认证和 HTTP 传输细节留给具体客户端。

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::infrastructure::TicketError;

/// 失败分类，调用方按分类决定重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 暂时性失败，消耗一次重试机会
    Retryable,
    /// 后端报告超出限流，走票据代理的溢出池，不消耗重试机会
    RateLimited,
    /// 不可恢复，立即放弃
    Fatal,
}

/// 后端调用错误
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("[{backend}] 超出限流: {message}")]
    RateLimited { backend: String, message: String },
    #[error("[{backend}] 调用失败: {message}")]
    Transient { backend: String, message: String },
    /// 空回复，通常是后端悄悄限流的症状
    #[error("[{backend}] 返回内容为空")]
    EmptyResponse { backend: String },
    #[error("[{backend}] 调用超时 ({after:?})")]
    Timeout { backend: String, after: Duration },
    #[error("[{backend}] 不可恢复的错误: {message}")]
    Fatal { backend: String, message: String },
    #[error(transparent)]
    Ticket(#[from] TicketError),
}

impl BackendError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BackendError::RateLimited { .. } => FailureKind::RateLimited,
            BackendError::Transient { .. }
            | BackendError::EmptyResponse { .. }
            | BackendError::Timeout { .. } => FailureKind::Retryable,
            BackendError::Fatal { .. } => FailureKind::Fatal,
            BackendError::Ticket(TicketError::NoTicketAvailable { .. }) => FailureKind::Retryable,
            BackendError::Ticket(TicketError::Closed { .. }) => FailureKind::Fatal,
        }
    }

    /// 按 HTTP 状态码和错误信息归类
    pub fn classify(backend: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        let backend = backend.to_string();
        let message = message.into();

        if status == Some(429) || matches_pattern(&RATE_LIMIT_PATTERN, &message) {
            return BackendError::RateLimited { backend, message };
        }
        if matches!(status, Some(401 | 403 | 404)) || matches_pattern(&FATAL_PATTERN, &message) {
            return BackendError::Fatal { backend, message };
        }
        BackendError::Transient { backend, message }
    }
}

static RATE_LIMIT_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(rate.?limit|\b429\b|too many requests|quota exceeded|resource.?exhausted)").ok()
});

static FATAL_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(invalid.?api.?key|incorrect api key|unauthori[sz]ed|authentication|permission denied|model.{0,40}(not found|does not exist))",
    )
    .ok()
});

fn matches_pattern(pattern: &Option<Regex>, message: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(message))
}

/// 一个可调用的后端
#[async_trait]
pub trait Backend: Send + Sync {
    /// 后端名称
    fn id(&self) -> &str;

    /// 最大输入 token 数
    fn max_input(&self) -> usize;

    /// 发送一次请求
    ///
    /// # 参数
    /// - `prompt`: 用户提示词
    /// - `system`: 系统提示词（可选）
    async fn invoke(&self, prompt: &str, system: Option<&str>) -> Result<String, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_by_status_and_message() {
        let by_status = BackendError::classify("gpt", Some(429), "slow down");
        assert_eq!(by_status.kind(), FailureKind::RateLimited);

        let by_message = BackendError::classify("gpt", None, "Rate limit reached for requests");
        assert_eq!(by_message.kind(), FailureKind::RateLimited);

        let quota = BackendError::classify("gemini", Some(400), "RESOURCE_EXHAUSTED");
        assert_eq!(quota.kind(), FailureKind::RateLimited);
    }

    #[test]
    fn test_classify_fatal_and_transient() {
        let auth = BackendError::classify("gpt", Some(401), "Incorrect API key provided");
        assert_eq!(auth.kind(), FailureKind::Fatal);

        let model = BackendError::classify("gpt", None, "The model `gpt-9` does not exist");
        assert_eq!(model.kind(), FailureKind::Fatal);

        let network = BackendError::classify("gpt", Some(502), "bad gateway");
        assert_eq!(network.kind(), FailureKind::Retryable);
    }

    #[test]
    fn test_ticket_errors_are_classified() {
        let timeout: BackendError = TicketError::NoTicketAvailable {
            broker: "gpt".to_string(),
            waited: Duration::from_secs(1),
        }
        .into();
        assert_eq!(timeout.kind(), FailureKind::Retryable);

        let closed: BackendError = TicketError::Closed {
            broker: "gpt".to_string(),
        }
        .into();
        assert_eq!(closed.kind(), FailureKind::Fatal);
    }
}
