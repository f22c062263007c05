//! 带重试的后端调用 - 业务能力层
//!
//! 只负责"把一次请求送到后端并拿回非空回复"，不关心流程。
//!
//! - 每次尝试前先从票据代理领票
//! - 后端报告限流时转入溢出池排队，不消耗重试次数
//! - 暂时性失败按 `尝试次数 × 基础延迟` 退避后重试
//! - 重试耗尽时返回哨兵结果而不是报错

use std::time::Duration;

use tracing::{debug, warn};

use crate::clients::{BackendError, BackendHandle, FailureKind};
use crate::config::Config;
use crate::results::{ExceptionRecord, Stage, TrialKey};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// 限流拒绝的重试上限，超过后按普通失败处理
    pub rate_limit_retries: u32,
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            rate_limit_retries: 100,
            call_timeout: Some(Duration::from_secs(90)),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: config.retry_base_delay,
            rate_limit_retries: config.rate_limit_retries,
            call_timeout: config.call_timeout,
        }
    }

    /// 第 `attempt` 次失败后的等待时间（`attempt` 从 1 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// 一次失败的尝试
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    /// 第几次尝试（从 1 开始）
    pub attempt: u32,
    pub error: BackendError,
}

/// 调用的最终结果
#[derive(Debug, Clone)]
pub enum InvocationOutcome {
    Answered { text: String, attempts: u32 },
    /// 哨兵结果：重试耗尽或遇到不可恢复错误
    Exhausted { attempts: u32, last_error: BackendError },
}

/// 调用报告：结果加上每次失败的记录
#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub outcome: InvocationOutcome,
    pub failures: Vec<AttemptFailure>,
    /// 因限流拒绝转入溢出池的次数
    pub rate_limited: u32,
}

impl InvocationReport {
    /// 没有发出任何请求就失败（任务异常退出等）
    pub fn failed(error: BackendError) -> Self {
        Self {
            outcome: InvocationOutcome::Exhausted {
                attempts: 1,
                last_error: error.clone(),
            },
            failures: vec![AttemptFailure { attempt: 1, error }],
            rate_limited: 0,
        }
    }

    pub fn answer(&self) -> Option<&str> {
        match &self.outcome {
            InvocationOutcome::Answered { text, .. } => Some(text),
            InvocationOutcome::Exhausted { .. } => None,
        }
    }

    pub fn into_answer(self) -> Option<String> {
        match self.outcome {
            InvocationOutcome::Answered { text, .. } => Some(text),
            InvocationOutcome::Exhausted { .. } => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Exhausted { .. })
    }

    /// 把失败记录转成异常记录，重试耗尽时最后一条标记为最终失败
    pub fn exception_records(
        &self,
        stage: Stage,
        key: &TrialKey,
        judge: Option<&str>,
    ) -> Vec<ExceptionRecord> {
        let last = self.failures.len();
        self.failures
            .iter()
            .enumerate()
            .map(|(i, failure)| {
                ExceptionRecord::new(
                    stage,
                    key.clone(),
                    judge.map(str::to_string),
                    failure.attempt,
                    failure.error.to_string(),
                    self.is_exhausted() && i + 1 == last,
                )
            })
            .collect()
    }
}

/// 带重试的调用器
#[derive(Debug, Clone, Default)]
pub struct RetryingInvoker {
    policy: RetryPolicy,
}

impl RetryingInvoker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 调用后端直到拿到非空回复或重试耗尽
    ///
    /// # 参数
    /// - `handle`: 后端及其票据代理
    /// - `prompt`: 用户提示词
    /// - `system`: 系统提示词（可选）
    ///
    /// # 返回
    /// 总是返回报告，失败也不会报错
    pub async fn invoke(
        &self,
        handle: &BackendHandle,
        prompt: &str,
        system: Option<&str>,
    ) -> InvocationReport {
        let backend = handle.id();
        let broker = handle.broker();
        let mut failures = Vec::new();
        let mut rate_limited = 0u32;
        let mut attempt = 0u32;
        let mut after_rejection = false;

        loop {
            let ticket = if after_rejection {
                broker.acquire_after_rejection().await
            } else {
                broker.acquire().await
            };
            after_rejection = false;

            let result = match ticket {
                Ok(_) => self.call(handle, prompt, system).await,
                Err(e) => Err(BackendError::from(e)),
            };

            let error = match result {
                Ok(text) if !text.trim().is_empty() => {
                    debug!("[{}] 调用成功 (第 {} 次尝试)", backend, attempt + 1);
                    return InvocationReport {
                        outcome: InvocationOutcome::Answered {
                            text,
                            attempts: attempt + 1,
                        },
                        failures,
                        rate_limited,
                    };
                }
                Ok(_) => BackendError::EmptyResponse {
                    backend: backend.to_string(),
                },
                Err(e) => e,
            };

            let kind = error.kind();
            if kind == FailureKind::RateLimited && rate_limited < self.policy.rate_limit_retries {
                rate_limited += 1;
                warn!(
                    "[{}] 后端报告限流 ({}/{}), 转入溢出池等待...",
                    backend, rate_limited, self.policy.rate_limit_retries
                );
                after_rejection = true;
                continue;
            }

            attempt += 1;
            warn!(
                "[{}] 调用失败 (尝试 {}/{}): {}",
                backend, attempt, self.policy.max_attempts, error
            );
            failures.push(AttemptFailure {
                attempt,
                error: error.clone(),
            });

            if kind == FailureKind::Fatal || attempt >= self.policy.max_attempts {
                warn!("[{}] ✗ 放弃调用，共尝试 {} 次", backend, attempt);
                return InvocationReport {
                    outcome: InvocationOutcome::Exhausted {
                        attempts: attempt,
                        last_error: error,
                    },
                    failures,
                    rate_limited,
                };
            }

            tokio::time::sleep(self.policy.backoff(attempt)).await;
        }
    }

    async fn call(
        &self,
        handle: &BackendHandle,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<String, BackendError> {
        let call = handle.client().invoke(prompt, system);
        match self.policy.call_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| BackendError::Timeout {
                    backend: handle.id().to_string(),
                    after: limit,
                })?,
            None => call.await,
        }
    }
}
