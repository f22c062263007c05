//! 集成测试共用的脚本化后端

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use needlestack_bench::clients::{Backend, BackendError, BackendHandle, BackendRegistry};
use needlestack_bench::infrastructure::{RateBudget, TicketBroker};
use needlestack_bench::models::{BackendRole, PromptBook, ProbeLocation, Question};
use needlestack_bench::orchestrator::{EngineSettings, ProgressReporter, ProgressSnapshot};
use needlestack_bench::results::ResultTree;
use needlestack_bench::services::RetryPolicy;

type Script = dyn Fn(usize, &str) -> Result<String, BackendError> + Send + Sync;

/// 按调用序号和提示词返回预设结果的后端
pub struct ScriptedBackend {
    id: String,
    calls: AtomicUsize,
    script: Box<Script>,
}

impl ScriptedBackend {
    pub fn new(
        id: &str,
        script: impl Fn(usize, &str) -> Result<String, BackendError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: AtomicUsize::new(0),
            script: Box::new(script),
        })
    }

    /// 总是返回同一段文本
    pub fn replying(id: &str, reply: &'static str) -> Arc<Self> {
        Self::new(id, move |_, _| Ok(reply.to_string()))
    }

    /// 总是暂时性失败
    pub fn failing(id: &str) -> Arc<Self> {
        let backend = id.to_string();
        Self::new(id, move |n, _| {
            Err(BackendError::Transient {
                backend: backend.clone(),
                message: format!("第 {} 次调用失败", n + 1),
            })
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn max_input(&self) -> usize {
        128_000
    }

    async fn invoke(&self, prompt: &str, _system: Option<&str>) -> Result<String, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        (self.script)(n, prompt)
    }
}

/// 额度充足的票据代理
pub fn roomy_broker(name: &str) -> Arc<TicketBroker> {
    Arc::new(TicketBroker::new(name, RateBudget::per_minute(10_000), None))
}

/// 注册被测后端和评审团，每个后端独占一个票据代理
pub fn registry(subjects: &[Arc<ScriptedBackend>], judges: &[Arc<ScriptedBackend>]) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    for backend in subjects {
        let handle = BackendHandle::new(backend.clone(), roomy_broker(backend.id()), 8, 8);
        registry
            .register(handle, &[BackendRole::Subject])
            .expect("注册被测后端失败");
    }
    for backend in judges {
        let handle = BackendHandle::new(backend.clone(), roomy_broker(backend.id()), 8, 8);
        registry
            .register(handle, &[BackendRole::Judge])
            .expect("注册评审失败");
    }
    registry
}

/// 不等待的引擎参数
pub fn fast_settings(max_attempts: u32) -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            rate_limit_retries: 3,
            call_timeout: Some(Duration::from_secs(5)),
        },
        status_interval: Duration::from_millis(10),
        checkpoint_every: 0,
    }
}

pub fn questions(count: u32) -> Vec<Arc<Question>> {
    (1..=count)
        .map(|id| {
            Arc::new(Question::new(
                id,
                format!("第 {} 段短文", id),
                format!("第 {} 个问题?", id),
                format!("答案 {}", id),
            ))
        })
        .collect()
}

pub fn prompts(backends: &[String], locations: &[ProbeLocation], questions: &[Arc<Question>]) -> PromptBook {
    let mut book = PromptBook::new();
    for backend in backends {
        for &location in locations {
            for question in questions {
                book.insert(
                    backend.clone(),
                    location,
                    question.id,
                    format!("[{}] 干草堆 {} ... {}", backend, location, question.question),
                );
            }
        }
    }
    book
}

/// 记录进度回调次数
#[derive(Default)]
pub struct CountingReporter {
    pub reports: AtomicUsize,
    pub finished: AtomicUsize,
    pub last: Mutex<Option<ProgressSnapshot>>,
}

impl ProgressReporter for CountingReporter {
    fn report(&self, snapshot: &ProgressSnapshot) {
        self.reports.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last.lock() {
            *last = Some(snapshot.clone());
        }
    }

    fn finished(&self, _tree: &ResultTree) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}
