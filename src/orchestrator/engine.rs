//! 执行引擎 - 编排层
//!
//! 把注册表、重试调用器、共识评审器、派发器和状态监控串起来，
//! 负责一次运行的生命周期：启动票据补充和状态监控 → 派发 → 等待 → 停止 → 保存。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::clients::BackendRegistry;
use crate::config::Config;
use crate::error::{AppError, AppResult, SetupError};
use crate::orchestrator::dispatcher::{DispatchSummary, Dispatched, Dispatcher, ResumePlan};
use crate::orchestrator::status_monitor::{LogReporter, ProgressReporter, StatusMonitor};
use crate::persistence::ResultStore;
use crate::results::{MutationQueue, ResultTree};
use crate::services::{ConsensusEvaluator, RetryPolicy, RetryingInvoker};
use crate::workflow::{TrialFlow, WorkUnit};

/// 引擎参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub status_interval: Duration,
    /// 每排空多少次写一次检查点，0 表示不写
    pub checkpoint_every: u32,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            status_interval: config.status_interval,
            checkpoint_every: config.checkpoint_every,
        }
    }
}

/// 一次运行的结果
#[derive(Debug, Clone)]
pub struct RunReport {
    pub tree: ResultTree,
    pub dispatch: DispatchSummary,
    /// 是否所有试验都已得出结论
    pub completed: bool,
}

pub struct Engine {
    registry: Arc<BackendRegistry>,
    settings: EngineSettings,
    reporter: Arc<dyn ProgressReporter>,
    store: Option<Arc<dyn ResultStore>>,
}

impl Engine {
    pub fn new(registry: Arc<BackendRegistry>, settings: EngineSettings) -> Self {
        Self {
            registry,
            settings,
            reporter: Arc::new(LogReporter),
            store: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// 运行期间写检查点，结束时保存最终结果
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// 按注册表的评审团构建派发器
    pub(crate) fn dispatcher(&self, queue: Arc<MutationQueue>) -> Result<Dispatcher, SetupError> {
        let invoker = Arc::new(RetryingInvoker::new(self.settings.retry));
        let evaluator = Arc::new(ConsensusEvaluator::new(
            self.registry.judge_panel()?,
            invoker.clone(),
        ));
        let flow = TrialFlow::new(invoker, evaluator, queue);
        Ok(Dispatcher::new(self.registry.clone(), flow))
    }

    /// 跑一批工作单元
    ///
    /// `tree` 必须已经包含每个单元的键；键空间或派发检查失败时不会派发任何任务。
    pub async fn run_benchmark(&self, tree: ResultTree, units: Vec<WorkUnit>) -> AppResult<RunReport> {
        self.run_plan(tree, ResumePlan::from_units(units)).await
    }

    /// 按计划运行：生成单元走完整流程，已有答案的只评审，没有答案的直接判负
    pub async fn run_plan(&self, tree: ResultTree, plan: ResumePlan) -> AppResult<RunReport> {
        if let Some(key) = plan.keys().find(|key| tree.trial(key).is_none()) {
            return Err(SetupError::MissingTrial {
                key: key.to_string(),
            }
            .into());
        }

        let queue = Arc::new(MutationQueue::new());
        let dispatcher = self.dispatcher(queue.clone())?;
        let ResumePlan {
            units,
            judging,
            no_answer,
        } = plan;
        let refills = self.registry.start_refills();

        let mut dispatched = match dispatcher.dispatch(units) {
            Ok(dispatched) => dispatched,
            Err(e) => {
                refills.iter().for_each(|h| h.abort());
                return Err(e.into());
            }
        };
        if !judging.is_empty() {
            info!("⚖️ {} 个试验已有答案，只重新评审", judging.len());
            dispatched.extend(dispatcher.dispatch_judging(judging));
        }
        for key in &no_answer {
            dispatcher.flow().record_no_answer(key);
        }

        let report = self.supervise(tree, queue, &dispatcher, dispatched).await;
        refills.iter().for_each(|h| h.abort());
        report.map(|mut report| {
            report.dispatch.total += no_answer.len();
            report.dispatch.no_answer += no_answer.len();
            report
        })
    }

    /// 启动状态监控，等待全部任务结束后停止监控并保存
    pub(crate) async fn supervise(
        &self,
        tree: ResultTree,
        queue: Arc<MutationQueue>,
        dispatcher: &Dispatcher,
        dispatched: Vec<Dispatched>,
    ) -> AppResult<RunReport> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut monitor = StatusMonitor::new(
            tree,
            queue,
            self.settings.status_interval,
            self.reporter.clone(),
        );
        if let Some(store) = &self.store {
            monitor = monitor.with_checkpoints(store.clone(), self.settings.checkpoint_every);
        }
        let monitor_handle = monitor.spawn(shutdown_rx);

        let dispatch = dispatcher.join(dispatched).await;
        info!(
            "✓ 全部任务结束: 通过 {}, 不通过 {}, 无答案 {}, 异常 {}",
            dispatch.passed, dispatch.failed, dispatch.no_answer, dispatch.crashed
        );

        // 监控可能已经因为全部完成而退出，发送失败可以忽略
        let _ = shutdown_tx.send(true);
        let tree = monitor_handle
            .await
            .map_err(|e| AppError::Other(format!("状态监控任务异常退出: {}", e)))?;

        let completed = tree.is_finished();
        if !completed {
            warn!("⚠️ 运行结束时仍有 {} 个试验未完成", tree.pending_keys().len());
        }

        if let Some(store) = &self.store {
            store.save(&tree).await?;
        }

        Ok(RunReport {
            tree,
            dispatch,
            completed,
        })
    }
}
