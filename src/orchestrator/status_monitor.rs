//! 状态监控 - 编排层
//!
//! 结果树唯一的写入者。按固定间隔：
//! 1. 整体换出变更队列
//! 2. 逐条应用变更（失败的记录日志后跳过）
//! 3. 自底向上重算分数
//! 4. 汇报进度，按需写检查点
//! 5. 检测到全部完成时通知一次并退出

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::persistence::ResultStore;
use crate::results::{apply_batch, ApplyStats, BackendResult, MutationQueue, ResultTree, TreeVisitor, TrialKey, TrialResult};
use crate::utils::logging::log_progress;

/// 单个后端的进度
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendProgress {
    pub total: usize,
    pub answered: usize,
    pub finished: usize,
    pub failed_generations: usize,
    pub failed_evaluations: usize,
}

/// 进度快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total_trials: usize,
    pub answered: usize,
    pub finished: usize,
    pub evaluations_required: usize,
    pub evaluations_completed: usize,
    pub failed_generations: usize,
    pub failed_evaluations: usize,
    pub backends: BTreeMap<String, BackendProgress>,
    /// 每个评审已完成的评审数
    pub judges: BTreeMap<String, usize>,
}

impl ProgressSnapshot {
    pub fn from_tree(tree: &ResultTree) -> Self {
        let mut snapshot = Self::default();
        for judge in &tree.judges {
            snapshot.judges.insert(judge.clone(), 0);
        }
        tree.walk(&mut snapshot);
        snapshot
    }

    pub fn is_complete(&self) -> bool {
        self.finished == self.total_trials
    }
}

impl TreeVisitor for ProgressSnapshot {
    fn visit_backend(&mut self, backend: &BackendResult) {
        self.failed_generations += backend.failed_generations;
        self.failed_evaluations += backend.failed_evaluations;
        let entry = self.backends.entry(backend.backend.clone()).or_default();
        entry.failed_generations = backend.failed_generations;
        entry.failed_evaluations = backend.failed_evaluations;
    }

    fn visit_trial(&mut self, key: &TrialKey, trial: &TrialResult) {
        let entry = self.backends.entry(key.backend.clone()).or_default();
        entry.total += 1;
        self.total_trials += 1;
        self.evaluations_required += trial.verdicts.len();

        if trial.answer_recorded {
            entry.answered += 1;
            self.answered += 1;
        }
        if trial.is_finished() {
            entry.finished += 1;
            self.finished += 1;
        }
        for verdict in trial.verdicts.iter().filter(|v| v.is_filled()) {
            self.evaluations_completed += 1;
            *self.judges.entry(verdict.judge.clone()).or_default() += 1;
        }
    }
}

/// 进度接收方
pub trait ProgressReporter: Send + Sync {
    /// 每次排空后调用
    fn report(&self, snapshot: &ProgressSnapshot);

    /// 全部完成时调用，整个运行只调用一次
    fn finished(&self, tree: &ResultTree);
}

/// 输出到日志
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn report(&self, snapshot: &ProgressSnapshot) {
        log_progress(snapshot);
    }

    fn finished(&self, tree: &ResultTree) {
        info!("🎉 全部 {} 个试验已完成", tree.trial_count());
    }
}

/// 一次排空的结果
#[derive(Debug, Clone)]
pub struct DrainOutcome {
    pub stats: ApplyStats,
    pub snapshot: ProgressSnapshot,
    /// 本次排空后首次检测到全部完成
    pub just_completed: bool,
}

pub struct StatusMonitor {
    tree: ResultTree,
    queue: Arc<MutationQueue>,
    interval: Duration,
    reporter: Arc<dyn ProgressReporter>,
    store: Option<Arc<dyn ResultStore>>,
    checkpoint_every: u32,
    drains: u64,
    completed: bool,
}

impl StatusMonitor {
    /// 创建状态监控
    ///
    /// # 参数
    /// - `tree`: 已建好键空间的结果树，之后只由监控修改
    /// - `queue`: 工作任务推送变更的队列
    /// - `interval`: 排空间隔
    /// - `reporter`: 进度接收方
    pub fn new(
        tree: ResultTree,
        queue: Arc<MutationQueue>,
        interval: Duration,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            tree,
            queue,
            interval,
            reporter,
            store: None,
            checkpoint_every: 0,
            drains: 0,
            completed: false,
        }
    }

    /// 每排空 `every` 次写一次检查点
    pub fn with_checkpoints(mut self, store: Arc<dyn ResultStore>, every: u32) -> Self {
        self.store = Some(store);
        self.checkpoint_every = every;
        self
    }

    pub fn tree(&self) -> &ResultTree {
        &self.tree
    }

    pub fn into_tree(self) -> ResultTree {
        self.tree
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn drains(&self) -> u64 {
        self.drains
    }

    /// 排空一次
    pub async fn drain_once(&mut self) -> DrainOutcome {
        let batch = self.queue.drain();
        let stats = apply_batch(&mut self.tree, batch);
        self.tree.recompute_scores();
        self.drains += 1;

        let snapshot = ProgressSnapshot::from_tree(&self.tree);
        self.reporter.report(&snapshot);

        if self.checkpoint_every > 0 && self.drains % u64::from(self.checkpoint_every) == 0 {
            self.checkpoint().await;
        }

        let just_completed = !self.completed && self.tree.is_finished();
        if just_completed {
            self.completed = true;
            self.reporter.finished(&self.tree);
        }

        DrainOutcome {
            stats,
            snapshot,
            just_completed,
        }
    }

    async fn checkpoint(&self) {
        if let Some(store) = &self.store {
            match store.save(&self.tree).await {
                Ok(()) => info!("💾 已写入检查点 (第 {} 次排空)", self.drains),
                // 检查点失败不影响运行，下一次再试
                Err(e) => warn!("⚠️ 写检查点失败: {}", e),
            }
        }
    }

    /// 按固定间隔排空，直到全部完成或收到停止信号
    ///
    /// 收到停止信号时再排空一次，返回最终的结果树。
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ResultTree {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_once().await;
                    if self.completed {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.drain_once().await;
                        if !self.completed {
                            let pending = self.tree.pending_keys().len();
                            error!("❌ 停止时仍有 {} 个试验未完成", pending);
                        }
                        break;
                    }
                }
            }
        }

        self.tree
    }

    /// 在后台任务中运行
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<ResultTree> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Question;
    use crate::results::Mutation;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        reports: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ProgressReporter for Counting {
        fn report(&self, _snapshot: &ProgressSnapshot) {
            self.reports.fetch_add(1, Ordering::SeqCst);
        }

        fn finished(&self, _tree: &ResultTree) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tree() -> ResultTree {
        ResultTree::build(
            &["gpt".to_string()],
            &[100],
            &[Question::new(1, "t", "q", "a")],
            1,
            &["j1".to_string(), "j2".to_string()],
        )
        .unwrap()
    }

    fn finish_trial(queue: &MutationQueue) {
        let key = TrialKey::new("gpt", 100, 1, 0);
        queue.push(Mutation::SetGeneratedAnswer {
            key: key.clone(),
            answer: Some("a".to_string()),
        });
        for (slot, judge) in ["j1", "j2"].into_iter().enumerate() {
            queue.push(Mutation::SetJudgeVerdict {
                key: key.clone(),
                slot,
                judge: judge.to_string(),
                passed: true,
            });
        }
    }

    #[tokio::test]
    async fn test_completion_is_signalled_once() {
        let queue = Arc::new(MutationQueue::new());
        let reporter = Arc::new(Counting::default());
        let mut monitor = StatusMonitor::new(tree(), queue.clone(), Duration::from_millis(5), reporter.clone());

        let first = monitor.drain_once().await;
        assert!(!first.just_completed);
        assert_eq!(first.snapshot.evaluations_required, 2);

        finish_trial(&queue);
        let second = monitor.drain_once().await;
        assert!(second.just_completed);
        assert_eq!(second.stats.applied, 3);
        assert_eq!(second.snapshot.judges["j1"], 1);

        let third = monitor.drain_once().await;
        assert!(!third.just_completed);
        assert_eq!(third.stats.total(), 0);
        assert_eq!(reporter.finished.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.reports.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.tree().backend("gpt").unwrap().score, Some(1.0));
    }

    #[tokio::test]
    async fn test_run_exits_after_completion() {
        let queue = Arc::new(MutationQueue::new());
        let reporter = Arc::new(Counting::default());
        let (_tx, rx) = watch::channel(false);
        let handle = StatusMonitor::new(tree(), queue.clone(), Duration::from_millis(5), reporter.clone())
            .spawn(rx);

        finish_trial(&queue);
        let tree = handle.await.unwrap();

        assert!(tree.is_finished());
        assert_eq!(reporter.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_drain() {
        let queue = Arc::new(MutationQueue::new());
        let reporter = Arc::new(Counting::default());
        let (tx, rx) = watch::channel(false);
        let handle = StatusMonitor::new(tree(), queue.clone(), Duration::from_secs(3600), reporter.clone())
            .spawn(rx);

        finish_trial(&queue);
        tx.send(true).unwrap();
        let tree = handle.await.unwrap();

        assert!(tree.is_finished());
        assert_eq!(reporter.finished.load(Ordering::SeqCst), 1);
    }
}
