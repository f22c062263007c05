//! 变更队列
//!
//! 工作任务从不直接写结果树，只往队列里追加不可变的变更记录。
//! 队列锁只在追加和整体换出时持有，应用变更时不持锁。

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::warn;

use crate::results::tree::{ExceptionRecord, ResultTree, Stage, TrialKey};

/// 变更目标不存在
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("变更目标不存在: {target}")]
    UnknownTarget { target: String },
}

/// 一条待应用的变更
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// 记录生成结果，`None` 表示重试耗尽没有答案
    SetGeneratedAnswer { key: TrialKey, answer: Option<String> },
    /// 填写评审槽位
    SetJudgeVerdict {
        key: TrialKey,
        slot: usize,
        judge: String,
        passed: bool,
    },
    /// 记录异常
    RecordException(ExceptionRecord),
    /// 任务异常结束：补记"没有答案"，空槽位判负，并记一条最终失败
    ///
    /// 失败阶段在应用时按试验当时的状态判断：已有答案算评审失败，否则算生成失败。
    AbandonTrial { key: TrialKey, reason: String },
}

/// 单条变更的应用结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// 目标已经写过，重复写入被忽略
    Ignored,
}

impl Mutation {
    pub fn key(&self) -> &TrialKey {
        match self {
            Mutation::SetGeneratedAnswer { key, .. }
            | Mutation::SetJudgeVerdict { key, .. }
            | Mutation::AbandonTrial { key, .. } => key,
            Mutation::RecordException(record) => &record.key,
        }
    }

    /// 应用到结果树
    pub fn apply(self, tree: &mut ResultTree) -> Result<Applied, MutationError> {
        match self {
            Mutation::SetGeneratedAnswer { key, answer } => {
                let trial = tree.trial_mut(&key).ok_or_else(|| unknown(&key))?;
                Ok(changed_if(trial.record_answer(answer)))
            }
            Mutation::SetJudgeVerdict {
                key,
                slot,
                judge,
                passed,
            } => {
                let trial = tree.trial_mut(&key).ok_or_else(|| unknown(&key))?;
                let outcome = trial
                    .record_verdict(slot, &judge, passed)
                    .ok_or_else(|| MutationError::UnknownTarget {
                        target: format!("{} 槽位 {} ({})", key, slot, judge),
                    })?;
                Ok(changed_if(outcome))
            }
            Mutation::RecordException(record) => {
                let backend = tree
                    .backend_mut(&record.key.backend)
                    .ok_or_else(|| unknown(&record.key))?;
                backend.record_exception(record);
                Ok(Applied::Changed)
            }
            Mutation::AbandonTrial { key, reason } => abandon(tree, key, reason),
        }
    }
}

fn abandon(tree: &mut ResultTree, key: TrialKey, reason: String) -> Result<Applied, MutationError> {
    let trial = tree.trial_mut(&key).ok_or_else(|| unknown(&key))?;
    if trial.is_finished() {
        return Ok(Applied::Ignored);
    }

    let stage = if trial.generated_answer.is_some() {
        Stage::Evaluation
    } else {
        Stage::Generation
    };
    trial.record_answer(None);
    let open_slots: Vec<(usize, String)> = trial
        .verdicts
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_filled())
        .map(|(slot, v)| (slot, v.judge.clone()))
        .collect();
    for (slot, judge) in open_slots {
        trial.record_verdict(slot, &judge, false);
    }

    let backend = tree.backend_mut(&key.backend).ok_or_else(|| unknown(&key))?;
    backend.record_exception(ExceptionRecord::new(stage, key, None, 1, reason, true));
    Ok(Applied::Changed)
}

fn unknown(key: &TrialKey) -> MutationError {
    MutationError::UnknownTarget {
        target: key.to_string(),
    }
}

fn changed_if(changed: bool) -> Applied {
    if changed {
        Applied::Changed
    } else {
        Applied::Ignored
    }
}

/// 一批变更的应用统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl ApplyStats {
    pub fn total(&self) -> usize {
        self.applied + self.ignored + self.failed
    }
}

/// 依次应用一批变更，失败的变更记录日志后跳过
pub fn apply_batch(tree: &mut ResultTree, batch: Vec<Mutation>) -> ApplyStats {
    let mut stats = ApplyStats::default();
    for mutation in batch {
        match mutation.apply(tree) {
            Ok(Applied::Changed) => stats.applied += 1,
            Ok(Applied::Ignored) => stats.ignored += 1,
            Err(e) => {
                warn!("⚠️ 跳过变更: {}", e);
                stats.failed += 1;
            }
        }
    }
    stats
}

/// 线程安全的只追加收件箱
#[derive(Debug, Default)]
pub struct MutationQueue {
    inbox: Mutex<Vec<Mutation>>,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, mutation: Mutation) {
        self.lock_inbox().push(mutation);
    }

    pub fn extend(&self, mutations: impl IntoIterator<Item = Mutation>) {
        let mutations: Vec<Mutation> = mutations.into_iter().collect();
        self.lock_inbox().extend(mutations);
    }

    /// 整体换出当前内容
    pub fn drain(&self) -> Vec<Mutation> {
        std::mem::take(&mut *self.lock_inbox())
    }

    pub fn len(&self) -> usize {
        self.lock_inbox().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_inbox().is_empty()
    }

    fn lock_inbox(&self) -> MutexGuard<'_, Vec<Mutation>> {
        // 持锁期间只做 push / take，不会留下不一致的状态
        self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
