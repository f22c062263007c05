//! 试验流程 - 流程层
//!
//! 核心职责：定义"一次试验"的完整处理流程
//!
//! 流程顺序：
//! 1. 生成答案（领票 → 调用 → 重试）
//! 2. 记录生成结果（包括"没有答案"）
//! 3. 评审团投票；没有答案时直接为每个槽位记不通过
//!
//! 所有结果都以变更记录的形式推入队列，不直接写结果树。

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clients::BackendHandle;
use crate::models::Question;
use crate::results::{Mutation, MutationQueue, Stage, TrialKey};
use crate::services::{ConsensusEvaluator, RetryingInvoker};
use crate::workflow::work_unit::WorkUnit;

pub const GENERATION_SYSTEM_PROMPT: &str =
    "You are an expert at understanding short passages and answering questions based on the passages you read.";

/// 试验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialOutcome {
    /// 拿到答案并完成评审
    Judged { passed: bool, dissent: usize },
    /// 重试耗尽，没有答案
    NoAnswer,
}

/// 试验流程
///
/// - 编排单次试验的生成和评审
/// - 不持有结果树，只往变更队列里推记录
/// - 不关心其他试验
#[derive(Debug, Clone)]
pub struct TrialFlow {
    invoker: Arc<RetryingInvoker>,
    evaluator: Arc<ConsensusEvaluator>,
    queue: Arc<MutationQueue>,
}

impl TrialFlow {
    /// 创建新的试验流程
    pub fn new(
        invoker: Arc<RetryingInvoker>,
        evaluator: Arc<ConsensusEvaluator>,
        queue: Arc<MutationQueue>,
    ) -> Self {
        Self {
            invoker,
            evaluator,
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub async fn run(&self, handle: &BackendHandle, unit: &WorkUnit) -> TrialOutcome {
        debug!("{} 开始生成答案", unit);

        let report = self
            .invoker
            .invoke(handle, &unit.prompt, Some(GENERATION_SYSTEM_PROMPT))
            .await;

        self.queue.extend(
            report
                .exception_records(Stage::Generation, &unit.key, None)
                .into_iter()
                .map(Mutation::RecordException),
        );

        let answer = report.into_answer();
        self.queue.push(Mutation::SetGeneratedAnswer {
            key: unit.key.clone(),
            answer: answer.clone(),
        });

        match answer {
            Some(answer) => self.judge(&unit.key, &unit.question, &answer).await,
            None => {
                warn!("{} ✗ 重试耗尽，没有答案，记为不通过", unit);
                self.record_no_answer(&unit.key);
                TrialOutcome::NoAnswer
            }
        }
    }

    /// 评审一个已有答案并推入投票记录
    pub async fn judge(&self, key: &TrialKey, question: &Question, answer: &str) -> TrialOutcome {
        let evaluation = self.evaluator.evaluate(question, answer).await;

        for outcome in &evaluation.outcomes {
            self.queue.extend(
                outcome
                    .report
                    .exception_records(Stage::Evaluation, key, Some(&outcome.judge))
                    .into_iter()
                    .map(Mutation::RecordException),
            );
            self.queue.push(Mutation::SetJudgeVerdict {
                key: key.clone(),
                slot: outcome.slot,
                judge: outcome.judge.clone(),
                passed: outcome.passed,
            });
        }

        let consensus = evaluation.consensus;
        info!(
            "[{}] {} 试验 {} 评审完成 (反对 {})",
            key.backend,
            if consensus.passed { "✓ 通过" } else { "✗ 不通过" },
            key,
            consensus.dissent
        );
        TrialOutcome::Judged {
            passed: consensus.passed,
            dissent: consensus.dissent,
        }
    }

    /// 没有答案：每个评审槽位直接记不通过，不调用评审
    pub fn record_no_answer(&self, key: &TrialKey) {
        self.queue
            .extend(fail_verdicts(key, &self.evaluator.judges()));
    }

    /// 任务异常结束时兜底：记一条最终失败，并把试验补成"没有答案"
    ///
    /// 已经写过的答案和槽位不会被覆盖，失败算在哪个阶段由状态监控按试验当时的状态决定。
    pub fn abandon(&self, key: &TrialKey, reason: impl Into<String>) {
        self.queue.push(Mutation::AbandonTrial {
            key: key.clone(),
            reason: reason.into(),
        });
    }
}

/// 为每个评审槽位生成不通过记录
pub fn fail_verdicts(key: &TrialKey, judges: &[String]) -> Vec<Mutation> {
    judges
        .iter()
        .enumerate()
        .map(|(slot, judge)| Mutation::SetJudgeVerdict {
            key: key.clone(),
            slot,
            judge: judge.clone(),
            passed: false,
        })
        .collect()
}
