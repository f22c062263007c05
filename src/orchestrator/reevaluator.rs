//! 重新评审 - 编排层
//!
//! 载入已有结果，保留生成的答案，只让（可能已更换的）评审团重新投票，
//! 并列出结论发生变化的试验。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::info;

use crate::error::{AppResult, SetupError};
use crate::models::{Question, QuestionId};
use crate::orchestrator::engine::{Engine, RunReport};
use crate::results::{MutationQueue, ResultTree, TreeVisitor, TrialKey, TrialResult};

/// 结论变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerdictChange {
    pub key: TrialKey,
    pub before: Option<bool>,
    pub after: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ReevaluationReport {
    pub run: RunReport,
    /// 重新评审的试验数
    pub reevaluated: usize,
    pub changes: Vec<VerdictChange>,
}

/// 已有答案的试验及其原结论
#[derive(Default)]
struct AnsweredTrials(BTreeMap<TrialKey, (Option<bool>, String)>);

impl TreeVisitor for AnsweredTrials {
    fn visit_trial(&mut self, key: &TrialKey, trial: &TrialResult) {
        if let Some(answer) = &trial.generated_answer {
            self.0.insert(key.clone(), (trial.passed, answer.clone()));
        }
    }
}

pub struct Reevaluator<'a> {
    engine: &'a Engine,
}

impl<'a> Reevaluator<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    pub async fn run(&self, mut tree: ResultTree, questions: &[Arc<Question>]) -> AppResult<ReevaluationReport> {
        let by_id: HashMap<QuestionId, Arc<Question>> =
            questions.iter().map(|q| (q.id, q.clone())).collect();

        let mut answered = AnsweredTrials::default();
        tree.walk(&mut answered);

        // 先确认题目都在，再动结果树
        let mut items = Vec::with_capacity(answered.0.len());
        for (key, (_, answer)) in &answered.0 {
            let question = by_id
                .get(&key.question_id)
                .ok_or(SetupError::UnknownQuestion {
                    question_id: key.question_id,
                })?;
            items.push((key.clone(), question.clone(), answer.clone()));
        }

        let judges = self.engine.registry().judges().to_vec();
        let reset = tree.reset_answered_verdicts(&judges);
        info!("🔁 重新评审 {} 个已有答案的试验，评审团 {} 人", reset.len(), judges.len());

        let queue = Arc::new(MutationQueue::new());
        let dispatcher = self.engine.dispatcher(queue.clone())?;
        let refills = self.engine.registry().start_refills();
        let dispatched = dispatcher.dispatch_judging(items);
        let run = self.engine.supervise(tree, queue, &dispatcher, dispatched).await;
        refills.iter().for_each(|h| h.abort());
        let run = run?;

        let changes: Vec<VerdictChange> = answered
            .0
            .into_iter()
            .filter_map(|(key, (before, _))| {
                let after = run.tree.trial(&key).and_then(|t| t.passed);
                (before != after).then_some(VerdictChange { key, before, after })
            })
            .collect();

        info!("✓ 重新评审完成，{} 个试验结论发生变化", changes.len());
        Ok(ReevaluationReport {
            run,
            reevaluated: reset.len(),
            changes,
        })
    }
}
