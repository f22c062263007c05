//! 分数汇总与评审分歧报告

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{ProbeLocation, QuestionId};
use crate::results::tree::{
    fraction, BackendResult, ResultTree, TreeVisitor, TrialKey,
};
use crate::results::trial::TrialResult;
use crate::results::QuestionResult;

/// 单个后端的分数汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub backend: String,
    pub score: Option<f64>,
    pub location_scores: BTreeMap<ProbeLocation, Option<f64>>,
    /// 每个位置上第 N 次试验通过的题目比例
    pub trial_scores: BTreeMap<ProbeLocation, BTreeMap<u32, Option<f64>>>,
    pub question_scores: BTreeMap<ProbeLocation, BTreeMap<QuestionId, Option<f64>>>,
    pub failed_generations: usize,
    pub failed_evaluations: usize,
}

impl ScoreSummary {
    /// 分数需要已经重新计算过
    pub fn from_backend(backend: &BackendResult) -> Self {
        let mut location_scores = BTreeMap::new();
        let mut trial_scores = BTreeMap::new();
        let mut question_scores = BTreeMap::new();

        for (&location, result) in &backend.locations {
            location_scores.insert(location, result.score);
            question_scores.insert(
                location,
                result
                    .questions
                    .iter()
                    .map(|(&id, question)| (id, question.score))
                    .collect(),
            );

            let mut by_trial: BTreeMap<u32, (usize, usize)> = BTreeMap::new();
            for question in result.questions.values() {
                for (&number, trial) in &question.trials {
                    let entry = by_trial.entry(number).or_default();
                    if let Some(passed) = trial.passed {
                        entry.1 += 1;
                        if passed {
                            entry.0 += 1;
                        }
                    }
                }
            }
            trial_scores.insert(
                location,
                by_trial
                    .into_iter()
                    .map(|(number, (passed, finished))| (number, fraction(passed, finished)))
                    .collect(),
            );
        }

        Self {
            backend: backend.backend.clone(),
            score: backend.score,
            location_scores,
            trial_scores,
            question_scores,
            failed_generations: backend.failed_generations,
            failed_evaluations: backend.failed_evaluations,
        }
    }

    /// 整棵树每个后端一条
    pub fn from_tree(tree: &ResultTree) -> Vec<Self> {
        tree.backends.values().map(Self::from_backend).collect()
    }
}

/// 单个评审与最终结论的一致情况
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeDissent {
    pub evaluations: usize,
    pub agreements: usize,
    pub disagreements: usize,
}

impl JudgeDissent {
    /// 与最终结论不一致的百分比
    pub fn percent_wrong(&self) -> Option<f64> {
        fraction(self.disagreements, self.evaluations).map(|f| f * 100.0)
    }
}

/// 评审分歧报告
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DissentReport {
    pub judges: BTreeMap<String, JudgeDissent>,
    /// 反对票达到评审团一半的试验
    pub concerning_trials: Vec<TrialKey>,
}

impl DissentReport {
    pub fn from_tree(tree: &ResultTree) -> Self {
        let mut report = Self::default();
        tree.walk(&mut report);
        report
    }
}

impl TreeVisitor for DissentReport {
    fn visit_trial(&mut self, key: &TrialKey, trial: &TrialResult) {
        let Some(resolved) = trial.passed else {
            return;
        };
        // 没有答案的试验是直接判负的，评审没有看过
        if trial.has_no_answer() {
            return;
        }
        for verdict in &trial.verdicts {
            let Some(vote) = verdict.passed else {
                continue;
            };
            let entry = self.judges.entry(verdict.judge.clone()).or_default();
            entry.evaluations += 1;
            if vote == resolved {
                entry.agreements += 1;
            } else {
                entry.disagreements += 1;
            }
        }
        if trial.has_concerning_dissent() {
            self.concerning_trials.push(key.clone());
        }
    }
}

/// 单个后端的试验间一致性
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendVariance {
    /// 至少有两次完成试验的 (位置, 题目) 组数
    pub groups: usize,
    /// 其中各次试验结论不一致的组数
    pub inconsistent_groups: usize,
}

impl BackendVariance {
    pub fn percent_inconsistent(&self) -> Option<f64> {
        fraction(self.inconsistent_groups, self.groups).map(|f| f * 100.0)
    }
}

/// 试验间差异报告
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarianceReport {
    pub backends: BTreeMap<String, BackendVariance>,
}

impl VarianceReport {
    pub fn from_tree(tree: &ResultTree) -> Self {
        let mut report = Self::default();
        tree.walk(&mut report);
        report
    }
}

impl TreeVisitor for VarianceReport {
    fn visit_backend(&mut self, backend: &BackendResult) {
        self.backends.entry(backend.backend.clone()).or_default();
    }

    fn visit_question(&mut self, backend: &str, _location: ProbeLocation, question: &QuestionResult) {
        let outcomes: Vec<bool> = question.trials.values().filter_map(|t| t.passed).collect();
        if outcomes.len() < 2 {
            return;
        }
        let entry = self.backends.entry(backend.to_string()).or_default();
        entry.groups += 1;
        if outcomes.iter().any(|&p| p != outcomes[0]) {
            entry.inconsistent_groups += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Question;

    fn finished_tree(votes_per_trial: &[[bool; 3]]) -> ResultTree {
        let judges: Vec<String> = vec!["j1".into(), "j2".into(), "j3".into()];
        let mut tree = ResultTree::build(
            &["gpt".to_string()],
            &[100],
            &[Question::new(1, "t", "q", "a")],
            votes_per_trial.len() as u32,
            &judges,
        )
        .unwrap();

        for (n, votes) in votes_per_trial.iter().enumerate() {
            let trial = tree.trial_mut(&TrialKey::new("gpt", 100, 1, n as u32)).unwrap();
            trial.record_answer(Some("a".to_string()));
            for (slot, (judge, vote)) in judges.iter().zip(votes).enumerate() {
                trial.record_verdict(slot, judge, *vote);
            }
        }
        tree.recompute_scores();
        tree
    }

    #[test]
    fn test_score_summary_per_trial_number() {
        let tree = finished_tree(&[[true, true, false], [false, false, true]]);
        let summary = ScoreSummary::from_backend(tree.backend("gpt").unwrap());

        assert_eq!(summary.score, Some(0.5));
        assert_eq!(summary.trial_scores[&100][&0], Some(1.0));
        assert_eq!(summary.trial_scores[&100][&1], Some(0.0));
        assert_eq!(summary.question_scores[&100][&1], Some(0.5));
    }

    #[test]
    fn test_dissent_report_counts_disagreements() {
        let tree = finished_tree(&[[true, true, false], [true, true, true]]);
        let report = DissentReport::from_tree(&tree);

        let j3 = &report.judges["j3"];
        assert_eq!(j3.evaluations, 2);
        assert_eq!(j3.disagreements, 1);
        assert_eq!(j3.percent_wrong(), Some(50.0));
        assert_eq!(report.judges["j1"].percent_wrong(), Some(0.0));
        assert!(report.concerning_trials.is_empty());
    }

    #[test]
    fn test_dissent_report_skips_trials_without_answer() {
        let mut tree = finished_tree(&[[true, true, false]]);
        let question = tree
            .backend_mut("gpt")
            .unwrap()
            .locations
            .get_mut(&100)
            .unwrap()
            .questions
            .get_mut(&1)
            .unwrap();
        let judges: Vec<String> = vec!["j1".into(), "j2".into(), "j3".into()];
        let mut no_answer = TrialResult::new(1, &judges);
        no_answer.record_answer(None);
        for (slot, judge) in judges.iter().enumerate() {
            no_answer.record_verdict(slot, judge, false);
        }
        assert!(no_answer.is_finished());
        question.trials.insert(1, no_answer);

        let report = DissentReport::from_tree(&tree);
        assert_eq!(report.judges["j1"].evaluations, 1);
        assert_eq!(report.judges["j1"].agreements, 1);
        assert_eq!(report.judges["j3"].evaluations, 1);
        assert_eq!(report.judges["j3"].percent_wrong(), Some(100.0));
    }

    #[test]
    fn test_variance_report_flags_inconsistent_groups() {
        let consistent = VarianceReport::from_tree(&finished_tree(&[[true; 3], [true; 3]]));
        assert_eq!(consistent.backends["gpt"].percent_inconsistent(), Some(0.0));

        let mixed = VarianceReport::from_tree(&finished_tree(&[[true; 3], [false; 3]]));
        assert_eq!(mixed.backends["gpt"].inconsistent_groups, 1);
        assert_eq!(mixed.backends["gpt"].percent_inconsistent(), Some(100.0));
    }
}
