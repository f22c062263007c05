//! 结果聚合树
//!
//! 后端 → 探测位置 → 题目 → 试验 四层结构。
//! 键空间在派发前一次性建好，之后只改叶子上的值，结构不再变化。
//! 所有查找都通过稳定的键进行，不依赖位置下标。

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::SetupError;
use crate::models::{ProbeLocation, Question, QuestionId};
use crate::results::trial::TrialResult;

/// 试验的唯一键
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialKey {
    pub backend: String,
    pub location: ProbeLocation,
    pub question_id: QuestionId,
    pub trial: u32,
}

impl TrialKey {
    pub fn new(
        backend: impl Into<String>,
        location: ProbeLocation,
        question_id: QuestionId,
        trial: u32,
    ) -> Self {
        Self {
            backend: backend.into(),
            location,
            question_id,
            trial,
        }
    }
}

impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.backend, self.location, self.question_id, self.trial
        )
    }
}

/// 异常发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Generation,
    Evaluation,
}

/// 一条异常记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub stage: Stage,
    pub key: TrialKey,
    /// 评审阶段的评审后端
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<String>,
    /// 第几次尝试（从 1 开始）
    pub attempt: u32,
    pub message: String,
    /// 是否为重试耗尽后的最终失败
    pub exhausted: bool,
    pub timestamp: DateTime<Local>,
}

impl ExceptionRecord {
    pub fn new(
        stage: Stage,
        key: TrialKey,
        judge: Option<String>,
        attempt: u32,
        message: impl Into<String>,
        exhausted: bool,
    ) -> Self {
        Self {
            stage,
            key,
            judge,
            attempt,
            message: message.into(),
            exhausted,
            timestamp: Local::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_id: QuestionId,
    pub canonical_answer: String,
    pub trials: BTreeMap<u32, TrialResult>,
    pub score: Option<f64>,
}

impl QuestionResult {
    /// 已完成试验中通过的比例，没有完成的试验时为 `None`
    pub fn recompute_score(&mut self) -> Option<f64> {
        let finished: Vec<bool> = self.trials.values().filter_map(|t| t.passed).collect();
        self.score = fraction(finished.iter().filter(|&&p| p).count(), finished.len());
        self.score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationResult {
    pub location: ProbeLocation,
    pub questions: BTreeMap<QuestionId, QuestionResult>,
    pub score: Option<f64>,
}

impl LocationResult {
    pub fn recompute_score(&mut self) -> Option<f64> {
        let scores: Vec<f64> = self
            .questions
            .values_mut()
            .filter_map(QuestionResult::recompute_score)
            .collect();
        self.score = mean(&scores);
        self.score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResult {
    pub backend: String,
    pub locations: BTreeMap<ProbeLocation, LocationResult>,
    pub score: Option<f64>,
    #[serde(default)]
    pub generation_exceptions: Vec<ExceptionRecord>,
    #[serde(default)]
    pub evaluation_exceptions: Vec<ExceptionRecord>,
    #[serde(default)]
    pub failed_generations: usize,
    #[serde(default)]
    pub failed_evaluations: usize,
}

impl BackendResult {
    pub fn recompute_score(&mut self) -> Option<f64> {
        let scores: Vec<f64> = self
            .locations
            .values_mut()
            .filter_map(LocationResult::recompute_score)
            .collect();
        self.score = mean(&scores);
        self.score
    }

    pub fn record_exception(&mut self, record: ExceptionRecord) {
        let (log, counter) = match record.stage {
            Stage::Generation => (&mut self.generation_exceptions, &mut self.failed_generations),
            Stage::Evaluation => (&mut self.evaluation_exceptions, &mut self.failed_evaluations),
        };
        if record.exhausted {
            *counter += 1;
        }
        log.push(record);
    }
}

/// 遍历结果树，需要哪一层就实现哪一层
pub trait TreeVisitor {
    fn visit_backend(&mut self, _backend: &BackendResult) {}
    fn visit_location(&mut self, _backend: &str, _location: &LocationResult) {}
    fn visit_question(&mut self, _backend: &str, _location: ProbeLocation, _question: &QuestionResult) {}
    fn visit_trial(&mut self, _key: &TrialKey, _trial: &TrialResult) {}
}

/// 整棵结果树
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTree {
    /// 评审团，顺序即槽位顺序
    pub judges: Vec<String>,
    pub backends: BTreeMap<String, BackendResult>,
}

impl ResultTree {
    /// 构建完整键空间
    ///
    /// 任何维度为空或键重复都是结构错误，整个运行应当中止。
    pub fn build(
        backends: &[String],
        locations: &[ProbeLocation],
        questions: &[Question],
        trial_count: u32,
        judges: &[String],
    ) -> Result<Self, SetupError> {
        ensure_not_empty(backends, "后端")?;
        ensure_not_empty(locations, "探测位置")?;
        ensure_not_empty(questions, "题目")?;
        ensure_not_empty(judges, "评审团")?;
        if trial_count == 0 {
            return Err(SetupError::EmptyAxis {
                axis: "试验".to_string(),
            });
        }
        ensure_unique(backends.iter().cloned(), "后端")?;
        ensure_unique(locations.iter().copied(), "探测位置")?;
        ensure_unique(questions.iter().map(|q| q.id), "题目")?;
        ensure_unique(judges.iter().cloned(), "评审")?;

        let mut tree = Self {
            judges: judges.to_vec(),
            backends: BTreeMap::new(),
        };

        for backend in backends {
            let mut location_map = BTreeMap::new();
            for &location in locations {
                let question_map = questions
                    .iter()
                    .map(|question| {
                        let trials = (0..trial_count)
                            .map(|n| (n, TrialResult::new(n, judges)))
                            .collect();
                        let result = QuestionResult {
                            question_id: question.id,
                            canonical_answer: question.answer.clone(),
                            trials,
                            score: None,
                        };
                        (question.id, result)
                    })
                    .collect();
                location_map.insert(
                    location,
                    LocationResult {
                        location,
                        questions: question_map,
                        score: None,
                    },
                );
            }
            tree.backends.insert(
                backend.clone(),
                BackendResult {
                    backend: backend.clone(),
                    locations: location_map,
                    score: None,
                    generation_exceptions: Vec::new(),
                    evaluation_exceptions: Vec::new(),
                    failed_generations: 0,
                    failed_evaluations: 0,
                },
            );
        }

        Ok(tree)
    }

    pub fn backend(&self, name: &str) -> Option<&BackendResult> {
        self.backends.get(name)
    }

    pub fn backend_mut(&mut self, name: &str) -> Option<&mut BackendResult> {
        self.backends.get_mut(name)
    }

    pub fn trial(&self, key: &TrialKey) -> Option<&TrialResult> {
        self.backends
            .get(&key.backend)?
            .locations
            .get(&key.location)?
            .questions
            .get(&key.question_id)?
            .trials
            .get(&key.trial)
    }

    pub fn trial_mut(&mut self, key: &TrialKey) -> Option<&mut TrialResult> {
        self.backends
            .get_mut(&key.backend)?
            .locations
            .get_mut(&key.location)?
            .questions
            .get_mut(&key.question_id)?
            .trials
            .get_mut(&key.trial)
    }

    /// 自底向上重新计算各层分数
    pub fn recompute_scores(&mut self) {
        for backend in self.backends.values_mut() {
            backend.recompute_score();
        }
    }

    /// 全部试验都已得出结论
    pub fn is_finished(&self) -> bool {
        let mut all_finished = true;
        self.walk(&mut |_: &TrialKey, trial: &TrialResult| {
            all_finished &= trial.is_finished();
        });
        all_finished
    }

    /// 尚未得出结论的试验键
    pub fn pending_keys(&self) -> Vec<TrialKey> {
        let mut pending = Vec::new();
        self.walk(&mut |key: &TrialKey, trial: &TrialResult| {
            if !trial.is_finished() {
                pending.push(key.clone());
            }
        });
        pending
    }

    pub fn trial_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_: &TrialKey, _: &TrialResult| count += 1);
        count
    }

    /// 深度优先遍历，键按升序
    pub fn walk<V: TreeVisitor + ?Sized>(&self, visitor: &mut V) {
        for (name, backend) in &self.backends {
            visitor.visit_backend(backend);
            for (&location, location_result) in &backend.locations {
                visitor.visit_location(name, location_result);
                for (&question_id, question) in &location_result.questions {
                    visitor.visit_question(name, location, question);
                    for (&trial_number, trial) in &question.trials {
                        let key = TrialKey::new(name.clone(), location, question_id, trial_number);
                        visitor.visit_trial(&key, trial);
                    }
                }
            }
        }
    }

    /// 清空所有已有答案的试验的评审结果，返回被清空的键
    ///
    /// 槽位按 `judges` 重建；没有答案的试验保留原来的判负结论。
    pub fn reset_answered_verdicts(&mut self, judges: &[String]) -> Vec<TrialKey> {
        self.judges = judges.to_vec();
        let mut reset = Vec::new();
        for (name, backend) in &mut self.backends {
            for (&location, location_result) in &mut backend.locations {
                for (&question_id, question) in &mut location_result.questions {
                    for (&trial_number, trial) in &mut question.trials {
                        if trial.generated_answer.is_some() {
                            trial.reset_verdicts(judges);
                            reset.push(TrialKey::new(name.clone(), location, question_id, trial_number));
                        }
                    }
                    question.score = None;
                }
                location_result.score = None;
            }
            backend.score = None;
        }
        reset
    }
}

impl ResultTree {
    /// 断点续跑前按当前评审团重建所有未完成试验的槽位，返回这些试验的键
    ///
    /// 已有答案的试验由评审团整体重新评审一轮，不会混入上一轮的半数投票。
    pub fn reset_pending_verdicts(&mut self, judges: &[String]) -> Vec<TrialKey> {
        self.judges = judges.to_vec();
        let pending = self.pending_keys();
        for key in &pending {
            if let Some(trial) = self.trial_mut(key) {
                trial.reset_verdicts(judges);
            }
        }
        pending
    }
}

/// 只关心试验层的遍历可以直接传闭包
impl<F> TreeVisitor for F
where
    F: FnMut(&TrialKey, &TrialResult),
{
    fn visit_trial(&mut self, key: &TrialKey, trial: &TrialResult) {
        self(key, trial)
    }
}

fn ensure_not_empty<T>(items: &[T], axis: &str) -> Result<(), SetupError> {
    if items.is_empty() {
        return Err(SetupError::EmptyAxis {
            axis: axis.to_string(),
        });
    }
    Ok(())
}

fn ensure_unique<T, I>(items: I, axis: &str) -> Result<(), SetupError>
where
    T: std::hash::Hash + Eq + fmt::Display,
    I: IntoIterator<Item = T>,
{
    let mut seen = HashSet::new();
    for item in items {
        if seen.contains(&item) {
            return Err(SetupError::DuplicateKey {
                key: format!("{} {}", axis, item),
            });
        }
        seen.insert(item);
    }
    Ok(())
}

pub(crate) fn fraction(numerator: usize, denominator: usize) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}
