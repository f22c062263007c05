use serde::{Deserialize, Serialize};

/// 单个评审的投票，`passed` 为 `None` 表示槽位未填
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub judge: String,
    pub passed: Option<bool>,
}

impl JudgeVerdict {
    pub fn empty(judge: impl Into<String>) -> Self {
        Self {
            judge: judge.into(),
            passed: None,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.passed.is_some()
    }
}

/// 多数表决结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consensus {
    pub passed: bool,
    /// 与最终结果不一致的评审数
    pub dissent: usize,
}

impl Consensus {
    /// 严格多数：通过票必须超过一半，平票判为不通过
    ///
    /// 只依赖票数，与投票到达顺序无关。
    pub fn resolve(votes: &[bool]) -> Self {
        let pass_count = votes.iter().filter(|&&v| v).count();
        let passed = pass_count * 2 > votes.len();
        let dissent = votes.iter().filter(|&&v| v != passed).count();
        Self { passed, dissent }
    }
}

/// 一次试验
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_number: u32,
    pub generated_answer: Option<String>,
    /// 生成结果是否已记录（包括"没有答案"）
    #[serde(default)]
    pub answer_recorded: bool,
    pub verdicts: Vec<JudgeVerdict>,
    pub passed: Option<bool>,
    pub dissent_count: Option<usize>,
}

impl TrialResult {
    /// 创建空试验，每个评审一个空槽位
    pub fn new(trial_number: u32, judges: &[String]) -> Self {
        Self {
            trial_number,
            generated_answer: None,
            answer_recorded: false,
            verdicts: judges.iter().map(JudgeVerdict::empty).collect(),
            passed: None,
            dissent_count: None,
        }
    }

    /// 记录生成结果，只生效一次
    ///
    /// 返回 `false` 表示已经记录过，本次被忽略。
    pub fn record_answer(&mut self, answer: Option<String>) -> bool {
        if self.answer_recorded {
            return false;
        }
        self.generated_answer = answer;
        self.answer_recorded = true;
        self.try_finalize();
        true
    }

    /// 填写评审槽位，已填的槽位不再改动
    ///
    /// 返回 `None` 表示槽位不存在或评审名称不符。
    pub fn record_verdict(&mut self, slot: usize, judge: &str, passed: bool) -> Option<bool> {
        let verdict = self.verdicts.get_mut(slot)?;
        if verdict.judge != judge {
            return None;
        }
        if verdict.is_filled() {
            return Some(false);
        }
        verdict.passed = Some(passed);
        self.try_finalize();
        Some(true)
    }

    pub fn filled_slots(&self) -> usize {
        self.verdicts.iter().filter(|v| v.is_filled()).count()
    }

    pub fn all_slots_filled(&self) -> bool {
        self.verdicts.iter().all(JudgeVerdict::is_filled)
    }

    pub fn is_finished(&self) -> bool {
        self.passed.is_some()
    }

    /// 生成已结束但没有答案（槽位是直接判负的，没有经过评审）
    pub fn has_no_answer(&self) -> bool {
        self.answer_recorded && self.generated_answer.is_none()
    }

    /// 全部槽位填满且生成结果已记录时计算并冻结结论
    fn try_finalize(&mut self) {
        if self.is_finished() || !self.answer_recorded || !self.all_slots_filled() {
            return;
        }
        let votes: Vec<bool> = self.verdicts.iter().filter_map(|v| v.passed).collect();
        let consensus = Consensus::resolve(&votes);
        self.passed = Some(consensus.passed);
        self.dissent_count = Some(consensus.dissent);
    }

    /// 按新的评审团重建空槽位，重新评审前调用
    pub fn reset_verdicts(&mut self, judges: &[String]) {
        self.verdicts = judges.iter().map(JudgeVerdict::empty).collect();
        self.passed = None;
        self.dissent_count = None;
    }

    /// 反对票达到评审团一半（半数按银行家舍入）
    pub fn has_concerning_dissent(&self) -> bool {
        let Some(dissent) = self.dissent_count else {
            return false;
        };
        let panel = self.verdicts.len();
        let threshold = panel / 2 + usize::from(panel % 4 == 3);
        dissent > 0 && dissent >= threshold
    }
}
