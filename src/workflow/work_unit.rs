//! 工作单元
//!
//! 封装"我正在跑哪个后端、哪个位置、哪道题的第几次试验"这一信息

use std::fmt;
use std::sync::Arc;

use crate::models::Question;
use crate::results::TrialKey;

/// 一个独立的 (后端, 位置, 题目, 试验) 任务
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub key: TrialKey,
    pub question: Arc<Question>,
    /// 该后端在该位置针对该题目的完整提示词
    pub prompt: Arc<str>,
}

impl WorkUnit {
    pub fn new(key: TrialKey, question: Arc<Question>, prompt: Arc<str>) -> Self {
        Self {
            key,
            question,
            prompt,
        }
    }

    pub fn backend(&self) -> &str {
        &self.key.backend
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] 位置 {} 题目 {} 试验 {}",
            self.key.backend, self.key.location, self.key.question_id, self.key.trial
        )
    }
}
