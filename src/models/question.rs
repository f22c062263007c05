use serde::{Deserialize, Serialize};

use crate::utils::truncate_text;

/// 题目编号
pub type QuestionId = u32;

/// 被测题目
///
/// 来自语料加载方，加载后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    /// 目标短文原文（题目所依据的段落）
    pub text: String,
    /// 问题
    pub question: String,
    /// 标准答案
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate_answers: Option<Vec<String>>,
}

impl Question {
    pub fn new(
        id: QuestionId,
        text: impl Into<String>,
        question: impl Into<String>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            question: question.into(),
            answer: answer.into(),
            alternate_answers: None,
        }
    }

    pub fn with_alternate_answers(mut self, answers: Vec<String>) -> Self {
        self.alternate_answers = Some(answers);
        self
    }

    /// 是否有备选标准答案
    pub fn has_alternate_answers(&self) -> bool {
        self.alternate_answers
            .as_ref()
            .is_some_and(|answers| !answers.is_empty())
    }

    /// 标准答案在前，备选答案在后
    pub fn all_answers(&self) -> Vec<&str> {
        let mut answers = vec![self.answer.as_str()];
        if let Some(alternates) = &self.alternate_answers {
            answers.extend(alternates.iter().map(String::as_str));
        }
        answers
    }
}

impl std::fmt::Display for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 截断问题内容以便显示（最多80个字符）
        write!(f, "#{} {}", self.id, truncate_text(&self.question, 80))
    }
}

/// 题目文件（TOML）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionFile {
    #[serde(default)]
    pub questions: Vec<Question>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_answers_puts_canonical_first() {
        let question = Question::new(7, "text", "who?", "Bob")
            .with_alternate_answers(vec!["Robert".to_string()]);

        assert!(question.has_alternate_answers());
        assert_eq!(question.all_answers(), vec!["Bob", "Robert"]);
    }

    #[test]
    fn test_empty_alternates_do_not_count() {
        let question = Question::new(1, "t", "q", "a").with_alternate_answers(Vec::new());
        assert!(!question.has_alternate_answers());
        assert_eq!(question.all_answers(), vec!["a"]);
    }
}
