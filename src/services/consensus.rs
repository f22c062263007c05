//! 共识评审 - 业务能力层
//!
//! 把一个生成答案同时交给评审团每个成员，等全部投票回来后按严格多数得出结论。
//!
//! 职责：
//! - 构建评审提示词
//! - 并发调用每个评审（各自走自己的并发池、票据代理和重试）
//! - 解析投票并在全部槽位到齐后统一表决
//! - 不写结果树

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use crate::clients::{BackendError, BackendHandle};
use crate::models::Question;
use crate::results::{Consensus, JudgeVerdict};
use crate::services::retrying_invoker::{InvocationReport, RetryingInvoker};

/// 通过标记（用无意义的字符串，避免和"是/否"类答案混淆）
pub const PASS_TOKEN: &str = "aaa";
/// 不通过标记
pub const FAIL_TOKEN: &str = "bbb";

pub const EVALUATION_SYSTEM_PROMPT: &str = "You are an expert at evaluating the answers to questions based on \
the text of a short passage. You are sure of yourself and always answer with an \"aaa\" or \"bbb\" \
without explanation.";

/// 构建评审提示词
pub fn build_evaluation_prompt(question: &Question, generated_answer: &str) -> String {
    let alternates = match &question.alternate_answers {
        Some(answers) if !answers.is_empty() => format!(
            "\nOther answers that are also considered good:\n\n{}\n",
            answers.join("\n")
        ),
        _ => String::new(),
    };

    format!(
        "I would like you to evaluate the answer to a question about a short passage. The passage is:\n\n\
         {text}\n\n\
         The question is:\n\n\
         {question}\n\n\
         An example of a good answer to this question is:\n\n\
         {good}\n\
         {alternates}\n\
         And this is the generated answer to the question:\n\n\
         {generated}\n\n\
         You need to determine if the generated answer passes or fails. Pass means the answer has the same \
         meaning as the good answer. It does not matter if the generated answer is more or less concise than \
         the good answer. Does the generated answer pass or fail? Do not provide an explanation, only reply \
         with \"{pass}\" if the generated answer passes or \"{fail}\" if it fails.\n",
        text = question.text,
        question = question.question,
        good = question.answer,
        alternates = alternates,
        generated = generated_answer,
        pass = PASS_TOKEN,
        fail = FAIL_TOKEN,
    )
}

/// 解析评审回复：只含通过标记才算通过，两个都有或都没有一律判负
pub fn parse_verdict(reply: &str) -> bool {
    let reply = reply.to_lowercase();
    reply.contains(PASS_TOKEN) && !reply.contains(FAIL_TOKEN)
}

/// 单个评审的结果
#[derive(Debug, Clone)]
pub struct JudgeOutcome {
    pub slot: usize,
    pub judge: String,
    pub passed: bool,
    pub report: InvocationReport,
}

/// 一次评审的完整结果
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub consensus: Consensus,
    /// 按槽位排列
    pub outcomes: Vec<JudgeOutcome>,
}

impl Evaluation {
    pub fn passed(&self) -> bool {
        self.consensus.passed
    }

    pub fn verdicts(&self) -> Vec<JudgeVerdict> {
        self.outcomes
            .iter()
            .map(|o| JudgeVerdict {
                judge: o.judge.clone(),
                passed: Some(o.passed),
            })
            .collect()
    }
}

/// 共识评审器
#[derive(Debug, Clone)]
pub struct ConsensusEvaluator {
    panel: Vec<BackendHandle>,
    invoker: Arc<RetryingInvoker>,
}

impl ConsensusEvaluator {
    /// 创建评审器
    ///
    /// # 参数
    /// - `panel`: 评审团，顺序即槽位顺序
    /// - `invoker`: 评审调用使用的重试调用器
    pub fn new(panel: Vec<BackendHandle>, invoker: Arc<RetryingInvoker>) -> Self {
        Self { panel, invoker }
    }

    pub fn panel_size(&self) -> usize {
        self.panel.len()
    }

    pub fn judges(&self) -> Vec<String> {
        self.panel.iter().map(|h| h.id().to_string()).collect()
    }

    /// 评审一个生成答案
    ///
    /// 等待全部评审返回后才表决；重试耗尽的评审投不通过票。
    pub async fn evaluate(&self, question: &Question, generated_answer: &str) -> Evaluation {
        let prompt: Arc<str> = Arc::from(build_evaluation_prompt(question, generated_answer));

        let mut pending: FuturesUnordered<_> = self
            .panel
            .iter()
            .enumerate()
            .map(|(slot, handle)| {
                let handle = handle.clone();
                let invoker = self.invoker.clone();
                let prompt = prompt.clone();
                let judge = handle.id().to_string();
                let task = tokio::spawn(async move {
                    let _permit = match handle.evaluation_pool().clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            return InvocationReport::failed(BackendError::Fatal {
                                backend: handle.id().to_string(),
                                message: format!("评审并发池已关闭: {}", e),
                            })
                        }
                    };
                    invoker
                        .invoke(&handle, &prompt, Some(EVALUATION_SYSTEM_PROMPT))
                        .await
                });
                async move { (slot, judge, task.await) }
            })
            .collect();

        let mut outcomes = Vec::with_capacity(self.panel.len());
        while let Some((slot, judge, joined)) = pending.next().await {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    warn!("[{}] 评审任务异常退出: {}", judge, e);
                    InvocationReport::failed(BackendError::Fatal {
                        backend: judge.clone(),
                        message: format!("评审任务异常退出: {}", e),
                    })
                }
            };
            let passed = report.answer().is_some_and(parse_verdict);
            debug!("[{}] 投票: {}", judge, if passed { "通过" } else { "不通过" });
            outcomes.push(JudgeOutcome {
                slot,
                judge,
                passed,
                report,
            });
        }

        // 全部到齐后再表决
        outcomes.sort_by_key(|o| o.slot);
        let votes: Vec<bool> = outcomes.iter().map(|o| o.passed).collect();
        Evaluation {
            consensus: Consensus::resolve(&votes),
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Backend;
    use crate::infrastructure::{RateBudget, TicketBroker};
    use crate::services::retrying_invoker::RetryPolicy;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedJudge {
        id: String,
        reply: Result<String, BackendError>,
        delay: Duration,
    }

    #[async_trait]
    impl Backend for FixedJudge {
        fn id(&self) -> &str {
            &self.id
        }

        fn max_input(&self) -> usize {
            8000
        }

        async fn invoke(&self, prompt: &str, system: Option<&str>) -> Result<String, BackendError> {
            assert!(prompt.contains("The passage is"));
            assert_eq!(system, Some(EVALUATION_SYSTEM_PROMPT));
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    fn judge(id: &str, reply: Result<&str, ()>, delay_ms: u64) -> BackendHandle {
        let reply = reply.map(str::to_string).map_err(|_| BackendError::Transient {
            backend: id.to_string(),
            message: "down".to_string(),
        });
        let client = Arc::new(FixedJudge {
            id: id.to_string(),
            reply,
            delay: Duration::from_millis(delay_ms),
        });
        let broker = Arc::new(TicketBroker::new(id, RateBudget::per_minute(1000), None));
        BackendHandle::new(client, broker, 1, 2)
    }

    fn evaluator(panel: Vec<BackendHandle>) -> ConsensusEvaluator {
        let invoker = RetryingInvoker::new(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            rate_limit_retries: 0,
            call_timeout: None,
        });
        ConsensusEvaluator::new(panel, Arc::new(invoker))
    }

    #[test]
    fn test_parse_verdict() {
        assert!(parse_verdict("aaa"));
        assert!(parse_verdict("  AAA.\n"));
        assert!(!parse_verdict("bbb"));
        assert!(!parse_verdict("aaa bbb"));
        assert!(!parse_verdict(""));
        assert!(!parse_verdict("yes"));
    }

    #[test]
    fn test_prompt_embeds_question_and_alternates() {
        let question = Question::new(1, "Ada kept the light.", "Who kept the light?", "Ada")
            .with_alternate_answers(vec!["The keeper Ada".to_string()]);
        let prompt = build_evaluation_prompt(&question, "It was Ada");

        assert!(prompt.contains("Ada kept the light."));
        assert!(prompt.contains("Who kept the light?"));
        assert!(prompt.contains("The keeper Ada"));
        assert!(prompt.contains("It was Ada"));
    }

    #[tokio::test]
    async fn test_majority_with_out_of_order_completion() {
        let panel = vec![
            judge("slow-pass", Ok("aaa"), 30),
            judge("fast-fail", Ok("bbb"), 0),
            judge("mid-pass", Ok("AAA"), 10),
        ];
        let question = Question::new(1, "Ada kept the light.", "Who?", "Ada");

        let evaluation = evaluator(panel).evaluate(&question, "Ada").await;

        assert!(evaluation.passed());
        assert_eq!(evaluation.consensus.dissent, 1);
        let judges: Vec<_> = evaluation.outcomes.iter().map(|o| o.judge.as_str()).collect();
        assert_eq!(judges, ["slow-pass", "fast-fail", "mid-pass"]);
    }

    #[tokio::test]
    async fn test_even_split_fails() {
        let panel = vec![
            judge("a", Ok("aaa"), 0),
            judge("b", Ok("aaa"), 0),
            judge("c", Ok("bbb"), 0),
            judge("d", Ok("bbb"), 0),
        ];
        let question = Question::new(1, "t", "q", "a");

        let evaluation = evaluator(panel).evaluate(&question, "a").await;

        assert!(!evaluation.passed());
        assert_eq!(evaluation.consensus.dissent, 2);
    }

    #[tokio::test]
    async fn test_exhausted_judge_votes_fail() {
        let panel = vec![
            judge("up", Ok("aaa"), 0),
            judge("down", Err(()), 0),
            judge("up-too", Ok("aaa"), 0),
        ];
        let question = Question::new(1, "t", "q", "a");

        let evaluation = evaluator(panel).evaluate(&question, "a").await;

        assert!(evaluation.passed());
        let down = &evaluation.outcomes[1];
        assert!(!down.passed);
        assert!(down.report.is_exhausted());
        assert_eq!(down.report.failures.len(), 3);
        assert_eq!(evaluation.verdicts()[1].passed, Some(false));
    }
}
