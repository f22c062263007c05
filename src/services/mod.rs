pub mod consensus;
pub mod retrying_invoker;

pub use consensus::{
    build_evaluation_prompt, parse_verdict, ConsensusEvaluator, Evaluation, JudgeOutcome,
    EVALUATION_SYSTEM_PROMPT, FAIL_TOKEN, PASS_TOKEN,
};
pub use retrying_invoker::{
    AttemptFailure, InvocationOutcome, InvocationReport, RetryPolicy, RetryingInvoker,
};
