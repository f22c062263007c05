pub mod mutation;
pub mod report;
pub mod tree;
pub mod trial;

pub use mutation::{apply_batch, Applied, ApplyStats, Mutation, MutationError, MutationQueue};
pub use report::{BackendVariance, DissentReport, JudgeDissent, ScoreSummary, VarianceReport};
pub use tree::{
    BackendResult, ExceptionRecord, LocationResult, QuestionResult, ResultTree, Stage,
    TreeVisitor, TrialKey,
};
pub use trial::{Consensus, JudgeVerdict, TrialResult};
