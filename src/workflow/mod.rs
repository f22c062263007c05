pub mod trial_flow;
pub mod work_unit;

pub use trial_flow::{fail_verdicts, TrialFlow, TrialOutcome, GENERATION_SYSTEM_PROMPT};
pub use work_unit::WorkUnit;
