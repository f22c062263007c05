pub mod json_store;

pub use json_store::{JsonResultStore, ResultStore, FULL_RESULTS_SUFFIX, MODEL_SCORES_FILE};
