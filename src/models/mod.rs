pub mod backend_spec;
pub mod loaders;
pub mod prompt_book;
pub mod provider;
pub mod question;

pub use backend_spec::{BackendFile, BackendRole, BackendSpec};
pub use loaders::{load_backend_specs, load_questions};
pub use prompt_book::{ProbeLocation, PromptBook};
pub use provider::{provider_defaults, ProviderDefaults, Protocol, PROVIDER_DEFAULTS};
pub use question::{Question, QuestionFile, QuestionId};
