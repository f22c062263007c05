pub mod backend;
pub mod ollama_client;
pub mod openai_client;
pub mod registry;

pub use backend::{Backend, BackendError, FailureKind};
pub use ollama_client::OllamaClient;
pub use openai_client::OpenAiCompatibleClient;
pub use registry::{BackendHandle, BackendRegistry};
