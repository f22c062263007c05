pub mod toml_loader;

pub use toml_loader::{load_backend_specs, load_questions};
