mod base_url;
mod error;
mod llm;
mod sse;

pub use base_url::{check_base_url, default_base_url};
pub use error::AdapterError;
pub use llm::{create_language_model, create_language_model_with};

pub use ebook_core::{LanguageModel, LanguageModelError, LlmConfig, ProviderKind};
