//! Base model runtime: asset resolution, tokenization, precision and the
//! trainable causal language model.

pub mod causal_lm;
pub mod model_config;
pub mod model_loader;
pub mod precision;
pub mod template_engine;
pub mod tokenizer;

pub use causal_lm::{CausalLanguageModel, LoraCausalLM, PEFT_PREFIX};
pub use model_config::ModelConfig;
pub use model_loader::{load_weights, resolve_base_model, select_device, BaseModelFiles};
pub use precision::{PrecisionConfig, PrecisionMode};
pub use template_engine::{ChatMessage, TemplateConfig, TemplateEngine};
pub use tokenizer::{ChatTokenizer, HfChatTokenizer};
