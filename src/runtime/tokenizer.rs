//! Tokenizer capability used by the dataset builder.

use super::template_engine::{ChatMessage, TemplateConfig, TemplateEngine};
use crate::error::{Result, TrainError};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

/// Chat formatting plus tokenization.
pub trait ChatTokenizer {
    /// Render a conversation through the model's chat template.
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String>;

    /// Token ids for `text`, including the tokenizer's special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Id used to right-pad sequences.
    fn pad_token_id(&self) -> u32;
}

/// `tokenizer.json` + `tokenizer_config.json` from a Hugging Face model repo.
pub struct HfChatTokenizer {
    tokenizer: Tokenizer,
    template: TemplateEngine,
    pad_token_id: u32,
}

impl HfChatTokenizer {
    pub fn new(tokenizer: Tokenizer, config: TemplateConfig, model_type: &str) -> Result<Self> {
        let pad_token_id = resolve_pad_token(&tokenizer, &config)?;
        let template = TemplateEngine::new(config, model_type)?;
        Ok(Self {
            tokenizer,
            template,
            pad_token_id,
        })
    }

    /// Load from a model directory containing `tokenizer.json` and,
    /// optionally, `tokenizer_config.json`.
    pub fn from_model_dir(model_dir: &Path, model_type: &str) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)?;

        let config_path = model_dir.join("tokenizer_config.json");
        let config = if config_path.exists() {
            let json: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
            TemplateConfig::from_tokenizer_config(&json)
        } else {
            warn!("No tokenizer_config.json in {}", model_dir.display());
            TemplateConfig::default()
        };

        debug!(
            "Loaded tokenizer with {} tokens from {}",
            tokenizer.get_vocab_size(true),
            tokenizer_path.display()
        );
        Self::new(tokenizer, config, model_type)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl ChatTokenizer for HfChatTokenizer {
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String> {
        self.template
            .apply_chat_template(messages, add_generation_prompt)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, true)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }
}

/// The declared pad token, else EOS, as causal LM tokenizers often lack one.
fn resolve_pad_token(tokenizer: &Tokenizer, config: &TemplateConfig) -> Result<u32> {
    if let Some(id) = config
        .pad_token
        .as_deref()
        .and_then(|t| tokenizer.token_to_id(t))
    {
        return Ok(id);
    }
    if let Some(id) = config
        .eos_token
        .as_deref()
        .and_then(|t| tokenizer.token_to_id(t))
    {
        warn!("Tokenizer has no pad token, padding with eos token id {}", id);
        return Ok(id);
    }
    Err(TrainError::Tokenizer(
        "tokenizer declares neither a pad token nor an eos token".into(),
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;
    use tokenizers::AddedToken;

    /// Word-level tokenizer over a tiny vocabulary with ChatML markers.
    pub(crate) fn word_tokenizer(pad: Option<&str>) -> HfChatTokenizer {
        let words = [
            "<unk>", "<pad>", "<eos>", "<|im_start|>", "<|im_end|>", "system", "user",
            "assistant", "You", "are", "Qwen", ",", "a", "helpful", "AI", ".", "hi", "hello",
            "how", "is", "the", "weather",
        ];
        let vocab: HashMap<String, u32> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_string())
            .build()
            .expect("test: wordlevel");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace::default()));
        let markers: Vec<AddedToken> = ["<|im_start|>", "<|im_end|>", "<pad>", "<eos>"]
            .iter()
            .map(|t| AddedToken::from(t.to_string(), true))
            .collect();
        tokenizer.add_special_tokens(&markers);

        let config = TemplateConfig {
            pad_token: pad.map(str::to_string),
            eos_token: Some("<eos>".to_string()),
            ..Default::default()
        };
        HfChatTokenizer::new(tokenizer, config, "qwen2").expect("test: tokenizer")
    }

    #[test]
    fn test_pad_token_resolution() {
        assert_eq!(word_tokenizer(Some("<pad>")).pad_token_id(), 1);
        // Falls back to eos
        assert_eq!(word_tokenizer(None).pad_token_id(), 2);
    }

    #[test]
    fn test_chat_encode() {
        let tokenizer = word_tokenizer(Some("<pad>"));
        let text = tokenizer
            .apply_chat_template(
                &[ChatMessage::user("hi"), ChatMessage::assistant("hello")],
                false,
            )
            .expect("test: template");
        let ids = tokenizer.encode(&text).expect("test: encode");
        assert!(ids.contains(&16));
        assert!(ids.contains(&17));
        assert!(!ids.contains(&0), "all words should be in the vocabulary");
    }
}
