//! Jinja2 chat templates from tokenizer_config.json, rendered with minijinja

use crate::error::Result;
use minijinja::{context, Environment, Error as JinjaError, ErrorKind, Value};
use serde::{Deserialize, Serialize};

/// Chat message structure for template rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

/// Template configuration loaded from tokenizer_config.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// The Jinja2 chat template string
    pub chat_template: Option<String>,
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
    pub pad_token: Option<String>,
    pub unk_token: Option<String>,
    pub additional_special_tokens: Vec<String>,
}

impl TemplateConfig {
    /// Parse template configuration from tokenizer_config.json
    pub fn from_tokenizer_config(config_json: &serde_json::Value) -> Self {
        let token = |key: &str| config_json.get(key).and_then(extract_token_value);

        // Some repos ship a list of named templates instead of a single string
        let chat_template = match config_json.get("chat_template") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Array(entries)) => entries
                .iter()
                .find(|e| e.get("name").and_then(|n| n.as_str()) == Some("default"))
                .or_else(|| entries.first())
                .and_then(|e| e.get("template"))
                .and_then(|t| t.as_str())
                .map(str::to_string),
            _ => None,
        };

        let additional_special_tokens = config_json
            .get("additional_special_tokens")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(extract_token_value).collect())
            .unwrap_or_default();

        Self {
            chat_template,
            bos_token: token("bos_token"),
            eos_token: token("eos_token"),
            pad_token: token("pad_token"),
            unk_token: token("unk_token"),
            additional_special_tokens,
        }
    }
}

/// Template engine for rendering chat templates
pub struct TemplateEngine {
    env: Environment<'static>,
    config: TemplateConfig,
}

const CHAT_TEMPLATE: &str = "chat";

impl TemplateEngine {
    /// Create an engine for `config`, using the fallback template for
    /// `model_type` when the tokenizer config carries none.
    pub fn new(config: TemplateConfig, model_type: &str) -> Result<Self> {
        let mut env = Environment::new();

        env.add_filter("length", length_filter);
        env.add_filter("tojson", tojson_filter);
        env.add_function("raise_exception", raise_exception);

        // Python string methods, usable as `x is startswith("p")`
        env.add_test("startswith", |value: &str, prefix: &str| -> bool {
            value.starts_with(prefix)
        });
        env.add_test("endswith", |value: &str, suffix: &str| -> bool {
            value.ends_with(suffix)
        });

        let source = match &config.chat_template {
            Some(template) => template.clone(),
            None => {
                tracing::warn!(
                    "Tokenizer has no chat template, using {} fallback",
                    model_type
                );
                Self::get_fallback_template(model_type).to_string()
            }
        };

        // minijinja has no string methods; map the two HF templates rely on to tests
        let template = source
            .replace(".startswith(", " is startswith(")
            .replace(".endswith(", " is endswith(");

        // Compiled once, so a broken template fails before tokenization
        env.add_template_owned(CHAT_TEMPLATE, template)?;

        Ok(Self { env, config })
    }

    pub fn config(&self) -> &TemplateConfig {
        &self.config
    }

    /// Render `messages` to a single prompt string.
    pub fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String> {
        let tmpl = self.env.get_template(CHAT_TEMPLATE)?;
        let rendered = tmpl.render(context! {
            messages => messages,
            bos_token => self.config.bos_token.as_deref().unwrap_or(""),
            eos_token => self.config.eos_token.as_deref().unwrap_or(""),
            pad_token => self.config.pad_token.as_deref().unwrap_or(""),
            unk_token => self.config.unk_token.as_deref().unwrap_or(""),
            additional_special_tokens => &self.config.additional_special_tokens,
            add_generation_prompt => add_generation_prompt,
        })?;
        Ok(rendered)
    }

    /// Fallback template for common model families
    pub fn get_fallback_template(model_type: &str) -> &'static str {
        match model_type.to_lowercase().as_str() {
            "llama" | "llama2" | "llama3" => {
                r#"{% for message in messages %}{% if message['role'] == 'system' %}{{ message['content'] }}

{% elif message['role'] == 'user' %}### Human: {{ message['content'] }}

{% elif message['role'] == 'assistant' %}### Assistant: {{ message['content'] }}

{% endif %}{% endfor %}{% if add_generation_prompt %}### Assistant: {% endif %}"#
            }
            "mistral" | "mixtral" => {
                r#"{% for message in messages %}{% if message['role'] == 'user' %}[INST] {{ message['content'] }} [/INST]{% elif message['role'] == 'assistant' %}{{ message['content'] }}</s>{% endif %}{% endfor %}"#
            }
            "gemma" | "gemma2" => {
                r#"{% for message in messages %}{% if message['role'] == 'user' %}<start_of_turn>user
{{ message['content'] }}<end_of_turn>
{% elif message['role'] == 'assistant' %}<start_of_turn>model
{{ message['content'] }}<end_of_turn>
{% endif %}{% endfor %}{% if add_generation_prompt %}<start_of_turn>model
{% endif %}"#
            }
            // Qwen and anything unknown use ChatML
            _ => {
                r#"{% for message in messages %}<|im_start|>{{ message['role'] }}
{{ message['content'] }}<|im_end|>
{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant
{% endif %}"#
            }
        }
    }
}

/// Extract token value from JSON (handles both string and AddedToken object formats)
fn extract_token_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(obj) => obj
            .get("content")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

fn length_filter(value: &Value) -> std::result::Result<Value, JinjaError> {
    if let Some(s) = value.as_str() {
        Ok(Value::from(s.chars().count()))
    } else if let Ok(iter) = value.try_iter() {
        Ok(Value::from(iter.count()))
    } else {
        Ok(Value::from(0))
    }
}

fn tojson_filter(value: &Value) -> std::result::Result<Value, JinjaError> {
    let json_str = serde_json::to_string(&value).map_err(|e| {
        JinjaError::new(
            ErrorKind::InvalidOperation,
            format!("Failed to serialize to JSON: {}", e),
        )
    })?;
    Ok(Value::from(json_str))
}

fn raise_exception(message: String) -> std::result::Result<Value, JinjaError> {
    Err(JinjaError::new(ErrorKind::InvalidOperation, message))
}
