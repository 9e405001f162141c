//! # MyDigest Providers
//!
//! Text generation backends for the summarization pipeline.
//!
//! Every supported provider (Mistral, OpenAI, OpenRouter, DeepSeek, Groq,
//! Gemini, Ollama) speaks the OpenAI chat-completions dialect and is served by
//! a single `OpenAiCompatibleGenerator`.

pub mod openai_compatible;
pub mod provider_registry;

use mydigest_core::config::MyDigestConfig;
use mydigest_core::{DigestError, Result, TextGenerator};

pub use openai_compatible::OpenAiCompatibleGenerator;

/// Create the text generator named by `[llm] provider`.
pub fn create_generator(config: &MyDigestConfig) -> Result<Box<dyn TextGenerator>> {
    let provider_name = config.llm.provider.as_str();
    match provider_name {
        // Custom endpoint: "custom:https://my-server.com/v1"
        other if other.starts_with("custom:") => Ok(Box::new(OpenAiCompatibleGenerator::custom(
            other,
            &config.llm,
        )?)),

        _ => {
            let registry = provider_registry::get_provider_config(provider_name).ok_or_else(|| {
                DigestError::Config(format!("unknown LLM provider '{provider_name}'"))
            })?;
            Ok(Box::new(OpenAiCompatibleGenerator::from_registry(
                registry,
                &config.llm,
            )?))
        }
    }
}

/// List all available provider names.
pub fn available_providers() -> Vec<&'static str> {
    let mut names = provider_registry::all_provider_names();
    names.push("custom");
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_default_generator() {
        let generator = create_generator(&MyDigestConfig::default()).unwrap();
        assert_eq!(generator.name(), "mistral");
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let mut config = MyDigestConfig::default();
        config.llm.provider = "hal9000".into();
        assert!(matches!(
            create_generator(&config),
            Err(DigestError::Config(_))
        ));
    }

    #[test]
    fn test_custom_provider() {
        let mut config = MyDigestConfig::default();
        config.llm.provider = "custom:http://localhost:1234/v1".into();
        assert_eq!(create_generator(&config).unwrap().name(), "custom");
        assert!(available_providers().contains(&"custom"));
    }
}
