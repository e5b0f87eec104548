//! rig-core OpenAI translator.

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openai;
use secrecy::ExposeSecret;

use crate::error::TranslateError;
use crate::translate::{
    KEYWORD_PREAMBLE, TRANSLATE_PREAMBLE, Translator, TranslatorConfig, first_line,
};

const PROVIDER: &str = "openai";
const MAX_TOKENS: u64 = 50;

/// Translator backed by OpenAI through rig-core.
pub struct RigTranslator {
    client: rig::client::Client<openai::client::OpenAIResponsesExt>,
    keyword_model: String,
    translate_model: String,
}

impl RigTranslator {
    pub fn new(config: &TranslatorConfig) -> Result<Self, TranslateError> {
        let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
            openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
                TranslateError::Client(format!("Failed to create OpenAI client: {e}"))
            })?;

        tracing::info!(
            keyword_model = %config.keyword_model,
            translate_model = %config.translate_model,
            "Using OpenAI translator"
        );
        Ok(Self {
            client,
            keyword_model: config.keyword_model.clone(),
            translate_model: config.translate_model.clone(),
        })
    }

    async fn ask(
        &self,
        model: &str,
        preamble: &str,
        input: &str,
        step: &str,
    ) -> Result<String, TranslateError> {
        let agent = self
            .client
            .agent(model)
            .preamble(preamble)
            .max_tokens(MAX_TOKENS)
            .build();

        let reply: String = agent
            .prompt(format!("Input: {input}"))
            .await
            .map_err(|e| classify(e.to_string()))?;

        first_line(&reply).ok_or_else(|| TranslateError::EmptyResponse {
            provider: PROVIDER.to_string(),
            step: step.to_string(),
        })
    }
}

fn classify(reason: String) -> TranslateError {
    let lower = reason.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") {
        TranslateError::RateLimited {
            provider: PROVIDER.to_string(),
        }
    } else {
        TranslateError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl Translator for RigTranslator {
    async fn extract_native_keyword(&self, title: &str) -> Result<String, TranslateError> {
        self.ask(&self.keyword_model, KEYWORD_PREAMBLE, title, "keyword")
            .await
    }

    async fn translate(&self, keyword: &str) -> Result<String, TranslateError> {
        self.ask(&self.translate_model, TRANSLATE_PREAMBLE, keyword, "translation")
            .await
    }
}
