//! AI keyword extraction and translation.
//!
//! Two calls per listing title: pull a short native-language search keyword
//! out of the title, then translate that keyword to English.

mod rig_translator;

pub use rig_translator::RigTranslator;

use async_trait::async_trait;

use crate::error::TranslateError;

/// Configuration for the OpenAI-backed translator.
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub api_key: secrecy::SecretString,
    /// Model used to extract the native keyword.
    pub keyword_model: String,
    /// Model used to translate the keyword.
    pub translate_model: String,
}

/// External translation capability. Both calls are fallible and retried
/// by the caller.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Up to three Japanese words that find the item a title describes.
    async fn extract_native_keyword(&self, title: &str) -> Result<String, TranslateError>;

    /// English rendering of a native keyword.
    async fn translate(&self, keyword: &str) -> Result<String, TranslateError>;
}

pub(crate) const KEYWORD_PREAMBLE: &str = "\
Role: Search optimization expert.
Task: Generate a concise set of Japanese keywords (up to three words) that finds the exact \
item described by the given listing title in Japanese marketplaces.
Rules:
- The keywords must be in Japanese and precisely target the item.
- Use natural Japanese search terms; no unnecessary words.
- Provide one option only, with no labels such as \"Japanese:\".
Output: only the keywords, on a single line.
Example: CSMオーズドライバー for the title \
\"Kamen Rider OOO DRIVER COMPLETE SET Selection BANDAI CSM Modification MINT\".";

pub(crate) const TRANSLATE_PREAMBLE: &str = "\
Role: Professional translator of Japanese product keywords.
Task: Translate the given Japanese word(s) into English.
Rules:
- Return only the single most accurate translation.
- No labels such as \"English:\", explanations, or formatting.
Output: only the translated word(s), on a single line.
Example: CSMオーズドライバー translates to CSM OOO DRIVER.";

/// Trim a model reply to its first non-empty line.
pub(crate) fn first_line(reply: &str) -> Option<String> {
    reply
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
