use crate::config::TranslationConfig;
use crate::translate::{TranslationError, Translator};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const GEMINI_API: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Rewrites task titles through the Gemini `generateContent` API.
pub struct GeminiTranslator {
    client: Client,
    api_key: String,
    model: String,
    prompt: String,
}

impl GeminiTranslator {
    pub fn from_config(config: &TranslationConfig) -> Result<Self, TranslationError> {
        let api_key = config.api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(TranslationError("missing Gemini API key".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(5)))
            .build()
            .map_err(|e| TranslationError(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            model: normalize_model_name(&config.model),
            prompt: title_prompt(&config.target_language, config.add_emojis),
        })
    }

    fn generate_text(&self, text: &str) -> Result<String, TranslationError> {
        let url = format!("{GEMINI_API}/{}:generateContent", self.model);
        let body = json!({
            "systemInstruction": {
                "parts": [{"text": self.prompt}]
            },
            "contents": [
                {
                    "role": "user",
                    "parts": [{"text": text}]
                }
            ],
            "generationConfig": {
                "temperature": 0.2,
                "maxOutputTokens": 128,
                "topP": 0.9
            }
        });

        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .map_err(|e| TranslationError(format!("Gemini request failed: {e}")))?;
        let status = response.status();
        let body_text = response
            .text()
            .map_err(|e| TranslationError(format!("Gemini response read failed: {e}")))?;
        if !status.is_success() {
            return Err(TranslationError(format!(
                "Gemini error ({status}): {}",
                truncate_chars(&body_text, 240)
            )));
        }
        first_text(&body_text)
    }
}

impl Translator for GeminiTranslator {
    fn translate(&self, text: &str) -> Result<String, TranslationError> {
        let translated = self.generate_text(text.trim())?;
        Ok(clean_title(&translated))
    }
}

fn title_prompt(target_language: &str, add_emojis: bool) -> String {
    let language = if target_language.trim().is_empty() {
        "Hebrew"
    } else {
        target_language.trim()
    };
    let emojis = if add_emojis {
        "Add two relevant emojis at the end of the sentence."
    } else {
        "Do not add any emojis."
    };
    format!(
        "You translate task titles from English to {language} and rewrite them concisely \
following Getting Things Done principles. {emojis} \
Reply with the rewritten title only, on a single line."
    )
}

fn first_text(body: &str) -> Result<String, TranslationError> {
    let parsed: GeminiResponse = serde_json::from_str(body)
        .map_err(|e| TranslationError(format!("Gemini parse failed: {e}")))?;
    parsed
        .candidates
        .iter()
        .filter_map(|candidate| candidate.content.as_ref())
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.text.as_ref())
        .find(|text| !text.trim().is_empty())
        .map(|text| text.trim().to_string())
        .ok_or_else(|| TranslationError("Gemini returned empty response.".to_string()))
}

/// Keeps the first line and drops wrapping quotes some models add.
fn clean_title(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    line.trim_matches(|c| c == '"' || c == '“' || c == '”' || c == '`')
        .trim()
        .to_string()
}

fn normalize_model_name(model: &str) -> String {
    let trimmed = model.trim();
    if trimmed.is_empty() {
        return DEFAULT_MODEL.to_string();
    }
    trimmed.strip_prefix("models/").unwrap_or(trimmed).to_string()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out.replace(['\n', '\r'], " ")
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_follows_emoji_setting() {
        let prompt = title_prompt("Hebrew", true);
        assert!(prompt.contains("to Hebrew"));
        assert!(prompt.contains("two relevant emojis"));
        assert!(title_prompt("", false).contains("Do not add any emojis"));
    }

    #[test]
    fn reads_first_non_empty_candidate() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"  "}]}},{"content":{"parts":[{"text":"לקנות חלב 🥛🛒\n"}]}}]}"#;
        assert_eq!(first_text(body).unwrap(), "לקנות חלב 🥛🛒");
        assert!(first_text(r#"{"candidates":[]}"#).is_err());
        assert!(first_text("not json").is_err());
    }

    #[test]
    fn cleans_quotes_and_extra_lines() {
        assert_eq!(clean_title("\"להתקשר לרופא שיניים\"\nnote"), "להתקשר לרופא שיניים");
        assert_eq!(clean_title("\n\n`Title`"), "Title");
    }

    #[test]
    fn missing_key_is_rejected() {
        let config = TranslationConfig::default();
        assert!(GeminiTranslator::from_config(&config).is_err());
    }

    #[test]
    fn model_names_are_normalized() {
        assert_eq!(normalize_model_name("models/gemini-2.0-flash"), "gemini-2.0-flash");
        assert_eq!(normalize_model_name(" "), DEFAULT_MODEL);
    }
}
