use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("translation failed: {0}")]
pub struct TranslationError(pub String);

/// Stateless title rewriter.
pub trait Translator {
    fn translate(&self, text: &str) -> Result<String, TranslationError>;
}

/// Creation direction a title is prepared for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Local task mirrored into the remote service.
    Outgoing,
    /// Remote task imported into the local task manager.
    Incoming,
}

/// Rewrites titles before creation when the deployment enables it.
pub struct TitlePipeline {
    translator: Option<Box<dyn Translator>>,
    outgoing: bool,
    incoming: bool,
}

impl TitlePipeline {
    pub fn disabled() -> Self {
        Self {
            translator: None,
            outgoing: false,
            incoming: false,
        }
    }

    pub fn new(translator: Box<dyn Translator>, outgoing: bool, incoming: bool) -> Self {
        Self {
            translator: Some(translator),
            outgoing,
            incoming,
        }
    }

    /// Returns the title to create with. Never fails: translator errors fall
    /// back to the original title.
    pub fn prepare(&self, title: &str, direction: Direction) -> String {
        let Some(translator) = self.translator.as_ref() else {
            return title.to_string();
        };
        let enabled = match direction {
            Direction::Outgoing => self.outgoing,
            Direction::Incoming => self.incoming,
        };
        if !enabled || !needs_translation(title) {
            return title.to_string();
        }

        match translator.translate(title) {
            Ok(translated) if !translated.trim().is_empty() => {
                tracing::debug!(original = %title, translated = %translated, "translated title");
                translated.trim().to_string()
            }
            Ok(_) => {
                tracing::warn!(title = %title, "translator returned an empty title");
                title.to_string()
            }
            Err(err) => {
                tracing::warn!(title = %title, error = %err, "using untranslated title");
                title.to_string()
            }
        }
    }
}

/// Only titles with Latin letters are sent to the translator.
pub fn needs_translation(text: &str) -> bool {
    static LATIN: OnceLock<Regex> = OnceLock::new();
    LATIN
        .get_or_init(|| Regex::new(r"[A-Za-z]").expect("valid regex"))
        .is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl Translator for Upper {
        fn translate(&self, text: &str) -> Result<String, TranslationError> {
            Ok(text.to_uppercase())
        }
    }

    struct Failing;

    impl Translator for Failing {
        fn translate(&self, _text: &str) -> Result<String, TranslationError> {
            Err(TranslationError("quota exceeded".to_string()))
        }
    }

    #[test]
    fn disabled_pipeline_keeps_title() {
        let pipeline = TitlePipeline::disabled();
        assert_eq!(pipeline.prepare("Buy milk", Direction::Outgoing), "Buy milk");
    }

    #[test]
    fn translates_only_enabled_direction() {
        let pipeline = TitlePipeline::new(Box::new(Upper), false, true);
        assert_eq!(pipeline.prepare("Buy milk", Direction::Incoming), "BUY MILK");
        assert_eq!(pipeline.prepare("Buy milk", Direction::Outgoing), "Buy milk");
    }

    #[test]
    fn skips_titles_without_latin_letters() {
        let pipeline = TitlePipeline::new(Box::new(Upper), true, true);
        assert_eq!(pipeline.prepare("לקנות חלב", Direction::Incoming), "לקנות חלב");
    }

    #[test]
    fn failure_falls_back_to_original() {
        let pipeline = TitlePipeline::new(Box::new(Failing), true, true);
        assert_eq!(pipeline.prepare("Call dentist", Direction::Incoming), "Call dentist");
    }
}
