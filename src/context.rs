//! Per-turn context payload sent on `speech.context`.
//!
//! The builder holds the live-mutable state (target languages, phrase list,
//! service properties); each `build` snapshots it into one frame, so a change
//! only reaches the service with the next frame that is sent.

use serde_json::{json, Map, Value};
use speech_protocol::{paths, Frame, ProtocolError};
use std::collections::BTreeMap;

const TRANSLATION_SECTION: &str = "translationcontext";
const PHRASE_SECTION: &str = "dgi";
const SYNTHESIS_SECTION: &str = "synthesis";
const PROPERTIES_SECTION: &str = "serviceProperties";

#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    target_languages: Vec<String>,
    phrases: Vec<String>,
    service_properties: BTreeMap<String, String>,
    voice: Option<String>,
    sections: BTreeMap<String, Value>,
}

impl ContextBuilder {
    pub fn new(target_languages: Vec<String>, voice: Option<String>) -> Self {
        let mut builder = Self {
            voice,
            ..Default::default()
        };
        for language in target_languages {
            builder.add_target_language(&language);
        }
        builder
    }

    pub fn target_languages(&self) -> &[String] {
        &self.target_languages
    }

    /// Language at index 0, which drives synthesis voice selection
    pub fn primary_language(&self) -> Option<&str> {
        self.target_languages.first().map(String::as_str)
    }

    pub fn voice_configured(&self) -> bool {
        self.voice.is_some()
    }

    /// Returns false if the language was already present
    pub fn add_target_language(&mut self, language: &str) -> bool {
        let language = language.trim();
        if language.is_empty() || self.target_languages.iter().any(|l| l == language) {
            return false;
        }
        self.target_languages.push(language.to_string());
        true
    }

    /// Index the language had before removal
    pub fn remove_target_language(&mut self, language: &str) -> Option<usize> {
        let index = self
            .target_languages
            .iter()
            .position(|l| l == language.trim())?;
        self.target_languages.remove(index);
        Some(index)
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    pub fn add_phrase(&mut self, phrase: &str) -> bool {
        let phrase = phrase.trim();
        if phrase.is_empty() || self.phrases.iter().any(|p| p == phrase) {
            return false;
        }
        self.phrases.push(phrase.to_string());
        true
    }

    pub fn clear_phrases(&mut self) -> bool {
        let had_phrases = !self.phrases.is_empty();
        self.phrases.clear();
        had_phrases
    }

    /// Last write wins per key
    pub fn set_service_property(&mut self, name: &str, value: &str) {
        self.service_properties
            .insert(name.to_string(), value.to_string());
    }

    /// Replace a whole top-level section of the payload
    pub fn set_section(&mut self, name: &str, value: Value) {
        self.sections.insert(name.to_string(), value);
    }

    pub fn payload(&self) -> Value {
        let mut payload: Map<String, Value> = self
            .sections
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if !self.target_languages.is_empty() {
            payload.insert(
                TRANSLATION_SECTION.to_string(),
                json!({ "to": self.target_languages }),
            );
        }

        if !self.phrases.is_empty() {
            let items: Vec<Value> = self.phrases.iter().map(|p| json!({ "Text": p })).collect();
            payload.insert(
                PHRASE_SECTION.to_string(),
                json!({ "Groups": [{ "Type": "Generic", "Items": items }] }),
            );
        }

        if let (Some(voice), Some(primary)) = (&self.voice, self.primary_language()) {
            let mut voices = Map::new();
            voices.insert(primary.to_string(), Value::String(voice.clone()));
            payload.insert(
                SYNTHESIS_SECTION.to_string(),
                json!({ "language": primary, "voices": voices }),
            );
        }

        if !self.service_properties.is_empty() {
            let mut properties = match payload.remove(PROPERTIES_SECTION) {
                Some(Value::Object(existing)) => existing,
                _ => Map::new(),
            };
            for (name, value) in &self.service_properties {
                properties.insert(name.clone(), Value::String(value.clone()));
            }
            payload.insert(PROPERTIES_SECTION.to_string(), Value::Object(properties));
        }

        Value::Object(payload)
    }

    pub fn build(&self, request_id: &str) -> Result<Frame, ProtocolError> {
        let body = serde_json::to_string(&self.payload())?;
        Ok(Frame::text(paths::SPEECH_CONTEXT, request_id, body)
            .with_header("Content-Type", "application/json"))
    }
}
