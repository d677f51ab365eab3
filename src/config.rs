use secrecy::{ExposeSecret, SecretBox};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;
use url::Url;

use crate::audio::AudioFormat;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid subscription key: {0}")]
    InvalidKey(String),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("Unsupported endpoint scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),
    #[error("Environment error: {0}")]
    EnvError(#[from] env::VarError),
}

/// Endpoint used when only a region is configured
const REGION_ENDPOINT: &str =
    "wss://{region}.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1";

pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const CONNECTION_ID_HEADER: &str = "X-ConnectionId";

/// Result detail level requested from the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Simple,
    Detailed,
}

/// Where a caller-supplied service property is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyChannel {
    /// Query parameter on the connection URI, applied at the next open
    UriQuery,
    /// Entry in the context payload, applied to the next context frame
    Context,
}

/// Automatic reconnection applied to continuous recognition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Delay before attempt `n` is `backoff * (n - 1)`
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Configuration for a speech session.
///
/// Language lists and phrases given here seed the session; both stay mutable
/// through the session handle after the connection opens.
pub struct SpeechConfig {
    pub endpoint: Url,
    subscription_key: Option<SecretBox<String>>,
    authorization_token: Option<SecretBox<String>>,
    pub recognition_language: String,
    pub target_languages: Vec<String>,
    pub voice: Option<String>,
    pub uri_properties: BTreeMap<String, String>,
    /// Headers merged into every frame the session sends
    pub frame_headers: BTreeMap<String, String>,
    pub output_format: OutputFormat,
    pub audio_format: AudioFormat,
    pub chunk_duration: Duration,
    pub reconnect: ReconnectPolicy,
    pub stop_grace: Duration,
}

impl fmt::Debug for SpeechConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeechConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("has_subscription_key", &self.subscription_key.is_some())
            .field("has_authorization_token", &self.authorization_token.is_some())
            .field("recognition_language", &self.recognition_language)
            .field("target_languages", &self.target_languages)
            .field("voice", &self.voice)
            .field("output_format", &self.output_format)
            .finish_non_exhaustive()
    }
}

impl SpeechConfig {
    /// Create a configuration for an endpoint with default settings
    pub fn new(endpoint: &str) -> Result<Self, ConfigError> {
        let endpoint = Url::parse(endpoint)?;
        match endpoint.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }

        Ok(Self {
            endpoint,
            subscription_key: None,
            authorization_token: None,
            recognition_language: "en-US".to_string(),
            target_languages: Vec::new(),
            voice: None,
            uri_properties: BTreeMap::new(),
            frame_headers: BTreeMap::new(),
            output_format: OutputFormat::default(),
            audio_format: AudioFormat::default(),
            chunk_duration: Duration::from_millis(100),
            reconnect: ReconnectPolicy::default(),
            stop_grace: Duration::from_secs(2),
        })
    }

    /// Endpoint derived from a service region name
    pub fn from_region(region: &str) -> Result<Self, ConfigError> {
        Self::new(&REGION_ENDPOINT.replace("{region}", region.trim()))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let key = env::var("SPEECH_KEY").map_err(|_| ConfigError::MissingEnvVar("SPEECH_KEY".into()))?;

        let mut config = match (env::var("SPEECH_ENDPOINT"), env::var("SPEECH_REGION")) {
            (Ok(endpoint), _) => Self::new(&endpoint)?,
            (Err(_), Ok(region)) => Self::from_region(&region)?,
            (Err(_), Err(_)) => {
                return Err(ConfigError::MissingEnvVar(
                    "SPEECH_ENDPOINT or SPEECH_REGION".into(),
                ))
            }
        };
        config = config.with_subscription_key(&key)?;

        if let Ok(language) = env::var("SPEECH_LANGUAGE") {
            config.recognition_language = language.trim().to_string();
        }
        if let Ok(targets) = env::var("SPEECH_TARGET_LANGUAGES") {
            config.target_languages = targets
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(voice) = env::var("SPEECH_VOICE") {
            if !voice.trim().is_empty() {
                config.voice = Some(voice.trim().to_string());
            }
        }

        log::info!(
            "🔧 Speech config loaded: endpoint={} language={} targets={:?}",
            config.endpoint,
            config.recognition_language,
            config.target_languages
        );
        Ok(config)
    }

    pub fn with_subscription_key(mut self, key: &str) -> Result<Self, ConfigError> {
        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKey("key cannot be empty".to_string()));
        }
        self.subscription_key = Some(SecretBox::new(Box::new(key.trim().to_string())));
        Ok(self)
    }

    pub fn with_authorization_token(mut self, token: &str) -> Self {
        self.set_authorization_token(token);
        self
    }

    pub fn with_target_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_voice(mut self, voice: &str) -> Self {
        self.voice = Some(voice.to_string());
        self
    }

    pub fn with_frame_header(mut self, name: &str, value: &str) -> Self {
        self.frame_headers
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_recognition_language(mut self, language: &str) -> Self {
        self.recognition_language = language.to_string();
        self
    }

    /// Replace the token used by the next connection open
    pub fn set_authorization_token(&mut self, token: &str) {
        self.authorization_token = Some(SecretBox::new(Box::new(token.to_string())));
    }

    /// Set a URI query property; the same key set twice keeps the last value
    pub fn set_uri_property(&mut self, name: &str, value: &str) {
        self.uri_properties
            .insert(name.to_string(), value.to_string());
    }

    /// Immutable view used to open one connection
    pub fn snapshot(&self, connection_id: &str) -> ConnectionSnapshot {
        let mut query: Vec<(String, String)> = self
            .endpoint
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut set = |key: &str, value: &str| match query.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => query.push((key.to_string(), value.to_string())),
        };
        set("language", &self.recognition_language);
        set("format", &self.output_format.to_string());
        for (key, value) in &self.uri_properties {
            set(key, value);
        }

        let mut uri = self.endpoint.clone();
        uri.set_query(None);
        if !query.is_empty() {
            uri.query_pairs_mut().extend_pairs(query.iter());
        }

        let mut headers = Vec::new();
        if let Some(token) = &self.authorization_token {
            headers.push((
                AUTHORIZATION_HEADER.to_string(),
                format!("Bearer {}", token.expose_secret()),
            ));
        } else if let Some(key) = &self.subscription_key {
            headers.push((
                SUBSCRIPTION_KEY_HEADER.to_string(),
                key.expose_secret().to_string(),
            ));
        }
        headers.push((CONNECTION_ID_HEADER.to_string(), connection_id.to_string()));

        ConnectionSnapshot {
            uri,
            headers,
            connection_id: connection_id.to_string(),
        }
    }
}

/// Everything needed to open one connection, fixed at open time
#[derive(Clone)]
pub struct ConnectionSnapshot {
    pub uri: Url,
    pub headers: Vec<(String, String)>,
    pub connection_id: String,
}

impl fmt::Debug for ConnectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(name, value)| {
                if name == AUTHORIZATION_HEADER || name == SUBSCRIPTION_KEY_HEADER {
                    (name.as_str(), "<redacted>")
                } else {
                    (name.as_str(), value.as_str())
                }
            })
            .collect();
        f.debug_struct("ConnectionSnapshot")
            .field("uri", &self.uri.as_str())
            .field("headers", &headers)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl ConnectionSnapshot {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_has_single_query_string() {
        let mut config = SpeechConfig::new("wss://example.test/speech?format=detailed&x=1").unwrap();
        config.set_uri_property("profanity", "masked");
        config.set_uri_property("profanity", "raw");

        let snapshot = config.snapshot("conn");
        let uri = snapshot.uri.as_str();
        assert_eq!(uri.matches('?').count(), 1);
        assert_eq!(uri.matches("profanity=").count(), 1);
        assert!(uri.contains("profanity=raw"));
        assert!(uri.contains("x=1"));
        // format from the config overwrites the endpoint's own value
        assert_eq!(uri.matches("format=").count(), 1);
        assert!(uri.contains("format=simple"));
        assert!(uri.contains("language=en-US"));
    }

    #[test]
    fn test_token_takes_precedence_over_key() {
        let config = SpeechConfig::new("wss://example.test/speech")
            .unwrap()
            .with_subscription_key("abc123")
            .unwrap();
        let snapshot = config.snapshot("c1");
        assert_eq!(snapshot.header(SUBSCRIPTION_KEY_HEADER), Some("abc123"));
        assert_eq!(snapshot.header("x-connectionid"), Some("c1"));

        let config = config.with_authorization_token("tok");
        let snapshot = config.snapshot("c2");
        assert_eq!(snapshot.header(AUTHORIZATION_HEADER), Some("Bearer tok"));
        assert!(snapshot.header(SUBSCRIPTION_KEY_HEADER).is_none());
        assert!(!format!("{:?}", snapshot).contains("tok"));
    }

    #[test]
    fn test_rejects_non_websocket_endpoint() {
        assert!(matches!(
            SpeechConfig::new("https://example.test/"),
            Err(ConfigError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            SpeechConfig::new("wss://example.test/").unwrap().with_subscription_key("  "),
            Err(ConfigError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_region_endpoint() {
        let config = SpeechConfig::from_region("westeurope").unwrap();
        assert_eq!(config.endpoint.host_str(), Some("westeurope.stt.speech.microsoft.com"));
    }
}
