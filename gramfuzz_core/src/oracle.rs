use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default model requested from the text-generation service.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
/// Default cap on tokens generated per answer.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;
const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Errors surfaced by a [`TextOracle`] or its transport.
#[derive(Error, Debug)]
pub enum OracleError {
    /// Every attempt failed; the caller gets no answer for this prompt.
    #[error("Oracle gave no answer after {attempts} attempt(s): {last_error}")]
    NoAnswer { attempts: u32, last_error: String },

    /// The request could not be delivered or the response could not be read.
    #[error("Oracle transport error: {0}")]
    Transport(String),

    /// The service answered, but not with the expected top-level shape.
    #[error("Malformed oracle response: {0}")]
    Malformed(String),
}

/// How the prompt is presented to the service.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OracleMode {
    /// A single user instruction wrapped with a system preamble.
    #[default]
    Instruct,
    /// A caller-built conversation, sent as-is.
    Chat,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// An opaque prompt built by the prompt-construction layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    Instruct(String),
    Conversation(Vec<ChatMessage>),
}

impl Prompt {
    /// The conversation sent on the wire. Instruct prompts gain the system preamble.
    pub fn messages(&self) -> Vec<ChatMessage> {
        match self {
            Prompt::Instruct(text) => vec![
                ChatMessage::new(Role::System, SYSTEM_PROMPT),
                ChatMessage::new(Role::User, text.clone()),
            ],
            Prompt::Conversation(messages) => messages.clone(),
        }
    }
}

/// Per-call knobs for [`TextOracle::ask`].
#[derive(Debug, Clone, PartialEq)]
pub struct AskOptions {
    pub mode: OracleMode,
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_retries: u32,
    pub temperature: f32,
    /// A JSON-schema `response_format` for structured answers. Only sent in chat mode.
    pub response_format: Option<JsonValue>,
}

impl Default for AskOptions {
    fn default() -> Self {
        Self {
            mode: OracleMode::Instruct,
            max_retries: 5,
            temperature: 0.5,
            response_format: None,
        }
    }
}

/// The external text-generation service.
///
/// Given a prompt it returns a single text answer, or a definitive failure once its
/// own retries are exhausted. Retry policy belongs to the implementation.
pub trait TextOracle: Send + Sync {
    fn ask(&self, prompt: &Prompt, options: &AskOptions) -> Result<String, OracleError>;
}

/// Delivers one serialized request body and returns the raw response body.
///
/// Implementations wrap whatever HTTP client the embedding fuzzer uses.
pub trait OracleTransport: Send + Sync {
    fn send(&self, body: &JsonValue) -> Result<String, OracleError>;
}

/// A [`TextOracle`] speaking the chat-completions request shape over an
/// [`OracleTransport`], with a bounded retry loop and a fixed backoff between
/// attempts.
pub struct RetryingOracle<T: OracleTransport> {
    transport: T,
    model: String,
    max_output_tokens: u32,
    backoff: Duration,
}

impl<T: OracleTransport> RetryingOracle<T> {
    pub fn new(transport: T, backoff: Duration) -> Self {
        Self {
            transport,
            model: DEFAULT_MODEL.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            backoff,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, max_output_tokens: u32) -> Self {
        self.model = model.into();
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Builds the request body for one attempt.
    pub fn request_body(&self, prompt: &Prompt, options: &AskOptions) -> JsonValue {
        let mut body = json!({
            "model": self.model,
            "messages": prompt.messages(),
            "max_tokens": self.max_output_tokens,
            "temperature": options.temperature,
        });
        if let (OracleMode::Chat, Some(format)) = (options.mode, &options.response_format) {
            body["response_format"] = format.clone();
        }
        body
    }
}

/// Pulls `choices[0].message.content` out of a chat-completions response body,
/// dropping one leading newline.
pub fn extract_answer(raw_body: &str) -> Result<String, OracleError> {
    let parsed: JsonValue = serde_json::from_str(raw_body)
        .map_err(|e| OracleError::Malformed(format!("response is not JSON: {e}")))?;
    let content = parsed
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| OracleError::Malformed(format!("no choices in response: {raw_body}")))?;
    Ok(content.strip_prefix('\n').unwrap_or(content).to_string())
}

impl<T: OracleTransport> TextOracle for RetryingOracle<T> {
    fn ask(&self, prompt: &Prompt, options: &AskOptions) -> Result<String, OracleError> {
        let body = self.request_body(prompt, options);
        let attempts = options.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.transport.send(&body).and_then(|raw| extract_answer(&raw)) {
                Ok(answer) => {
                    debug!(attempt, "Oracle answered");
                    return Ok(answer);
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Oracle attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts && !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                }
            }
        }

        Err(OracleError::NoAnswer {
            attempts,
            last_error,
        })
    }
}
