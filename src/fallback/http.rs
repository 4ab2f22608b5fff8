use super::{CompletionError, CompletionRequest, Completer};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Completer backed by an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpCompleter {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl From<reqwest::Error> for CompletionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CompletionError::Timeout
        } else if err.is_decode() {
            CompletionError::Malformed(err.to_string())
        } else {
            CompletionError::Transport(err.to_string())
        }
    }
}

impl HttpCompleter {
    /// Completer with the default endpoint, model and timeout.
    pub fn new(api_key: impl Into<String>) -> Result<Self, CompletionError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(CompletionError::MissingApiKey);
        }
        Ok(Self {
            client: build_client(DEFAULT_TIMEOUT)?,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.1,
            max_tokens: 4096,
        })
    }

    /// Configure from `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `AI_MODEL`.
    pub fn from_env() -> Result<Self, CompletionError> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| CompletionError::MissingApiKey)?;
        let mut completer = Self::new(api_key)?;
        if let Ok(base_url) = env::var("OPENAI_BASE_URL") {
            if !base_url.trim().is_empty() {
                completer = completer.with_base_url(base_url);
            }
        }
        if let Ok(model) = env::var("AI_MODEL") {
            if !model.trim().is_empty() {
                completer = completer.with_model(model);
            }
        }
        Ok(completer)
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, CompletionError> {
        self.client = build_client(timeout)?;
        Ok(self)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn build_client(timeout: Duration) -> Result<Client, CompletionError> {
    Ok(Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

impl Completer for HttpCompleter {
    fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let prompt = request.user_prompt();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_instructions,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        tracing::debug!(model = %self.model, file = %request.file_path, "requesting completion");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: ChatResponse = response.json()?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CompletionError::Malformed("no choices in response".to_string()))
    }
}
